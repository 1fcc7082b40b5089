//! Pinhole Proxy - intercepting HTTP/WebSocket proxy engine.
//!
//! Sits between a client and origin servers, terminates TLS with
//! certificates issued on the fly by a local root CA, and exposes every
//! request, response and WebSocket frame to registered observers before
//! forwarding it.
//!
//! ## Features
//!
//! - Generates a root CA on first run, issues per-host leaf certificates
//! - Handles explicit (`CONNECT`, absolute-form) and transparent (SNI) clients
//! - HTTP/1.1 with keep-alive, WebSocket upgrade and frame relay
//! - Observer fanout isolating failing observers
//! - Request/response/frame rewriting, including local responses
//! - Optional external proxy chaining and OS proxy registration
//!
//! ## Architecture
//!
//! ```text
//! accept ─▶ Pipeline (one per connection)
//!              │
//!              ├─ TLS? ──▶ SNI sniff ──▶ intercept (leaf cert) or blind relay
//!              ├─ CONNECT ─▶ 200, re-sniff tunnel bytes
//!              ▼
//!          Codec stage (RequestCodec) ──▶ Handler stage
//!                                           │ rewrite ─▶ on_request
//!                                           │ forward (ResponseCodec) ─▶ origin
//!                                           │ rewrite ─▶ on_response
//!                                           ▼
//!                                   101? ─▶ FrameCodec relay ─▶ on_message
//! ```

mod ca;
pub mod codec;
mod config;
mod error;
mod handler;
mod listener;
mod message;
mod pipeline;
mod rewrite;
mod server;
mod system_proxy;

#[cfg(test)]
mod testing;

pub use ca::{default_ca_dir, CaManager, HostCertificate};
pub use config::{default_pass_domains, ExternalProxy, ProxyConfig};
pub use error::{CaManagerError, DecodeError, ObserverError, ProxyError, Result};
pub use listener::{EventFanout, EventListener};
pub use message::{
    canonical_reason, parse_authority, Direction, Headers, HttpRequest, HttpResponse, Message,
    Opcode, Scheme, Upstream, Version, WebSocketFrame,
};
pub use pipeline::{BoxedIo, ConnectionInfo, Io, PrefixedIo};
pub use rewrite::{
    FrameAction, NoRewrite, RequestAction, RewriteAction, RewriteRule, RewriteRules, Rewriter,
};
pub use server::{ProxyServer, ProxyServerState, ServerHandle};
pub use system_proxy::{
    NoopSystemProxy, PlatformSystemProxy, SystemProxyController, SUPPORTS_SYSTEM_PROXY,
};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 9099;
