//! Wire codecs: HTTP/1.x messages, WebSocket frames, TLS ClientHello.

pub mod http;
pub mod tls;
pub mod websocket;

pub use self::http::{RequestCodec, ResponseCodec, MAX_BODY_BYTES, MAX_HEADERS, MAX_HEAD_BYTES};
pub use tls::{looks_like_tls, parse_client_hello, ClientHello};
pub use websocket::{FrameCodec, MAX_FRAME_PAYLOAD};
