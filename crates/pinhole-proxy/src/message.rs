//! Decoded protocol units flowing through the pipeline.
//!
//! Requests and responses keep their headers in wire order with the original
//! name casing so an unmodified message re-encodes to the bytes it came from.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    #[default]
    Http11,
}

impl Version {
    /// Returns the version as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub(crate) fn from_minor(minor: u8) -> Self {
        if minor == 0 {
            Version::Http10
        } else {
            Version::Http11
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if a header named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns true if any comma-separated value of `name` equals `token`
    /// (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Appends a header, keeping any existing values.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Sets a header, replacing existing values in place of the first one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(index) => {
                self.0[index].1 = value;
                let mut i = 0;
                self.0.retain(|(n, _)| {
                    let keep = i <= index || !n.eq_ignore_ascii_case(&name);
                    i += 1;
                    keep
                });
            }
            None => self.0.push((name, value)),
        }
    }

    /// Removes every header named `name`. Returns true if any was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.len() != before
    }

    /// Iterates headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("chunked"))
    }

    fn wants_close(&self, version: Version) -> bool {
        match version {
            Version::Http11 => self.has_token("connection", "close"),
            Version::Http10 => !self.has_token("connection", "keep-alive"),
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// URL scheme of an upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Returns the scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Returns the default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upstream {
    /// Scheme used toward the origin.
    pub scheme: Scheme,
    /// Origin host name or IP literal (without brackets).
    pub host: String,
    /// Origin port.
    pub port: u16,
}

impl Upstream {
    /// Creates an upstream target.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Builds the full URL for an origin-form or absolute-form target.
    pub fn url(&self, target: &str) -> String {
        if split_absolute(target).is_some() {
            return target.to_string();
        }
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let port = if self.port == self.scheme.default_port() {
            String::new()
        } else {
            format!(":{}", self.port)
        };
        format!("{}://{}{}{}", self.scheme.as_str(), host, port, target)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// Splits `host[:port]` (IPv6 in brackets) into its parts.
pub fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => Some((authority.to_string(), default_port)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Splits an absolute-form target into scheme, authority and origin-form path.
pub(crate) fn split_absolute(target: &str) -> Option<(Scheme, &str, &str)> {
    let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(target, "http://") {
        (Scheme::Http, rest)
    } else if let Some(rest) = strip_prefix_ignore_case(target, "https://") {
        (Scheme::Https, rest)
    } else if let Some(rest) = strip_prefix_ignore_case(target, "ws://") {
        (Scheme::Http, rest)
    } else if let Some(rest) = strip_prefix_ignore_case(target, "wss://") {
        (Scheme::Https, rest)
    } else {
        return None;
    };
    let end = rest.find(|c| c == '/' || c == '?').unwrap_or(rest.len());
    let path = &rest[end..];
    let path = if path.is_empty() { "/" } else { path };
    Some((scheme, &rest[..end], path))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// A decoded HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target as sent (origin-, absolute- or authority-form).
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Header lines.
    pub headers: Headers,
    /// De-chunked body bytes.
    pub body: Bytes,
}

impl HttpRequest {
    /// Creates an HTTP/1.1 request without headers or body.
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body (builder style).
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true for `CONNECT` requests.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Returns true for `HEAD` requests.
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Returns true for methods that may be repeated without changing the
    /// outcome (RFC 9110 section 9.2.2).
    pub fn is_idempotent(&self) -> bool {
        ["GET", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE"]
            .iter()
            .any(|m| self.method.eq_ignore_ascii_case(m))
    }

    /// Returns true if this is a WebSocket upgrade handshake.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade")
            && self.headers.has_token("upgrade", "websocket")
    }

    /// Returns true if the client expects the connection to stay open.
    pub fn keep_alive(&self) -> bool {
        !self.headers.wants_close(self.version)
    }

    /// Resolves the upstream this request addresses, if the request itself
    /// names one (absolute-form target, authority-form CONNECT or `Host`).
    pub fn upstream(&self, default_scheme: Scheme) -> Option<Upstream> {
        if self.is_connect() {
            let (host, port) = parse_authority(&self.target, 443)?;
            return Some(Upstream::new(Scheme::Https, host, port));
        }
        if let Some((scheme, authority, _)) = split_absolute(&self.target) {
            let (host, port) = parse_authority(authority, scheme.default_port())?;
            return Some(Upstream::new(scheme, host, port));
        }
        let host = self.headers.get("host")?;
        let (host, port) = parse_authority(host, default_scheme.default_port())?;
        Some(Upstream::new(default_scheme, host, port))
    }

    /// Returns the target in origin-form (`/path?query`).
    pub fn origin_form(&self) -> &str {
        match split_absolute(&self.target) {
            Some((_, _, path)) => path,
            None => &self.target,
        }
    }
}

/// A decoded HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: u16,
    /// Reason phrase as sent.
    pub reason: String,
    /// Header lines.
    pub headers: Headers,
    /// De-chunked body bytes.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates an HTTP/1.1 response with the canonical reason phrase.
    pub fn new(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: canonical_reason(status).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body and a matching `Content-Length` (builder style).
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers
            .insert("Content-Length", self.body.len().to_string());
        self
    }

    /// Plain-text error response synthesized by the proxy.
    pub fn error(status: u16, message: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(Bytes::from(format!("{message}\n")))
    }

    /// Returns true for `101 Switching Protocols`.
    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }

    /// Returns true if the connection may be reused after this response.
    pub fn keep_alive(&self) -> bool {
        !self.headers.wants_close(self.version)
    }
}

/// Canonical reason phrase for `status`, or empty when it has none.
pub fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    /// Parses the 4-bit opcode. Reserved values yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Returns the 4-bit wire value.
    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Returns true for close, ping and pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single WebSocket frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    /// Final fragment flag.
    pub fin: bool,
    /// The three RSV bits (extension use), right-aligned.
    pub rsv: u8,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key when the frame was masked on the wire.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl WebSocketFrame {
    /// Creates a final, unmasked text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode: Opcode::Text,
            mask: None,
            payload: Bytes::from(text.into()),
        }
    }

    /// Creates a final, unmasked binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode: Opcode::Binary,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Sets the masking key (builder style).
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Returns the payload as text if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Direction a frame travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the client toward the origin.
    ClientToServer,
    /// From the origin toward the client.
    ServerToClient,
}

/// Any decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// HTTP request.
    Request(HttpRequest),
    /// HTTP response.
    Response(HttpResponse),
    /// WebSocket frame.
    Frame(WebSocketFrame),
}
