//! Error types for the proxy engine.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening port could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed protocol bytes on one connection.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The origin (or external proxy) could not be reached.
    #[error("upstream {authority} unreachable: {source}")]
    UpstreamUnreachable {
        /// `host:port` of the upstream that failed.
        authority: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// CA or leaf certificate failure.
    #[error("certificate error: {0}")]
    Certificate(#[from] CaManagerError),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// System proxy controller failure.
    #[error("system proxy error: {0}")]
    SystemProxy(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// Errors raised by the codec stage.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Start line or headers could not be parsed.
    #[error("invalid message head: {0}")]
    InvalidHead(String),

    /// Head exceeded the size or header-count limit.
    #[error("message head too large")]
    HeadTooLarge,

    /// `Content-Length` was missing a valid value or conflicted.
    #[error("invalid content-length")]
    InvalidContentLength,

    /// Malformed chunked transfer encoding.
    #[error("invalid chunked encoding: {0}")]
    InvalidChunk(String),

    /// Declared or accumulated body over the buffering cap.
    #[error("message body of {0} bytes exceeds limit")]
    BodyTooLarge(u64),

    /// Malformed WebSocket frame.
    #[error("invalid websocket frame: {0}")]
    InvalidFrame(String),

    /// WebSocket frame payload over the configured cap.
    #[error("websocket frame of {0} bytes exceeds limit")]
    FrameTooLarge(u64),

    /// IO error while reading.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to issue a leaf certificate.
    #[error("Failed to issue certificate for {host}: {reason}")]
    Issuance {
        /// Hostname the leaf was requested for.
        host: String,
        /// Failure description.
        reason: String,
    },
}

impl From<rcgen::Error> for CaManagerError {
    fn from(e: rcgen::Error) -> Self {
        CaManagerError::Generation(e.to_string())
    }
}

/// Error returned by an observer callback.
#[derive(Debug, Clone, Error)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    /// Creates an observer error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_mentions_address() {
        let err = ProxyError::Bind {
            addr: SocketAddr::from(([0, 0, 0, 0], 9099)),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:9099"));
    }

    #[test]
    fn decode_error_converts() {
        let err: ProxyError = DecodeError::HeadTooLarge.into();
        assert!(matches!(err, ProxyError::Decode(DecodeError::HeadTooLarge)));
    }

    #[test]
    fn issuance_error_names_host() {
        let err = CaManagerError::Issuance {
            host: "example.test".into(),
            reason: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to issue certificate for example.test: boom"
        );
    }
}
