//! Session error types.
//!
//! One taxonomy covers the whole framework: argument misuse and backpressure
//! surface synchronously from `write_pkg`, while codec, connection, and
//! handshake failures are reported through the event listener before the
//! session closes.

use std::time::Duration;
use thiserror::Error;

/// Session and endpoint errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed call (missing addressing context, unbound codec, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write queue saturated and the per-call timeout elapsed
    #[error("write queue full after {waited:?}")]
    QueueFull {
        /// How long the caller waited for queue space
        waited: Duration,
    },

    /// Operation on a session that has entered Closing/Closed
    #[error("session closed")]
    SessionClosed,

    /// Operation on an endpoint that has been closed
    #[error("endpoint closed")]
    EndpointClosed,

    /// Decode/encode failure; always fatal to the session
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O failure; fatal to the session, triggers reconnection on clients
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// TLS or upgrade failure; fatal to the connection attempt,
    /// never produces a session
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// WebSocket protocol failure; fatal to the session
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Build an `InvalidArgument` error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build a `Codec` error
    pub fn codec(msg: impl ToString) -> Self {
        Error::Codec(msg.to_string())
    }

    /// Build a `Handshake` error
    pub fn handshake(msg: impl ToString) -> Self {
        Error::Handshake(msg.to_string())
    }

    /// Whether the session must close after this error. A corrupted stream
    /// cannot be resynchronized, so codec failures are always fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Codec(_) | Error::Connection(_) | Error::Handshake(_) | Error::WebSocket(_)
        )
    }
}

impl From<tether_wire::WireError> for Error {
    fn from(err: tether_wire::WireError) -> Self {
        Error::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::codec("bad frame").is_fatal());
        assert!(Error::Connection(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_fatal());
        assert!(!Error::SessionClosed.is_fatal());
        assert!(!Error::QueueFull {
            waited: Duration::ZERO
        }
        .is_fatal());
        assert!(!Error::invalid("nil package").is_fatal());
    }
}
