//! Error types for the memcache ring client.
//!
//! Construction of a [`Ring`](crate::Ring) can fail (bad configuration, an
//! unreadable config file, a TLS context that cannot be built). Runtime cache
//! operations never surface these errors to callers; they are logged, counted
//! against the server's error limiter, and turned into a miss or a no-op.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The main error type for the ring client.
#[derive(Debug, Error)]
pub enum RingError {
    /// A configuration value could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `item_size_warning_threshold` was present but not an integer.
    #[error("invalid item_size_warning_threshold '{value}': {reason}")]
    InvalidThreshold { value: String, reason: String },

    /// The external configuration file exists but could not be read.
    #[error("failed to read config file: {0}")]
    ConfigRead(#[source] io::Error),

    /// A server address was not of the form `host:port`.
    #[error("invalid server address '{0}'")]
    InvalidServer(String),

    /// The TLS client context could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// An I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A connection to the server could not be established.
    #[error("connect to {server} failed: {reason}")]
    Connect { server: String, reason: String },

    /// An operation exceeded its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// No pooled connection became available in time.
    #[error("connection pool for {server} exhausted after {waited:?}")]
    PoolExhausted { server: String, waited: Duration },

    /// The server sent something we could not understand, or an error line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A structured value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored entry carries a flag this client cannot decode.
    #[error("unsupported entry flags: {0}")]
    UnsupportedFlags(u32),
}

impl RingError {
    /// Whether the peer hung up on an established connection. On a reused
    /// pooled connection this usually means the server dropped it while idle.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RingError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// A specialized Result type for ring operations.
pub type RingResult<T> = Result<T, RingError>;
