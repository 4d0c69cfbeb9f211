//! Error types for the Hotline engine.
//!
//! The variants follow the protocol's failure taxonomy: malformed
//! frames close the connection, business errors become error replies,
//! storage problems surface as generic error replies.

use thiserror::Error;

/// Core error type for Hotline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame or field that cannot be parsed. The connection that
    /// produced it is closed without a reply.
    #[error("malformed transaction: {0}")]
    Malformed(String),

    /// Handshake or transfer-channel protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A resolved file path escaped the configured file root.
    #[error("path traversal rejected")]
    PathTraversal,

    /// Persistence or filesystem failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A referenced entity (account, chat, article, refnum) is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O deadline elapsed.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using the Hotline [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
