//! Server Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::net::SocketAddr;

/// A server error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Per-request problems never surface here; they become HTTP responses.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The listening socket could not be created (address in use, no
    /// permission for a privileged port, ...)
    #[display("could not listen on {_0}")]
    Bind(#[error(not(source))] SocketAddr),
    /// Underlying socket error
    #[display("socket error: {_0}")]
    Io(std::io::Error),
}
impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
