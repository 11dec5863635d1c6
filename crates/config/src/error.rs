//! Configuration Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Every variant is fatal at startup; the message is meant for the operator.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A configuration file was named explicitly but does not exist
    #[display("configuration file not found: {}", _0.display())]
    MissingFile(#[error(not(source))] PathBuf),
    /// Merging or extracting the configuration layers failed
    #[display("invalid configuration: {_0}")]
    Parse(#[error(not(source))] String),
    /// Not something `parse_duration` understands
    #[display("invalid duration `{_0}` (expected e.g. `500ms`, `30s`, `5m` or a number of seconds)")]
    InvalidDuration(#[error(not(source))] String),
    /// The ignore setting is not a valid regular expression
    #[display("invalid ignore pattern: {_0}")]
    InvalidIgnore(#[error(not(source))] String),
}
