//! File metadata produced by directory listings.

use std::path::PathBuf;
use time::OffsetDateTime;

/// File metadata returned by storage backends.
///
/// One of these is yielded for every regular file found during a listing;
/// it carries everything the reconciler needs to decide whether the file's
/// content has to be (re-)read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Cache key: relative path with `/` separators
    pub key: String,
    /// Relative path from the served root, in platform form
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp, full filesystem precision
    pub modified: OffsetDateTime,
}
impl FileInfo {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            size,
            modified,
        }
    }
}
