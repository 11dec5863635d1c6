//! Ignore-pattern storage backend decorator.
//!
//! Wraps another backend and hides every file whose key matches a regular
//! expression. Hidden files are indistinguishable from files that do not
//! exist: they never show up in a listing and cannot be read.

use crate::backend::FileInfoStream;
use crate::error::ErrorKind;
use crate::{BackendHandle, FileInfo, StorageBackend, error::Result, path::key as path_key};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use std::path::Path;

/// A regular expression matched against cache keys (`/`-separated paths
/// relative to the served root, no leading slash).
///
/// The match is unanchored, same as [`Regex::is_match`]: `^\.` hides
/// top-level dotfiles, `(^|/)\.` hides dotfiles at any depth.
#[derive(Debug, Clone)]
pub struct IgnorePattern {
    regex: Regex,
}
impl IgnorePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| ErrorKind::InvalidPattern(e.to_string()))?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Ignore-filtered storage backend.
///
/// Ignored paths return [`ErrorKind::FilteredPath`] from direct reads.
#[derive(Clone)]
pub struct FilteredBackend {
    inner: BackendHandle,
    pattern: IgnorePattern,
}
impl FilteredBackend {
    pub fn new(inner: BackendHandle, pattern: IgnorePattern) -> Self {
        Self { inner, pattern }
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.pattern.is_ignored(&path_key(path)?) {
            exn::bail!(ErrorKind::FilteredPath(path.to_path_buf()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilteredBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        Box::pin(self.inner.list_stream().filter(|item| {
            std::future::ready(match item {
                Ok(info) => {
                    let ignored = self.pattern.is_ignored(&info.key);
                    if ignored {
                        tracing::trace!(key = %info.key, pattern = self.pattern.as_str(), "Ignoring file");
                    }
                    !ignored
                },
                Err(_) => true, // propagate errors
            })
        }))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.check(path)?;
        self.inner.read(path).await
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.check(path)?;
        self.inner.stat(path).await
    }
}
