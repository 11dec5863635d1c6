//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the read-only interface the
//! reconciler uses to enumerate and load the served tree. The production
//! implementation is [`LocalBackend`]; [`FilteredBackend`] decorates any
//! backend with an ignore pattern.

mod ignore;
mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::ignore::{FilteredBackend, IgnorePattern};
pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
use crate::error::Result;
use crate::file::FileInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified read-only interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the served root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use memserve_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_of_index(backend: &dyn StorageBackend) -> Result<u64> {
///     let data = backend.read(Path::new("index.html")).await?;
///     Ok(data.len() as u64)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend (used for logging only).
    fn name(&self) -> &str;

    /// List every regular file under the root.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning. The first error aborts the listing.
    async fn list(&self) -> Result<Vec<FileInfo>> {
        self.list_stream().try_collect().await
    }

    /// Stream metadata for every regular file under the root.
    ///
    /// Directories are descended into but never yielded. An error item means
    /// part of the tree could not be enumerated, so the listing as a whole
    /// can no longer be trusted to be complete.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use memserve_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream();
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.key, info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream(&self) -> FileInfoStream<'_>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist (anymore).
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Get file metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}
