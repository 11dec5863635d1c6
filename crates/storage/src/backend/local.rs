//! Local filesystem storage backend.
//!
//! This module provides the read-only storage backend for the local
//! filesystem. Files are accessed using `tokio::fs` for async I/O.

use crate::backend::FileInfoStream;
use crate::error::ErrorKind;
use crate::{FileInfo, StorageBackend, error::Result, path::key as path_key, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Serves files from a directory on the local filesystem. All paths are
/// relative to the configured root directory, which is never written to.
///
/// # Examples
///
/// ```no_run
/// use memserve_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("public", "/srv/www")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LocalBackend {
    name: String,
    /// Root directory being served
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Arguments
    /// * `root` - Absolute path to an existing directory
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, does not exist or is not
    /// a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        // Use non-async here; it'll only happen once on startup and it's not
        // worth the hassle of making the constructor async.
        let metadata = std::fs::metadata(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative storage path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a relative storage path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        Ok(validate_path(relative)?)
    }

    /// Re-use same data collection from file metadata for both list and stat functions
    fn metadata(relative: &Path, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(FileInfo::new(path_key(relative)?, relative, metadata.len(), modified))
    }

    /// Decide what a single directory entry means for the walk.
    ///
    /// Symlinks to regular files are treated as the file they point to.
    /// Symlinks to directories are never followed (no cycles to worry about)
    /// and dangling symlinks are dropped.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            // Deleted between read_dir and now: it was never there.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WalkEntry::Skip),
            Err(e) => exn::bail!(ErrorKind::from_io(e, &path)),
        };
        if file_type.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        let metadata = match file_type.is_symlink() {
            true => match fs::metadata(&path).await {
                Ok(target) if target.is_file() => target,
                Ok(_) | Err(_) => {
                    tracing::debug!(path = %path.display(), "Skipping symlink that does not resolve to a file");
                    return Ok(WalkEntry::Skip);
                },
            },
            false => match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WalkEntry::Skip),
                Err(e) => exn::bail!(ErrorKind::from_io(e, &path)),
            },
        };
        if !metadata.is_file() {
            // Sockets, FIFOs, devices: nothing we could ever serve.
            return Ok(WalkEntry::Skip);
        }
        let relative = self.relative_path(&path)?;
        match Self::metadata(&relative, metadata) {
            Ok(info) => Ok(WalkEntry::File(info)),
            Err(e) if matches!(&*e, ErrorKind::InvalidPath(_)) => {
                tracing::warn!(path = %path.display(), "Skipping file whose name cannot be used as a URL path");
                Ok(WalkEntry::Skip)
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A subdirectory removed mid-walk simply has no files left
                    // in it. The root disappearing is a real failure though.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound && current != self.root => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        return;
                    }
                };

                loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(e) => {
                            yield Err(exn::Exn::from(ErrorKind::from_io(e, &current)));
                            return;
                        },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => {
                            yield Err(e);
                            return;
                        },
                    };
                }
            }
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        Self::metadata(&validate_path(path)?, metadata)
    }
}
