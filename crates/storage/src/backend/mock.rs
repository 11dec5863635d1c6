//! In-memory storage backend for testing.

use super::FileInfoStream;
use crate::error::{ErrorKind, Result};
use crate::path::{key as path_key, validate as validate_path};
use crate::{FileInfo, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

/// In-memory storage backend for testing.
///
/// Files are stored in a map behind a [`RwLock`], so all trait methods can
/// operate on `&self` without external synchronisation. On top of plain
/// storage it offers the counters and switches the reconciler tests need:
///
/// - every [`read`](StorageBackend::read) is counted per key,
/// - listing can be made to fail halfway through,
/// - reads of individual keys can be made to fail.
///
/// # Examples
///
/// ```
/// use memserve_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("index.html", b"<html>...</html>")]);
/// backend.read(Path::new("index.html")).await?;
/// assert_eq!(backend.read_count("index.html").await, 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<BTreeMap<PathBuf, (OffsetDateTime, Vec<u8>)>>,
    reads: Mutex<HashMap<String, usize>>,
    unreadable: RwLock<HashSet<String>>,
    fail_listing: AtomicBool,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files, all stamped with the
    /// same modification time.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        let now = OffsetDateTime::now_utc();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            reads: Mutex::new(HashMap::new()),
            unreadable: RwLock::new(HashSet::new()),
            fail_listing: AtomicBool::new(false),
        }
    }

    /// Create or replace a file with an explicit modification time.
    pub async fn write_at(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>, modified: OffsetDateTime) {
        let Ok(validated) = validate_path(path.as_ref()) else {
            panic!("MockBackend::write_at: invalid path {}", path.as_ref().display());
        };
        self.storage.write().await.insert(validated, (modified, data.into()));
    }

    /// Delete a file; returns whether it existed.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        match validate_path(path.as_ref()) {
            Ok(validated) => self.storage.write().await.remove(&validated).is_some(),
            Err(_) => false,
        }
    }

    /// Number of times [`read`](StorageBackend::read) was called for `key`.
    pub async fn read_count(&self, key: &str) -> usize {
        self.reads.lock().await.get(key).copied().unwrap_or_default()
    }

    /// Total number of reads across all keys.
    pub async fn total_reads(&self) -> usize {
        self.reads.lock().await.values().sum()
    }

    /// Make the next listings yield an error after the first file.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make reads of `key` fail with a permission error (it still lists).
    pub async fn make_unreadable(&self, key: impl Into<String>) {
        self.unreadable.write().await.insert(key.into());
    }

    fn file_info(path: &Path, size: u64, modified: OffsetDateTime) -> Result<FileInfo> {
        Ok(FileInfo::new(path_key(path)?, path, size, modified))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        Box::pin(stream! {
            // Snapshot entries under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let entries: Vec<(PathBuf, OffsetDateTime, u64)> = {
                let guard = self.storage.read().await;
                guard.iter().map(|(path, (modified, data))| (path.clone(), *modified, data.len() as u64)).collect()
            };
            let fail = self.fail_listing.load(Ordering::SeqCst);
            for (index, (path, modified, size)) in entries.into_iter().enumerate() {
                if fail && index == 1 {
                    yield Err(exn::Exn::from(ErrorKind::BackendError("injected listing failure".to_string())));
                    return;
                }
                yield Self::file_info(&path, size, modified);
            }
            if fail {
                yield Err(exn::Exn::from(ErrorKind::BackendError("injected listing failure".to_string())));
            }
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let key = path_key(&path)?;
        *self.reads.lock().await.entry(key.clone()).or_default() += 1;
        if self.unreadable.read().await.contains(&key) {
            exn::bail!(ErrorKind::PermissionDenied(path));
        }
        let (_modified, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(data)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let (modified, data) = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Self::file_info(&path, data.len() as u64, *modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_files_and_read() {
        let backend = MockBackend::with_files([("one.html", b"data file 1"), ("dir/two.html", b"data file 2")]);
        assert_eq!(backend.read(Path::new("dir/two.html")).await.unwrap(), b"data file 2");
        assert_eq!(backend.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_counts() {
        let backend = MockBackend::with_files([("a.txt", b"a")]);
        assert_eq!(backend.read_count("a.txt").await, 0);
        backend.read(Path::new("a.txt")).await.unwrap();
        backend.read(Path::new("a.txt")).await.unwrap();
        let _ = backend.read(Path::new("missing.txt")).await;
        assert_eq!(backend.read_count("a.txt").await, 2);
        assert_eq!(backend.total_reads().await, 3);
    }

    #[tokio::test]
    async fn test_write_at_and_remove() {
        let backend = MockBackend::default();
        let modified = OffsetDateTime::UNIX_EPOCH;
        backend.write_at("a.txt", "hello", modified).await;
        let info = backend.stat(Path::new("a.txt")).await.unwrap();
        assert_eq!(info.modified, modified);
        assert_eq!(info.size, 5);
        assert!(backend.remove("a.txt").await);
        assert!(!backend.remove("a.txt").await);
        assert!(backend.read(Path::new("a.txt")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fail_listing() {
        let backend = MockBackend::with_files([("a.txt", b"a"), ("b.txt", b"b")]);
        backend.fail_listing(true);
        assert!(backend.list().await.is_err());
        backend.fail_listing(false);
        assert_eq!(backend.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable() {
        let backend = MockBackend::with_files([("a.txt", b"a")]);
        backend.make_unreadable("a.txt").await;
        let err = backend.read(Path::new("a.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PermissionDenied(_)));
        assert_eq!(backend.list().await.unwrap().len(), 1);
    }
}
