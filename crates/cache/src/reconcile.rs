use crate::error::{ErrorKind, Result};
use crate::{CacheEntry, FileCache};
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt};
use memserve_storage::error::Result as StorageResult;
use memserve_storage::{BackendHandle, FileInfo};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Default number of files read from disk concurrently during a reconcile.
pub const DEFAULT_READ_CONCURRENCY: usize = 8;

/// How a reconcile turns the current disk state into cache state.
///
/// Both strategies end up with the same cache contents; they differ in how
/// much they read and how the result is published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Strategy {
    /// Only files whose modification time changed (or that are new) are
    /// read. The delta is applied to the live map.
    #[default]
    Incremental,
    /// Every file is read again and the resulting map replaces the live one
    /// in a single swap.
    Snapshot,
}
impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => f.write_str("incremental"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// What had to happen to one listed file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effort {
    /// Modification time matched the cached entry; reused without any I/O.
    Cached,
    /// Unchanged, but read again anyway (snapshot strategy).
    Refreshed,
    /// Cached, but the modification time differs on disk.
    Updated,
    /// Not cached yet.
    Added,
}

/// Counters describing one completed reconcile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Files reused from the cache without reading them.
    pub cached: usize,
    /// Unchanged files that were read again (snapshot strategy only).
    pub refreshed: usize,
    /// Files whose content was reloaded because they changed.
    pub updated: usize,
    /// Files loaded for the first time.
    pub added: usize,
    /// Cached keys dropped because their file is gone.
    pub removed: usize,
    /// Files that could not be read this time; any previous entry is kept.
    pub skipped: usize,
    /// Number of entries in the cache after the commit.
    pub files: usize,
}
impl ReconcileStats {
    /// Whether this reconcile changed the key set or any content.
    pub fn changed(&self) -> bool {
        self.updated + self.added + self.removed > 0
    }

    fn record(&mut self, effort: Effort) {
        match effort {
            Effort::Cached => self.cached += 1,
            Effort::Refreshed => self.refreshed += 1,
            Effort::Updated => self.updated += 1,
            Effort::Added => self.added += 1,
        }
    }
}

/// Brings a [`FileCache`] into agreement with a storage backend.
///
/// Ignore rules are applied by the backend (see
/// [`FilteredBackend`](memserve_storage::backend::FilteredBackend)): an ignored
/// file is simply never listed, so an entry cached before the rule applied is
/// purged like any other file that was not seen.
///
/// # Examples
///
/// ```no_run
/// use memserve_cache::{FileCache, Reconciler, Strategy};
/// use memserve_storage::{BackendHandle, backend::LocalBackend};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend: BackendHandle = Arc::new(LocalBackend::new("public", "/srv/www")?);
/// let cache = Arc::new(FileCache::new());
/// let reconciler = Reconciler::new(backend, cache.clone()).with_strategy(Strategy::Snapshot);
/// let stats = reconciler.reconcile().await?;
/// println!("{} files cached", stats.files);
/// # Ok(())
/// # }
/// ```
pub struct Reconciler {
    backend: BackendHandle,
    cache: Arc<FileCache>,
    strategy: Strategy,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(backend: BackendHandle, cache: Arc<FileCache>) -> Self {
        Self {
            backend,
            cache,
            strategy: Strategy::default(),
            concurrency: DEFAULT_READ_CONCURRENCY,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Limit how many files are read from disk at once (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    /// Run one reconcile.
    ///
    /// The directory walk and all file reads happen without holding the
    /// cache's exclusive lock; the delta is committed at the very end. If the
    /// walk fails nothing is committed and the previous state stays visible.
    /// A single unreadable file does not fail the reconcile: it keeps its
    /// previous entry (if any) and is counted as skipped. A file that
    /// vanished between listing and reading is treated as deleted.
    pub async fn reconcile(&self) -> Result<ReconcileStats> {
        let started = Instant::now();
        let writer = self.cache.begin().await;
        let previous = writer.snapshot();
        let mut stats = ReconcileStats::default();

        let plan = self.plan(&previous).await?;

        // Everything that survives this reconcile, cache hits included.
        let mut seen: HashSet<String> = HashSet::with_capacity(plan.len());
        let mut to_read = Vec::new();
        for (info, effort) in plan {
            match effort {
                Effort::Cached => {
                    stats.record(effort);
                    seen.insert(info.key);
                },
                _ => to_read.push((info, effort)),
            }
        }

        let mut loaded = Vec::with_capacity(to_read.len());
        let mut reads = futures::stream::iter(to_read)
            .map(|(info, effort)| async move {
                let result = self.backend.read(&info.path).await;
                (info, effort, result)
            })
            .buffer_unordered(self.concurrency);
        while let Some((info, effort, result)) = reads.next().await {
            match result {
                Ok(content) => {
                    stats.record(effort);
                    tracing::trace!(key = %info.key, bytes = content.len(), ?effort, "Loaded file");
                    let entry = Arc::new(CacheEntry::new(content, info.modified));
                    seen.insert(info.key.clone());
                    loaded.push((info.key, entry));
                },
                Err(e) if e.is_not_found() => {
                    tracing::debug!(key = %info.key, "File vanished before it could be read");
                },
                Err(e) => {
                    stats.skipped += 1;
                    let kept = previous.contains_key(&info.key);
                    if kept {
                        seen.insert(info.key.clone());
                    }
                    let reason = e.to_string();
                    tracing::warn!(key = %info.key, error = %reason, kept_previous = kept, "Skipping unreadable file");
                },
            }
        }
        drop(reads);

        let removals: Vec<String> = previous.keys().filter(|key| !seen.contains(*key)).cloned().collect();
        stats.removed = removals.len();
        stats.files = seen.len();

        match self.strategy {
            Strategy::Incremental => writer.commit(loaded, removals),
            Strategy::Snapshot => {
                let mut replacement: HashMap<String, Arc<CacheEntry>> = HashMap::with_capacity(seen.len());
                replacement.extend(loaded);
                // Entries that were skipped keep their previous value.
                for key in seen {
                    if !replacement.contains_key(&key)
                        && let Some(entry) = previous.get(&key)
                    {
                        replacement.insert(key, entry.clone());
                    }
                }
                writer.replace(replacement);
            },
        }

        tracing::info!(
            backend = self.backend.name(),
            strategy = %self.strategy,
            files = stats.files,
            cached = stats.cached,
            refreshed = stats.refreshed,
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            skipped = stats.skipped,
            bytes = self.cache.total_bytes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reconciled cache with disk"
        );
        Ok(stats)
    }

    /// Walk the backend and decide, per file, what needs doing.
    ///
    /// Any listing error aborts the whole plan.
    async fn plan(&self, previous: &HashMap<String, Arc<CacheEntry>>) -> Result<Vec<(FileInfo, Effort)>> {
        let listing: StorageResult<Vec<FileInfo>> = self.backend.list_stream().try_collect().await;
        let files = listing.or_raise(|| ErrorKind::Listing(self.backend.name().to_string()))?;
        let plan = files
            .into_iter()
            .map(|info| {
                let effort = match (previous.get(&info.key), self.strategy) {
                    (Some(entry), Strategy::Incremental) if entry.modified() == info.modified => Effort::Cached,
                    (Some(entry), Strategy::Snapshot) if entry.modified() == info.modified => Effort::Refreshed,
                    (Some(_), _) => Effort::Updated,
                    (None, _) => Effort::Added,
                };
                (info, effort)
            })
            .collect();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memserve_storage::backend::{FilteredBackend, IgnorePattern, LocalBackend, MockBackend};
    use rstest::rstest;
    use time::{Duration, OffsetDateTime};

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + seconds)
    }

    async fn mock(files: &[(&str, &str, i64)]) -> Arc<MockBackend> {
        let backend = MockBackend::default();
        for (path, content, modified) in files {
            backend.write_at(path, *content, at(*modified)).await;
        }
        Arc::new(backend)
    }

    fn reconciler(backend: &Arc<MockBackend>, strategy: Strategy) -> Reconciler {
        let handle: BackendHandle = backend.clone();
        Reconciler::new(handle, Arc::new(FileCache::new())).with_strategy(strategy)
    }

    fn content(cache: &FileCache, key: &str) -> Option<String> {
        cache.lookup(key).map(|entry| String::from_utf8(entry.content().to_vec()).unwrap())
    }

    #[rstest]
    #[tokio::test]
    async fn test_initial_load(#[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy) {
        let backend = mock(&[("a.txt", "hello", 1), ("dir/b.txt", "world", 2)]).await;
        let reconciler = reconciler(&backend, strategy);
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.added, 2);
        assert_eq!(stats.files, 2);
        let cache = reconciler.cache();
        assert_eq!(content(cache, "a.txt").as_deref(), Some("hello"));
        assert_eq!(cache.lookup("dir/b.txt").unwrap().modified(), at(2));
        assert!(cache.lookup("dir").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_modify_then_delete(#[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy) {
        let backend = mock(&[("a.txt", "hello", 1)]).await;
        let reconciler = reconciler(&backend, strategy);
        reconciler.reconcile().await.unwrap();
        let cache = reconciler.cache();
        let entry = cache.lookup("a.txt").unwrap();
        assert_eq!((entry.content().as_ref(), entry.modified()), (&b"hello"[..], at(1)));

        backend.write_at("a.txt", "world", at(2)).await;
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.updated, 1);
        let entry = cache.lookup("a.txt").unwrap();
        assert_eq!((entry.content().as_ref(), entry.modified()), (&b"world"[..], at(2)));

        backend.remove("a.txt").await;
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(cache.lookup("a.txt").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_skips_unchanged_files() {
        let backend = mock(&[("a.txt", "a", 1), ("b.txt", "b", 1)]).await;
        let reconciler = reconciler(&backend, Strategy::Incremental);
        reconciler.reconcile().await.unwrap();
        assert_eq!(backend.total_reads().await, 2);

        backend.write_at("b.txt", "b2", at(5)).await;
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(backend.read_count("a.txt").await, 1);
        assert_eq!(backend.read_count("b.txt").await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_rereads_everything() {
        let backend = mock(&[("a.txt", "a", 1), ("b.txt", "b", 1)]).await;
        let reconciler = reconciler(&backend, Strategy::Snapshot);
        reconciler.reconcile().await.unwrap();
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.refreshed, 2);
        assert!(!stats.changed());
        assert_eq!(backend.read_count("a.txt").await, 2);
    }

    #[tokio::test]
    async fn test_content_change_with_same_mtime_is_not_detected() {
        // Modification time is the only change signal.
        let backend = mock(&[("a.txt", "old", 1)]).await;
        let reconciler = reconciler(&backend, Strategy::Incremental);
        reconciler.reconcile().await.unwrap();
        backend.write_at("a.txt", "new", at(1)).await;
        reconciler.reconcile().await.unwrap();
        assert_eq!(content(reconciler.cache(), "a.txt").as_deref(), Some("old"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_idempotent(#[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy) {
        let backend = mock(&[("a.txt", "a", 1), ("x/y/z.txt", "z", 3)]).await;
        let reconciler = reconciler(&backend, strategy);
        reconciler.reconcile().await.unwrap();
        let once: Vec<_> = reconciler.cache().keys().into_iter().map(|k| (k.clone(), reconciler.cache().lookup(&k))).collect();
        let stats = reconciler.reconcile().await.unwrap();
        assert!(!stats.changed());
        let twice: Vec<_> = reconciler.cache().keys().into_iter().map(|k| (k.clone(), reconciler.cache().lookup(&k))).collect();
        assert_eq!(once, twice);
    }

    #[rstest]
    #[tokio::test]
    async fn test_listing_failure_leaves_cache_untouched(
        #[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy,
    ) {
        let backend = mock(&[("a.txt", "a", 1), ("b.txt", "b", 1), ("c.txt", "c", 1)]).await;
        let reconciler = reconciler(&backend, strategy);
        reconciler.reconcile().await.unwrap();
        let before = reconciler.cache().keys();

        backend.write_at("a.txt", "changed", at(9)).await;
        backend.remove("c.txt").await;
        backend.write_at("d.txt", "new", at(9)).await;
        backend.fail_listing(true);
        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Listing(_)));
        assert!(err.is_retryable());
        assert_eq!(reconciler.cache().keys(), before);
        assert_eq!(content(reconciler.cache(), "a.txt").as_deref(), Some("a"));

        backend.fail_listing(false);
        reconciler.reconcile().await.unwrap();
        assert_eq!(reconciler.cache().keys(), vec!["a.txt", "b.txt", "d.txt"]);
        assert_eq!(content(reconciler.cache(), "a.txt").as_deref(), Some("changed"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_unreadable_file_keeps_previous_entry(
        #[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy,
    ) {
        let backend = mock(&[("a.txt", "a", 1), ("b.txt", "b", 1)]).await;
        let reconciler = reconciler(&backend, strategy);
        reconciler.reconcile().await.unwrap();

        backend.write_at("a.txt", "a2", at(2)).await;
        backend.write_at("b.txt", "b2", at(2)).await;
        backend.write_at("new.txt", "n", at(2)).await;
        backend.make_unreadable("a.txt").await;
        backend.make_unreadable("new.txt").await;
        let stats = reconciler.reconcile().await.unwrap();
        assert_eq!(stats.skipped, 2);
        let cache = reconciler.cache();
        // Stale but present, the other file still updated, the new one absent.
        assert_eq!(content(cache, "a.txt").as_deref(), Some("a"));
        assert_eq!(cache.lookup("a.txt").unwrap().modified(), at(1));
        assert_eq!(content(cache, "b.txt").as_deref(), Some("b2"));
        assert!(cache.lookup("new.txt").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_newly_ignored_file_is_purged(#[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy) {
        let backend = mock(&[(".hidden", "secret", 1), ("visible.txt", "hello", 1)]).await;
        let cache = Arc::new(FileCache::new());
        let unfiltered: BackendHandle = backend.clone();
        Reconciler::new(unfiltered.clone(), cache.clone()).with_strategy(strategy).reconcile().await.unwrap();
        assert!(cache.lookup(".hidden").is_some());

        let filtered: BackendHandle = Arc::new(FilteredBackend::new(unfiltered, IgnorePattern::new(r"^\.").unwrap()));
        let stats = Reconciler::new(filtered, cache.clone()).with_strategy(strategy).reconcile().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(cache.lookup(".hidden").is_none());
        assert!(cache.lookup("visible.txt").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_are_serialized() {
        let backend = mock(&[("a.txt", "a", 1)]).await;
        let reconciler = Arc::new(reconciler(&backend, Strategy::Incremental));
        let (first, second) = tokio::join!(reconciler.reconcile(), reconciler.reconcile());
        let (first, second) = (first.unwrap(), second.unwrap());
        // Exactly one of them loaded the file; the other saw it cached.
        assert_eq!(first.added + second.added, 1);
        assert_eq!(first.cached + second.cached, 1);
        assert_eq!(backend.read_count("a.txt").await, 1);
    }

    #[tokio::test]
    async fn test_local_scenario() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.txt");
        let set_mtime = |seconds: i64| {
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(at(seconds).into()).unwrap();
        };
        let backend: BackendHandle = Arc::new(LocalBackend::new("local", temp_dir.path()).unwrap());
        let reconciler = Reconciler::new(backend, Arc::new(FileCache::new()));
        let cache = reconciler.cache();

        std::fs::write(&path, "hello").unwrap();
        set_mtime(1);
        reconciler.reconcile().await.unwrap();
        let entry = cache.lookup("a.txt").unwrap();
        assert_eq!(entry.content().as_ref(), b"hello");
        assert_eq!(entry.modified(), at(1));

        std::fs::write(&path, "world").unwrap();
        set_mtime(2);
        reconciler.reconcile().await.unwrap();
        let entry = cache.lookup("a.txt").unwrap();
        assert_eq!(entry.content().as_ref(), b"world");
        assert_eq!(entry.modified(), at(2));

        std::fs::remove_file(&path).unwrap();
        reconciler.reconcile().await.unwrap();
        assert!(cache.lookup("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_local_ignore_scenario() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join(".hidden"), "secret").unwrap();
        std::fs::write(temp_dir.path().join("visible.txt"), "hello").unwrap();
        let local: BackendHandle = Arc::new(LocalBackend::new("local", temp_dir.path()).unwrap());
        let backend: BackendHandle = Arc::new(FilteredBackend::new(local, IgnorePattern::new(r"^\.").unwrap()));
        let reconciler = Reconciler::new(backend, Arc::new(FileCache::new()));
        reconciler.reconcile().await.unwrap();
        assert!(reconciler.cache().lookup(".hidden").is_none());
        assert_eq!(content(reconciler.cache(), "visible.txt").as_deref(), Some("hello"));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_never_see_torn_entries(
        #[values(Strategy::Incremental, Strategy::Snapshot)] strategy: Strategy,
    ) {
        // Content encodes the modification time it was written with, so a
        // reader can verify every entry it sees is internally consistent.
        const FILES: usize = 16;
        const ROUNDS: i64 = 20;
        let backend = Arc::new(MockBackend::default());
        for i in 0..FILES {
            backend.write_at(format!("f{i}.txt"), "0", at(0)).await;
        }
        let reconciler = Arc::new(reconciler(&backend, strategy));
        reconciler.reconcile().await.unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = reconciler.cache().clone();
            let stop = stop.clone();
            readers.push(tokio::spawn(async move {
                let mut observed = 0usize;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    for i in 0..FILES {
                        let key = format!("f{i}.txt");
                        if let Some(entry) = cache.lookup(&key) {
                            let round: i64 = std::str::from_utf8(entry.content()).unwrap().parse().unwrap();
                            assert_eq!(entry.modified(), at(round), "torn entry for {key}");
                            observed += 1;
                        }
                        // Keys outside f0..f{FILES} never existed in any state.
                        assert!(cache.lookup("ghost.txt").is_none());
                    }
                    tokio::task::yield_now().await;
                }
                observed
            }));
        }

        for round in 1..=ROUNDS {
            for i in 0..FILES {
                // Odd files are removed and re-added every other round.
                if i % 2 == 1 && round % 2 == 0 {
                    backend.remove(format!("f{i}.txt")).await;
                } else {
                    backend.write_at(format!("f{i}.txt"), round.to_string(), at(round)).await;
                }
            }
            reconciler.reconcile().await.unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert_eq!(reconciler.cache().len(), FILES / 2);
    }
}
