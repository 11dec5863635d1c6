use crate::CacheEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

type Entries = HashMap<String, Arc<CacheEntry>>;

/// Key → entry map shared between request handlers and the reconciler.
///
/// Readers take the shared lock for as long as it takes to clone an `Arc`.
/// The only way to mutate the map is through a [`Reconcile`] handle from
/// [`begin`](Self::begin), and only one of those can exist at a time.
///
/// # Examples
///
/// ```
/// use memserve_cache::{CacheEntry, FileCache};
/// use time::OffsetDateTime;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = FileCache::new();
/// let writer = cache.begin().await;
/// writer.commit(vec![("a.txt".to_string(), CacheEntry::new(&b"hello"[..], OffsetDateTime::UNIX_EPOCH).into())], vec![]);
/// assert_eq!(cache.lookup("a.txt").unwrap().content().as_ref(), b"hello");
/// # }
/// ```
#[derive(Default)]
pub struct FileCache {
    entries: RwLock<Entries>,
    writer: Mutex<()>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the entry for `key`, if cached.
    ///
    /// May wait behind a commit's exclusive section, never behind disk I/O.
    pub fn lookup(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Total size of all cached content in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|entry| entry.len() as u64).sum()
    }

    /// Become the (single) writer.
    ///
    /// Waits for any other reconcile to finish. Lookups are unaffected.
    pub async fn begin(&self) -> Reconcile<'_> {
        let permit = self.writer.lock().await;
        Reconcile { cache: self, _permit: permit }
    }
}

/// Exclusive writer handle for a [`FileCache`].
///
/// Holding one does not block readers. Both ways of finishing a reconcile
/// consume the handle, so a reconcile commits at most once.
pub struct Reconcile<'a> {
    cache: &'a FileCache,
    _permit: MutexGuard<'a, ()>,
}

impl Reconcile<'_> {
    /// Copy of the current map. Stays accurate for the lifetime of this
    /// handle, since nobody else can write in the meantime.
    pub fn snapshot(&self) -> HashMap<String, Arc<CacheEntry>> {
        self.cache.entries.read().clone()
    }

    /// Apply an incremental delta: all upserts first, then all removals,
    /// under a single exclusive section.
    pub fn commit(self, upserts: Vec<(String, Arc<CacheEntry>)>, removals: Vec<String>) {
        if upserts.is_empty() && removals.is_empty() {
            return;
        }
        let mut evicted = Vec::with_capacity(removals.len());
        {
            let mut entries = self.cache.entries.write();
            entries.extend(upserts);
            for key in removals {
                if let Some(entry) = entries.remove(&key) {
                    evicted.push(entry);
                }
            }
        }
        // Release the content of evicted entries outside of the lock.
        drop(evicted);
    }

    /// Swap in a complete replacement map.
    pub fn replace(self, replacement: HashMap<String, Arc<CacheEntry>>) {
        let previous = std::mem::replace(&mut *self.cache.entries.write(), replacement);
        drop(previous);
    }
}
