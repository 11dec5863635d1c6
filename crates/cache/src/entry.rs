use bytes::Bytes;
use std::fmt;
use time::OffsetDateTime;

/// One file's materialized state.
///
/// Built once from a single read and never mutated afterwards; the cache
/// hands out `Arc<CacheEntry>` so that content and modification time always
/// travel together. Replacing a file's content means replacing the entry.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    content: Bytes,
    modified: OffsetDateTime,
    etag: String,
}
impl CacheEntry {
    pub fn new(content: impl Into<Bytes>, modified: OffsetDateTime) -> Self {
        let content = content.into();
        // 128 bits of BLAKE3 is plenty to tell two versions of a file apart.
        let etag = format!("\"{}\"", &blake3::hash(&content).to_hex()[..32]);
        Self { content, modified, etag }
    }

    /// File content. Cloning [`Bytes`] is a reference count bump.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// On-disk modification time the content was read against.
    pub fn modified(&self) -> OffsetDateTime {
        self.modified
    }

    /// Strong entity tag (quoted) derived from the content.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("len", &self.content.len())
            .field("modified", &self.modified)
            .field("etag", &self.etag)
            .finish()
    }
}
