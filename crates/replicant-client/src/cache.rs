//! Client-side cache of channel payloads.
//!
//! When a cacheable channel's change set arrives with an ETag it is stored
//! here. On reconnect the client reports the ETags it holds and the server
//! may answer a subscribe with `use-cache`, in which case the stored text
//! is replayed as an out-of-band change set.

use std::collections::BTreeMap;

/// A cached channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Opaque version token issued by the server.
    pub etag: String,
    /// The raw change set text.
    pub content: String,
}

/// Storage for cached channel payloads.
pub trait CacheService {
    fn lookup(&self, key: &str) -> Option<CacheEntry>;

    /// Store or replace a payload. Returns false if the cache refused it.
    fn store(&mut self, key: &str, etag: &str, content: &str) -> bool;

    /// Drop a cached payload.
    fn invalidate(&mut self, key: &str) -> bool;

    /// Keys and ETags of every stored payload.
    fn etags(&self) -> BTreeMap<String, String>;
}

/// In-memory cache service.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheService {
    entries: BTreeMap<String, CacheEntry>,
}

impl MemoryCacheService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheService for MemoryCacheService {
    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: &str, etag: &str, content: &str) -> bool {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                etag: etag.to_string(),
                content: content.to_string(),
            },
        );
        true
    }

    fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn etags(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.etag.clone()))
            .collect()
    }
}
