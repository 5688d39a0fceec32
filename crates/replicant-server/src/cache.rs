//! Server-side channel cache.
//!
//! Each cacheable channel address has its own entry guarded by its own
//! `RwLock`, so computing the contents of one channel never blocks readers
//! or writers of another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use replicant_core::{ChannelAddress, EntityMessage, ProtocolError, SchemaMetaData};

use crate::error::{Result, ServerError};
use crate::hooks::ReplicantHooks;

/// A populated cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedChannel {
    pub cache_key: String,
    pub messages: Arc<Vec<EntityMessage>>,
}

/// Cache slot for one channel address.
#[derive(Debug)]
pub struct ChannelCacheEntry {
    address: ChannelAddress,
    content: RwLock<Option<CachedChannel>>,
}

impl ChannelCacheEntry {
    fn new(address: ChannelAddress) -> Self {
        Self {
            address,
            content: RwLock::new(None),
        }
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub async fn is_initialized(&self) -> bool {
        self.content.read().await.is_some()
    }
}

/// Compute the cache key for a payload: hex-encoded BLAKE3 of its JSON form.
pub fn compute_cache_key(messages: &[EntityMessage]) -> Result<String> {
    let bytes = serde_json::to_vec(messages).map_err(ProtocolError::from)?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

/// Cache of collected channel contents shared by all sessions.
#[derive(Debug, Default)]
pub struct ChannelCache {
    entries: RwLock<HashMap<ChannelAddress, Arc<ChannelCacheEntry>>>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, address: &ChannelAddress) -> Arc<ChannelCacheEntry> {
        if let Some(entry) = self.entries.read().await.get(address) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(address.clone())
                .or_insert_with(|| Arc::new(ChannelCacheEntry::new(address.clone()))),
        )
    }

    /// Return the cached contents of `address`, collecting them on a miss.
    ///
    /// Returns `None` when the channel root no longer exists; nothing is
    /// cached in that case.
    pub async fn ensure<H: ReplicantHooks + ?Sized>(
        &self,
        address: &ChannelAddress,
        hooks: &H,
    ) -> Result<Option<CachedChannel>> {
        let entry = self.entry(address).await;
        if let Some(cached) = entry.content.read().await.as_ref() {
            debug!(channel = %address, cache_key = %cached.cache_key, "Cache hit");
            return Ok(Some(cached.clone()));
        }

        let mut content = entry.content.write().await;
        // Another task may have populated the entry while we waited.
        if let Some(cached) = content.as_ref() {
            return Ok(Some(cached.clone()));
        }

        debug!(channel = %address, "Cache miss");
        let data = hooks
            .collect_data_for_subscribe(address, None)
            .await
            .map_err(ServerError::Collector)?;
        if data.channel_root_deleted {
            drop(content);
            self.release(address, &entry).await;
            return Ok(None);
        }
        let cache_key = match data.cache_key {
            Some(key) => key,
            None => compute_cache_key(&data.messages)?,
        };
        let cached = CachedChannel {
            cache_key,
            messages: Arc::new(data.messages),
        };
        *content = Some(cached.clone());
        Ok(Some(cached))
    }

    /// Remove the slot for `address` unless it has been replaced meanwhile.
    async fn release(&self, address: &ChannelAddress, entry: &Arc<ChannelCacheEntry>) {
        let mut entries = self.entries.write().await;
        if entries.get(address).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            entries.remove(address);
        }
    }

    /// Drop the cached contents of `address` along with its slot. Returns
    /// whether anything was cached.
    pub async fn purge(&self, address: &ChannelAddress) -> bool {
        let Some(entry) = self.entries.write().await.remove(address) else {
            return false;
        };
        let purged = entry.content.write().await.take().is_some();
        if purged {
            info!(channel = %address, "Cache purged");
        }
        purged
    }

    /// Purge `address` and, for type channels, every cacheable type channel
    /// that depends on it.
    pub async fn purge_with_dependents(&self, schema: &SchemaMetaData, address: &ChannelAddress) -> usize {
        let mut purged = usize::from(self.purge(address).await);
        if address.root_id.is_none() {
            for dependent in schema.cache_dependents(address.channel_id) {
                let dependent = ChannelAddress::type_channel(schema.id, dependent);
                purged += usize::from(self.purge(&dependent).await);
            }
        }
        purged
    }

    /// Number of channel slots currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// The cached contents of `address`, if populated.
    pub async fn get(&self, address: &ChannelAddress) -> Option<CachedChannel> {
        let entry = self.entries.read().await.get(address).cloned()?;
        let content = entry.content.read().await;
        content.clone()
    }
}
