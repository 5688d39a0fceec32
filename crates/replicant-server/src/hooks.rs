//! Application hooks consumed by the session manager.
//!
//! The engine never reads application data itself. Everything it sends is
//! produced by a [`ReplicantHooks`] implementation: initial channel contents,
//! filtered views of entity updates, link policy, authorization and command
//! execution.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use replicant_core::{ChannelAddress, EntityMessage, Filter};

use crate::subscription::SubscriptionEntry;

/// Data collected for a single channel subscription.
#[derive(Debug, Clone, Default)]
pub struct CollectedData {
    pub messages: Vec<EntityMessage>,
    /// Cache key to use instead of a digest of `messages`.
    pub cache_key: Option<String>,
    /// The channel's root entity no longer exists.
    pub channel_root_deleted: bool,
}

impl CollectedData {
    pub fn new(messages: Vec<EntityMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn root_deleted() -> Self {
        Self {
            channel_root_deleted: true,
            ..Self::default()
        }
    }
}

/// Data collected for several addresses of one channel in a single pass.
#[derive(Debug, Clone, Default)]
pub struct BulkCollectedData {
    pub messages: Vec<EntityMessage>,
    /// Addresses whose root entity no longer exists.
    pub deleted: BTreeSet<ChannelAddress>,
}

/// Hooks supplied by the application.
#[async_trait]
pub trait ReplicantHooks: Send + Sync {
    /// Collect the full contents of `address`.
    async fn collect_data_for_subscribe(
        &self,
        address: &ChannelAddress,
        filter: Option<&Filter>,
    ) -> anyhow::Result<CollectedData>;

    /// Collect several addresses of one channel at once.
    ///
    /// Returning `None` makes the manager fall back to
    /// [`collect_data_for_subscribe`](Self::collect_data_for_subscribe) per address.
    async fn bulk_collect_data_for_subscribe(
        &self,
        _addresses: &[ChannelAddress],
        _filter: Option<&Filter>,
    ) -> anyhow::Result<Option<BulkCollectedData>> {
        Ok(None)
    }

    /// Collect what a client needs after the filter of `address` changed.
    async fn collect_data_for_subscription_update(
        &self,
        address: &ChannelAddress,
        _original_filter: Option<&Filter>,
        filter: Option<&Filter>,
    ) -> anyhow::Result<Vec<EntityMessage>> {
        Ok(self.collect_data_for_subscribe(address, filter).await?.messages)
    }

    /// Bulk form of [`collect_data_for_subscription_update`](Self::collect_data_for_subscription_update).
    async fn bulk_collect_data_for_subscription_update(
        &self,
        _addresses: &[ChannelAddress],
        _filter: Option<&Filter>,
    ) -> anyhow::Result<Option<Vec<EntityMessage>>> {
        Ok(None)
    }

    /// The view of `message` a subscriber of `address` with `filter` may see.
    fn filter_entity_message(
        &self,
        _address: &ChannelAddress,
        _filter: Option<&Filter>,
        message: &EntityMessage,
    ) -> Option<EntityMessage> {
        Some(message.clone())
    }

    /// Whether a link from `source` into the filtered channel `target` is followed.
    ///
    /// Links into unfiltered channels are always followed.
    fn should_follow_link(&self, _source: &SubscriptionEntry, _target: &ChannelAddress) -> bool {
        false
    }

    /// Filter for a subscription created by following a link.
    fn link_filter(&self, source: &SubscriptionEntry, _target: &ChannelAddress) -> Option<Filter> {
        source.filter().cloned()
    }

    async fn authorize(&self, _session_id: &str, _token: &str) -> bool {
        true
    }

    /// Run an application command, returning the resulting entity messages.
    async fn execute(
        &self,
        _session_id: &str,
        command: &str,
        _payload: &Value,
    ) -> anyhow::Result<Vec<EntityMessage>> {
        anyhow::bail!("unknown command: {}", command)
    }
}
