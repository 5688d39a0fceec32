//! Local record of the subscriptions the server has confirmed.
//!
//! The registry tracks which channels this client is subscribed to, with
//! what filter, and which entities arrived through which channel, so that
//! entities can be dropped once no subscribed channel holds them.

use std::collections::{BTreeMap, BTreeSet};

use replicant_core::{ChannelAddress, EntityKey, Filter};

/// One subscription as acknowledged by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSubscription {
    pub address: ChannelAddress,
    pub filter: Option<Filter>,
    /// Requested by this client rather than implied by the server.
    pub explicit: bool,
    entities: BTreeSet<EntityKey>,
}

impl LocalSubscription {
    pub fn entities(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Subscriptions and entity membership for every schema.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<ChannelAddress, LocalSubscription>,
    entity_channels: BTreeMap<EntityKey, BTreeSet<ChannelAddress>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription, or update the filter of an existing one.
    ///
    /// `explicit` only ever upgrades an implicit subscription.
    pub fn record_subscription(
        &mut self,
        address: ChannelAddress,
        filter: Option<Filter>,
        explicit: bool,
    ) -> &LocalSubscription {
        let subscription = self
            .subscriptions
            .entry(address.clone())
            .or_insert_with(|| LocalSubscription {
                address,
                filter: None,
                explicit: false,
                entities: BTreeSet::new(),
            });
        subscription.filter = filter;
        subscription.explicit |= explicit;
        subscription
    }

    pub fn update_filter(&mut self, address: &ChannelAddress, filter: Option<Filter>) -> bool {
        match self.subscriptions.get_mut(address) {
            Some(subscription) => {
                subscription.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &ChannelAddress) -> Option<&LocalSubscription> {
        self.subscriptions.get(address)
    }

    pub fn is_subscribed(&self, address: &ChannelAddress) -> bool {
        self.subscriptions.contains_key(address)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &LocalSubscription> {
        self.subscriptions.values()
    }

    pub fn subscriptions_for_schema(&self, schema_id: u32) -> impl Iterator<Item = &LocalSubscription> {
        self.subscriptions
            .values()
            .filter(move |s| s.address.schema_id == schema_id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Record that `entity` belongs to each of `channels`.
    ///
    /// Channels this client is not subscribed to are ignored.
    pub fn link_entity<'a>(
        &mut self,
        entity: EntityKey,
        channels: impl IntoIterator<Item = &'a ChannelAddress>,
    ) {
        for address in channels {
            if let Some(subscription) = self.subscriptions.get_mut(address) {
                subscription.entities.insert(entity);
                self.entity_channels
                    .entry(entity)
                    .or_default()
                    .insert(address.clone());
            }
        }
    }

    /// Forget an entity entirely.
    pub fn unlink_entity(&mut self, entity: EntityKey) {
        if let Some(channels) = self.entity_channels.remove(&entity) {
            for address in channels {
                if let Some(subscription) = self.subscriptions.get_mut(&address) {
                    subscription.entities.remove(&entity);
                }
            }
        }
    }

    /// Whether `entity` still belongs to any subscribed channel.
    pub fn is_entity_referenced(&self, entity: EntityKey) -> bool {
        self.entity_channels
            .get(&entity)
            .is_some_and(|channels| !channels.is_empty())
    }

    /// Remove `entity` from one channel. Returns true if it is now orphaned.
    pub fn remove_entity_from_channel(&mut self, address: &ChannelAddress, entity: EntityKey) -> bool {
        if let Some(subscription) = self.subscriptions.get_mut(address) {
            subscription.entities.remove(&entity);
        }
        match self.entity_channels.get_mut(&entity) {
            Some(channels) => {
                channels.remove(address);
                if channels.is_empty() {
                    self.entity_channels.remove(&entity);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Drop a subscription, returning the entities no other channel holds.
    pub fn remove_subscription(&mut self, address: &ChannelAddress) -> Vec<EntityKey> {
        let Some(subscription) = self.subscriptions.remove(address) else {
            return Vec::new();
        };
        let mut orphans = Vec::new();
        for entity in subscription.entities {
            if let Some(channels) = self.entity_channels.get_mut(&entity) {
                channels.remove(address);
                if channels.is_empty() {
                    self.entity_channels.remove(&entity);
                    orphans.push(entity);
                }
            }
        }
        orphans
    }

    /// Drop every subscription of a schema, returning orphaned entities.
    pub fn remove_schema(&mut self, schema_id: u32) -> Vec<EntityKey> {
        let addresses: Vec<_> = self
            .subscriptions
            .keys()
            .filter(|a| a.schema_id == schema_id)
            .cloned()
            .collect();
        let mut orphans = Vec::new();
        for address in addresses {
            orphans.extend(self.remove_subscription(&address));
        }
        orphans
    }
}
