//! Change sets: the unit of replication delivered to clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::ChannelAddress;
use crate::Filter;

/// Identifies one entity instance across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: u32,
    pub id: i32,
}

impl EntityKey {
    pub const fn new(entity_type: u32, id: i32) -> Self {
        Self { entity_type, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// What happened to a channel in a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAction {
    /// The client is now subscribed.
    Add,
    /// The client is no longer subscribed.
    Remove,
    /// The subscription's filter changed.
    Update,
    /// The channel root was deleted; the subscription is gone.
    Delete,
}

/// A channel-level action inside a change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelChange {
    pub channel: ChannelAddress,
    pub action: ChannelAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

/// A wire-level diff for one entity.
///
/// `data == None` means the entity was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    #[serde(rename = "type")]
    pub entity_type: u32,
    pub id: i32,
    /// Channels the entity belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl EntityChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id)
    }

    pub fn is_removal(&self) -> bool {
        self.data.is_none()
    }
}

/// A sequenced batch of entity changes and channel actions.
///
/// Out-of-band change sets (replayed from a client cache) carry no
/// sequence, request id or etag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(rename = "seq", default)]
    pub sequence: u32,
    #[serde(rename = "req", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "channels", default, skip_serializing_if = "Vec::is_empty")]
    pub channel_actions: Vec<ChannelChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<EntityChange>,
}

impl ChangeSet {
    /// Whether the set carries neither channel actions nor entity changes.
    pub fn is_empty(&self) -> bool {
        self.channel_actions.is_empty() && self.changes.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}
