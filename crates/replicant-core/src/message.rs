//! Server-side entity messages.
//!
//! An entity message records one mutation produced by the server's domain
//! layer, the channels it routes to, and the graph links it introduces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::change::{EntityChange, EntityKey};
use crate::channel::ChannelAddress;

/// A declared relation: a session subscribed to `source` should follow to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelLink {
    pub source: ChannelAddress,
    pub target: ChannelAddress,
}

impl ChannelLink {
    pub fn new(source: ChannelAddress, target: ChannelAddress) -> Self {
        Self { source, target }
    }
}

/// One entity mutation with routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMessage {
    pub entity_type: u32,
    pub id: i32,
    /// Channels the entity belongs to.
    pub channels: Vec<ChannelAddress>,
    /// Attribute values; `None` marks a deletion.
    pub data: Option<Map<String, Value>>,
    pub links: Vec<ChannelLink>,
}

impl EntityMessage {
    /// An update message with no attributes yet.
    pub fn update(entity_type: u32, id: i32) -> Self {
        Self {
            entity_type,
            id,
            channels: Vec::new(),
            data: Some(Map::new()),
            links: Vec::new(),
        }
    }

    /// A deletion message.
    pub fn delete(entity_type: u32, id: i32) -> Self {
        Self {
            entity_type,
            id,
            channels: Vec::new(),
            data: None,
            links: Vec::new(),
        }
    }

    pub fn in_channel(mut self, address: ChannelAddress) -> Self {
        if !self.channels.contains(&address) {
            self.channels.push(address);
        }
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Some(data) = self.data.as_mut() {
            data.insert(name.into(), value.into());
        }
        self
    }

    pub fn link(mut self, source: ChannelAddress, target: ChannelAddress) -> Self {
        let link = ChannelLink::new(source, target);
        if !self.links.contains(&link) {
            self.links.push(link);
        }
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id)
    }

    pub fn is_delete(&self) -> bool {
        self.data.is_none()
    }

    /// Fold a later message for the same entity into this one.
    ///
    /// The later message's attributes win; channels and links accumulate.
    pub fn merge(&mut self, later: &EntityMessage) {
        debug_assert_eq!(self.key(), later.key());
        match (&mut self.data, &later.data) {
            (Some(existing), Some(update)) => {
                for (name, value) in update {
                    existing.insert(name.clone(), value.clone());
                }
            }
            (data, update) => *data = update.clone(),
        }
        for channel in &later.channels {
            if !self.channels.contains(channel) {
                self.channels.push(channel.clone());
            }
        }
        for link in &later.links {
            if !self.links.contains(link) {
                self.links.push(link.clone());
            }
        }
    }

    /// The wire form sent to clients.
    pub fn to_change(&self) -> EntityChange {
        EntityChange {
            entity_type: self.entity_type,
            id: self.id,
            channels: self.channels.clone(),
            data: self.data.clone(),
        }
    }
}
