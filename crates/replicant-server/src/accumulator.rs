//! Collects the effects of one operation on one session.

use std::collections::HashMap;

use replicant_core::{
    ChangeSet, ChannelAction, ChannelAddress, ChannelChange, EntityKey, EntityMessage, Filter,
};

/// Channel actions and entity messages destined for one session.
///
/// Messages for the same entity are merged, keeping the position of the
/// first occurrence.
#[derive(Debug, Clone, Default)]
pub struct ChangeAccumulator {
    channel_actions: Vec<ChannelChange>,
    messages: Vec<EntityMessage>,
    index: HashMap<EntityKey, usize>,
    etag: Option<String>,
}

impl ChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel_action(&mut self, channel: ChannelAddress, action: ChannelAction, filter: Option<Filter>) {
        self.channel_actions.push(ChannelChange {
            channel,
            action,
            filter,
        });
    }

    pub fn add_message(&mut self, message: EntityMessage) {
        match self.index.get(&message.key()) {
            Some(&position) => self.messages[position].merge(&message),
            None => {
                self.index.insert(message.key(), self.messages.len());
                self.messages.push(message);
            }
        }
    }

    pub fn add_messages<'a>(&mut self, messages: impl IntoIterator<Item = &'a EntityMessage>) {
        for message in messages {
            self.add_message(message.clone());
        }
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.etag = Some(etag.into());
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn channel_actions(&self) -> &[ChannelChange] {
        &self.channel_actions
    }

    pub fn messages(&self) -> &[EntityMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.channel_actions.is_empty() && self.messages.is_empty()
    }

    /// Build the change set. The sequence is assigned when it is queued.
    pub fn into_change_set(self, request_id: Option<u32>) -> ChangeSet {
        ChangeSet {
            sequence: 0,
            request_id,
            etag: self.etag,
            channel_actions: self.channel_actions,
            changes: self.messages.iter().map(EntityMessage::to_change).collect(),
        }
    }
}
