//! One inbound change set moving through the data-load pipeline.

use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;

use replicant_core::{ChangeSet, ChannelAddress, EntityKey};

/// Counts reported when a data load completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataLoadStatus {
    pub schema_id: u32,
    /// Sequence of the applied change set; 0 for out-of-band loads.
    pub sequence: u32,
    /// Request resolved by this load, if any.
    pub request_id: Option<u32>,
    pub channel_adds: Vec<ChannelAddress>,
    pub channel_updates: Vec<ChannelAddress>,
    pub channel_removes: Vec<ChannelAddress>,
    pub entity_update_count: usize,
    pub entity_remove_count: usize,
    pub entity_link_count: usize,
}

/// Work item for a single inbound payload.
///
/// Phases only ever move forward.
#[derive(Debug)]
pub(crate) struct DataLoadAction {
    /// Raw text, dropped once parsed.
    pub raw: Option<String>,
    /// Replayed from the local cache; carries no sequence or request id.
    pub oob: bool,
    /// Request an out-of-band load completes.
    pub completes_request: Option<u32>,
    pub change_set: Option<ChangeSet>,
    /// Next entity change to apply.
    pub change_index: usize,
    /// Disable rather than pause the broker.
    pub bulk: bool,
    pub broker_paused: bool,
    pub channel_actions_processed: bool,
    pub links_calculated: bool,
    pub world_notified: bool,
    updated: Vec<EntityKey>,
    updated_set: BTreeSet<EntityKey>,
    removed: BTreeSet<EntityKey>,
    pub links_pending: VecDeque<EntityKey>,
    pub status: DataLoadStatus,
}

impl DataLoadAction {
    pub fn new(raw: String, oob: bool, schema_id: u32) -> Self {
        Self {
            raw: Some(raw),
            oob,
            completes_request: None,
            change_set: None,
            change_index: 0,
            bulk: false,
            broker_paused: false,
            channel_actions_processed: false,
            links_calculated: false,
            world_notified: false,
            updated: Vec::new(),
            updated_set: BTreeSet::new(),
            removed: BTreeSet::new(),
            links_pending: VecDeque::new(),
            status: DataLoadStatus {
                schema_id,
                ..DataLoadStatus::default()
            },
        }
    }

    pub fn out_of_band(raw: String, schema_id: u32, completes_request: u32) -> Self {
        let mut action = Self::new(raw, true, schema_id);
        action.completes_request = Some(completes_request);
        action
    }

    pub fn is_parsed(&self) -> bool {
        self.change_set.is_some()
    }

    pub fn sequence(&self) -> u32 {
        self.change_set.as_ref().map_or(0, |c| c.sequence)
    }

    /// Ordering key for the parsed queue: out-of-band first, then by sequence.
    pub fn sort_key(&self) -> (bool, u32) {
        (!self.oob, self.sequence())
    }

    /// The request this load resolves.
    pub fn request_id(&self) -> Option<u32> {
        if self.oob {
            self.completes_request
        } else {
            self.change_set.as_ref().and_then(|c| c.request_id)
        }
    }

    pub fn changes_remaining(&self) -> bool {
        self.change_set
            .as_ref()
            .is_some_and(|c| self.change_index < c.changes.len())
    }

    pub fn links_applied(&self) -> bool {
        self.links_calculated && self.links_pending.is_empty()
    }

    pub fn record_update(&mut self, key: EntityKey) {
        self.removed.remove(&key);
        if self.updated_set.insert(key) {
            self.updated.push(key);
        }
    }

    pub fn record_removal(&mut self, key: EntityKey) {
        self.removed.insert(key);
    }

    /// Updated entities that were not removed later in the same batch.
    pub fn calculate_links(&mut self) {
        let removed = &self.removed;
        self.links_pending = self
            .updated
            .iter()
            .filter(|key| !removed.contains(key))
            .copied()
            .collect();
        self.links_calculated = true;
    }
}
