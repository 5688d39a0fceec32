//! Test fixtures and helpers.
//!
//! A reference schema exercising every channel shape, canned entity
//! messages, recording server hooks and a recording area-of-interest
//! listener.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use replicant_client::AreaOfInterestListener;
use replicant_core::{ChannelAddress, ChannelMetaData, EntityMessage, Filter, FilterType, SchemaMetaData};
use replicant_server::{CollectedData, ReplicantHooks, SubscriptionEntry};

pub const SCHEMA_ID: u32 = 1;

/// Cached type channel holding reference data.
pub const META_CHANNEL: u32 = 0;
/// Instance channel rooted at a project, loaded in bulk.
pub const PROJECT_CHANNEL: u32 = 1;
/// Instance channel rooted at a task; requires the meta channel.
pub const TASK_CHANNEL: u32 = 2;
/// Type channel with a dynamic filter.
pub const SEARCH_CHANNEL: u32 = 3;
/// Type channel with a static filter.
pub const CONFIG_CHANNEL: u32 = 4;
/// Type channel clients may not subscribe to directly.
pub const ADMIN_CHANNEL: u32 = 5;
/// Filter-instanced type channel.
pub const VIEW_CHANNEL: u32 = 6;

pub const PROJECT_TYPE: u32 = 1;
pub const TASK_TYPE: u32 = 2;
pub const META_TYPE: u32 = 3;

/// The reference schema.
pub fn reference_schema() -> Arc<SchemaMetaData> {
    let channels = vec![
        ChannelMetaData::type_channel(META_CHANNEL, "meta").cached(),
        ChannelMetaData::instance_channel(PROJECT_CHANNEL, "project", PROJECT_TYPE).bulk_load(),
        ChannelMetaData::instance_channel(TASK_CHANNEL, "task", TASK_TYPE).requires(META_CHANNEL),
        ChannelMetaData::type_channel(SEARCH_CHANNEL, "search").filter(FilterType::Dynamic),
        ChannelMetaData::type_channel(CONFIG_CHANNEL, "config").filter(FilterType::Static),
        ChannelMetaData::type_channel(ADMIN_CHANNEL, "admin").internal(),
        ChannelMetaData::type_channel(VIEW_CHANNEL, "view").filter(FilterType::StaticInstanced),
    ];
    match SchemaMetaData::new(SCHEMA_ID, "reference", channels) {
        Ok(schema) => Arc::new(schema),
        Err(err) => panic!("reference schema is invalid: {}", err),
    }
}

pub fn meta_channel() -> ChannelAddress {
    ChannelAddress::type_channel(SCHEMA_ID, META_CHANNEL)
}

pub fn project_channel(project_id: i32) -> ChannelAddress {
    ChannelAddress::instance_channel(SCHEMA_ID, PROJECT_CHANNEL, project_id)
}

pub fn task_channel(task_id: i32) -> ChannelAddress {
    ChannelAddress::instance_channel(SCHEMA_ID, TASK_CHANNEL, task_id)
}

pub fn search_channel() -> ChannelAddress {
    ChannelAddress::type_channel(SCHEMA_ID, SEARCH_CHANNEL)
}

pub fn config_channel() -> ChannelAddress {
    ChannelAddress::type_channel(SCHEMA_ID, CONFIG_CHANNEL)
}

pub fn admin_channel() -> ChannelAddress {
    ChannelAddress::type_channel(SCHEMA_ID, ADMIN_CHANNEL)
}

pub fn view_channel(instance: &str) -> ChannelAddress {
    ChannelAddress::type_channel(SCHEMA_ID, VIEW_CHANNEL).with_filter_instance(instance)
}

// ─── Canned messages ─────────────────────────────────────────────────────

/// A named entity placed in `channel`.
pub fn named_entity(entity_type: u32, id: i32, name: &str, channel: ChannelAddress) -> EntityMessage {
    EntityMessage::update(entity_type, id)
        .in_channel(channel)
        .attribute("name", name)
}

/// Contents of the meta channel: `count` meta entities.
pub fn meta_messages(count: i32) -> Vec<EntityMessage> {
    (1..=count)
        .map(|id| named_entity(META_TYPE, id, &format!("meta-{}", id), meta_channel()))
        .collect()
}

/// A project entity plus one member task per id, without links.
pub fn project_messages(project_id: i32, task_ids: &[i32]) -> Vec<EntityMessage> {
    let channel = project_channel(project_id);
    let mut messages = vec![named_entity(PROJECT_TYPE, project_id, "project", channel.clone())];
    messages.extend(
        task_ids
            .iter()
            .map(|id| named_entity(TASK_TYPE, *id, &format!("task-{}", id), channel.clone())),
    );
    messages
}

/// A project entity linking to the task channel of each id.
pub fn linked_project_messages(project_id: i32, task_ids: &[i32]) -> Vec<EntityMessage> {
    let channel = project_channel(project_id);
    let project = task_ids.iter().fold(
        named_entity(PROJECT_TYPE, project_id, "project", channel.clone()),
        |message, id| message.link(channel.clone(), task_channel(*id)),
    );
    vec![project]
}

/// Contents of a task channel.
pub fn task_messages(task_id: i32) -> Vec<EntityMessage> {
    vec![named_entity(TASK_TYPE, task_id, &format!("task-{}", task_id), task_channel(task_id))]
}

// ─── Server hooks ────────────────────────────────────────────────────────

/// A hook invocation recorded by [`FixtureHooks`].
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Collect(ChannelAddress),
    BulkCollect(Vec<ChannelAddress>),
    Execute(String),
}

/// In-memory application data behind the server hooks.
///
/// Channel contents are set explicitly per address. Entities of the search
/// channel are filtered by a `{"prefix": "..."}` filter on their `name`.
#[derive(Debug, Default)]
pub struct FixtureHooks {
    data: Mutex<HashMap<ChannelAddress, Vec<EntityMessage>>>,
    deleted: Mutex<BTreeSet<ChannelAddress>>,
    commands: Mutex<HashMap<String, Vec<EntityMessage>>>,
    calls: Mutex<Vec<HookCall>>,
    collects: AtomicUsize,
    bulk_collect: bool,
    follow_filtered_links: bool,
    token: Option<String>,
}

impl FixtureHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve bulk subscribe requests with one collection call.
    pub fn with_bulk_collect(mut self) -> Self {
        self.bulk_collect = true;
        self
    }

    /// Follow links into filtered channels, inheriting the source filter.
    pub fn following_filtered_links(mut self) -> Self {
        self.follow_filtered_links = true;
        self
    }

    /// Only accept `auth` frames carrying `token`.
    pub fn requiring_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Replace the contents of `address`.
    pub fn set_channel(&self, address: ChannelAddress, messages: Vec<EntityMessage>) {
        lock(&self.data).insert(address, messages);
    }

    /// Report the root of `address` as deleted from now on.
    pub fn delete_root(&self, address: ChannelAddress) {
        lock(&self.deleted).insert(address);
    }

    /// Make the `exec` command `name` produce `messages`.
    pub fn on_command(&self, name: &str, messages: Vec<EntityMessage>) {
        lock(&self.commands).insert(name.to_string(), messages);
    }

    pub fn calls(&self) -> Vec<HookCall> {
        lock(&self.calls).clone()
    }

    /// Number of single-channel collections.
    pub fn collect_count(&self) -> usize {
        self.collects.load(Ordering::SeqCst)
    }

    fn contents(&self, address: &ChannelAddress, filter: Option<&Filter>) -> Vec<EntityMessage> {
        let messages = lock(&self.data).get(address).cloned().unwrap_or_default();
        messages
            .into_iter()
            .filter(|message| matches_filter(message, filter))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether `message` passes a `{"prefix": "..."}` filter on its name.
pub fn matches_filter(message: &EntityMessage, filter: Option<&Filter>) -> bool {
    match &message.data {
        Some(data) => name_matches_filter(data, filter),
        None => filter_prefix(filter).is_none(),
    }
}

/// Entity-attribute form of [`matches_filter`], usable as a client
/// repository filter predicate.
pub fn name_matches_filter(data: &Map<String, Value>, filter: Option<&Filter>) -> bool {
    let Some(prefix) = filter_prefix(filter) else {
        return true;
    };
    data.get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.starts_with(prefix))
}

fn filter_prefix(filter: Option<&Filter>) -> Option<&str> {
    filter.and_then(|f| f.get("prefix")).and_then(Value::as_str)
}

#[async_trait]
impl ReplicantHooks for FixtureHooks {
    async fn collect_data_for_subscribe(
        &self,
        address: &ChannelAddress,
        filter: Option<&Filter>,
    ) -> anyhow::Result<CollectedData> {
        self.collects.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push(HookCall::Collect(address.clone()));
        if lock(&self.deleted).contains(address) {
            return Ok(CollectedData::root_deleted());
        }
        Ok(CollectedData::new(self.contents(address, filter)))
    }

    async fn bulk_collect_data_for_subscribe(
        &self,
        addresses: &[ChannelAddress],
        filter: Option<&Filter>,
    ) -> anyhow::Result<Option<replicant_server::BulkCollectedData>> {
        if !self.bulk_collect {
            return Ok(None);
        }
        lock(&self.calls).push(HookCall::BulkCollect(addresses.to_vec()));
        let deleted = lock(&self.deleted).clone();
        let mut data = replicant_server::BulkCollectedData::default();
        for address in addresses {
            if deleted.contains(address) {
                data.deleted.insert(address.clone());
            } else {
                data.messages.extend(self.contents(address, filter));
            }
        }
        Ok(Some(data))
    }

    fn filter_entity_message(
        &self,
        _address: &ChannelAddress,
        filter: Option<&Filter>,
        message: &EntityMessage,
    ) -> Option<EntityMessage> {
        (message.is_delete() || matches_filter(message, filter)).then(|| message.clone())
    }

    fn should_follow_link(&self, _source: &SubscriptionEntry, _target: &ChannelAddress) -> bool {
        self.follow_filtered_links
    }

    async fn authorize(&self, _session_id: &str, token: &str) -> bool {
        self.token.as_deref().map_or(true, |expected| expected == token)
    }

    async fn execute(&self, _session_id: &str, command: &str, _payload: &Value) -> anyhow::Result<Vec<EntityMessage>> {
        lock(&self.calls).push(HookCall::Execute(command.to_string()));
        lock(&self.commands)
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown command: {}", command))
    }
}

// ─── Client listener ─────────────────────────────────────────────────────

/// An area-of-interest notification recorded by [`RecordingListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum AreaOfInterestEvent {
    ScopeCreated(String),
    ScopeDeleted(String),
    SubscriptionCreated(ChannelAddress, Option<Filter>),
    SubscriptionUpdated(ChannelAddress, Option<Filter>),
    SubscriptionDeleted(ChannelAddress),
}

/// Area-of-interest listener that records every notification.
///
/// Clones share the same log, so keep one to inspect after handing the
/// other to the client.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Rc<RefCell<Vec<AreaOfInterestEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<AreaOfInterestEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    fn record(&self, event: AreaOfInterestEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl AreaOfInterestListener for RecordingListener {
    fn scope_created(&mut self, name: &str) {
        self.record(AreaOfInterestEvent::ScopeCreated(name.to_string()));
    }

    fn scope_deleted(&mut self, name: &str) {
        self.record(AreaOfInterestEvent::ScopeDeleted(name.to_string()));
    }

    fn subscription_created(&mut self, address: &ChannelAddress, filter: Option<&Filter>) {
        self.record(AreaOfInterestEvent::SubscriptionCreated(address.clone(), filter.cloned()));
    }

    fn subscription_updated(&mut self, address: &ChannelAddress, filter: Option<&Filter>) {
        self.record(AreaOfInterestEvent::SubscriptionUpdated(address.clone(), filter.cloned()));
    }

    fn subscription_deleted(&mut self, address: &ChannelAddress) {
        self.record(AreaOfInterestEvent::SubscriptionDeleted(address.clone()));
    }
}
