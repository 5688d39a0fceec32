//! Data loader: the client end of one connection to one schema.
//!
//! A [`DataLoaderService`] owns the connection state, the session, the queue
//! of area-of-interest requests and the incremental data-load pipeline.
//!
//! ## Data-load pipeline
//!
//! Inbound change sets are queued as raw text and applied by repeated calls
//! to [`DataLoaderService::step_data_load`]. Each call performs one bounded
//! phase of work for the current action and returns whether more work may
//! be pending:
//!
//! ```text
//! select ─► parse ─► (requeue by sequence) ─► select ─► pause broker
//!        ─► channel actions ─► changes (chunked) ─► calculate links
//!        ─► links (chunked) ─► finalize ─► complete
//! ```
//!
//! Out-of-band actions (cached payloads) jump the queue and bypass
//! sequencing. Sequenced actions are applied strictly in order: an action
//! whose sequence is not `last_rx_sequence + 1` is held until its
//! predecessors arrive.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use replicant_core::{
    ChangeSet, ChannelAction, ChannelAddress, ClientMessage, EntityKey, Filter, FrameHeader,
    RateLimitedValue, SchemaMetaData, ServerMessage,
};

use crate::broker::ChangeBroker;
use crate::cache::CacheService;
use crate::data_load::{DataLoadAction, DataLoadStatus};
use crate::error::{ClientError, Result};
use crate::registry::SubscriptionRegistry;
use crate::repository::EntityRepository;
use crate::transport::ClientTransport;

// ─── Configuration ────────────────────────────────────────────────────────

/// Token bucket settings pacing connect and disconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorRateLimit {
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Regeneration rate for loaders the application cannot run without.
    pub required_tokens_per_second: f64,
    /// Regeneration rate for optional loaders.
    pub optional_tokens_per_second: f64,
}

impl Default for ConnectorRateLimit {
    fn default() -> Self {
        Self {
            max_tokens: 1.0,
            required_tokens_per_second: 1.0,
            optional_tokens_per_second: 0.2,
        }
    }
}

/// Configuration for a data loader.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Entity changes applied per pipeline step.
    pub changes_to_process_per_tick: usize,
    /// Entities linked per pipeline step.
    pub links_to_process_per_tick: usize,
    /// Change sets larger than this disable the broker instead of pausing it.
    pub bulk_load_threshold: usize,
    /// Run a full repository validation after every load.
    pub validate_repository_on_load: bool,
    pub repository_debug_output: bool,
    pub subscriptions_debug_output: bool,
    /// Whether the system counts as connected only when this loader is.
    pub required: bool,
    /// Token sent in the `auth` frame.
    pub auth_token: Option<String>,
    pub rate_limit: ConnectorRateLimit,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            changes_to_process_per_tick: 100,
            links_to_process_per_tick: 100,
            bulk_load_threshold: 500,
            validate_repository_on_load: false,
            repository_debug_output: false,
            subscriptions_debug_output: false,
            required: true,
            auth_token: None,
            rate_limit: ConnectorRateLimit::default(),
        }
    }
}

// ─── State and requests ───────────────────────────────────────────────────

/// Connection state of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataLoaderState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// What an area-of-interest request asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AreaOfInterestAction {
    Add,
    Remove,
    Update,
}

/// A queued request to change the remote subscription state.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterestRequest {
    pub address: ChannelAddress,
    pub action: AreaOfInterestAction,
    pub filter: Option<Filter>,
    in_progress: bool,
}

impl AreaOfInterestRequest {
    fn new(address: ChannelAddress, action: AreaOfInterestAction, filter: Option<Filter>) -> Self {
        Self {
            address,
            action,
            filter,
            in_progress: false,
        }
    }

    /// Sent to the server and awaiting a response.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    fn can_group_with(&self, other: &AreaOfInterestRequest) -> bool {
        self.action == other.action
            && self.address.same_channel_type(&other.address)
            && self.address != other.address
            && self.filter == other.filter
    }
}

/// Notifications raised by a loader, drained by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    StateChanged {
        schema_id: u32,
        state: DataLoaderState,
    },
    DataLoadComplete(DataLoadStatus),
    DataLoadFailure {
        schema_id: u32,
        error: String,
    },
    /// A subscribe, update or unsubscribe request went to the server.
    SubscribeRequested {
        schema_id: u32,
        action: AreaOfInterestAction,
        channels: Vec<ChannelAddress>,
    },
    RequestFailed {
        schema_id: u32,
        request_id: u32,
        message: String,
    },
}

/// Receives debug output after a load when enabled in the config.
#[allow(unused_variables)]
pub trait DataLoadDebugger {
    fn repository_dump(&mut self, schema_id: u32, dump: &str) {}
    fn subscriptions_dump(&mut self, schema_id: u32, dump: &str) {}
}

struct NoopDebugger;

impl DataLoadDebugger for NoopDebugger {}

/// An outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEntry {
    pub id: u32,
    pub name: &'static str,
    /// Where to cache the response, for cacheable channels.
    pub cache_key: Option<String>,
    /// Whether this request carries the in-flight area-of-interest batch.
    pub area_of_interest: bool,
}

/// Client view of a server session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    session_id: String,
    last_rx_sequence: u32,
    next_request_id: u32,
    requests: BTreeMap<u32, RequestEntry>,
}

impl ClientSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_rx_sequence: 0,
            next_request_id: 1,
            requests: BTreeMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sequence of the last applied change set.
    pub fn last_rx_sequence(&self) -> u32 {
        self.last_rx_sequence
    }

    pub fn request(&self, id: u32) -> Option<&RequestEntry> {
        self.requests.get(&id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &RequestEntry> {
        self.requests.values()
    }

    fn new_request(&mut self, name: &'static str, cache_key: Option<String>, area_of_interest: bool) -> u32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.insert(
            id,
            RequestEntry {
                id,
                name,
                cache_key,
                area_of_interest,
            },
        );
        id
    }
}

/// Local state the pipeline reads and writes.
pub struct LoadContext<'a> {
    pub repository: &'a mut dyn EntityRepository,
    pub cache: &'a mut dyn CacheService,
    pub registry: &'a mut SubscriptionRegistry,
    pub broker: &'a mut ChangeBroker,
}

enum StepOutcome {
    /// Keep the action current.
    Continue,
    /// Put the freshly parsed action back in sequence order.
    Requeue,
    Done,
}

// ─── Service ──────────────────────────────────────────────────────────────

/// One connection to one schema.
pub struct DataLoaderService {
    schema: Arc<SchemaMetaData>,
    config: DataLoaderConfig,
    state: DataLoaderState,
    session: Option<ClientSession>,
    transport: Box<dyn ClientTransport>,
    rate_limiter: RateLimitedValue,
    current: Option<DataLoadAction>,
    oob_actions: VecDeque<DataLoadAction>,
    /// Parsed actions, out-of-band first then by sequence.
    parsed_actions: Vec<DataLoadAction>,
    pending_actions: VecDeque<DataLoadAction>,
    aoi_requests: VecDeque<AreaOfInterestRequest>,
    /// Request carrying the in-flight area-of-interest batch.
    aoi_in_flight: Option<u32>,
    data_load_in_progress: bool,
    events: VecDeque<LoaderEvent>,
    debugger: Box<dyn DataLoadDebugger>,
}

impl fmt::Debug for DataLoaderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoaderService")
            .field("schema", &self.schema.id)
            .field("state", &self.state)
            .field("session", &self.session.as_ref().map(|s| s.session_id()))
            .field("aoi_requests", &self.aoi_requests.len())
            .field("pending_actions", &self.pending_actions.len())
            .finish()
    }
}

impl DataLoaderService {
    pub fn new(
        schema: Arc<SchemaMetaData>,
        config: DataLoaderConfig,
        transport: Box<dyn ClientTransport>,
    ) -> Self {
        let rate = if config.required {
            config.rate_limit.required_tokens_per_second
        } else {
            config.rate_limit.optional_tokens_per_second
        };
        let rate_limiter = RateLimitedValue::new(0, rate, config.rate_limit.max_tokens);
        Self {
            schema,
            config,
            state: DataLoaderState::Disconnected,
            session: None,
            transport,
            rate_limiter,
            current: None,
            oob_actions: VecDeque::new(),
            parsed_actions: Vec::new(),
            pending_actions: VecDeque::new(),
            aoi_requests: VecDeque::new(),
            aoi_in_flight: None,
            data_load_in_progress: false,
            events: VecDeque::new(),
            debugger: Box::new(NoopDebugger),
        }
    }

    pub fn with_debugger(mut self, debugger: impl DataLoadDebugger + 'static) -> Self {
        self.debugger = Box::new(debugger);
        self
    }

    pub fn schema(&self) -> &SchemaMetaData {
        &self.schema
    }

    pub fn schema_id(&self) -> u32 {
        self.schema.id
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    pub fn state(&self) -> DataLoaderState {
        self.state
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn last_rx_sequence(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.last_rx_sequence)
    }

    pub fn drain_events(&mut self) -> Vec<LoaderEvent> {
        self.events.drain(..).collect()
    }

    /// No queued area-of-interest work and no data load pending.
    pub fn is_idle(&self) -> bool {
        self.aoi_requests.is_empty() && self.aoi_in_flight.is_none() && !self.has_data_load_work()
    }

    pub fn is_data_load_in_progress(&self) -> bool {
        self.data_load_in_progress
    }

    fn has_data_load_work(&self) -> bool {
        self.current.is_some()
            || !self.oob_actions.is_empty()
            || !self.parsed_actions.is_empty()
            || !self.pending_actions.is_empty()
    }

    fn set_state(&mut self, state: DataLoaderState) {
        if self.state != state {
            info!(schema = self.schema.id, from = ?self.state, to = ?state, "Data loader state changed");
            self.state = state;
            self.events.push_back(LoaderEvent::StateChanged {
                schema_id: self.schema.id,
                state,
            });
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────────

    /// Connect if disconnected and the rate limiter allows it.
    pub fn attempt_connect(&mut self, now_ms: u64) -> Result<bool> {
        if self.state != DataLoaderState::Disconnected {
            return Ok(false);
        }
        if !self.rate_limiter.consume(now_ms, 1.0) {
            trace!(schema = self.schema.id, "Connect attempt rate limited");
            return Ok(false);
        }
        self.connect()?;
        Ok(true)
    }

    /// Disconnect if connected and the rate limiter allows it.
    pub fn attempt_disconnect(&mut self, now_ms: u64) -> Result<bool> {
        if self.state != DataLoaderState::Connected {
            return Ok(false);
        }
        if !self.rate_limiter.consume(now_ms, 1.0) {
            trace!(schema = self.schema.id, "Disconnect attempt rate limited");
            return Ok(false);
        }
        self.disconnect()?;
        Ok(true)
    }

    pub fn connect(&mut self) -> Result<()> {
        self.set_state(DataLoaderState::Connecting);
        if let Err(err) = self.transport.connect() {
            self.set_state(DataLoaderState::Error);
            return Err(err);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.set_state(DataLoaderState::Disconnecting);
        if let Err(err) = self.transport.disconnect() {
            self.set_state(DataLoaderState::Error);
            return Err(err);
        }
        Ok(())
    }

    /// The connection is gone: drop the session and everything it delivered.
    pub fn on_disconnected(&mut self, ctx: &mut LoadContext<'_>) {
        let schema_id = self.schema.id;
        let orphans = ctx.registry.remove_schema(schema_id);
        for key in &orphans {
            ctx.repository.deregister(*key);
            ctx.broker.remove_entity_listeners(*key);
        }
        // release the broker if a load was interrupted mid-way
        ctx.broker.resume(schema_id);

        self.current = None;
        self.oob_actions.clear();
        self.parsed_actions.clear();
        self.pending_actions.clear();
        for request in &mut self.aoi_requests {
            request.in_progress = false;
        }
        self.aoi_in_flight = None;
        self.data_load_in_progress = false;
        self.session = None;
        info!(schema = schema_id, purged = orphans.len(), "Data loader disconnected");
        self.set_state(DataLoaderState::Disconnected);
    }

    // ─── Inbound frames ───────────────────────────────────────────────────

    /// Handle one frame from the server.
    pub fn on_message(&mut self, text: &str, ctx: &mut LoadContext<'_>) -> Result<()> {
        let header = FrameHeader::peek(text)?;
        if header.kind == FrameHeader::UPDATE {
            return self.queue_change_set(text);
        }
        match ServerMessage::decode(text)? {
            ServerMessage::SessionCreated { session_id } => {
                self.on_session_created(session_id, &*ctx.cache)
            }
            ServerMessage::Ok { req } => {
                self.complete_request(req);
                Ok(())
            }
            ServerMessage::UseCache { req, channel, etag } => {
                self.on_use_cache(req, &channel, &etag, &*ctx.cache)
            }
            ServerMessage::Error { req: Some(req), message } => {
                // the session survives a failed request
                warn!(schema = self.schema.id, request = req, %message, "Request failed");
                self.fail_request(req, &message);
                Ok(())
            }
            ServerMessage::Error { req: None, message } => {
                warn!(schema = self.schema.id, %message, "Server reported error");
                self.set_state(DataLoaderState::Error);
                Ok(())
            }
            ServerMessage::Update(_) => self.queue_change_set(text),
        }
    }

    fn queue_change_set(&mut self, text: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(ClientError::IllegalState(
                "change set received without a session".into(),
            ));
        }
        trace!(schema = self.schema.id, "Change set queued");
        self.pending_actions
            .push_back(DataLoadAction::new(text.to_string(), false, self.schema.id));
        Ok(())
    }

    fn on_session_created(&mut self, session_id: String, cache: &dyn CacheService) -> Result<()> {
        info!(schema = self.schema.id, session = %session_id, "Session created");
        self.session = Some(ClientSession::new(session_id));

        let token = self.config.auth_token.clone().unwrap_or_default();
        let req = self.new_request("auth", None, false)?;
        self.send(ClientMessage::Auth { req, token })?;

        let schema_id = self.schema.id;
        let etags: BTreeMap<String, String> = cache
            .etags()
            .into_iter()
            .filter(|(key, _)| {
                key.parse::<ChannelAddress>()
                    .is_ok_and(|address| address.schema_id == schema_id)
            })
            .collect();
        if !etags.is_empty() {
            debug!(schema = schema_id, count = etags.len(), "Sending cached etags");
            let req = self.new_request("etags", None, false)?;
            self.send(ClientMessage::Etags { req, etags })?;
        }

        self.set_state(DataLoaderState::Connected);
        Ok(())
    }

    fn on_use_cache(
        &mut self,
        req: u32,
        channel: &ChannelAddress,
        etag: &str,
        cache: &dyn CacheService,
    ) -> Result<()> {
        match cache.lookup(&channel.cache_key()) {
            Some(entry) if entry.etag == etag => {
                debug!(schema = self.schema.id, channel = %channel, request = req, "Replaying cached change set");
                self.oob_actions
                    .push_back(DataLoadAction::out_of_band(entry.content, self.schema.id, req));
                Ok(())
            }
            _ => {
                let message = format!("no cached content for {} with etag {}", channel, etag);
                self.fail_request(req, &message);
                Err(ClientError::IllegalState(message))
            }
        }
    }

    fn new_request(
        &mut self,
        name: &'static str,
        cache_key: Option<String>,
        area_of_interest: bool,
    ) -> Result<u32> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ClientError::IllegalState("no session".into()))?;
        Ok(session.new_request(name, cache_key, area_of_interest))
    }

    fn send(&mut self, message: ClientMessage) -> Result<()> {
        trace!(schema = self.schema.id, request = message.request_id(), kind = message.name(), "Sending");
        let frame = message.encode()?;
        self.transport.send(frame)
    }

    /// Remove a resolved request, finishing its area-of-interest batch.
    fn complete_request(&mut self, req: u32) -> Option<RequestEntry> {
        let entry = self.session.as_mut()?.requests.remove(&req)?;
        if self.aoi_in_flight == Some(req) {
            self.aoi_requests.retain(|r| !r.in_progress);
            self.aoi_in_flight = None;
        }
        debug!(schema = self.schema.id, request = req, kind = entry.name, "Request completed");
        Some(entry)
    }

    fn fail_request(&mut self, req: u32, message: &str) {
        if let Some(session) = self.session.as_mut() {
            session.requests.remove(&req);
        }
        if self.aoi_in_flight == Some(req) {
            self.aoi_requests.retain(|r| !r.in_progress);
            self.aoi_in_flight = None;
        }
        self.events.push_back(LoaderEvent::RequestFailed {
            schema_id: self.schema.id,
            request_id: req,
            message: message.to_string(),
        });
    }

    // ─── Area of interest ─────────────────────────────────────────────────

    pub fn request_subscribe(&mut self, address: ChannelAddress, filter: Option<Filter>) {
        debug!(schema = self.schema.id, channel = %address, "Subscribe requested");
        self.aoi_requests
            .push_back(AreaOfInterestRequest::new(address, AreaOfInterestAction::Add, filter));
    }

    pub fn request_subscription_update(&mut self, address: ChannelAddress, filter: Option<Filter>) {
        debug!(schema = self.schema.id, channel = %address, "Subscription update requested");
        self.aoi_requests
            .push_back(AreaOfInterestRequest::new(address, AreaOfInterestAction::Update, filter));
    }

    pub fn request_unsubscribe(&mut self, address: ChannelAddress) {
        debug!(schema = self.schema.id, channel = %address, "Unsubscribe requested");
        self.aoi_requests
            .push_back(AreaOfInterestRequest::new(address, AreaOfInterestAction::Remove, None));
    }

    pub fn area_of_interest_requests(&self) -> impl Iterator<Item = &AreaOfInterestRequest> {
        self.aoi_requests.iter()
    }

    /// Position of the last queued request matching `action` and `address`.
    ///
    /// Filters are compared for adds and updates only.
    pub fn last_index_of_pending_request(
        &self,
        action: AreaOfInterestAction,
        address: &ChannelAddress,
        filter: Option<&Filter>,
    ) -> Option<usize> {
        self.aoi_requests.iter().rposition(|r| {
            r.action == action
                && r.address == *address
                && (action == AreaOfInterestAction::Remove || r.filter.as_ref() == filter)
        })
    }

    /// Whether any request for `address` is queued or in flight.
    pub fn has_pending_request_for(&self, address: &ChannelAddress) -> bool {
        self.aoi_requests.iter().any(|r| r.address == *address)
    }

    fn is_in_flight(&self, action: AreaOfInterestAction, address: &ChannelAddress) -> bool {
        self.aoi_requests
            .iter()
            .any(|r| r.in_progress && r.action == action && r.address == *address)
    }

    fn is_noop(request: &AreaOfInterestRequest, registry: &SubscriptionRegistry) -> bool {
        match (request.action, registry.get(&request.address)) {
            (AreaOfInterestAction::Add, subscription) => subscription.is_some(),
            (AreaOfInterestAction::Remove, subscription) => subscription.is_none(),
            (AreaOfInterestAction::Update, Some(subscription)) => subscription.filter == request.filter,
            (AreaOfInterestAction::Update, None) => true,
        }
    }

    /// Send the next batch of area-of-interest requests.
    ///
    /// At most one batch is in flight at a time. Returns whether a request was sent.
    pub fn progress_area_of_interest_requests(&mut self, registry: &SubscriptionRegistry) -> Result<bool> {
        if self.state != DataLoaderState::Connected || self.aoi_in_flight.is_some() {
            return Ok(false);
        }
        while let Some(head) = self.aoi_requests.front() {
            if !Self::is_noop(head, registry) {
                break;
            }
            debug!(schema = self.schema.id, channel = %head.address, action = ?head.action, "Dropping satisfied request");
            self.aoi_requests.pop_front();
        }
        let Some(head) = self.aoi_requests.front() else {
            return Ok(false);
        };

        let Ok(channel) = self.schema.channel_for(&head.address) else {
            let address = head.address.clone();
            warn!(schema = self.schema.id, channel = %address, "Dropping request for unknown channel");
            self.aoi_requests.pop_front();
            return Err(ClientError::UnknownChannel(address));
        };
        let mut count = 1;
        if channel.bulk_load {
            while let Some(next) = self.aoi_requests.get(count) {
                if head.can_group_with(next)
                    && !self.aoi_requests.iter().take(count).any(|r| r.address == next.address)
                    && !Self::is_noop(next, registry)
                {
                    count += 1;
                } else {
                    break;
                }
            }
        }

        let action = head.action;
        let filter = head.filter.clone();
        let cache_key = (count == 1 && action == AreaOfInterestAction::Add && channel.is_cacheable())
            .then(|| head.address.cache_key());
        let channels: Vec<ChannelAddress> = self
            .aoi_requests
            .iter()
            .take(count)
            .map(|r| r.address.clone())
            .collect();

        let name = match (action, count) {
            (AreaOfInterestAction::Remove, 1) => "unsub",
            (AreaOfInterestAction::Remove, _) => "bulk-unsub",
            (_, 1) => "sub",
            _ => "bulk-sub",
        };
        let req = self.new_request(name, cache_key, true)?;
        let message = match (action, count) {
            (AreaOfInterestAction::Remove, 1) => ClientMessage::Unsub {
                req,
                channel: channels[0].clone(),
            },
            (AreaOfInterestAction::Remove, _) => ClientMessage::BulkUnsub {
                req,
                channels: channels.clone(),
            },
            (_, 1) => ClientMessage::Sub {
                req,
                channel: channels[0].clone(),
                filter,
            },
            _ => ClientMessage::BulkSub {
                req,
                channels: channels.clone(),
                filter,
            },
        };

        for request in self.aoi_requests.iter_mut().take(count) {
            request.in_progress = true;
        }
        self.aoi_in_flight = Some(req);
        info!(schema = self.schema.id, request = req, ?action, count, "Area of interest request sent");
        self.events.push_back(LoaderEvent::SubscribeRequested {
            schema_id: self.schema.id,
            action,
            channels,
        });

        if let Err(err) = self.send(message) {
            self.fail_request(req, &err.to_string());
            return Err(err);
        }
        Ok(true)
    }

    // ─── Data-load pipeline ───────────────────────────────────────────────

    /// Perform one step of the data-load pipeline, reporting errors as events.
    ///
    /// Returns whether more work may be pending. An error stops the
    /// incremental load until the caller drives it again.
    pub fn progress_data_load(&mut self, ctx: &mut LoadContext<'_>) -> bool {
        match self.step_data_load(ctx) {
            Ok(more) => more,
            Err(err) => {
                error!(schema = self.schema.id, error = %err, "Data load failed");
                self.events.push_back(LoaderEvent::DataLoadFailure {
                    schema_id: self.schema.id,
                    error: err.to_string(),
                });
                self.data_load_in_progress = false;
                false
            }
        }
    }

    /// Perform one step of the data-load pipeline.
    ///
    /// Returns `Ok(false)` when there is nothing to do right now. On error
    /// the current action is dropped and the broker released.
    pub fn step_data_load(&mut self, ctx: &mut LoadContext<'_>) -> Result<bool> {
        let Some(mut action) = self.current.take().or_else(|| self.select_next_action()) else {
            if self.data_load_in_progress {
                debug!(schema = self.schema.id, "Incremental data load terminating");
                self.data_load_in_progress = false;
            }
            return Ok(false);
        };
        self.data_load_in_progress = true;

        match self.step_action(&mut action, ctx) {
            Ok(StepOutcome::Continue) => {
                self.current = Some(action);
                Ok(true)
            }
            Ok(StepOutcome::Requeue) => {
                self.insert_parsed(action);
                Ok(true)
            }
            Ok(StepOutcome::Done) => Ok(true),
            Err(err) => {
                if action.broker_paused && !action.world_notified {
                    self.release_broker(&action, ctx.broker);
                }
                if let Some(req) = action.request_id() {
                    self.fail_request(req, &err.to_string());
                }
                if !action.oob {
                    self.abandon_sequence(&action);
                }
                Err(err)
            }
        }
    }

    /// A sequenced action failed; later change sets must not wait for it.
    ///
    /// A parsed action's sequence is skipped. An unparsable one leaves the
    /// stream position unknown, so the connection is dropped to resync.
    fn abandon_sequence(&mut self, action: &DataLoadAction) {
        if action.is_parsed() {
            let sequence = action.sequence();
            if let Some(session) = self.session.as_mut() {
                session.last_rx_sequence = session.last_rx_sequence.max(sequence);
            }
            warn!(schema = self.schema.id, sequence, "Skipping failed change set");
        } else if self.state == DataLoaderState::Connected {
            warn!(schema = self.schema.id, "Unparsable change set, reconnecting");
            if let Err(err) = self.disconnect() {
                error!(schema = self.schema.id, error = %err, "Disconnect failed");
            }
        }
    }

    fn select_next_action(&mut self) -> Option<DataLoadAction> {
        if let Some(action) = self.oob_actions.pop_front() {
            return Some(action);
        }
        let last_rx = self.last_rx_sequence();
        while self
            .parsed_actions
            .first()
            .is_some_and(|a| !a.oob && a.sequence() <= last_rx)
        {
            let stale = self.parsed_actions.remove(0);
            warn!(
                schema = self.schema.id,
                sequence = stale.sequence(),
                last_rx,
                "Discarding stale change set"
            );
        }
        let next_sequence = last_rx.wrapping_add(1);
        if self
            .parsed_actions
            .first()
            .is_some_and(|a| a.oob || a.sequence() == next_sequence)
        {
            return Some(self.parsed_actions.remove(0));
        }
        self.pending_actions.pop_front()
    }

    fn insert_parsed(&mut self, action: DataLoadAction) {
        let key = action.sort_key();
        let index = self.parsed_actions.partition_point(|a| a.sort_key() <= key);
        self.parsed_actions.insert(index, action);
    }

    fn step_action(&mut self, action: &mut DataLoadAction, ctx: &mut LoadContext<'_>) -> Result<StepOutcome> {
        if !action.is_parsed() {
            self.parse_action(action, ctx.cache)?;
            return Ok(StepOutcome::Requeue);
        }

        if !action.broker_paused {
            let owner = self.schema.id;
            if ctx.broker.is_held_by_other(owner) {
                trace!(schema = owner, "Broker held by another loader");
                return Ok(StepOutcome::Continue);
            }
            if action.bulk {
                ctx.broker.disable(owner);
            } else {
                ctx.broker.pause(owner);
            }
            action.broker_paused = true;
            return Ok(StepOutcome::Continue);
        }

        if !action.channel_actions_processed {
            self.process_channel_actions(action, ctx);
            action.channel_actions_processed = true;
            return Ok(StepOutcome::Continue);
        }

        if action.changes_remaining() {
            let Some(change_set) = action.change_set.take() else {
                return Ok(StepOutcome::Continue);
            };
            let result = self.apply_changes(&change_set, action, ctx);
            action.change_set = Some(change_set);
            result?;
            return Ok(StepOutcome::Continue);
        }

        if !action.links_calculated {
            action.calculate_links();
            trace!(schema = self.schema.id, links = action.links_pending.len(), "Links calculated");
            return Ok(StepOutcome::Continue);
        }

        if !action.links_pending.is_empty() {
            let limit = self.config.links_to_process_per_tick.max(1);
            for _ in 0..limit {
                let Some(key) = action.links_pending.pop_front() else {
                    break;
                };
                ctx.repository.link(key).map_err(ClientError::Repository)?;
                action.status.entity_link_count += 1;
            }
            return Ok(StepOutcome::Continue);
        }

        if !action.world_notified {
            self.finalize(action, ctx)?;
            action.world_notified = true;
            return Ok(StepOutcome::Continue);
        }

        self.complete_action(action);
        Ok(StepOutcome::Done)
    }

    fn parse_action(&mut self, action: &mut DataLoadAction, cache: &mut dyn CacheService) -> Result<()> {
        let raw = action.raw.take().unwrap_or_default();
        let mut change_set: ChangeSet = serde_json::from_str(&raw)?;

        if action.oob {
            change_set.sequence = 0;
            change_set.request_id = None;
            change_set.etag = None;
        } else if let (Some(req), Some(etag)) = (change_set.request_id, change_set.etag.as_deref()) {
            let cache_key = self
                .session
                .as_ref()
                .and_then(|s| s.request(req))
                .and_then(|r| r.cache_key.clone());
            if let Some(key) = cache_key {
                if cache.store(&key, etag, &raw) {
                    debug!(schema = self.schema.id, key = %key, etag, "Cached change set");
                }
            }
        }

        action.bulk = change_set.change_count() > self.config.bulk_load_threshold;
        action.status.sequence = change_set.sequence;
        trace!(
            schema = self.schema.id,
            sequence = change_set.sequence,
            request = ?change_set.request_id,
            changes = change_set.change_count(),
            oob = action.oob,
            "Change set parsed"
        );
        action.change_set = Some(change_set);
        Ok(())
    }

    fn process_channel_actions(&mut self, action: &mut DataLoadAction, ctx: &mut LoadContext<'_>) {
        let channel_actions = action
            .change_set
            .as_mut()
            .map(|c| std::mem::take(&mut c.channel_actions))
            .unwrap_or_default();

        for change in channel_actions {
            let address = change.channel;
            match change.action {
                ChannelAction::Add => {
                    let explicit = self.is_in_flight(AreaOfInterestAction::Add, &address);
                    debug!(schema = self.schema.id, channel = %address, explicit, "Channel added");
                    ctx.registry
                        .record_subscription(address.clone(), change.filter, explicit);
                    action.status.channel_adds.push(address);
                }
                ChannelAction::Remove | ChannelAction::Delete => {
                    debug!(schema = self.schema.id, channel = %address, action = ?change.action, "Channel removed");
                    for key in ctx.registry.remove_subscription(&address) {
                        Self::deregister_entity(key, action, ctx);
                    }
                    action.status.channel_removes.push(address);
                }
                ChannelAction::Update => {
                    debug!(schema = self.schema.id, channel = %address, "Channel filter updated");
                    ctx.registry.update_filter(&address, change.filter.clone());
                    let members: Vec<EntityKey> = ctx
                        .registry
                        .get(&address)
                        .map(|s| s.entities().copied().collect())
                        .unwrap_or_default();
                    for key in members {
                        if !ctx
                            .repository
                            .entity_matches_filter(&address, change.filter.as_ref(), key)
                            && ctx.registry.remove_entity_from_channel(&address, key)
                        {
                            Self::deregister_entity(key, action, ctx);
                        }
                    }
                    action.status.channel_updates.push(address);
                }
            }
        }
    }

    fn deregister_entity(key: EntityKey, action: &mut DataLoadAction, ctx: &mut LoadContext<'_>) {
        if ctx.repository.deregister(key) {
            action.status.entity_remove_count += 1;
        }
        ctx.broker.entity_removed(key);
        ctx.broker.remove_entity_listeners(key);
    }

    fn apply_changes(
        &self,
        change_set: &ChangeSet,
        action: &mut DataLoadAction,
        ctx: &mut LoadContext<'_>,
    ) -> Result<()> {
        let limit = self.config.changes_to_process_per_tick.max(1);
        for change in change_set.changes.iter().skip(action.change_index).take(limit) {
            let key = change.key();
            if change.is_removal() {
                ctx.registry.unlink_entity(key);
                Self::deregister_entity(key, action, ctx);
                action.record_removal(key);
            } else {
                ctx.repository
                    .apply_change(change)
                    .map_err(ClientError::Repository)?;
                ctx.registry.link_entity(key, &change.channels);
                ctx.broker.entity_changed(key);
                action.record_update(key);
                action.status.entity_update_count += 1;
            }
            action.change_index += 1;
        }
        Ok(())
    }

    fn finalize(&mut self, action: &DataLoadAction, ctx: &mut LoadContext<'_>) -> Result<()> {
        let schema_id = self.schema.id;
        if !action.oob {
            if let Some(session) = self.session.as_mut() {
                session.last_rx_sequence = session.last_rx_sequence.max(action.sequence());
            }
        }
        self.release_broker(action, ctx.broker);

        if self.config.repository_debug_output {
            self.debugger.repository_dump(schema_id, &ctx.repository.dump());
        }
        if self.config.subscriptions_debug_output {
            let mut dump = String::new();
            for subscription in ctx.registry.subscriptions_for_schema(schema_id) {
                let _ = writeln!(
                    dump,
                    "{} filter={} explicit={} entities={}",
                    subscription.address,
                    subscription
                        .filter
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |f| f.to_string()),
                    subscription.explicit,
                    subscription.entity_count()
                );
            }
            self.debugger.subscriptions_dump(schema_id, &dump);
        }
        if self.config.validate_repository_on_load {
            ctx.repository.validate().map_err(ClientError::Repository)?;
        }
        Ok(())
    }

    fn release_broker(&self, action: &DataLoadAction, broker: &mut ChangeBroker) {
        if action.bulk {
            broker.enable(self.schema.id);
        } else {
            broker.resume(self.schema.id);
        }
    }

    fn complete_action(&mut self, action: &mut DataLoadAction) {
        let resolved = action.request_id().and_then(|req| self.complete_request(req));
        action.status.request_id = resolved.map(|r| r.id);
        let status = std::mem::take(&mut action.status);
        info!(
            schema = status.schema_id,
            sequence = status.sequence,
            request = ?status.request_id,
            updates = status.entity_update_count,
            removes = status.entity_remove_count,
            links = status.entity_link_count,
            "Data load complete"
        );
        self.events.push_back(LoaderEvent::DataLoadComplete(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheService;
    use crate::repository::MemoryEntityRepository;
    use crate::transport::memory::{MemoryClientTransport, MemoryTransportHandle};
    use replicant_core::{ChannelChange, ChannelMetaData, EntityChange};
    use serde_json::{json, Map};

    struct Fixture {
        loader: DataLoaderService,
        handle: MemoryTransportHandle,
        repository: MemoryEntityRepository,
        cache: MemoryCacheService,
        registry: SubscriptionRegistry,
        broker: ChangeBroker,
    }

    impl Fixture {
        fn new(config: DataLoaderConfig) -> Self {
            let schema = SchemaMetaData::new(
                1,
                "test",
                vec![
                    ChannelMetaData::type_channel(0, "meta").cached(),
                    ChannelMetaData::instance_channel(1, "project", 1).requires(0).bulk_load(),
                    ChannelMetaData::type_channel(2, "filtered").filter(FilterType::Dynamic),
                ],
            )
            .unwrap();
            let (transport, handle) = MemoryClientTransport::new();
            Self {
                loader: DataLoaderService::new(Arc::new(schema), config, Box::new(transport)),
                handle,
                repository: MemoryEntityRepository::new(),
                cache: MemoryCacheService::new(),
                registry: SubscriptionRegistry::new(),
                broker: ChangeBroker::new(),
            }
        }

        fn connected(config: DataLoaderConfig) -> Self {
            let mut fixture = Self::new(config);
            fixture.loader.connect().unwrap();
            fixture.receive(r#"{"type":"session-created","session_id":"s1"}"#).unwrap();
            fixture.handle.drain();
            fixture
        }

        fn receive(&mut self, text: &str) -> Result<()> {
            let mut ctx = LoadContext {
                repository: &mut self.repository,
                cache: &mut self.cache,
                registry: &mut self.registry,
                broker: &mut self.broker,
            };
            self.loader.on_message(text, &mut ctx)
        }

        fn step(&mut self) -> Result<bool> {
            let mut ctx = LoadContext {
                repository: &mut self.repository,
                cache: &mut self.cache,
                registry: &mut self.registry,
                broker: &mut self.broker,
            };
            self.loader.step_data_load(&mut ctx)
        }

        fn run(&mut self) -> usize {
            let mut steps = 0;
            while self.step().unwrap() {
                steps += 1;
                assert!(steps < 10_000, "pipeline did not settle");
            }
            steps
        }

        fn completed(&mut self) -> Vec<DataLoadStatus> {
            self.loader
                .drain_events()
                .into_iter()
                .filter_map(|e| match e {
                    LoaderEvent::DataLoadComplete(status) => Some(status),
                    _ => None,
                })
                .collect()
        }
    }

    use replicant_core::FilterType;

    fn entity(id: i32, channel: &ChannelAddress) -> EntityChange {
        let mut data = Map::new();
        data.insert("id".into(), json!(id));
        EntityChange {
            entity_type: 1,
            id,
            channels: vec![channel.clone()],
            data: Some(data),
        }
    }

    fn update_frame(change_set: ChangeSet) -> String {
        ServerMessage::Update(change_set).encode().unwrap()
    }

    #[test]
    fn test_session_created_sends_auth_and_etags() {
        let mut fixture = Fixture::new(DataLoaderConfig {
            auth_token: Some("secret".into()),
            ..DataLoaderConfig::default()
        });
        fixture.cache.store("1.0", "e1", "{}");
        fixture.cache.store("2.0", "other", "{}");
        fixture.loader.connect().unwrap();
        assert_eq!(fixture.loader.state(), DataLoaderState::Connecting);

        fixture.receive(r#"{"type":"session-created","session_id":"abc"}"#).unwrap();
        assert_eq!(fixture.loader.state(), DataLoaderState::Connected);

        let frames: Vec<ClientMessage> = fixture
            .handle
            .drain_frames()
            .iter()
            .map(|f| ClientMessage::decode(f).unwrap())
            .collect();
        assert_eq!(
            frames[0],
            ClientMessage::Auth {
                req: 1,
                token: "secret".into()
            }
        );
        match &frames[1] {
            ClientMessage::Etags { etags, .. } => {
                assert_eq!(etags.len(), 1);
                assert_eq!(etags.get("1.0").map(String::as_str), Some("e1"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_sequencing_applies_in_order() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        fixture.registry.record_subscription(channel.clone(), None, true);

        for sequence in [3, 1, 2] {
            let frame = update_frame(ChangeSet {
                sequence,
                changes: vec![entity(sequence as i32, &channel)],
                ..ChangeSet::default()
            });
            fixture.receive(&frame).unwrap();
        }
        fixture.run();

        let order: Vec<u32> = fixture.completed().iter().map(|s| s.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(fixture.loader.last_rx_sequence(), 3);
        assert_eq!(fixture.repository.entity_count(), 3);
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_gap_stalls_without_discarding() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                changes: vec![entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        assert!(fixture.completed().is_empty());
        assert_eq!(fixture.loader.last_rx_sequence(), 0);
        assert!(!fixture.loader.is_idle());

        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();
        assert_eq!(fixture.completed().len(), 2);
        assert_eq!(fixture.loader.last_rx_sequence(), 2);
    }

    #[test]
    fn test_changes_applied_in_bounded_chunks() {
        let mut fixture = Fixture::connected(DataLoaderConfig {
            changes_to_process_per_tick: 2,
            links_to_process_per_tick: 2,
            ..DataLoaderConfig::default()
        });
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: (1..=5).map(|id| entity(id, &channel)).collect(),
                ..ChangeSet::default()
            }))
            .unwrap();

        // select+parse, select+pause, channel actions
        for _ in 0..3 {
            assert!(fixture.step().unwrap());
        }
        assert!(fixture.step().unwrap());
        assert_eq!(fixture.repository.entity_count(), 2);
        assert!(fixture.step().unwrap());
        assert_eq!(fixture.repository.entity_count(), 4);

        fixture.run();
        let status = fixture.completed().remove(0);
        assert_eq!(status.entity_update_count, 5);
        assert_eq!(status.entity_link_count, 5);
        assert_eq!(fixture.repository.link_calls(), 5);
    }

    #[test]
    fn test_broker_paused_while_loading() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let seen = std::rc::Rc::new(std::cell::RefCell::new(0));
        let sink = std::rc::Rc::clone(&seen);
        fixture.broker.add_listener(move |_| *sink.borrow_mut() += 1);

        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![entity(1, &channel), entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();

        for _ in 0..4 {
            fixture.step().unwrap();
        }
        assert_eq!(fixture.repository.entity_count(), 2);
        assert_eq!(*seen.borrow(), 0);

        fixture.run();
        assert_eq!(*seen.borrow(), 2);
    }

    #[test]
    fn test_spins_while_broker_held_by_other_loader() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        assert!(fixture.broker.pause(99));
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                ..ChangeSet::default()
            }))
            .unwrap();

        for _ in 0..10 {
            assert!(fixture.step().unwrap());
        }
        assert!(fixture.completed().is_empty());

        fixture.broker.resume(99);
        fixture.run();
        assert_eq!(fixture.completed().len(), 1);
    }

    #[test]
    fn test_channel_remove_deregisters_orphans() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::instance_channel(1, 1, 7);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                channel_actions: vec![ChannelChange {
                    channel: channel.clone(),
                    action: ChannelAction::Add,
                    filter: None,
                }],
                changes: vec![entity(7, &channel), entity(8, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();
        assert_eq!(fixture.repository.entity_count(), 2);

        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                channel_actions: vec![ChannelChange {
                    channel: channel.clone(),
                    action: ChannelAction::Remove,
                    filter: None,
                }],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        let statuses = fixture.completed();
        assert_eq!(statuses[1].channel_removes, vec![channel.clone()]);
        assert_eq!(statuses[1].entity_remove_count, 2);
        assert_eq!(fixture.repository.entity_count(), 0);
        assert!(!fixture.registry.is_subscribed(&channel));
    }

    #[test]
    fn test_channel_update_drops_entities_outside_filter() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.repository = MemoryEntityRepository::new().with_filter_predicate(|_, filter, data| {
            filter.map_or(true, |f| data.get("id") == Some(f))
        });
        let channel = ChannelAddress::type_channel(1, 2);
        fixture.registry.record_subscription(channel.clone(), None, true);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![entity(1, &channel), entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                channel_actions: vec![ChannelChange {
                    channel: channel.clone(),
                    action: ChannelAction::Update,
                    filter: Some(json!(2)),
                }],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        let status = fixture.completed().pop().unwrap();
        assert_eq!(status.channel_updates, vec![channel.clone()]);
        assert_eq!(status.entity_remove_count, 1);
        assert!(fixture.repository.contains(EntityKey::new(1, 2)));
        assert!(!fixture.repository.contains(EntityKey::new(1, 1)));
        assert_eq!(fixture.registry.get(&channel).unwrap().filter, Some(json!(2)));
    }

    #[test]
    fn test_mapper_failure_is_reported_and_stops_load() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.repository.fail_on(EntityKey::new(1, 2));
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![entity(1, &channel), entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();

        let mut ctx = LoadContext {
            repository: &mut fixture.repository,
            cache: &mut fixture.cache,
            registry: &mut fixture.registry,
            broker: &mut fixture.broker,
        };
        while fixture.loader.progress_data_load(&mut ctx) {}

        let events = fixture.loader.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, LoaderEvent::DataLoadFailure { .. })));
        assert_eq!(fixture.broker.holder(), None);
        // the failed change set is skipped rather than awaited
        assert_eq!(fixture.loader.last_rx_sequence(), 1);
    }

    #[test]
    fn test_stream_continues_after_failed_change_set() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.repository.fail_on(EntityKey::new(1, 1));
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![entity(1, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        let mut failed = false;
        for _ in 0..100 {
            match fixture.step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => failed = true,
            }
        }
        assert!(failed);

        fixture.repository = MemoryEntityRepository::new();
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                changes: vec![entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        assert_eq!(fixture.loader.last_rx_sequence(), 2);
        assert!(fixture.repository.contains(EntityKey::new(1, 2)));
        assert_eq!(fixture.completed().len(), 1);
        assert_eq!(fixture.loader.state(), DataLoaderState::Connected);
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_unparsable_change_set_reconnects() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.receive(r#"{"type":"update","seq":"not a number"}"#).unwrap();

        assert!(fixture.step().is_err());
        assert_eq!(fixture.loader.state(), DataLoaderState::Disconnecting);
    }

    #[test]
    fn test_stale_change_set_is_discarded() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        let first = update_frame(ChangeSet {
            sequence: 1,
            changes: vec![entity(1, &channel)],
            ..ChangeSet::default()
        });
        fixture.receive(&first).unwrap();
        fixture.run();
        fixture.completed();

        // a duplicate must not block the next sequence
        fixture.receive(&first).unwrap();
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                changes: vec![entity(2, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        let order: Vec<u32> = fixture.completed().iter().map(|s| s.sequence).collect();
        assert_eq!(order, vec![2]);
        assert_eq!(fixture.loader.last_rx_sequence(), 2);
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_removal_of_unknown_entity_is_not_counted() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        let mut removal = entity(1, &channel);
        removal.data = None;
        let mut known = entity(2, &channel);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![known.clone()],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();
        fixture.completed();

        known.data = None;
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 2,
                changes: vec![removal, known],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();

        let status = fixture.completed().pop().unwrap();
        assert_eq!(status.entity_remove_count, 1);
        assert_eq!(fixture.repository.entity_count(), 0);
    }

    #[test]
    fn test_validation_runs_after_load() {
        let mut fixture = Fixture::connected(DataLoaderConfig {
            validate_repository_on_load: true,
            ..DataLoaderConfig::default()
        });
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                changes: vec![entity(1, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();
        assert_eq!(fixture.completed().len(), 1);
    }

    #[test]
    fn test_groups_compatible_requests_into_bulk_subscribe() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        for root in [1, 2, 3] {
            fixture
                .loader
                .request_subscribe(ChannelAddress::instance_channel(1, 1, root), None);
        }
        fixture
            .loader
            .request_subscribe(ChannelAddress::type_channel(1, 2), Some(json!(1)));

        assert!(fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());
        let frames = fixture.handle.drain_frames();
        assert_eq!(frames.len(), 1);
        match ClientMessage::decode(&frames[0]).unwrap() {
            ClientMessage::BulkSub { channels, .. } => assert_eq!(channels.len(), 3),
            other => panic!("unexpected frame {:?}", other),
        }

        // one batch in flight at a time
        assert!(!fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());

        let req = fixture.loader.aoi_in_flight.unwrap();
        fixture.receive(&format!(r#"{{"type":"ok","req":{}}}"#, req)).unwrap();
        assert_eq!(fixture.loader.area_of_interest_requests().count(), 1);

        assert!(fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());
        let frames = fixture.handle.drain_frames();
        assert!(matches!(
            ClientMessage::decode(&frames[0]).unwrap(),
            ClientMessage::Sub { .. }
        ));
    }

    #[test]
    fn test_satisfied_requests_are_dropped() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let subscribed = ChannelAddress::type_channel(1, 0);
        fixture.registry.record_subscription(subscribed.clone(), None, true);
        fixture.loader.request_subscribe(subscribed, None);
        fixture.loader.request_unsubscribe(ChannelAddress::instance_channel(1, 1, 4));

        assert!(!fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_unknown_channel_request_is_dropped() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let unknown = ChannelAddress::type_channel(1, 9);
        fixture.loader.request_subscribe(unknown.clone(), None);

        let err = fixture
            .loader
            .progress_area_of_interest_requests(&fixture.registry)
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownChannel(address) if address == unknown));
        assert_eq!(fixture.loader.area_of_interest_requests().count(), 0);
        assert!(fixture.handle.drain_frames().is_empty());
    }

    #[test]
    fn test_explicit_add_and_cache_store() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        fixture.loader.request_subscribe(channel.clone(), None);
        fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap();
        let req = fixture.loader.aoi_in_flight.unwrap();

        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                request_id: Some(req),
                etag: Some("tag".into()),
                channel_actions: vec![ChannelChange {
                    channel: channel.clone(),
                    action: ChannelAction::Add,
                    filter: None,
                }],
                changes: vec![entity(1, &channel)],
            }))
            .unwrap();
        fixture.run();

        assert!(fixture.registry.get(&channel).unwrap().explicit);
        assert_eq!(fixture.cache.lookup("1.0").unwrap().etag, "tag");
        let status = fixture.completed().remove(0);
        assert_eq!(status.request_id, Some(req));
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_use_cache_replays_out_of_band() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        let cached = update_frame(ChangeSet {
            sequence: 40,
            request_id: Some(9),
            channel_actions: vec![ChannelChange {
                channel: channel.clone(),
                action: ChannelAction::Add,
                filter: None,
            }],
            changes: vec![entity(1, &channel)],
            ..ChangeSet::default()
        });
        fixture.cache.store("1.0", "tag", &cached);

        fixture.loader.request_subscribe(channel.clone(), None);
        fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap();
        let req = fixture.loader.aoi_in_flight.unwrap();
        fixture
            .receive(&format!(
                r#"{{"type":"use-cache","req":{},"channel":"1.0","etag":"tag"}}"#,
                req
            ))
            .unwrap();
        fixture.run();

        let status = fixture.completed().remove(0);
        assert_eq!(status.sequence, 0);
        assert_eq!(status.request_id, Some(req));
        assert_eq!(fixture.loader.last_rx_sequence(), 0);
        assert!(fixture.repository.contains(EntityKey::new(1, 1)));
        assert!(fixture.loader.is_idle());
    }

    #[test]
    fn test_use_cache_without_content_fails_request() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.loader.request_subscribe(ChannelAddress::type_channel(1, 0), None);
        fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap();
        let req = fixture.loader.aoi_in_flight.unwrap();

        let result = fixture.receive(&format!(
            r#"{{"type":"use-cache","req":{},"channel":"1.0","etag":"x"}}"#,
            req
        ));
        assert!(matches!(result, Err(ClientError::IllegalState(_))));
        assert!(fixture
            .loader
            .drain_events()
            .iter()
            .any(|e| matches!(e, LoaderEvent::RequestFailed { .. })));
    }

    #[test]
    fn test_error_frame_enters_error_state() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        fixture.receive(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(fixture.loader.state(), DataLoaderState::Error);
    }

    #[test]
    fn test_request_error_keeps_loader_connected() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let meta = ChannelAddress::type_channel(1, 0);
        let filtered = ChannelAddress::type_channel(1, 2);
        fixture.loader.request_subscribe(meta, None);
        fixture.loader.request_subscribe(filtered.clone(), None);
        assert!(fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());
        let req = fixture.loader.aoi_in_flight.unwrap();
        fixture.handle.drain();

        fixture
            .receive(&format!(r#"{{"type":"error","req":{},"message":"collector failed"}}"#, req))
            .unwrap();

        assert_eq!(fixture.loader.state(), DataLoaderState::Connected);
        assert!(fixture.loader.drain_events().iter().any(|e| matches!(
            e,
            LoaderEvent::RequestFailed { request_id, .. } if *request_id == req
        )));
        assert!(fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap());
        let sent = fixture.handle.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            fixture.loader.area_of_interest_requests().next().map(|r| &r.address),
            Some(&filtered)
        );
    }

    #[test]
    fn test_disconnect_purges_schema_state() {
        let mut fixture = Fixture::connected(DataLoaderConfig::default());
        let channel = ChannelAddress::type_channel(1, 0);
        fixture
            .receive(&update_frame(ChangeSet {
                sequence: 1,
                channel_actions: vec![ChannelChange {
                    channel: channel.clone(),
                    action: ChannelAction::Add,
                    filter: None,
                }],
                changes: vec![entity(1, &channel)],
                ..ChangeSet::default()
            }))
            .unwrap();
        fixture.run();
        fixture.loader.request_subscribe(ChannelAddress::instance_channel(1, 1, 3), None);
        fixture.loader.progress_area_of_interest_requests(&fixture.registry).unwrap();

        fixture.loader.disconnect().unwrap();
        let mut ctx = LoadContext {
            repository: &mut fixture.repository,
            cache: &mut fixture.cache,
            registry: &mut fixture.registry,
            broker: &mut fixture.broker,
        };
        fixture.loader.on_disconnected(&mut ctx);

        assert_eq!(fixture.loader.state(), DataLoaderState::Disconnected);
        assert!(fixture.loader.session().is_none());
        assert!(fixture.registry.is_empty());
        assert_eq!(fixture.repository.entity_count(), 0);
        assert!(fixture
            .loader
            .area_of_interest_requests()
            .all(|r| !r.is_in_progress()));
    }

    #[test]
    fn test_connect_is_rate_limited() {
        let mut fixture = Fixture::new(DataLoaderConfig::default());
        assert!(fixture.loader.attempt_connect(1_000).unwrap());
        fixture.receive(r#"{"type":"session-created","session_id":"s"}"#).unwrap();

        // bucket holds one token and regenerates at one per second
        assert!(!fixture.loader.attempt_disconnect(1_500).unwrap());
        assert!(fixture.loader.attempt_disconnect(2_000).unwrap());
        assert_eq!(fixture.loader.state(), DataLoaderState::Disconnecting);
    }
}
