//! Session and subscription management.
//!
//! The manager owns every session, the shared channel cache and the
//! delivery broker. Each operation on a session runs under that session's
//! lock and collects its effects in a [`RequestContext`], which is turned
//! into outbound frames once the operation completes.
//!
//! ## Lock order
//!
//! ```text
//! session registry (short) ─► session state ─► channel cache entry
//! ```
//!
//! Delivery takes only a session's delivery lock and never a state lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{MutexGuard, RwLock};
use tracing::{debug, info, warn};

use replicant_core::{
    ChannelAction, ChannelAddress, ChannelLink, ChannelMetaData, EntityMessage, Filter,
    SchemaMetaData, ServerMessage,
};

use crate::accumulator::ChangeAccumulator;
use crate::broker::ReplicantMessageBroker;
use crate::cache::ChannelCache;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::hooks::ReplicantHooks;
use crate::session::{ReplicantSession, SessionState};
use crate::subscription::SubscriptionEntry;
use crate::transport::SessionTransport;

/// Reason sent to a client whose session is closed by a failed link expansion.
pub const LINK_EXPANSION_FAILED: &str = "Expanding links failed";

/// Response for a request that hit a cacheable channel.
#[derive(Debug)]
enum CachedResponse {
    /// The client already holds the current payload.
    UseCache { channel: ChannelAddress, etag: String },
    /// The payload, sent as its own change set with an etag.
    Payload(ChangeAccumulator),
}

/// Effects of one operation on one session.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Option<u32>,
    pub changes: ChangeAccumulator,
    cached: Option<CachedResponse>,
}

impl RequestContext {
    pub fn new(request_id: Option<u32>) -> Self {
        Self {
            request_id,
            changes: ChangeAccumulator::new(),
            cached: None,
        }
    }

    /// Every entity message this operation will send.
    pub fn messages(&self) -> impl Iterator<Item = &EntityMessage> {
        let cached = match &self.cached {
            Some(CachedResponse::Payload(payload)) => payload.messages(),
            _ => &[],
        };
        self.changes.messages().iter().chain(cached.iter())
    }

    pub fn is_use_cache(&self) -> bool {
        matches!(self.cached, Some(CachedResponse::UseCache { .. }))
    }
}

/// Links staged for one round of expansion, grouped by target channel and filter.
type PendingLinks = BTreeMap<(u32, String), (Option<Filter>, Vec<ChannelLink>)>;

/// Tracks sessions and their subscriptions.
pub struct ReplicantSessionManager<H: ReplicantHooks> {
    schema: Arc<SchemaMetaData>,
    hooks: H,
    config: ServerConfig,
    sessions: RwLock<HashMap<String, Arc<ReplicantSession>>>,
    cache: ChannelCache,
    broker: Arc<ReplicantMessageBroker>,
}

impl<H: ReplicantHooks> ReplicantSessionManager<H> {
    pub fn new(schema: Arc<SchemaMetaData>, hooks: H, config: ServerConfig) -> Self {
        let broker = Arc::new(ReplicantMessageBroker::new(&config));
        Self {
            schema,
            hooks,
            config,
            sessions: RwLock::new(HashMap::new()),
            cache: ChannelCache::new(),
            broker,
        }
    }

    pub fn schema(&self) -> &SchemaMetaData {
        &self.schema
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }

    pub fn broker(&self) -> Arc<ReplicantMessageBroker> {
        Arc::clone(&self.broker)
    }

    // ─── Sessions ─────────────────────────────────────────────────────────

    /// Register a new session and queue its `session-created` frame.
    pub async fn create_session(&self, transport: Arc<dyn SessionTransport>) -> Result<Arc<ReplicantSession>> {
        let id = hex::encode(rand::random::<[u8; 16]>());
        let session = Arc::new(ReplicantSession::new(id.clone(), transport));
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "Session created");

        session
            .queue(ServerMessage::SessionCreated { session_id: id })
            .await?;
        self.broker.queue_session(Arc::clone(&session));
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<ReplicantSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove and close a session. Returns whether it existed.
    pub async fn close_session(&self, session_id: &str, reason: Option<&str>) -> bool {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return false;
        };
        info!(session = %session_id, reason = reason.unwrap_or(""), "Session closed");
        session.close(reason).await;
        true
    }

    async fn require_session(&self, session_id: &str) -> Result<Arc<ReplicantSession>> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))?;
        if session.is_closed() {
            return Err(ServerError::SessionClosed(session_id.to_string()));
        }
        Ok(session)
    }

    /// Acquire the session lock, closing the session if it cannot be had in time.
    async fn lock_state<'a>(&self, session: &'a ReplicantSession) -> Result<MutexGuard<'a, SessionState>> {
        match tokio::time::timeout(self.config.session_lock_timeout, session.state().lock()).await {
            Ok(state) => Ok(state),
            Err(_) => {
                warn!(session = %session.id(), "Timed out acquiring session lock");
                self.close_session(session.id(), Some("session lock timeout")).await;
                Err(ServerError::SessionLockTimeout(session.id().to_string()))
            }
        }
    }

    // ─── Operations ───────────────────────────────────────────────────────

    /// Subscribe a session to one channel.
    pub async fn subscribe(
        &self,
        session_id: &str,
        request_id: Option<u32>,
        address: ChannelAddress,
        filter: Option<Filter>,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;
        let mut state = self.lock_state(&session).await?;
        let mut ctx = RequestContext::new(request_id);

        let request_level = request_id.is_some();
        let mut result = self
            .subscribe_one(&mut state, &mut ctx, address, filter, true, request_level)
            .await;
        if result.is_ok() {
            result = self.expand_links(&session, &mut state, &mut ctx).await;
        }
        drop(state);
        self.complete(&session, ctx, result, true).await
    }

    /// Subscribe a session to several channels with the same filter.
    ///
    /// An empty address list is acknowledged without any channel actions.
    pub async fn bulk_subscribe(
        &self,
        session_id: &str,
        request_id: Option<u32>,
        addresses: Vec<ChannelAddress>,
        filter: Option<Filter>,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;
        let mut state = self.lock_state(&session).await?;
        let mut ctx = RequestContext::new(request_id);

        let mut result = self
            .bulk_subscribe_explicit(&mut state, &mut ctx, addresses, filter)
            .await;
        if result.is_ok() {
            result = self.expand_links(&session, &mut state, &mut ctx).await;
        }
        drop(state);
        self.complete(&session, ctx, result, true).await
    }

    pub async fn unsubscribe(&self, session_id: &str, request_id: Option<u32>, address: ChannelAddress) -> Result<()> {
        self.bulk_unsubscribe(session_id, request_id, vec![address]).await
    }

    pub async fn bulk_unsubscribe(
        &self,
        session_id: &str,
        request_id: Option<u32>,
        addresses: Vec<ChannelAddress>,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;
        let mut state = self.lock_state(&session).await?;
        let mut ctx = RequestContext::new(request_id);

        let result = addresses.iter().try_for_each(|address| {
            self.validate(address, true)?;
            self.perform_unsubscribe(&mut state, &mut ctx, address, true, false);
            Ok(())
        });
        drop(state);
        self.complete(&session, ctx, result, true).await
    }

    /// Replace the cache keys the client reports holding.
    pub async fn set_etags(
        &self,
        session_id: &str,
        request_id: Option<u32>,
        etags: BTreeMap<String, String>,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;
        let mut state = self.lock_state(&session).await?;
        debug!(session = %session_id, count = etags.len(), "Client etags received");
        state.set_etags(etags);
        drop(state);
        self.complete(&session, RequestContext::new(request_id), Ok(()), true)
            .await
    }

    /// Route entity changes to every session subscribed to their channels.
    ///
    /// Cacheable channels touched by the changes are purged first. `origin`
    /// names the session and request that caused the changes; that session
    /// is always answered, others only when they receive something.
    pub async fn process_entity_messages(
        &self,
        messages: Vec<EntityMessage>,
        origin: Option<(&str, u32)>,
    ) -> Result<()> {
        self.invalidate_caches(&messages).await;

        let sessions: Vec<Arc<ReplicantSession>> = self.sessions.read().await.values().cloned().collect();
        let mut origin_result = Ok(());
        for session in sessions {
            let request_id = origin
                .filter(|(id, _)| *id == session.id())
                .map(|(_, req)| req);
            let result = self.route_to_session(&session, &messages, request_id).await;
            match result {
                Err(err) if request_id.is_some() => origin_result = Err(err),
                Err(err) => warn!(session = %session.id(), error = %err, "Failed to route entity messages"),
                Ok(()) => {}
            }
        }
        origin_result
    }

    async fn invalidate_caches(&self, messages: &[EntityMessage]) {
        let mut purged = HashSet::new();
        for message in messages {
            for channel in &message.channels {
                let cacheable = self
                    .schema
                    .channel_for(channel)
                    .is_ok_and(ChannelMetaData::is_cacheable);
                if cacheable && purged.insert(channel.clone()) {
                    self.cache.purge_with_dependents(&self.schema, channel).await;
                }
            }
        }
    }

    async fn route_to_session(
        &self,
        session: &Arc<ReplicantSession>,
        messages: &[EntityMessage],
        request_id: Option<u32>,
    ) -> Result<()> {
        if session.is_closed() {
            return Ok(());
        }
        let mut state = self.lock_state(session).await?;
        let mut ctx = RequestContext::new(request_id);

        for message in messages {
            for channel in &message.channels {
                let Some(entry) = state.subscription(channel) else {
                    continue;
                };
                if let Some(filtered) = self.hooks.filter_entity_message(channel, entry.filter(), message) {
                    ctx.changes.add_message(filtered);
                }
            }
            if message.is_delete() {
                self.unsubscribe_deleted_roots(&mut state, &mut ctx, message);
            }
        }

        let result = self.expand_links(session, &mut state, &mut ctx).await;
        drop(state);
        self.complete(session, ctx, result, request_id.is_some()).await
    }

    // ─── Subscribe ────────────────────────────────────────────────────────

    /// Check that `address` may be subscribed.
    fn validate(&self, address: &ChannelAddress, explicit: bool) -> Result<&ChannelMetaData> {
        let channel = self
            .schema
            .channel_for(address)
            .map_err(|_| ServerError::UnknownChannel(address.clone()))?;
        if explicit && !channel.external {
            return Err(ServerError::ChannelNotExternal(address.clone()));
        }
        if channel.is_instance_rooted() != address.root_id.is_some() {
            return Err(ServerError::RootIdMismatch(address.clone()));
        }
        if channel.filter_type.requires_instance_id() != address.filter_instance_id.is_some() {
            return Err(ServerError::FilterInstanceMismatch(address.clone()));
        }
        Ok(channel)
    }

    fn effective_filter(channel: &ChannelMetaData, filter: Option<Filter>) -> Option<Filter> {
        filter.filter(|_| channel.filter_type.has_filter_parameter())
    }

    async fn subscribe_one(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        address: ChannelAddress,
        filter: Option<Filter>,
        explicit: bool,
        request_level: bool,
    ) -> Result<()> {
        let channel = self.validate(&address, explicit)?;
        let filter = Self::effective_filter(channel, filter);

        if let Some(entry) = state.subscription_mut(&address) {
            if explicit {
                entry.set_explicitly_subscribed(true);
            }
            if entry.filter() == filter.as_ref() {
                return Ok(());
            }
            return self.update_filter(state, ctx, channel, &address, filter).await;
        }

        self.ensure_required(state, ctx, channel).await?;
        if self
            .subscribe_new(state, ctx, channel, &address, filter, explicit, request_level)
            .await?
        {
            self.link_required(state, channel, &address);
        }
        Ok(())
    }

    async fn bulk_subscribe_explicit(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        addresses: Vec<ChannelAddress>,
        filter: Option<Filter>,
    ) -> Result<()> {
        let mut groups: BTreeMap<u32, BTreeSet<ChannelAddress>> = BTreeMap::new();
        for address in addresses {
            self.validate(&address, true)?;
            groups.entry(address.channel_id).or_default().insert(address);
        }

        for (channel_id, addresses) in groups {
            let Some(channel) = self.schema.channel(channel_id) else {
                continue;
            };
            let filter = Self::effective_filter(channel, filter.clone());

            let mut updates = Vec::new();
            let mut adds = Vec::new();
            for address in addresses {
                match state.subscription_mut(&address) {
                    Some(entry) => {
                        entry.set_explicitly_subscribed(true);
                        if entry.filter() != filter.as_ref() {
                            if channel.filter_type.is_static() {
                                return Err(ServerError::AttemptedToUpdateStaticFilter(address));
                            }
                            updates.push(address);
                        }
                    }
                    None => adds.push(address),
                }
            }

            debug!(channel = channel_id, updates = updates.len(), adds = adds.len(), "Bulk subscribe");
            if !updates.is_empty() {
                self.bulk_update(state, ctx, channel, &updates, filter.clone()).await?;
            }
            if !adds.is_empty() {
                self.bulk_add(state, ctx, channel, &adds, filter, true).await?;
            }
        }
        Ok(())
    }

    /// Subscribe every channel `channel` requires, dependencies first.
    async fn ensure_required(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        channel: &ChannelMetaData,
    ) -> Result<()> {
        for required_id in self.schema.required_channel_closure(channel.id) {
            let address = ChannelAddress::type_channel(self.schema.id, required_id);
            if state.is_subscribed(&address) {
                continue;
            }
            let Some(required) = self.schema.channel(required_id) else {
                continue;
            };
            debug!(channel = %address, "Subscribing required channel");
            if self
                .subscribe_new(state, ctx, required, &address, None, false, false)
                .await?
            {
                self.link_required(state, required, &address);
            }
        }
        Ok(())
    }

    fn link_required(&self, state: &mut SessionState, channel: &ChannelMetaData, address: &ChannelAddress) {
        for required_id in &channel.required_type_channels {
            state.link(address, &ChannelAddress::type_channel(self.schema.id, *required_id));
        }
    }

    /// Collect and record a subscription that does not exist yet.
    ///
    /// Returns false when the channel root no longer exists, in which case
    /// a delete action is recorded instead.
    #[allow(clippy::too_many_arguments)]
    async fn subscribe_new(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        channel: &ChannelMetaData,
        address: &ChannelAddress,
        filter: Option<Filter>,
        explicit: bool,
        request_level: bool,
    ) -> Result<bool> {
        if channel.is_cacheable() {
            let Some(cached) = self.cache.ensure(address, &self.hooks).await? else {
                info!(channel = %address, "Channel root deleted");
                ctx.changes.add_channel_action(address.clone(), ChannelAction::Delete, None);
                return Ok(false);
            };
            state.insert(SubscriptionEntry::new(address.clone(), None, explicit));

            if !request_level {
                ctx.changes.add_channel_action(address.clone(), ChannelAction::Add, None);
                ctx.changes.add_messages(cached.messages.iter());
            } else if state.etag(address) == Some(cached.cache_key.as_str()) {
                info!(channel = %address, request = ?ctx.request_id, "Client cache is current");
                ctx.cached = Some(CachedResponse::UseCache {
                    channel: address.clone(),
                    etag: cached.cache_key,
                });
            } else {
                let mut payload = ChangeAccumulator::new();
                payload.add_channel_action(address.clone(), ChannelAction::Add, None);
                payload.add_messages(cached.messages.iter());
                payload.set_etag(cached.cache_key.clone());
                state.record_etag(address, cached.cache_key);
                ctx.cached = Some(CachedResponse::Payload(payload));
            }
            info!(channel = %address, explicit, "Subscribed");
            return Ok(true);
        }

        let data = self
            .hooks
            .collect_data_for_subscribe(address, filter.as_ref())
            .await
            .map_err(ServerError::Collector)?;
        if data.channel_root_deleted {
            info!(channel = %address, "Channel root deleted");
            ctx.changes.add_channel_action(address.clone(), ChannelAction::Delete, None);
            return Ok(false);
        }

        state.insert(SubscriptionEntry::new(address.clone(), filter.clone(), explicit));
        ctx.changes.add_channel_action(address.clone(), ChannelAction::Add, filter);
        ctx.changes.add_messages(data.messages.iter());
        info!(channel = %address, explicit, messages = data.messages.len(), "Subscribed");
        Ok(true)
    }

    /// Add several new subscriptions of one channel, in bulk where supported.
    async fn bulk_add(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        channel: &ChannelMetaData,
        addresses: &[ChannelAddress],
        filter: Option<Filter>,
        explicit: bool,
    ) -> Result<()> {
        self.ensure_required(state, ctx, channel).await?;

        if channel.bulk_load && !channel.is_cacheable() && addresses.len() > 1 {
            let collected = self
                .hooks
                .bulk_collect_data_for_subscribe(addresses, filter.as_ref())
                .await
                .map_err(ServerError::Collector)?;
            if let Some(data) = collected {
                for address in addresses {
                    if data.deleted.contains(address) {
                        ctx.changes.add_channel_action(address.clone(), ChannelAction::Delete, None);
                        continue;
                    }
                    state.insert(SubscriptionEntry::new(address.clone(), filter.clone(), explicit));
                    ctx.changes.add_channel_action(address.clone(), ChannelAction::Add, filter.clone());
                    self.link_required(state, channel, address);
                }
                ctx.changes.add_messages(data.messages.iter());
                info!(channel = channel.id, count = addresses.len(), "Bulk subscribed");
                return Ok(());
            }
        }

        for address in addresses {
            if self
                .subscribe_new(state, ctx, channel, address, filter.clone(), explicit, false)
                .await?
            {
                self.link_required(state, channel, address);
            }
        }
        Ok(())
    }

    async fn update_filter(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        channel: &ChannelMetaData,
        address: &ChannelAddress,
        filter: Option<Filter>,
    ) -> Result<()> {
        if !channel.filter_type.is_dynamic() {
            return Err(ServerError::AttemptedToUpdateStaticFilter(address.clone()));
        }
        let original = state.subscription(address).and_then(|e| e.filter().cloned());
        let messages = self
            .hooks
            .collect_data_for_subscription_update(address, original.as_ref(), filter.as_ref())
            .await
            .map_err(ServerError::Collector)?;
        self.apply_filter_update(state, ctx, address, filter);
        ctx.changes.add_messages(messages.iter());
        Ok(())
    }

    fn apply_filter_update(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        address: &ChannelAddress,
        filter: Option<Filter>,
    ) {
        if let Some(entry) = state.subscription_mut(address) {
            entry.set_filter(filter.clone());
            ctx.changes.add_channel_action(address.clone(), ChannelAction::Update, filter);
            info!(channel = %address, "Subscription filter updated");
        }
    }

    async fn bulk_update(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        channel: &ChannelMetaData,
        addresses: &[ChannelAddress],
        filter: Option<Filter>,
    ) -> Result<()> {
        if channel.bulk_load && channel.filter_type.is_dynamic() && addresses.len() > 1 {
            let collected = self
                .hooks
                .bulk_collect_data_for_subscription_update(addresses, filter.as_ref())
                .await
                .map_err(ServerError::Collector)?;
            if let Some(messages) = collected {
                for address in addresses {
                    self.apply_filter_update(state, ctx, address, filter.clone());
                }
                ctx.changes.add_messages(messages.iter());
                return Ok(());
            }
        }
        for address in addresses {
            self.update_filter(state, ctx, channel, address, filter.clone()).await?;
        }
        Ok(())
    }

    // ─── Unsubscribe ──────────────────────────────────────────────────────

    /// Drop a subscription and everything only it kept alive.
    ///
    /// `explicit` clears the explicit flag first. `delete` removes the
    /// subscription even if it is still reachable and reports a delete
    /// action instead of a remove.
    fn perform_unsubscribe(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        address: &ChannelAddress,
        explicit: bool,
        delete: bool,
    ) {
        let mut work = vec![(address.clone(), explicit, delete)];
        while let Some((address, explicit, delete)) = work.pop() {
            let Some(entry) = state.subscription_mut(&address) else {
                continue;
            };
            if explicit {
                entry.set_explicitly_subscribed(false);
            }
            if !delete && !entry.can_unsubscribe() {
                continue;
            }
            let Some(entry) = state.remove(&address) else {
                continue;
            };

            let action = if delete {
                ChannelAction::Delete
            } else {
                ChannelAction::Remove
            };
            info!(channel = %address, ?action, "Unsubscribed");
            ctx.changes.add_channel_action(address.clone(), action, None);

            for source in entry.inward_links() {
                if let Some(source) = state.subscription_mut(source) {
                    source.deregister_outward_link(&address);
                }
            }
            for target in entry.outward_links() {
                if let Some(target) = state.subscription_mut(target) {
                    target.deregister_inward_link(&address);
                }
                work.push((target.clone(), false, false));
            }
        }
    }

    /// Delete subscriptions to instance channels rooted at a deleted entity.
    fn unsubscribe_deleted_roots(&self, state: &mut SessionState, ctx: &mut RequestContext, message: &EntityMessage) {
        let channels: Vec<u32> = self
            .schema
            .channels_rooted_at(message.entity_type)
            .map(|c| c.id)
            .collect();
        for channel_id in channels {
            for address in state.instance_subscriptions(self.schema.id, channel_id, message.id) {
                self.perform_unsubscribe(state, ctx, &address, false, true);
            }
        }
    }

    // ─── Links ────────────────────────────────────────────────────────────

    /// Follow links from subscribed channels until no new targets remain.
    ///
    /// Each round subscribes the smallest `(channel, filter)` group of
    /// pending targets, then rescans.
    async fn expand_links(
        &self,
        session: &ReplicantSession,
        state: &mut SessionState,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        let mut attempted: HashSet<ChannelAddress> = HashSet::new();
        let mut round = 0;
        loop {
            let pending = self.pending_links(state, ctx, &attempted);
            let Some((_, (filter, links))) = pending.into_iter().next() else {
                return Ok(());
            };
            round += 1;

            let targets: BTreeSet<ChannelAddress> = links.iter().map(|l| l.target.clone()).collect();
            let targets: Vec<ChannelAddress> = targets.into_iter().collect();
            debug!(session = %session.id(), round, count = targets.len(), "Expanding links");
            attempted.extend(targets.iter().cloned());

            self.subscribe_linked(state, ctx, &targets, filter)
                .await
                .map_err(|err| ServerError::LinkExpansionFailed {
                    session: session.id().to_string(),
                    message: err.to_string(),
                })?;
            for link in &links {
                state.link(&link.source, &link.target);
            }
        }
    }

    fn pending_links(
        &self,
        state: &SessionState,
        ctx: &RequestContext,
        attempted: &HashSet<ChannelAddress>,
    ) -> PendingLinks {
        let mut pending = PendingLinks::new();
        for message in ctx.messages() {
            for link in &message.links {
                let Some(source) = state.subscription(&link.source) else {
                    continue;
                };
                if state.is_subscribed(&link.target) || attempted.contains(&link.target) {
                    continue;
                }
                let Ok(target) = self.schema.channel_for(&link.target) else {
                    warn!(channel = %link.target, "Ignoring link to unknown channel");
                    continue;
                };
                let filter = if !target.filter_type.has_filter_parameter() {
                    None
                } else if self.hooks.should_follow_link(source, &link.target) {
                    self.hooks.link_filter(source, &link.target)
                } else {
                    continue;
                };
                let key = (
                    link.target.channel_id,
                    filter.as_ref().map(Filter::to_string).unwrap_or_default(),
                );
                pending
                    .entry(key)
                    .or_insert_with(|| (filter, Vec::new()))
                    .1
                    .push(link.clone());
            }
        }
        pending
    }

    async fn subscribe_linked(
        &self,
        state: &mut SessionState,
        ctx: &mut RequestContext,
        targets: &[ChannelAddress],
        filter: Option<Filter>,
    ) -> Result<()> {
        let Some(first) = targets.first() else {
            return Ok(());
        };
        let channel = self.validate(first, false)?;
        for target in targets {
            self.validate(target, false)?;
        }
        self.bulk_add(state, ctx, channel, targets, filter, false).await
    }

    // ─── Responses ────────────────────────────────────────────────────────

    async fn complete(
        &self,
        session: &Arc<ReplicantSession>,
        ctx: RequestContext,
        result: Result<()>,
        respond: bool,
    ) -> Result<()> {
        let err = match result {
            Ok(()) => {
                self.respond(session, ctx, respond).await;
                return Ok(());
            }
            Err(err) => err,
        };

        match &err {
            ServerError::LinkExpansionFailed { .. } => {
                warn!(session = %session.id(), error = %err, "Link expansion failed");
                self.close_session(session.id(), Some(LINK_EXPANSION_FAILED)).await;
            }
            ServerError::SessionLockTimeout(_) | ServerError::SessionClosed(_) | ServerError::SessionNotFound(_) => {}
            _ if err.is_protocol_violation() => {
                warn!(session = %session.id(), error = %err, "Protocol violation");
                self.close_session(session.id(), Some(&err.to_string())).await;
            }
            _ => {
                warn!(session = %session.id(), request = ?ctx.request_id, error = %err, "Request failed");
                let RequestContext {
                    request_id, changes, ..
                } = ctx;
                let mut queued = false;
                if !changes.is_empty() {
                    queued |= self
                        .send(session, ServerMessage::Update(changes.into_change_set(None)))
                        .await;
                }
                queued |= self
                    .send(
                        session,
                        ServerMessage::Error {
                            req: request_id,
                            message: err.to_string(),
                        },
                    )
                    .await;
                if queued {
                    self.broker.queue_session(Arc::clone(session));
                }
            }
        }
        Err(err)
    }

    /// Queue the frames answering a completed operation.
    async fn respond(&self, session: &Arc<ReplicantSession>, ctx: RequestContext, respond: bool) {
        let RequestContext {
            request_id,
            changes,
            cached,
        } = ctx;
        let mut queued = false;

        match cached {
            None => {
                if !changes.is_empty() {
                    queued |= self
                        .send(session, ServerMessage::Update(changes.into_change_set(request_id)))
                        .await;
                } else if let (true, Some(req)) = (respond, request_id) {
                    queued |= self.send(session, ServerMessage::Ok { req }).await;
                }
            }
            Some(cached) => {
                // Changes outside the cached channel go first, unsolicited.
                if !changes.is_empty() {
                    queued |= self
                        .send(session, ServerMessage::Update(changes.into_change_set(None)))
                        .await;
                }
                match cached {
                    CachedResponse::UseCache { channel, etag } => {
                        if let Some(req) = request_id {
                            queued |= self.send(session, ServerMessage::UseCache { req, channel, etag }).await;
                        }
                    }
                    CachedResponse::Payload(payload) => {
                        queued |= self
                            .send(session, ServerMessage::Update(payload.into_change_set(request_id)))
                            .await;
                    }
                }
            }
        }

        if queued {
            self.broker.queue_session(Arc::clone(session));
        }
    }

    async fn send(&self, session: &ReplicantSession, message: ServerMessage) -> bool {
        match session.queue(message).await {
            Ok(()) => true,
            Err(err) => {
                debug!(session = %session.id(), error = %err, "Dropping packet");
                false
            }
        }
    }
}

impl<H: ReplicantHooks> std::fmt::Debug for ReplicantSessionManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicantSessionManager")
            .field("schema", &self.schema.name)
            .field("config", &self.config)
            .finish()
    }
}
