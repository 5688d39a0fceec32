//! Server-side state for one connected client.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use replicant_core::{ChannelAddress, ServerMessage};

use crate::error::{Result, ServerError};
use crate::subscription::SubscriptionEntry;
use crate::transport::SessionTransport;

/// Subscriptions and known cache keys of a session.
///
/// Guarded by the session lock for the duration of one operation.
#[derive(Debug, Default)]
pub struct SessionState {
    subscriptions: BTreeMap<ChannelAddress, SubscriptionEntry>,
    /// Cache keys the client holds, by channel cache key.
    etags: BTreeMap<String, String>,
}

impl SessionState {
    pub fn subscription(&self, address: &ChannelAddress) -> Option<&SubscriptionEntry> {
        self.subscriptions.get(address)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.subscriptions.values()
    }

    pub fn is_subscribed(&self, address: &ChannelAddress) -> bool {
        self.subscriptions.contains_key(address)
    }

    pub fn etag(&self, address: &ChannelAddress) -> Option<&str> {
        self.etags.get(&address.cache_key()).map(String::as_str)
    }

    pub fn set_etags(&mut self, etags: BTreeMap<String, String>) {
        self.etags = etags;
    }

    pub fn record_etag(&mut self, address: &ChannelAddress, etag: String) {
        self.etags.insert(address.cache_key(), etag);
    }

    pub(crate) fn subscription_mut(&mut self, address: &ChannelAddress) -> Option<&mut SubscriptionEntry> {
        self.subscriptions.get_mut(address)
    }

    pub(crate) fn insert(&mut self, entry: SubscriptionEntry) {
        self.subscriptions.insert(entry.address().clone(), entry);
    }

    pub(crate) fn remove(&mut self, address: &ChannelAddress) -> Option<SubscriptionEntry> {
        self.subscriptions.remove(address)
    }

    /// Record that `source` caused `target`. Both must be subscribed.
    pub(crate) fn link(&mut self, source: &ChannelAddress, target: &ChannelAddress) -> bool {
        if source == target || !self.is_subscribed(source) || !self.is_subscribed(target) {
            return false;
        }
        if let Some(entry) = self.subscriptions.get_mut(target) {
            entry.register_inward_link(source.clone());
        }
        self.subscriptions
            .get_mut(source)
            .is_some_and(|entry| entry.register_outward_link(target.clone()))
    }

    /// Addresses subscribed for the instance channel rooted at `root_id`.
    pub(crate) fn instance_subscriptions(&self, schema_id: u32, channel_id: u32, root_id: i32) -> Vec<ChannelAddress> {
        self.subscriptions
            .keys()
            .filter(|a| a.schema_id == schema_id && a.channel_id == channel_id && a.root_id == Some(root_id))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct Outbound {
    last_sequence: u32,
    packets: VecDeque<ServerMessage>,
}

/// A connected client session.
pub struct ReplicantSession {
    id: String,
    transport: Arc<dyn SessionTransport>,
    state: Mutex<SessionState>,
    outbound: Mutex<Outbound>,
    /// Held while packets are being written to the transport.
    delivery: Mutex<()>,
    authenticated: AtomicBool,
    closed: AtomicBool,
}

impl ReplicantSession {
    pub(crate) fn new(id: String, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            id,
            transport,
            state: Mutex::new(SessionState::default()),
            outbound: Mutex::new(Outbound::default()),
            delivery: Mutex::new(()),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> &Mutex<SessionState> {
        &self.state
    }

    /// Snapshot of one subscription.
    pub async fn subscription(&self, address: &ChannelAddress) -> Option<SubscriptionEntry> {
        self.state.lock().await.subscription(address).cloned()
    }

    /// Snapshot of every subscription.
    pub async fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        self.state.lock().await.subscriptions().cloned().collect()
    }

    /// Queue a packet for delivery.
    ///
    /// Update frames are numbered here, so sequence order is queue order.
    pub async fn queue(&self, mut message: ServerMessage) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::SessionClosed(self.id.clone()));
        }
        let mut outbound = self.outbound.lock().await;
        if let ServerMessage::Update(change_set) = &mut message {
            outbound.last_sequence += 1;
            change_set.sequence = outbound.last_sequence;
            debug!(session = %self.id, sequence = change_set.sequence, request = ?change_set.request_id, "Queued change set");
        }
        outbound.packets.push_back(message);
        Ok(())
    }

    pub async fn has_pending_packets(&self) -> bool {
        !self.outbound.lock().await.packets.is_empty()
    }

    /// Claim delivery for this session, unless another worker holds it.
    pub(crate) fn try_begin_delivery(&self) -> Option<MutexGuard<'_, ()>> {
        self.delivery.try_lock().ok()
    }

    /// Send the packets queued so far, in order. Requires the delivery guard.
    ///
    /// Packets queued while sending are left for the next round.
    pub(crate) async fn deliver_pending(&self, _guard: &MutexGuard<'_, ()>) -> Result<usize> {
        let batch = std::mem::take(&mut self.outbound.lock().await.packets);
        let mut sent = 0;
        for message in batch {
            let frame = message.encode()?;
            self.transport.send(frame).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Flush pending packets, send a final error frame if `reason` is given
    /// and close the transport.
    pub(crate) async fn close(&self, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let guard = self.delivery.lock().await;
        if let Err(err) = self.deliver_pending(&guard).await {
            warn!(session = %self.id, error = %err, "Failed to flush packets on close");
        }
        if let Some(reason) = reason {
            let frame = ServerMessage::Error {
                req: None,
                message: reason.to_string(),
            }
            .encode();
            match frame {
                Ok(frame) => {
                    if let Err(err) = self.transport.send(frame).await {
                        warn!(session = %self.id, error = %err, "Failed to send close reason");
                    }
                }
                Err(err) => warn!(session = %self.id, error = %err, "Failed to encode close reason"),
            }
        }
        self.transport.close().await;
    }
}

impl std::fmt::Debug for ReplicantSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicantSession")
            .field("id", &self.id)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}
