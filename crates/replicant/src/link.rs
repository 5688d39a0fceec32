//! In-process connection between a client loader and a server.
//!
//! A [`LocalLink`] stands in for a network connection: it carries frames
//! from a client's [`MemoryClientTransport`] to a session of a
//! [`ReplicantSessionManager`] and back. Useful for tests, demos and
//! embedding both halves in one process.

use std::sync::Arc;

use tracing::{debug, info, warn};

use replicant_client::transport::memory::{MemoryClientTransport, MemoryTransportHandle, TransportEvent};
use replicant_client::{CacheService, EntityRepository, ReplicantClient};
use replicant_server::memory::{self, MemorySessionReceiver};
use replicant_server::{ReplicantHooks, ReplicantSessionManager};

use crate::error::{ReplicantError, Result};

/// Rounds [`settle`] runs before giving up.
pub const DEFAULT_SETTLE_ROUNDS: usize = 1000;

/// Frame relay for one schema's loader.
#[derive(Debug)]
pub struct LocalLink {
    schema_id: u32,
    handle: MemoryTransportHandle,
    session: Option<(String, MemorySessionReceiver)>,
}

impl LocalLink {
    /// Create a link and the transport to register with the client's loader.
    pub fn new(schema_id: u32) -> (Self, MemoryClientTransport) {
        let (transport, handle) = MemoryClientTransport::new();
        (
            Self {
                schema_id,
                handle,
                session: None,
            },
            transport,
        )
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    /// Server-side id of the current session.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn handle(&self) -> &MemoryTransportHandle {
        &self.handle
    }

    /// Move everything pending in both directions once.
    ///
    /// Returns the number of events and frames relayed.
    pub async fn pump<R, C, H>(
        &mut self,
        client: &mut ReplicantClient<R, C>,
        manager: &ReplicantSessionManager<H>,
    ) -> Result<usize>
    where
        R: EntityRepository,
        C: CacheService,
        H: ReplicantHooks,
    {
        let mut moved = 0;

        for event in self.handle.drain() {
            moved += 1;
            match event {
                TransportEvent::Connect => {
                    let (transport, receiver) = memory::channel();
                    let session = manager.create_session(Arc::new(transport)).await?;
                    info!(schema = self.schema_id, session = %session.id(), "Link connected");
                    self.session = Some((session.id().to_string(), receiver));
                }
                TransportEvent::Disconnect => {
                    if let Some((id, _)) = self.session.take() {
                        manager.close_session(&id, None).await;
                    }
                    client.on_disconnected(self.schema_id)?;
                }
                TransportEvent::Frame(frame) => {
                    let Some((id, _)) = self.session.as_ref() else {
                        warn!(schema = self.schema_id, "Dropping frame sent without a session");
                        continue;
                    };
                    // The server answers failures itself; the error is informational.
                    if let Err(err) = manager.handle_message(id, &frame).await {
                        debug!(schema = self.schema_id, error = %err, "Server rejected frame");
                    }
                }
            }
        }

        manager.broker().process_pending().await;

        let Some((_, receiver)) = self.session.as_mut() else {
            return Ok(moved);
        };
        let frames = receiver.drain();
        let closed = receiver.is_closed();
        for frame in frames {
            moved += 1;
            client.on_message(self.schema_id, &frame)?;
        }
        if closed {
            info!(schema = self.schema_id, "Server closed the session");
            self.session = None;
            client.on_disconnected(self.schema_id)?;
            moved += 1;
        }
        Ok(moved)
    }
}

/// Tick the client and pump every link until neither side has work left.
///
/// Returns the number of rounds taken.
pub async fn settle<R, C, H>(
    client: &mut ReplicantClient<R, C>,
    manager: &ReplicantSessionManager<H>,
    links: &mut [LocalLink],
    now_ms: u64,
    max_rounds: usize,
) -> Result<usize>
where
    R: EntityRepository,
    C: CacheService,
    H: ReplicantHooks,
{
    for round in 1..=max_rounds {
        let busy = client.tick(now_ms);
        let mut moved = 0;
        for link in links.iter_mut() {
            moved += link.pump(client, manager).await?;
        }
        if !busy && moved == 0 {
            debug!(rounds = round, "Settled");
            return Ok(round);
        }
    }
    Err(ReplicantError::NotSettled(max_rounds))
}
