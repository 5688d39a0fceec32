//! Per-session serialized delivery.
//!
//! Sessions with queued packets are pushed onto a shared work queue. Any
//! number of workers drain it; a worker delivers the packets a session has
//! queued so far while holding that session's delivery lock, so one session
//! is never written by two workers at once while different sessions proceed
//! in parallel. A session that still has packets afterwards goes to the
//! back of the queue, so a busy session cannot monopolize a worker.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::session::ReplicantSession;

/// Work queue of sessions with pending packets.
#[derive(Debug)]
pub struct ReplicantMessageBroker {
    sender: mpsc::UnboundedSender<Arc<ReplicantSession>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Arc<ReplicantSession>>>,
    poll_timeout: std::time::Duration,
}

impl ReplicantMessageBroker {
    pub fn new(config: &ServerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            poll_timeout: config.broker_poll_timeout,
        }
    }

    /// Schedule delivery for `session`.
    pub fn queue_session(&self, session: Arc<ReplicantSession>) {
        if self.sender.send(session).is_err() {
            warn!("Broker queue closed");
        }
    }

    /// Wait up to the poll timeout for one queued session and deliver it.
    ///
    /// Returns whether a session was taken from the queue.
    pub async fn process_next(&self) -> bool {
        let next = {
            let mut receiver = self.receiver.lock().await;
            tokio::time::timeout(self.poll_timeout, receiver.recv()).await
        };
        match next {
            Ok(Some(session)) => {
                self.deliver(session).await;
                true
            }
            _ => false,
        }
    }

    /// Deliver every session queued so far without waiting.
    ///
    /// Returns the number of queue entries processed.
    pub async fn process_pending(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = self.receiver.lock().await.try_recv();
            let Ok(session) = next else {
                return processed;
            };
            self.deliver(session).await;
            processed += 1;
        }
    }

    /// Run a worker until `shutdown` becomes true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Broker worker started");
        while !*shutdown.borrow() {
            self.process_next().await;
        }
        info!("Broker worker stopped");
    }

    async fn deliver(&self, session: Arc<ReplicantSession>) {
        // A session already being delivered is skipped; its worker
        // re-checks for packets after releasing the lock.
        let Some(guard) = session.try_begin_delivery() else {
            debug!(session = %session.id(), "Session delivery in progress");
            return;
        };
        match session.deliver_pending(&guard).await {
            Ok(sent) => debug!(session = %session.id(), sent, "Delivered packets"),
            Err(err) => {
                warn!(session = %session.id(), error = %err, "Delivery failed");
                return;
            }
        }
        drop(guard);
        if !session.is_closed() && session.has_pending_packets().await {
            self.queue_session(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory, SessionTransport};
    use async_trait::async_trait;
    use replicant_core::ServerMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};
    use std::time::Duration;

    fn session(id: &str) -> (Arc<ReplicantSession>, memory::MemorySessionReceiver) {
        let (transport, receiver) = memory::channel();
        (Arc::new(ReplicantSession::new(id.into(), Arc::new(transport))), receiver)
    }

    #[tokio::test]
    async fn test_requeued_session_is_delivered_once_in_order() {
        let broker = ReplicantMessageBroker::new(&ServerConfig::default());
        let (session, mut receiver) = session("a");
        for req in 1..=3 {
            session.queue(ServerMessage::Ok { req }).await.unwrap();
            broker.queue_session(Arc::clone(&session));
        }

        assert_eq!(broker.process_pending().await, 3);
        let reqs: Vec<u32> = receiver
            .drain()
            .iter()
            .map(|f| match ServerMessage::decode(f).unwrap() {
                ServerMessage::Ok { req } => req,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(reqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_busy_session_is_skipped() {
        let broker = ReplicantMessageBroker::new(&ServerConfig::default());
        let (session, mut receiver) = session("a");
        session.queue(ServerMessage::Ok { req: 1 }).await.unwrap();
        broker.queue_session(Arc::clone(&session));

        let guard = session.try_begin_delivery().unwrap();
        broker.process_pending().await;
        assert!(receiver.drain().is_empty());
        drop(guard);

        broker.queue_session(Arc::clone(&session));
        broker.process_pending().await;
        assert_eq!(receiver.drain().len(), 1);
    }

    /// Queues another packet on its own session for every frame it sends.
    struct BurstTransport {
        id: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
        session: OnceLock<Weak<ReplicantSession>>,
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl SessionTransport for BurstTransport {
        async fn send(&self, _frame: String) -> crate::error::Result<()> {
            self.log.lock().unwrap().push(self.id);
            let more = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if more {
                if let Some(session) = self.session.get().and_then(Weak::upgrade) {
                    session.queue(ServerMessage::Ok { req: 0 }).await?;
                }
            }
            Ok(())
        }

        async fn close(&self) {}
    }

    fn burst_session(
        id: &'static str,
        log: &Arc<StdMutex<Vec<&'static str>>>,
        burst: usize,
    ) -> Arc<ReplicantSession> {
        let transport = Arc::new(BurstTransport {
            id,
            log: Arc::clone(log),
            session: OnceLock::new(),
            remaining: AtomicUsize::new(burst),
        });
        let session = Arc::new(ReplicantSession::new(id.into(), Arc::clone(&transport) as Arc<dyn SessionTransport>));
        let _ = transport.session.set(Arc::downgrade(&session));
        session
    }

    #[tokio::test]
    async fn test_busy_session_does_not_pin_worker() {
        let broker = ReplicantMessageBroker::new(&ServerConfig::default());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let busy = burst_session("a", &log, 50);
        let quiet = burst_session("b", &log, 0);
        busy.queue(ServerMessage::Ok { req: 1 }).await.unwrap();
        quiet.queue(ServerMessage::Ok { req: 1 }).await.unwrap();
        broker.queue_session(Arc::clone(&busy));
        broker.queue_session(Arc::clone(&quiet));

        // one worker: the quiet session is served right after one round of the busy one
        assert!(broker.process_next().await);
        assert!(broker.process_next().await);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);

        broker.process_pending().await;
        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|id| **id == "a").count(), 51);
        assert_eq!(log.iter().filter(|id| **id == "b").count(), 1);
        drop(log);
        assert!(!busy.has_pending_packets().await);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let config = ServerConfig {
            broker_poll_timeout: Duration::from_millis(5),
            ..ServerConfig::default()
        };
        let broker = Arc::new(ReplicantMessageBroker::new(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&broker).run(shutdown_rx));

        let (session, mut receiver) = session("a");
        session.queue(ServerMessage::Ok { req: 1 }).await.unwrap();
        broker.queue_session(Arc::clone(&session));
        assert!(receiver.recv_timeout(Duration::from_secs(1)).await.is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
