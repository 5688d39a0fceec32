//! Transport abstraction for server sessions.
//!
//! A transport carries encoded frames to one connected client.
//! Implementations may use WebSockets or any other persistent connection.

use async_trait::async_trait;

use crate::error::Result;

/// Outbound side of one client connection.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection. Further sends fail.
    async fn close(&self);
}

/// A simple in-memory transport for testing.
///
/// Frames are delivered over a channel to a [`MemorySessionReceiver`].
pub mod memory {
    use super::*;
    use crate::error::ServerError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory transport implementation.
    #[derive(Debug)]
    pub struct MemorySessionTransport {
        sender: mpsc::Sender<String>,
        closed: Arc<AtomicBool>,
    }

    /// Client-side end of a [`MemorySessionTransport`].
    #[derive(Debug)]
    pub struct MemorySessionReceiver {
        receiver: mpsc::Receiver<String>,
        closed: Arc<AtomicBool>,
    }

    /// Create a connected transport and receiver pair.
    pub fn channel() -> (MemorySessionTransport, MemorySessionReceiver) {
        let (sender, receiver) = mpsc::channel(1000);
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemorySessionTransport {
                sender,
                closed: Arc::clone(&closed),
            },
            MemorySessionReceiver { receiver, closed },
        )
    }

    #[async_trait]
    impl SessionTransport for MemorySessionTransport {
        async fn send(&self, frame: String) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ServerError::Transport("connection closed".into()));
            }
            self.sender
                .send(frame)
                .await
                .map_err(|_| ServerError::Transport("receiver dropped".into()))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl MemorySessionReceiver {
        /// Wait for the next frame.
        pub async fn recv(&mut self) -> Option<String> {
            self.receiver.recv().await
        }

        /// Wait for the next frame, giving up after `timeout`.
        pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
            tokio::time::timeout(timeout, self.receiver.recv())
                .await
                .ok()
                .flatten()
        }

        /// Every frame already delivered.
        pub fn drain(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.receiver.try_recv() {
                frames.push(frame);
            }
            frames
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
