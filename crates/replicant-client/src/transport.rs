//! Transport abstraction for the client.
//!
//! The client is single threaded and never blocks, so the transport only
//! pushes frames out. Inbound frames are handed to the client by the host
//! through [`ReplicantClient::on_message`].
//!
//! [`ReplicantClient::on_message`]: crate::client::ReplicantClient::on_message

use crate::error::{ClientError, Result};

/// Outbound side of a client connection.
pub trait ClientTransport {
    /// Begin connecting. A `session-created` frame arrives later.
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    /// Send one text frame.
    fn send(&mut self, frame: String) -> Result<()>;
}

/// A simple in-memory transport for testing.
///
/// Frames are collected in a queue shared with a [`MemoryTransportHandle`]
/// so a test harness can forward them to a server.
pub mod memory {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Something the client asked the transport to do.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TransportEvent {
        Connect,
        Disconnect,
        Frame(String),
    }

    #[derive(Debug, Default)]
    struct Shared {
        events: VecDeque<TransportEvent>,
        connected: bool,
        fail_sends: bool,
    }

    /// In-memory transport implementation.
    #[derive(Debug)]
    pub struct MemoryClientTransport {
        shared: Rc<RefCell<Shared>>,
    }

    /// Test-side view of a [`MemoryClientTransport`].
    #[derive(Debug, Clone)]
    pub struct MemoryTransportHandle {
        shared: Rc<RefCell<Shared>>,
    }

    impl MemoryClientTransport {
        /// Create a transport and the handle used to observe it.
        pub fn new() -> (Self, MemoryTransportHandle) {
            let shared = Rc::new(RefCell::new(Shared::default()));
            (
                Self {
                    shared: Rc::clone(&shared),
                },
                MemoryTransportHandle { shared },
            )
        }
    }

    impl ClientTransport for MemoryClientTransport {
        fn connect(&mut self) -> Result<()> {
            let mut shared = self.shared.borrow_mut();
            shared.connected = true;
            shared.events.push_back(TransportEvent::Connect);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            let mut shared = self.shared.borrow_mut();
            shared.connected = false;
            shared.events.push_back(TransportEvent::Disconnect);
            Ok(())
        }

        fn send(&mut self, frame: String) -> Result<()> {
            let mut shared = self.shared.borrow_mut();
            if !shared.connected {
                return Err(ClientError::Transport("not connected".into()));
            }
            if shared.fail_sends {
                return Err(ClientError::Transport("send failed".into()));
            }
            shared.events.push_back(TransportEvent::Frame(frame));
            Ok(())
        }
    }

    impl MemoryTransportHandle {
        /// Remove and return everything the client did since the last drain.
        pub fn drain(&self) -> Vec<TransportEvent> {
            self.shared.borrow_mut().events.drain(..).collect()
        }

        /// Remove and return just the frames sent since the last drain.
        pub fn drain_frames(&self) -> Vec<String> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    TransportEvent::Frame(frame) => Some(frame),
                    _ => None,
                })
                .collect()
        }

        pub fn is_connected(&self) -> bool {
            self.shared.borrow().connected
        }

        /// Make every subsequent send fail.
        pub fn fail_sends(&self, fail: bool) {
            self.shared.borrow_mut().fail_sends = fail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;

    #[test]
    fn test_memory_transport_records_frames() {
        let (mut transport, handle) = MemoryClientTransport::new();
        assert!(transport.send("x".into()).is_err());

        transport.connect().unwrap();
        transport.send("a".into()).unwrap();
        transport.send("b".into()).unwrap();
        assert!(handle.is_connected());

        assert_eq!(
            handle.drain(),
            vec![
                TransportEvent::Connect,
                TransportEvent::Frame("a".into()),
                TransportEvent::Frame("b".into()),
            ]
        );
        assert!(handle.drain_frames().is_empty());
    }

    #[test]
    fn test_fail_sends() {
        let (mut transport, handle) = MemoryClientTransport::new();
        transport.connect().unwrap();
        handle.fail_sends(true);
        assert!(matches!(transport.send("a".into()), Err(ClientError::Transport(_))));
    }
}
