//! Server configuration.

use std::time::Duration;

/// Configuration for the session manager and delivery broker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long an operation waits for a session's lock before closing it.
    pub session_lock_timeout: Duration,
    /// How long a broker worker waits for a queued session before
    /// checking for shutdown.
    pub broker_poll_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_lock_timeout: Duration::from_secs(30),
            broker_poll_timeout: Duration::from_millis(100),
        }
    }
}
