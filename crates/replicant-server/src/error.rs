//! Error types for the server.

use thiserror::Error;

use replicant_core::{ChannelAddress, ProtocolError};

/// Errors that can occur on the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelAddress),

    /// Clients may only subscribe to external channels directly.
    #[error("channel {0} is not external")]
    ChannelNotExternal(ChannelAddress),

    #[error("root id presence does not match channel kind for {0}")]
    RootIdMismatch(ChannelAddress),

    #[error("filter instance id presence does not match filter type for {0}")]
    FilterInstanceMismatch(ChannelAddress),

    #[error("attempted to update static filter on {0}")]
    AttemptedToUpdateStaticFilter(ChannelAddress),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The session lock could not be acquired in time; the session was closed.
    #[error("timed out acquiring lock for session {0}")]
    SessionLockTimeout(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("expanding links failed for session {session}: {message}")]
    LinkExpansionFailed { session: String, message: String },

    /// A data collection or command hook failed.
    #[error("collector error: {0}")]
    Collector(#[from] anyhow::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ServerError {
    /// Whether the error is a client protocol violation that closes the session.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ServerError::UnknownChannel(_)
                | ServerError::ChannelNotExternal(_)
                | ServerError::RootIdMismatch(_)
                | ServerError::FilterInstanceMismatch(_)
                | ServerError::AttemptedToUpdateStaticFilter(_)
                | ServerError::Protocol(_)
        )
    }
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
