//! Error types for the client.

use thiserror::Error;

use replicant_core::{ChannelAddress, ProtocolError, SchemaError};

/// Errors that can occur on the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A scope or subscription reference was used after release.
    #[error("reference has been released")]
    ReferenceReleased,

    #[error("scope {0} is inactive")]
    ScopeInactive(String),

    #[error("subscription {0} is inactive")]
    SubscriptionInactive(String),

    #[error("scope {child} is already required by scope {parent}")]
    ScopeAlreadyRequired { parent: String, child: String },

    #[error("subscription {child} is already required by {parent}")]
    SubscriptionAlreadyRequired { parent: String, child: ChannelAddress },

    /// A change set or frame could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The change mapper or repository failed.
    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("channel {0} is not declared by its schema")]
    UnknownChannel(ChannelAddress),

    #[error("no data loader registered for schema {0}")]
    UnknownSchema(u32),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
