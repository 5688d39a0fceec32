//! Error types for Replicant core.

use thiserror::Error;

/// Errors raised while building or querying schema metadata.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("channel at index {index} declares id {id}; channel ids must be dense")]
    NonDenseChannelId { index: usize, id: u32 },

    #[error("channel {channel} requires unknown channel {required}")]
    UnknownRequiredChannel { channel: u32, required: u32 },

    #[error("channel {channel} requires instance channel {required}; required channels must be type channels")]
    RequiredChannelNotTypeChannel { channel: u32, required: u32 },

    #[error("channel {0} requires itself")]
    SelfRequirement(u32),

    #[error("channel {0} is cacheable but filtered; cached channels must be unfiltered")]
    CachedChannelFiltered(u32),

    #[error("unknown channel {channel} in schema {schema}")]
    UnknownChannel { schema: u32, channel: u32 },
}

/// Errors raised while encoding or decoding wire frames and addresses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed channel address: {0}")]
    MalformedAddress(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
