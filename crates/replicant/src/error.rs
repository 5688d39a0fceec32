//! Error types for the umbrella crate.

use replicant_client::ClientError;
use replicant_server::ServerError;
use thiserror::Error;

/// Errors raised while wiring a client to a server in process.
#[derive(Debug, Error)]
pub enum ReplicantError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Client and server kept exchanging frames past the round limit.
    #[error("not settled after {0} rounds")]
    NotSettled(usize),
}

/// Result type for umbrella operations.
pub type Result<T> = std::result::Result<T, ReplicantError>;
