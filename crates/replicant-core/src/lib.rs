//! # Replicant Core
//!
//! Pure primitives shared by the Replicant client and server: channel
//! addresses, schema metadata, change sets, entity messages and the wire
//! frames exchanged between the two.
//!
//! This crate contains no I/O and no async code.
//!
//! ## Key Types
//!
//! - [`ChannelAddress`] - Identifies a type-wide or instance-rooted channel
//! - [`SchemaMetaData`] - Static description of every channel in a system
//! - [`ChangeSet`] - A sequenced batch of entity changes and channel actions
//! - [`EntityMessage`] - A server-side entity mutation with routing and links
//! - [`ClientMessage`] / [`ServerMessage`] - Wire frames
//! - [`RateLimitedValue`] - Token bucket used to pace connection attempts
//!
//! ## Channel addresses
//!
//! Addresses have a compact string form used on the wire and as cache keys:
//!
//! ```rust
//! use replicant_core::ChannelAddress;
//!
//! let address: ChannelAddress = "1.2.7".parse().unwrap();
//! assert_eq!(address.channel_id, 2);
//! assert_eq!(address.root_id, Some(7));
//! assert_eq!(address.to_string(), "1.2.7");
//! ```

pub mod change;
pub mod channel;
pub mod error;
pub mod message;
pub mod protocol;
pub mod rate_limit;
pub mod schema;

pub use change::{ChangeSet, ChannelAction, ChannelChange, EntityChange, EntityKey};
pub use channel::ChannelAddress;
pub use error::{ProtocolError, SchemaError};
pub use message::{ChannelLink, EntityMessage};
pub use protocol::{ClientMessage, FrameHeader, ServerMessage};
pub use rate_limit::RateLimitedValue;
pub use schema::{CacheType, ChannelKind, ChannelMetaData, FilterType, SchemaMetaData};

/// Opaque filter value attached to a subscription.
///
/// Filters are compared by value; the engine never interprets them.
pub type Filter = serde_json::Value;
