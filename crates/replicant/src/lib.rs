//! # Replicant
//!
//! Replication of server-side entity graphs into client-side repositories.
//!
//! ## Overview
//!
//! A server exposes its data as typed *channels* (graphs). Clients
//! subscribe to channels, receive the channel contents and then a stream of
//! ordered change sets keeping their local copy current:
//!
//! - **Channels**: type channels hold every entity of a kind; instance
//!   channels hold the entities reachable from one root entity
//! - **Filters**: per-subscription parameters narrowing what a channel sends
//! - **Links**: entities in one channel may pull further channels in
//! - **Caching**: cacheable channels are answered with `use-cache` when the
//!   client already holds the current contents
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replicant::{settle, LocalLink, DEFAULT_SETTLE_ROUNDS};
//! use replicant::client::{DataLoaderConfig, MemoryCacheService, MemoryEntityRepository, ReplicantClient};
//! use replicant::core::ChannelAddress;
//! use replicant::server::{ReplicantHooks, ReplicantSessionManager, ServerConfig};
//!
//! async fn example<H: ReplicantHooks>(schema: Arc<replicant::core::SchemaMetaData>, hooks: H) {
//!     let manager = ReplicantSessionManager::new(Arc::clone(&schema), hooks, ServerConfig::default());
//!
//!     let mut client = ReplicantClient::new(MemoryEntityRepository::new(), MemoryCacheService::new());
//!     let (link, transport) = LocalLink::new(schema.id);
//!     client.add_data_loader(schema, DataLoaderConfig::default(), Box::new(transport)).unwrap();
//!     client.activate(0).unwrap();
//!
//!     let _meta = client
//!         .area_of_interest_mut()
//!         .subscribe(ChannelAddress::type_channel(1, 0), None);
//!     let mut links = [link];
//!     settle(&mut client, &manager, &mut links, 0, DEFAULT_SETTLE_ROUNDS).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `replicant::core` - Addresses, schema metadata, wire types
//! - `replicant::client` - Client runtime, area of interest, data loading
//! - `replicant::server` - Session manager, hooks, cache, broker

pub mod error;
pub mod link;

// Re-export component crates
pub use replicant_client as client;
pub use replicant_core as core;
pub use replicant_server as server;

pub use error::{ReplicantError, Result};
pub use link::{settle, LocalLink, DEFAULT_SETTLE_ROUNDS};

// Re-export commonly used types
pub use replicant_core::{
    ChangeSet, ChannelAction, ChannelAddress, ChannelMetaData, EntityKey, EntityMessage, Filter,
    FilterType, SchemaMetaData,
};
