//! # Replicant Server
//!
//! Server side of the Replicant replication protocol.
//!
//! ## Overview
//!
//! Each connected client owns a session holding its subscriptions. The
//! session manager validates subscribe and unsubscribe requests against the
//! schema, collects channel contents through the application's
//! [`ReplicantHooks`], follows links between channels and routes entity
//! changes to every subscribed session. Outbound frames are delivered by
//! the message broker, one worker per session at a time.
//!
//! ## Key Properties
//!
//! - **Serialized sessions**: operations on one session never interleave
//! - **Ordered delivery**: update frames arrive in sequence order
//! - **Shared caches**: cacheable channels are collected once for all sessions
//! - **Graph-aware unsubscribe**: channels kept alive only by links are reclaimed
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replicant_server::{ReplicantSessionManager, ServerConfig};
//!
//! async fn example<H: replicant_server::ReplicantHooks>(
//!     schema: Arc<replicant_core::SchemaMetaData>,
//!     hooks: H,
//! ) {
//!     let manager = ReplicantSessionManager::new(schema, hooks, ServerConfig::default());
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     tokio::spawn(manager.broker().run(shutdown_rx));
//!
//!     // let (transport, receiver) = replicant_server::memory::channel();
//!     // let session = manager.create_session(Arc::new(transport)).await?;
//!     // manager.handle_message(session.id(), &frame).await?;
//!     let _ = shutdown_tx.send(true);
//! }
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! Client                 Manager                       Broker
//!   |--- sub ----------->| validate                      |
//!   |                    | required channels             |
//!   |                    | collect / cache               |
//!   |                    | expand links                  |
//!   |                    |--- queue update ------------->|
//!   |<---------------------------------- update (seq n) -|
//! ```

pub mod accumulator;
pub mod broker;
pub mod cache;
pub mod config;
mod endpoint;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod session;
pub mod subscription;
pub mod transport;

pub use accumulator::ChangeAccumulator;
pub use broker::ReplicantMessageBroker;
pub use cache::{compute_cache_key, CachedChannel, ChannelCache, ChannelCacheEntry};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use hooks::{BulkCollectedData, CollectedData, ReplicantHooks};
pub use manager::{ReplicantSessionManager, RequestContext, LINK_EXPANSION_FAILED};
pub use session::{ReplicantSession, SessionState};
pub use subscription::SubscriptionEntry;
pub use transport::{memory, SessionTransport};
