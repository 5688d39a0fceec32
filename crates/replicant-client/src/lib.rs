//! # Replicant Client
//!
//! Client side of the Replicant replication protocol.
//!
//! ## Overview
//!
//! The client keeps a local entity repository in step with the server. The
//! host declares what it wants to see through reference-counted scopes and
//! subscriptions; the converger turns that desired graph into subscribe,
//! update and unsubscribe requests; and each schema's data loader applies
//! the change sets the server sends back.
//!
//! Everything here is single threaded and non-blocking. Work is performed
//! in bounded steps from [`ReplicantClient::tick`], which reports whether
//! more work is pending.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replicant_client::{
//!     DataLoaderConfig, MemoryCacheService, MemoryEntityRepository, ReplicantClient,
//! };
//! use replicant_client::transport::memory::MemoryClientTransport;
//! use replicant_core::{ChannelAddress, ChannelMetaData, SchemaMetaData};
//!
//! let schema = SchemaMetaData::new(1, "app", vec![ChannelMetaData::type_channel(0, "meta")]).unwrap();
//! let (transport, _handle) = MemoryClientTransport::new();
//!
//! let mut client = ReplicantClient::new(MemoryEntityRepository::new(), MemoryCacheService::new());
//! client
//!     .add_data_loader(Arc::new(schema), DataLoaderConfig::default(), Box::new(transport))
//!     .unwrap();
//! client.activate(0).unwrap();
//!
//! let _meta = client
//!     .area_of_interest_mut()
//!     .subscribe(ChannelAddress::type_channel(1, 0), None);
//! while client.tick(0) {
//!     // forward frames to the server and feed replies to `on_message`
//!     # break;
//! }
//! ```
//!
//! ## Data-load phases
//!
//! ```text
//! raw ─► parse ─► pause broker ─► channel actions ─► changes ─► links ─► finalize ─► complete
//! ```

pub mod area_of_interest;
pub mod broker;
pub mod cache;
pub mod client;
pub mod converger;
mod data_load;
pub mod error;
pub mod loader;
pub mod registry;
pub mod repository;
pub mod transport;

pub use area_of_interest::{
    AreaOfInterestListener, AreaOfInterestService, NoopAreaOfInterestListener, Scope, ScopeId,
    ScopeReference, Subscription, SubscriptionId, SubscriptionReference,
};
pub use broker::{BrokerMode, ChangeBroker, ChangeEvent, ListenerId};
pub use cache::{CacheEntry, CacheService, MemoryCacheService};
pub use client::{ReplicantClient, MAX_STEPS_PER_TICK};
pub use converger::{aggregate_state, ContextConverger, ConvergeAction, DataLoaders};
pub use data_load::DataLoadStatus;
pub use error::{ClientError, Result};
pub use loader::{
    AreaOfInterestAction, AreaOfInterestRequest, ConnectorRateLimit, DataLoadDebugger,
    DataLoaderConfig, DataLoaderService, DataLoaderState, LoadContext, LoaderEvent,
};
pub use registry::{LocalSubscription, SubscriptionRegistry};
pub use repository::{ChangeMapper, EntityRepository, MemoryEntityRepository};
pub use transport::ClientTransport;
