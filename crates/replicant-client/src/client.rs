//! The client runtime.
//!
//! [`ReplicantClient`] owns the local entity repository, the cache, the
//! subscription registry, the change broker, the area-of-interest arena and
//! one [`DataLoaderService`] per schema. The host drives it by calling
//! [`tick`](ReplicantClient::tick) regularly and forwarding inbound frames
//! with [`on_message`](ReplicantClient::on_message).

use std::sync::Arc;

use tracing::{debug, warn};

use replicant_core::SchemaMetaData;

use crate::area_of_interest::{AreaOfInterestListener, AreaOfInterestService};
use crate::broker::ChangeBroker;
use crate::cache::CacheService;
use crate::converger::{aggregate_state, ContextConverger, DataLoaders};
use crate::error::{ClientError, Result};
use crate::loader::{DataLoaderConfig, DataLoaderService, DataLoaderState, LoadContext, LoaderEvent};
use crate::registry::SubscriptionRegistry;
use crate::repository::EntityRepository;
use crate::transport::ClientTransport;

/// Upper bound on pipeline steps per loader per tick.
pub const MAX_STEPS_PER_TICK: usize = 32;

/// A replication client for one or more schemas.
pub struct ReplicantClient<R: EntityRepository, C: CacheService> {
    repository: R,
    cache: C,
    registry: SubscriptionRegistry,
    broker: ChangeBroker,
    aoi: AreaOfInterestService,
    loaders: DataLoaders,
    converger: ContextConverger,
    /// Whether loaders should be connected.
    active: bool,
}

impl<R: EntityRepository, C: CacheService> ReplicantClient<R, C> {
    pub fn new(repository: R, cache: C) -> Self {
        Self {
            repository,
            cache,
            registry: SubscriptionRegistry::new(),
            broker: ChangeBroker::new(),
            aoi: AreaOfInterestService::new(),
            loaders: DataLoaders::new(),
            converger: ContextConverger::new(),
            active: false,
        }
    }

    pub fn with_area_of_interest_listener(
        mut self,
        listener: impl AreaOfInterestListener + 'static,
    ) -> Self {
        self.aoi = AreaOfInterestService::with_listener(listener);
        self
    }

    /// Register a loader for `schema`.
    pub fn add_data_loader(
        &mut self,
        schema: Arc<SchemaMetaData>,
        config: DataLoaderConfig,
        transport: Box<dyn ClientTransport>,
    ) -> Result<()> {
        self.add_loader(DataLoaderService::new(schema, config, transport))
    }

    /// Register a preconfigured loader.
    pub fn add_loader(&mut self, loader: DataLoaderService) -> Result<()> {
        let schema_id = loader.schema_id();
        if self.loaders.contains_key(&schema_id) {
            return Err(ClientError::IllegalState(format!(
                "data loader for schema {} already registered",
                schema_id
            )));
        }
        self.loaders.insert(schema_id, loader);
        Ok(())
    }

    // ─── Connection ───────────────────────────────────────────────────────

    /// Start connecting every disconnected loader the rate limiter allows.
    pub fn activate(&mut self, now_ms: u64) -> Result<()> {
        self.active = true;
        for loader in self.loaders.values_mut() {
            loader.attempt_connect(now_ms)?;
        }
        Ok(())
    }

    /// Start disconnecting every connected loader the rate limiter allows.
    pub fn deactivate(&mut self, now_ms: u64) -> Result<()> {
        self.active = false;
        for loader in self.loaders.values_mut() {
            loader.attempt_disconnect(now_ms)?;
        }
        Ok(())
    }

    /// Combined state of all loaders.
    pub fn state(&self) -> DataLoaderState {
        aggregate_state(&self.loaders)
    }

    // ─── Driving ──────────────────────────────────────────────────────────

    /// Run one convergence pass.
    pub fn converge(&mut self) {
        self.converger
            .converge_step(&self.aoi, &mut self.loaders, &self.registry);
    }

    /// Do a bounded amount of work. Returns whether work remains.
    ///
    /// Retries connection transitions, converges, sends the next
    /// area-of-interest request of each loader and steps each data-load
    /// pipeline.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        for loader in self.loaders.values_mut() {
            let attempt = if self.active {
                loader.attempt_connect(now_ms)
            } else {
                loader.attempt_disconnect(now_ms)
            };
            if let Err(err) = attempt {
                warn!(schema = loader.schema_id(), error = %err, "Connection transition failed");
            }
        }

        self.converge();

        let (loaders, mut ctx) = self.split();
        for loader in loaders.values_mut() {
            if let Err(err) = loader.progress_area_of_interest_requests(ctx.registry) {
                warn!(schema = loader.schema_id(), error = %err, "Area of interest request failed");
            }
            for _ in 0..MAX_STEPS_PER_TICK {
                if !loader.progress_data_load(&mut ctx) {
                    break;
                }
            }
        }
        !self.is_idle()
    }

    /// Hand an inbound frame to the loader for `schema_id`.
    pub fn on_message(&mut self, schema_id: u32, text: &str) -> Result<()> {
        let (loaders, mut ctx) = self.split();
        let loader = loaders
            .get_mut(&schema_id)
            .ok_or(ClientError::UnknownSchema(schema_id))?;
        loader.on_message(text, &mut ctx)
    }

    /// The connection for `schema_id` is gone.
    pub fn on_disconnected(&mut self, schema_id: u32) -> Result<()> {
        let (loaders, mut ctx) = self.split();
        let loader = loaders
            .get_mut(&schema_id)
            .ok_or(ClientError::UnknownSchema(schema_id))?;
        debug!(schema = schema_id, "Transport disconnected");
        loader.on_disconnected(&mut ctx);
        Ok(())
    }

    /// Converged at least once and nothing is pending on any loader.
    pub fn is_idle(&self) -> bool {
        self.converger.is_idle(&self.loaders)
    }

    /// Events raised by every loader since the last drain.
    pub fn drain_events(&mut self) -> Vec<LoaderEvent> {
        self.loaders
            .values_mut()
            .flat_map(DataLoaderService::drain_events)
            .collect()
    }

    fn split(&mut self) -> (&mut DataLoaders, LoadContext<'_>) {
        (
            &mut self.loaders,
            LoadContext {
                repository: &mut self.repository,
                cache: &mut self.cache,
                registry: &mut self.registry,
                broker: &mut self.broker,
            },
        )
    }

    // ─── Accessors ────────────────────────────────────────────────────────

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn repository_mut(&mut self) -> &mut R {
        &mut self.repository
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn broker_mut(&mut self) -> &mut ChangeBroker {
        &mut self.broker
    }

    pub fn area_of_interest(&self) -> &AreaOfInterestService {
        &self.aoi
    }

    pub fn area_of_interest_mut(&mut self) -> &mut AreaOfInterestService {
        &mut self.aoi
    }

    pub fn loader(&self, schema_id: u32) -> Option<&DataLoaderService> {
        self.loaders.get(&schema_id)
    }

    pub fn loader_mut(&mut self, schema_id: u32) -> Option<&mut DataLoaderService> {
        self.loaders.get_mut(&schema_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheService;
    use crate::repository::MemoryEntityRepository;
    use crate::transport::memory::{MemoryClientTransport, MemoryTransportHandle, TransportEvent};
    use replicant_core::{ChannelAddress, ChannelMetaData, ClientMessage};

    fn client(required: bool) -> (ReplicantClient<MemoryEntityRepository, MemoryCacheService>, MemoryTransportHandle) {
        let schema = SchemaMetaData::new(
            1,
            "test",
            vec![ChannelMetaData::type_channel(0, "meta")],
        )
        .unwrap();
        let (transport, handle) = MemoryClientTransport::new();
        let mut client = ReplicantClient::new(MemoryEntityRepository::new(), MemoryCacheService::new());
        client
            .add_data_loader(
                Arc::new(schema),
                DataLoaderConfig {
                    required,
                    ..DataLoaderConfig::default()
                },
                Box::new(transport),
            )
            .unwrap();
        (client, handle)
    }

    #[test]
    fn test_duplicate_loader_rejected() {
        let (mut client, _handle) = client(true);
        let schema = Arc::new(SchemaMetaData::new(1, "again", vec![]).unwrap());
        let (transport, _h) = MemoryClientTransport::new();
        let result = client.add_data_loader(schema, DataLoaderConfig::default(), Box::new(transport));
        assert!(matches!(result, Err(ClientError::IllegalState(_))));
    }

    #[test]
    fn test_activate_and_subscribe() {
        let (mut client, handle) = client(true);
        assert_eq!(client.state(), DataLoaderState::Disconnected);

        client.activate(0).unwrap();
        assert_eq!(client.state(), DataLoaderState::Connecting);
        assert_eq!(handle.drain(), vec![TransportEvent::Connect]);

        client
            .on_message(1, r#"{"type":"session-created","session_id":"s"}"#)
            .unwrap();
        assert_eq!(client.state(), DataLoaderState::Connected);
        handle.drain();

        let _reference = client
            .area_of_interest_mut()
            .subscribe(ChannelAddress::type_channel(1, 0), None);
        assert!(client.tick(10));

        let frames = handle.drain_frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            ClientMessage::decode(&frames[0]).unwrap(),
            ClientMessage::Sub { .. }
        ));
    }

    #[test]
    fn test_optional_loader_reconnects_slowly() {
        let (mut client, handle) = client(false);
        client.activate(0).unwrap();
        client.on_disconnected(1).unwrap();
        handle.drain();

        // optional loaders regain a token every five seconds
        client.tick(1_000);
        assert!(handle.drain().is_empty());
        client.tick(5_000);
        assert_eq!(handle.drain(), vec![TransportEvent::Connect]);
    }

    #[test]
    fn test_unknown_schema() {
        let (mut client, _handle) = client(true);
        assert!(matches!(
            client.on_message(9, r#"{"type":"ok","req":1}"#),
            Err(ClientError::UnknownSchema(9))
        ));
    }
}
