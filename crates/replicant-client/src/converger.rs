//! Convergence of the desired area of interest with remote state.
//!
//! Each pass walks the root subscriptions of the [`AreaOfInterestService`]
//! and compares them with what the server has acknowledged (the
//! [`SubscriptionRegistry`]) and what is already queued on the data loaders.
//! The first subscription needing work becomes the grouping template:
//! later siblings needing the same kind of request for the same channel
//! type are submitted too, so the loader can send them as one bulk request.
//! Anything else waits for a later pass.
//!
//! A pass that finds nothing to submit reclaims orphans: explicit remote
//! subscriptions nothing in the area of interest wants any more.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use replicant_core::{ChannelAddress, Filter};

use crate::area_of_interest::{AreaOfInterestService, SubscriptionId};
use crate::loader::{AreaOfInterestAction, DataLoaderService, DataLoaderState};
use crate::registry::SubscriptionRegistry;

/// Data loaders keyed by schema id.
pub type DataLoaders = BTreeMap<u32, DataLoaderService>;

/// Outcome of converging one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConvergeAction {
    /// Nothing to do.
    NoAction,
    SubmittedAdd,
    SubmittedUpdate,
    /// A request for this subscription is pending; wait.
    InProgress,
    /// Work is needed but cannot join the current group; stop this pass.
    Terminate,
}

/// The first request submitted in a pass, which later requests must match.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTemplate {
    pub address: ChannelAddress,
    pub action: AreaOfInterestAction,
    pub filter: Option<Filter>,
}

impl GroupTemplate {
    fn accepts(
        &self,
        address: &ChannelAddress,
        action: AreaOfInterestAction,
        filter: Option<&Filter>,
        bulk_load: bool,
    ) -> bool {
        bulk_load
            && self.action == action
            && self.address.same_channel_type(address)
            && (action == AreaOfInterestAction::Remove || self.filter.as_ref() == filter)
    }
}

/// Drives remote subscriptions towards the desired area of interest.
#[derive(Debug, Default, Clone)]
pub struct ContextConverger {
    pass_completed: bool,
}

impl ContextConverger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one convergence pass.
    pub fn converge_step(
        &mut self,
        aoi: &AreaOfInterestService,
        loaders: &mut DataLoaders,
        registry: &SubscriptionRegistry,
    ) {
        let mut template = None;
        for id in aoi.root_subscriptions() {
            match self.converge_subscription(aoi, loaders, registry, id, &mut template, true) {
                ConvergeAction::Terminate => return,
                ConvergeAction::InProgress if template.is_none() => return,
                _ => {}
            }
        }
        if template.is_none() {
            self.remove_orphan_subscriptions(&aoi.desired_addresses(), loaders, registry);
        }
        self.pass_completed = true;
    }

    /// Converge one subscription and, once it is satisfied, its children.
    ///
    /// `template` is set by the first submission of a pass. With `can_group`
    /// false a subscription never joins an existing template.
    pub fn converge_subscription(
        &self,
        aoi: &AreaOfInterestService,
        loaders: &mut DataLoaders,
        registry: &SubscriptionRegistry,
        id: SubscriptionId,
        template: &mut Option<GroupTemplate>,
        can_group: bool,
    ) -> ConvergeAction {
        let Some(subscription) = aoi.subscription(id) else {
            return ConvergeAction::NoAction;
        };
        let address = subscription.address();
        let filter = subscription.filter();
        let Some(loader) = loaders.get_mut(&address.schema_id) else {
            return ConvergeAction::NoAction;
        };
        if loader.state() != DataLoaderState::Connected {
            return ConvergeAction::NoAction;
        }
        let bulk_load = loader
            .schema()
            .channel(address.channel_id)
            .is_some_and(|c| c.bulk_load);

        let remote = registry.get(address);
        let add_index = loader.last_index_of_pending_request(AreaOfInterestAction::Add, address, filter);
        let remove_index = loader.last_index_of_pending_request(AreaOfInterestAction::Remove, address, None);
        let update_index =
            loader.last_index_of_pending_request(AreaOfInterestAction::Update, address, filter);

        let Some(remote) = remote else {
            if add_index.is_some() {
                return ConvergeAction::InProgress;
            }
            if !Self::join(template, can_group, address, AreaOfInterestAction::Add, filter, bulk_load) {
                return ConvergeAction::Terminate;
            }
            debug!(channel = %address, "Converger submitting add");
            loader.request_subscribe(address.clone(), filter.cloned());
            return ConvergeAction::SubmittedAdd;
        };

        if remove_index.is_some() || update_index.is_some() {
            return ConvergeAction::InProgress;
        }

        if remote.filter.as_ref() != filter {
            if !Self::join(template, can_group, address, AreaOfInterestAction::Update, filter, bulk_load) {
                return ConvergeAction::Terminate;
            }
            debug!(channel = %address, "Converger submitting filter update");
            loader.request_subscription_update(address.clone(), filter.cloned());
            return ConvergeAction::SubmittedUpdate;
        }

        for child in subscription.children() {
            match self.converge_subscription(aoi, loaders, registry, child, template, false) {
                ConvergeAction::NoAction => {}
                other => return other,
            }
        }
        ConvergeAction::NoAction
    }

    /// Whether a new request may be submitted in this pass, recording it as
    /// the template if it is the first.
    fn join(
        template: &mut Option<GroupTemplate>,
        can_group: bool,
        address: &ChannelAddress,
        action: AreaOfInterestAction,
        filter: Option<&Filter>,
        bulk_load: bool,
    ) -> bool {
        match template {
            None => {
                *template = Some(GroupTemplate {
                    address: address.clone(),
                    action,
                    filter: filter.cloned(),
                });
                true
            }
            Some(existing) => can_group && existing.accepts(address, action, filter, bulk_load),
        }
    }

    /// Unsubscribe explicit remote subscriptions that are no longer desired.
    pub fn remove_orphan_subscriptions(
        &self,
        expected: &BTreeSet<ChannelAddress>,
        loaders: &mut DataLoaders,
        registry: &SubscriptionRegistry,
    ) {
        for loader in loaders.values_mut() {
            if loader.state() != DataLoaderState::Connected {
                continue;
            }
            let orphans: Vec<ChannelAddress> = registry
                .subscriptions_for_schema(loader.schema_id())
                .filter(|s| s.explicit && !expected.contains(&s.address))
                .filter(|s| !loader.has_pending_request_for(&s.address))
                .map(|s| s.address.clone())
                .collect();
            for address in orphans {
                info!(channel = %address, "Removing orphan subscription");
                loader.request_unsubscribe(address);
            }
        }
    }

    /// At least one pass has completed and every loader is idle.
    pub fn is_idle(&self, loaders: &DataLoaders) -> bool {
        self.pass_completed && loaders.values().all(DataLoaderService::is_idle)
    }
}

/// Combined connection state of all loaders.
///
/// Any error wins, then any transition in progress. The system is connected
/// only when every loader is.
pub fn aggregate_state(loaders: &DataLoaders) -> DataLoaderState {
    let states: Vec<DataLoaderState> = loaders.values().map(DataLoaderService::state).collect();
    if states.contains(&DataLoaderState::Error) {
        DataLoaderState::Error
    } else if states.contains(&DataLoaderState::Connecting) {
        DataLoaderState::Connecting
    } else if states.contains(&DataLoaderState::Disconnecting) {
        DataLoaderState::Disconnecting
    } else if !states.is_empty() && states.iter().all(|s| *s == DataLoaderState::Connected) {
        DataLoaderState::Connected
    } else {
        DataLoaderState::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DataLoaderConfig;
    use crate::transport::memory::{MemoryClientTransport, MemoryTransportHandle};
    use replicant_core::{ChannelMetaData, FilterType, SchemaMetaData};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        aoi: AreaOfInterestService,
        loaders: DataLoaders,
        registry: SubscriptionRegistry,
        converger: ContextConverger,
        _handle: MemoryTransportHandle,
    }

    fn schema() -> SchemaMetaData {
        SchemaMetaData::new(
            1,
            "test",
            vec![
                ChannelMetaData::type_channel(0, "meta"),
                ChannelMetaData::instance_channel(1, "project", 1).bulk_load(),
                ChannelMetaData::type_channel(2, "search").filter(FilterType::Dynamic),
                ChannelMetaData::instance_channel(3, "detail", 2),
            ],
        )
        .unwrap()
    }

    impl Fixture {
        fn connected() -> Self {
            let (transport, handle) = MemoryClientTransport::new();
            let mut loader = DataLoaderService::new(
                Arc::new(schema()),
                DataLoaderConfig::default(),
                Box::new(transport),
            );
            loader.connect().unwrap();
            let mut registry = SubscriptionRegistry::new();
            let mut repository = crate::repository::MemoryEntityRepository::new();
            let mut cache = crate::cache::MemoryCacheService::new();
            let mut broker = crate::broker::ChangeBroker::new();
            let mut ctx = crate::loader::LoadContext {
                repository: &mut repository,
                cache: &mut cache,
                registry: &mut registry,
                broker: &mut broker,
            };
            loader
                .on_message(r#"{"type":"session-created","session_id":"s"}"#, &mut ctx)
                .unwrap();
            let mut loaders = DataLoaders::new();
            loaders.insert(1, loader);
            Self {
                aoi: AreaOfInterestService::new(),
                loaders,
                registry,
                converger: ContextConverger::new(),
                _handle: handle,
            }
        }

        fn converge(&mut self, id: SubscriptionId) -> ConvergeAction {
            let mut template = None;
            self.converger.converge_subscription(
                &self.aoi,
                &mut self.loaders,
                &self.registry,
                id,
                &mut template,
                true,
            )
        }

        fn step(&mut self) {
            self.converger
                .converge_step(&self.aoi, &mut self.loaders, &self.registry);
        }

        fn loader(&self) -> &DataLoaderService {
            &self.loaders[&1]
        }

        fn requests(&self) -> Vec<(AreaOfInterestAction, ChannelAddress)> {
            self.loader()
                .area_of_interest_requests()
                .map(|r| (r.action, r.address.clone()))
                .collect()
        }
    }

    #[test]
    fn test_converge_is_idempotent_while_in_flight() {
        let mut f = Fixture::connected();
        let address = ChannelAddress::type_channel(1, 0);
        let reference = f.aoi.subscribe(address.clone(), None);
        let id = reference.subscription().unwrap();

        assert_eq!(f.converge(id), ConvergeAction::SubmittedAdd);
        for _ in 0..5 {
            assert_eq!(f.converge(id), ConvergeAction::InProgress);
        }
        assert_eq!(f.requests().len(), 1);

        // the server acknowledges
        f.registry.record_subscription(address.clone(), None, true);
        f.loaders
            .get_mut(&1)
            .unwrap()
            .progress_area_of_interest_requests(&f.registry)
            .unwrap();
        assert!(f.requests().is_empty());
        for _ in 0..5 {
            assert_eq!(f.converge(id), ConvergeAction::NoAction);
        }
    }

    #[test]
    fn test_inactive_subscription_is_no_action() {
        let mut f = Fixture::connected();
        let mut reference = f.aoi.subscribe(ChannelAddress::type_channel(1, 0), None);
        let id = reference.subscription().unwrap();
        f.aoi.release_subscription(&mut reference);
        assert_eq!(f.converge(id), ConvergeAction::NoAction);
        assert!(f.requests().is_empty());
    }

    #[test]
    fn test_filter_mismatch_submits_update() {
        let mut f = Fixture::connected();
        let address = ChannelAddress::type_channel(1, 2);
        f.registry.record_subscription(address.clone(), Some(json!("a")), true);
        let reference = f.aoi.subscribe(address.clone(), Some(json!("b")));
        let id = reference.subscription().unwrap();

        assert_eq!(f.converge(id), ConvergeAction::SubmittedUpdate);
        assert_eq!(f.converge(id), ConvergeAction::InProgress);
        assert_eq!(f.requests(), vec![(AreaOfInterestAction::Update, address)]);
    }

    #[test]
    fn test_subscribed_with_remove_pending_waits() {
        let mut f = Fixture::connected();
        let address = ChannelAddress::type_channel(1, 0);
        f.registry.record_subscription(address.clone(), None, true);
        f.loaders.get_mut(&1).unwrap().request_unsubscribe(address.clone());
        let reference = f.aoi.subscribe(address, None);
        assert_eq!(
            f.converge(reference.subscription().unwrap()),
            ConvergeAction::InProgress
        );
    }

    #[test]
    fn test_siblings_grouped_into_one_pass() {
        let mut f = Fixture::connected();
        let _refs: Vec<_> = [1, 2, 3]
            .into_iter()
            .map(|root| f.aoi.subscribe(ChannelAddress::instance_channel(1, 1, root), None))
            .collect();
        let _other = f.aoi.subscribe(ChannelAddress::type_channel(1, 0), None);

        f.step();
        // the type channel cannot join the instance group
        assert_eq!(f.requests().len(), 3);
        assert!(f
            .requests()
            .iter()
            .all(|(action, address)| *action == AreaOfInterestAction::Add && address.channel_id == 1));
    }

    #[test]
    fn test_non_bulk_channel_is_not_grouped() {
        let mut f = Fixture::connected();
        let _a = f.aoi.subscribe(ChannelAddress::instance_channel(1, 3, 1), None);
        let _b = f.aoi.subscribe(ChannelAddress::instance_channel(1, 3, 2), None);
        f.step();
        assert_eq!(f.requests().len(), 1);
    }

    #[test]
    fn test_children_converge_after_parent_and_never_group() {
        let mut f = Fixture::connected();
        let parent_address = ChannelAddress::instance_channel(1, 1, 1);
        let child_address = ChannelAddress::instance_channel(1, 1, 2);
        let parent = f.aoi.subscribe(parent_address.clone(), None);
        let parent_id = parent.subscription().unwrap();
        f.aoi
            .subscription_require_subscription(parent_id, child_address.clone(), None)
            .unwrap();

        f.step();
        assert_eq!(f.requests(), vec![(AreaOfInterestAction::Add, parent_address.clone())]);

        f.registry.record_subscription(parent_address, None, true);
        f.loaders
            .get_mut(&1)
            .unwrap()
            .progress_area_of_interest_requests(&f.registry)
            .unwrap();

        f.step();
        assert_eq!(f.requests(), vec![(AreaOfInterestAction::Add, child_address)]);
    }

    #[test]
    fn test_child_terminates_when_group_exists() {
        let mut f = Fixture::connected();
        let parent_address = ChannelAddress::instance_channel(1, 1, 1);
        f.registry.record_subscription(parent_address.clone(), None, true);
        let parent = f.aoi.subscribe(parent_address, None);
        let child_id = f
            .aoi
            .subscription_require_subscription(
                parent.subscription().unwrap(),
                ChannelAddress::instance_channel(1, 1, 9),
                None,
            )
            .unwrap();

        let mut template = Some(GroupTemplate {
            address: ChannelAddress::instance_channel(1, 1, 5),
            action: AreaOfInterestAction::Add,
            filter: None,
        });
        let action = f.converger.converge_subscription(
            &f.aoi,
            &mut f.loaders,
            &f.registry,
            parent.subscription().unwrap(),
            &mut template,
            true,
        );
        assert_eq!(action, ConvergeAction::Terminate);
        assert!(f.aoi.is_subscription_active(child_id));
        assert!(f.requests().is_empty());
    }

    #[test]
    fn test_orphans_removed_only_when_explicit() {
        let mut f = Fixture::connected();
        let explicit = ChannelAddress::instance_channel(1, 1, 4);
        let implicit = ChannelAddress::type_channel(1, 0);
        f.registry.record_subscription(explicit.clone(), None, true);
        f.registry.record_subscription(implicit, None, false);

        f.step();
        assert_eq!(f.requests(), vec![(AreaOfInterestAction::Remove, explicit)]);

        // no duplicate while the remove is pending
        f.step();
        assert_eq!(f.requests().len(), 1);
    }

    #[test]
    fn test_disconnected_loader_is_ignored() {
        let mut f = Fixture::connected();
        let mut loaders = DataLoaders::new();
        let (transport, _handle) = MemoryClientTransport::new();
        loaders.insert(
            1,
            DataLoaderService::new(Arc::new(schema()), DataLoaderConfig::default(), Box::new(transport)),
        );
        let reference = f.aoi.subscribe(ChannelAddress::type_channel(1, 0), None);
        let mut template = None;
        let action = f.converger.converge_subscription(
            &f.aoi,
            &mut loaders,
            &f.registry,
            reference.subscription().unwrap(),
            &mut template,
            true,
        );
        assert_eq!(action, ConvergeAction::NoAction);
    }

    #[test]
    fn test_idle_requires_completed_pass() {
        let mut f = Fixture::connected();
        assert!(!f.converger.is_idle(&f.loaders));
        f.step();
        assert!(f.converger.is_idle(&f.loaders));

        let _r = f.aoi.subscribe(ChannelAddress::type_channel(1, 0), None);
        f.step();
        assert!(!f.converger.is_idle(&f.loaders));
    }

    #[test]
    fn test_aggregate_state() {
        let mut loaders = DataLoaders::new();
        assert_eq!(aggregate_state(&loaders), DataLoaderState::Disconnected);

        let (transport, _h1) = MemoryClientTransport::new();
        let mut first =
            DataLoaderService::new(Arc::new(schema()), DataLoaderConfig::default(), Box::new(transport));
        first.connect().unwrap();
        loaders.insert(1, first);
        assert_eq!(aggregate_state(&loaders), DataLoaderState::Connecting);

        let (transport, _h2) = MemoryClientTransport::new();
        loaders.insert(
            2,
            DataLoaderService::new(Arc::new(schema()), DataLoaderConfig::default(), Box::new(transport)),
        );
        assert_eq!(aggregate_state(&loaders), DataLoaderState::Connecting);
    }
}
