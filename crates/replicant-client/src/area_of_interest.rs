//! The client's desired area of interest.
//!
//! Applications express what they want replicated through reference counted
//! [`Scope`]s and [`Subscription`]s stored in an arena owned by
//! [`AreaOfInterestService`]. A scope groups required subscriptions and child
//! scopes; a subscription may in turn require child subscriptions. Holders
//! get one-shot reference tokens. When the last reference to a node is
//! released the node is destroyed and its own references are released in
//! turn.
//!
//! The arena only describes intent. The [`ContextConverger`] compares it
//! against what the server has acknowledged and issues requests.
//!
//! [`ContextConverger`]: crate::converger::ContextConverger

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use replicant_core::{ChannelAddress, Filter};

use crate::error::{ClientError, Result};

/// Stable handle of a scope in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

/// Stable handle of a subscription in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription#{}", self.0)
    }
}

/// A named group of required subscriptions and scopes.
#[derive(Debug, Clone)]
pub struct Scope {
    name: String,
    ref_count: usize,
    required_scopes: BTreeSet<ScopeId>,
    required_subscriptions: BTreeSet<SubscriptionId>,
}

impl Scope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn required_scopes(&self) -> impl Iterator<Item = ScopeId> + '_ {
        self.required_scopes.iter().copied()
    }

    pub fn required_subscriptions(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.required_subscriptions.iter().copied()
    }
}

/// A desired subscription to one channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    address: ChannelAddress,
    filter: Option<Filter>,
    ref_count: usize,
    children: BTreeSet<SubscriptionId>,
    parents: BTreeSet<SubscriptionId>,
}

impl Subscription {
    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Subscriptions this one requires.
    pub fn children(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.children.iter().copied()
    }

    /// Whether another subscription requires this one.
    pub fn is_child(&self) -> bool {
        !self.parents.is_empty()
    }
}

/// One-shot release token for a scope.
///
/// Not `Clone`: each token accounts for exactly one reference.
#[derive(Debug, PartialEq, Eq)]
pub struct ScopeReference {
    scope: ScopeId,
    released: bool,
}

impl ScopeReference {
    /// The referenced scope, unless this reference has been released.
    pub fn scope(&self) -> Result<ScopeId> {
        if self.released {
            Err(ClientError::ReferenceReleased)
        } else {
            Ok(self.scope)
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// One-shot release token for a subscription.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionReference {
    subscription: SubscriptionId,
    released: bool,
}

impl SubscriptionReference {
    pub fn subscription(&self) -> Result<SubscriptionId> {
        if self.released {
            Err(ClientError::ReferenceReleased)
        } else {
            Ok(self.subscription)
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Observer of area-of-interest changes.
#[allow(unused_variables)]
pub trait AreaOfInterestListener {
    fn scope_created(&mut self, name: &str) {}
    fn scope_deleted(&mut self, name: &str) {}
    fn subscription_created(&mut self, address: &ChannelAddress, filter: Option<&Filter>) {}
    fn subscription_updated(&mut self, address: &ChannelAddress, filter: Option<&Filter>) {}
    fn subscription_deleted(&mut self, address: &ChannelAddress) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAreaOfInterestListener;

impl AreaOfInterestListener for NoopAreaOfInterestListener {}

/// Arena of scopes and subscriptions.
pub struct AreaOfInterestService {
    scopes: BTreeMap<ScopeId, Scope>,
    scope_names: BTreeMap<String, ScopeId>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    subscription_index: BTreeMap<ChannelAddress, SubscriptionId>,
    next_scope: u32,
    next_subscription: u32,
    listener: Box<dyn AreaOfInterestListener>,
}

impl Default for AreaOfInterestService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AreaOfInterestService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AreaOfInterestService")
            .field("scopes", &self.scopes.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl AreaOfInterestService {
    pub fn new() -> Self {
        Self::with_listener(NoopAreaOfInterestListener)
    }

    pub fn with_listener(listener: impl AreaOfInterestListener + 'static) -> Self {
        Self {
            scopes: BTreeMap::new(),
            scope_names: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            subscription_index: BTreeMap::new(),
            next_scope: 0,
            next_subscription: 0,
            listener: Box::new(listener),
        }
    }

    // ─── Scopes ───────────────────────────────────────────────────────────

    /// Find or create the scope called `name` and take a reference to it.
    pub fn create_scope(&mut self, name: &str) -> ScopeReference {
        let id = self.find_or_create_scope(name);
        self.reference_scope(id)
    }

    /// Take an additional reference to the scope behind `reference`.
    pub fn create_scope_reference(&mut self, reference: &ScopeReference) -> Result<ScopeReference> {
        let id = self.active_scope(reference)?;
        Ok(self.reference_scope(id))
    }

    /// Make `parent` hold a reference to `child`.
    pub fn require_scope(&mut self, parent: &ScopeReference, child: &ScopeReference) -> Result<()> {
        let parent_id = self.active_scope(parent)?;
        let child_id = self.active_scope(child)?;
        if self.scope_reaches(child_id, parent_id) {
            return Err(ClientError::IllegalState(format!(
                "scope {} already requires scope {}",
                self.scope_name(child_id),
                self.scope_name(parent_id)
            )));
        }
        if !self.scope_node_mut(parent_id)?.required_scopes.insert(child_id) {
            return Err(ClientError::ScopeAlreadyRequired {
                parent: self.scope_name(parent_id),
                child: self.scope_name(child_id),
            });
        }
        if let Some(child) = self.scopes.get_mut(&child_id) {
            child.ref_count += 1;
        }
        Ok(())
    }

    /// Release one reference. Releasing twice is a no-op.
    pub fn release_scope(&mut self, reference: &mut ScopeReference) {
        if reference.released {
            return;
        }
        reference.released = true;
        self.decrement_scopes(vec![reference.scope]);
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    pub fn scope_by_name(&self, name: &str) -> Option<ScopeId> {
        self.scope_names.get(name).copied()
    }

    pub fn is_scope_active(&self, id: ScopeId) -> bool {
        self.scopes.contains_key(&id)
    }

    pub fn scopes(&self) -> impl Iterator<Item = (ScopeId, &Scope)> {
        self.scopes.iter().map(|(id, scope)| (*id, scope))
    }

    fn find_or_create_scope(&mut self, name: &str) -> ScopeId {
        if let Some(id) = self.scope_names.get(name) {
            return *id;
        }
        let id = ScopeId(self.next_scope);
        self.next_scope += 1;
        self.scopes.insert(
            id,
            Scope {
                name: name.to_string(),
                ref_count: 0,
                required_scopes: BTreeSet::new(),
                required_subscriptions: BTreeSet::new(),
            },
        );
        self.scope_names.insert(name.to_string(), id);
        debug!(scope = name, "Scope created");
        self.listener.scope_created(name);
        id
    }

    fn reference_scope(&mut self, id: ScopeId) -> ScopeReference {
        if let Some(scope) = self.scopes.get_mut(&id) {
            scope.ref_count += 1;
        }
        ScopeReference {
            scope: id,
            released: false,
        }
    }

    fn active_scope(&self, reference: &ScopeReference) -> Result<ScopeId> {
        let id = reference.scope()?;
        if self.scopes.contains_key(&id) {
            Ok(id)
        } else {
            Err(ClientError::ScopeInactive(id.to_string()))
        }
    }

    fn scope_node_mut(&mut self, id: ScopeId) -> Result<&mut Scope> {
        self.scopes
            .get_mut(&id)
            .ok_or_else(|| ClientError::ScopeInactive(id.to_string()))
    }

    /// Whether `from` is `target` or requires it, directly or transitively.
    fn scope_reaches(&self, from: ScopeId, target: ScopeId) -> bool {
        let mut pending = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = pending.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                if let Some(scope) = self.scopes.get(&id) {
                    pending.extend(scope.required_scopes.iter().copied());
                }
            }
        }
        false
    }

    fn scope_name(&self, id: ScopeId) -> String {
        self.scopes
            .get(&id)
            .map_or_else(|| id.to_string(), |s| s.name.clone())
    }

    fn decrement_scopes(&mut self, mut pending: Vec<ScopeId>) {
        while let Some(id) = pending.pop() {
            let Some(scope) = self.scopes.get_mut(&id) else {
                continue;
            };
            scope.ref_count = scope.ref_count.saturating_sub(1);
            if scope.ref_count > 0 {
                continue;
            }
            let Some(scope) = self.scopes.remove(&id) else {
                continue;
            };
            self.scope_names.remove(&scope.name);
            debug!(scope = %scope.name, "Scope deleted");
            pending.extend(scope.required_scopes.iter().copied());
            for subscription in scope.required_subscriptions {
                self.decrement_subscription(subscription);
            }
            self.listener.scope_deleted(&scope.name);
        }
    }

    // ─── Subscriptions ────────────────────────────────────────────────────

    /// Find or create a subscription and take a reference to it.
    ///
    /// An existing subscription with a different filter has its filter replaced.
    pub fn subscribe(&mut self, address: ChannelAddress, filter: Option<Filter>) -> SubscriptionReference {
        let id = self.find_or_create_subscription(address, filter);
        self.reference_subscription(id)
    }

    /// Take an additional reference to the subscription behind `reference`.
    pub fn create_subscription_reference(
        &mut self,
        reference: &SubscriptionReference,
    ) -> Result<SubscriptionReference> {
        let id = self.active_subscription(reference.subscription()?)?;
        Ok(self.reference_subscription(id))
    }

    /// Make a scope require a subscription to `address`.
    pub fn require_subscription(
        &mut self,
        scope: &ScopeReference,
        address: ChannelAddress,
        filter: Option<Filter>,
    ) -> Result<SubscriptionId> {
        let scope_id = self.active_scope(scope)?;
        if let Some(existing) = self.subscription_index.get(&address) {
            if self
                .scopes
                .get(&scope_id)
                .is_some_and(|s| s.required_subscriptions.contains(existing))
            {
                return Err(ClientError::SubscriptionAlreadyRequired {
                    parent: self.scope_name(scope_id),
                    child: address,
                });
            }
        }
        let id = self.find_or_create_subscription(address, filter);
        self.scope_node_mut(scope_id)?.required_subscriptions.insert(id);
        if let Some(subscription) = self.subscriptions.get_mut(&id) {
            subscription.ref_count += 1;
        }
        Ok(id)
    }

    /// Drop a scope's requirement on a subscription.
    pub fn scope_release_subscription(&mut self, scope: &ScopeReference, subscription: SubscriptionId) -> Result<bool> {
        let scope_id = self.active_scope(scope)?;
        let removed = self.scope_node_mut(scope_id)?.required_subscriptions.remove(&subscription);
        if removed {
            self.decrement_subscription(subscription);
        }
        Ok(removed)
    }

    /// Make one subscription require another.
    pub fn subscription_require_subscription(
        &mut self,
        parent: SubscriptionId,
        address: ChannelAddress,
        filter: Option<Filter>,
    ) -> Result<SubscriptionId> {
        let parent = self.active_subscription(parent)?;
        if let Some(&existing) = self.subscription_index.get(&address) {
            if self
                .subscriptions
                .get(&parent)
                .is_some_and(|s| s.children.contains(&existing))
            {
                return Err(ClientError::SubscriptionAlreadyRequired {
                    parent: self.subscription_label(parent),
                    child: address,
                });
            }
            if self.subscription_reaches(existing, parent) {
                return Err(ClientError::IllegalState(format!(
                    "subscription {} already requires subscription {}",
                    address,
                    self.subscription_label(parent)
                )));
            }
        }
        let child = self.find_or_create_subscription(address, filter);
        if let Some(node) = self.subscriptions.get_mut(&child) {
            node.ref_count += 1;
            node.parents.insert(parent);
        }
        if let Some(node) = self.subscriptions.get_mut(&parent) {
            node.children.insert(child);
        }
        Ok(child)
    }

    /// Replace the desired filter of a live subscription.
    pub fn update_subscription_filter(&mut self, id: SubscriptionId, filter: Option<Filter>) -> Result<()> {
        let id = self.active_subscription(id)?;
        if let Some(subscription) = self.subscriptions.get_mut(&id) {
            if subscription.filter != filter {
                subscription.filter = filter;
                debug!(channel = %subscription.address, "Subscription filter updated");
                self.listener
                    .subscription_updated(&subscription.address, subscription.filter.as_ref());
            }
        }
        Ok(())
    }

    /// Release one reference. Releasing twice is a no-op.
    pub fn release_subscription(&mut self, reference: &mut SubscriptionReference) {
        if reference.released {
            return;
        }
        reference.released = true;
        self.decrement_subscription(reference.subscription);
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn find_subscription(&self, address: &ChannelAddress) -> Option<SubscriptionId> {
        self.subscription_index.get(address).copied()
    }

    pub fn is_subscription_active(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (SubscriptionId, &Subscription)> {
        self.subscriptions.iter().map(|(id, s)| (*id, s))
    }

    /// Subscriptions not required by another subscription, in creation order.
    pub fn root_subscriptions(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| !s.is_child())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Every desired address, children included.
    pub fn desired_addresses(&self) -> BTreeSet<ChannelAddress> {
        self.subscription_index.keys().cloned().collect()
    }

    fn find_or_create_subscription(&mut self, address: ChannelAddress, filter: Option<Filter>) -> SubscriptionId {
        if let Some(id) = self.subscription_index.get(&address).copied() {
            if let Some(subscription) = self.subscriptions.get_mut(&id) {
                if subscription.filter != filter {
                    subscription.filter = filter;
                    self.listener
                        .subscription_updated(&subscription.address, subscription.filter.as_ref());
                }
            }
            return id;
        }
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        debug!(channel = %address, "Subscription created");
        self.listener.subscription_created(&address, filter.as_ref());
        self.subscription_index.insert(address.clone(), id);
        self.subscriptions.insert(
            id,
            Subscription {
                address,
                filter,
                ref_count: 0,
                children: BTreeSet::new(),
                parents: BTreeSet::new(),
            },
        );
        id
    }

    fn reference_subscription(&mut self, id: SubscriptionId) -> SubscriptionReference {
        if let Some(subscription) = self.subscriptions.get_mut(&id) {
            subscription.ref_count += 1;
        }
        SubscriptionReference {
            subscription: id,
            released: false,
        }
    }

    fn active_subscription(&self, id: SubscriptionId) -> Result<SubscriptionId> {
        if self.subscriptions.contains_key(&id) {
            Ok(id)
        } else {
            Err(ClientError::SubscriptionInactive(id.to_string()))
        }
    }

    /// Whether `from` is `target` or requires it, directly or transitively.
    fn subscription_reaches(&self, from: SubscriptionId, target: SubscriptionId) -> bool {
        let mut pending = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = pending.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                if let Some(subscription) = self.subscriptions.get(&id) {
                    pending.extend(subscription.children.iter().copied());
                }
            }
        }
        false
    }

    fn subscription_label(&self, id: SubscriptionId) -> String {
        self.subscriptions
            .get(&id)
            .map_or_else(|| id.to_string(), |s| s.address.to_string())
    }

    fn decrement_subscription(&mut self, id: SubscriptionId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(subscription) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            subscription.ref_count = subscription.ref_count.saturating_sub(1);
            if subscription.ref_count > 0 {
                continue;
            }
            let Some(subscription) = self.subscriptions.remove(&id) else {
                continue;
            };
            self.subscription_index.remove(&subscription.address);
            for child in &subscription.children {
                if let Some(node) = self.subscriptions.get_mut(child) {
                    node.parents.remove(&id);
                }
                pending.push(*child);
            }
            debug!(channel = %subscription.address, "Subscription deleted");
            self.listener.subscription_deleted(&subscription.address);
        }
    }
}
