//! One session's subscription to one channel.

use std::collections::BTreeSet;

use replicant_core::{ChannelAddress, Filter};

/// A live subscription held by a session.
///
/// Links record which subscriptions were created by following entity links
/// or channel requirements. A subscription that is not explicit and has no
/// inward links is unreachable and may be reclaimed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEntry {
    address: ChannelAddress,
    filter: Option<Filter>,
    explicitly_subscribed: bool,
    /// Subscriptions this one caused.
    outward_links: BTreeSet<ChannelAddress>,
    /// Subscriptions that caused this one.
    inward_links: BTreeSet<ChannelAddress>,
}

impl SubscriptionEntry {
    pub fn new(address: ChannelAddress, filter: Option<Filter>, explicitly_subscribed: bool) -> Self {
        Self {
            address,
            filter,
            explicitly_subscribed,
            outward_links: BTreeSet::new(),
            inward_links: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn set_filter(&mut self, filter: Option<Filter>) {
        self.filter = filter;
    }

    pub fn is_explicitly_subscribed(&self) -> bool {
        self.explicitly_subscribed
    }

    pub fn set_explicitly_subscribed(&mut self, explicit: bool) {
        self.explicitly_subscribed = explicit;
    }

    pub fn outward_links(&self) -> &BTreeSet<ChannelAddress> {
        &self.outward_links
    }

    pub fn inward_links(&self) -> &BTreeSet<ChannelAddress> {
        &self.inward_links
    }

    pub fn register_outward_link(&mut self, target: ChannelAddress) -> bool {
        self.outward_links.insert(target)
    }

    pub fn deregister_outward_link(&mut self, target: &ChannelAddress) -> bool {
        self.outward_links.remove(target)
    }

    pub fn register_inward_link(&mut self, source: ChannelAddress) -> bool {
        self.inward_links.insert(source)
    }

    pub fn deregister_inward_link(&mut self, source: &ChannelAddress) -> bool {
        self.inward_links.remove(source)
    }

    pub fn can_unsubscribe(&self) -> bool {
        !self.explicitly_subscribed && self.inward_links.is_empty()
    }
}
