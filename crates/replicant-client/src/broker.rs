//! Local change notification broker.
//!
//! Listeners are told when entities change or are removed. While a data
//! loader is applying a change set the broker is either paused (events are
//! queued and delivered on resume) or disabled (events are dropped), so
//! listeners never observe a half-applied batch.
//!
//! Only one loader can hold the broker at a time.

use std::fmt;

use tracing::{debug, trace};

use replicant_core::EntityKey;

/// A notification delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    EntityChanged(EntityKey),
    EntityRemoved(EntityKey),
}

impl ChangeEvent {
    pub fn key(&self) -> EntityKey {
        match self {
            ChangeEvent::EntityChanged(key) | ChangeEvent::EntityRemoved(key) => *key,
        }
    }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&ChangeEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Enabled,
    Paused,
    Disabled,
}

struct Registration {
    id: ListenerId,
    /// `None` listens to every entity.
    entity: Option<EntityKey>,
    listener: Listener,
}

/// Fans out entity change events to listeners.
pub struct ChangeBroker {
    mode: BrokerMode,
    /// Schema id of the loader holding the broker.
    holder: Option<u32>,
    queued: Vec<ChangeEvent>,
    registrations: Vec<Registration>,
    next_id: u64,
}

impl Default for ChangeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBroker")
            .field("mode", &self.mode)
            .field("holder", &self.holder)
            .field("queued", &self.queued.len())
            .field("listeners", &self.registrations.len())
            .finish()
    }
}

impl ChangeBroker {
    pub fn new() -> Self {
        Self {
            mode: BrokerMode::Enabled,
            holder: None,
            queued: Vec::new(),
            registrations: Vec::new(),
            next_id: 0,
        }
    }

    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    pub fn holder(&self) -> Option<u32> {
        self.holder
    }

    /// Whether the broker is paused or disabled by someone other than `owner`.
    pub fn is_held_by_other(&self, owner: u32) -> bool {
        self.holder.is_some_and(|holder| holder != owner)
    }

    /// Listen to every entity.
    pub fn add_listener(&mut self, listener: impl FnMut(&ChangeEvent) + 'static) -> ListenerId {
        self.register(None, Box::new(listener))
    }

    /// Listen to one entity.
    pub fn add_entity_listener(
        &mut self,
        entity: EntityKey,
        listener: impl FnMut(&ChangeEvent) + 'static,
    ) -> ListenerId {
        self.register(Some(entity), Box::new(listener))
    }

    fn register(&mut self, entity: Option<EntityKey>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            entity,
            listener,
        });
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        before != self.registrations.len()
    }

    /// Drop every listener bound to `entity`. Returns how many were removed.
    pub fn remove_entity_listeners(&mut self, entity: EntityKey) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.entity != Some(entity));
        before - self.registrations.len()
    }

    /// Queue events until [`resume`](Self::resume). Fails if held by another loader.
    pub fn pause(&mut self, owner: u32) -> bool {
        self.acquire(owner, BrokerMode::Paused)
    }

    /// Drop events until [`enable`](Self::enable). Fails if held by another loader.
    pub fn disable(&mut self, owner: u32) -> bool {
        self.acquire(owner, BrokerMode::Disabled)
    }

    fn acquire(&mut self, owner: u32, mode: BrokerMode) -> bool {
        if self.is_held_by_other(owner) {
            return false;
        }
        debug!(owner, ?mode, "Broker acquired");
        self.holder = Some(owner);
        self.mode = mode;
        true
    }

    /// Deliver queued events and re-enable. Ignored unless `owner` holds the broker.
    pub fn resume(&mut self, owner: u32) {
        self.release(owner);
    }

    /// Re-enable after [`disable`](Self::disable). Ignored unless `owner` holds the broker.
    pub fn enable(&mut self, owner: u32) {
        self.release(owner);
    }

    fn release(&mut self, owner: u32) {
        if self.holder != Some(owner) {
            return;
        }
        self.holder = None;
        self.mode = BrokerMode::Enabled;
        let queued = std::mem::take(&mut self.queued);
        debug!(owner, delivered = queued.len(), "Broker released");
        for event in queued {
            self.deliver(&event);
        }
    }

    pub fn entity_changed(&mut self, entity: EntityKey) {
        self.raise(ChangeEvent::EntityChanged(entity));
    }

    pub fn entity_removed(&mut self, entity: EntityKey) {
        self.raise(ChangeEvent::EntityRemoved(entity));
    }

    fn raise(&mut self, event: ChangeEvent) {
        match self.mode {
            BrokerMode::Enabled => self.deliver(&event),
            BrokerMode::Paused => self.queued.push(event),
            BrokerMode::Disabled => trace!(?event, "Dropped event while disabled"),
        }
    }

    fn deliver(&mut self, event: &ChangeEvent) {
        let key = event.key();
        for registration in &mut self.registrations {
            if registration.entity.map_or(true, |entity| entity == key) {
                (registration.listener)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(broker: &mut ChangeBroker) -> Rc<RefCell<Vec<ChangeEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        broker.add_listener(move |event| sink.borrow_mut().push(*event));
        seen
    }

    #[test]
    fn test_enabled_delivers_immediately() {
        let mut broker = ChangeBroker::new();
        let seen = recorder(&mut broker);
        broker.entity_changed(EntityKey::new(1, 1));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_paused_queues_until_resume() {
        let mut broker = ChangeBroker::new();
        let seen = recorder(&mut broker);

        assert!(broker.pause(1));
        broker.entity_changed(EntityKey::new(1, 1));
        broker.entity_removed(EntityKey::new(1, 2));
        assert!(seen.borrow().is_empty());

        broker.resume(1);
        assert_eq!(
            *seen.borrow(),
            vec![
                ChangeEvent::EntityChanged(EntityKey::new(1, 1)),
                ChangeEvent::EntityRemoved(EntityKey::new(1, 2)),
            ]
        );
    }

    #[test]
    fn test_disabled_drops() {
        let mut broker = ChangeBroker::new();
        let seen = recorder(&mut broker);
        assert!(broker.disable(1));
        broker.entity_changed(EntityKey::new(1, 1));
        broker.enable(1);
        assert!(seen.borrow().is_empty());
        assert_eq!(broker.mode(), BrokerMode::Enabled);
    }

    #[test]
    fn test_single_holder() {
        let mut broker = ChangeBroker::new();
        assert!(broker.pause(1));
        assert!(broker.is_held_by_other(2));
        assert!(!broker.pause(2));

        // release by a non-holder is ignored
        broker.resume(2);
        assert_eq!(broker.holder(), Some(1));

        broker.resume(1);
        assert!(broker.pause(2));
    }

    #[test]
    fn test_entity_listeners() {
        let mut broker = ChangeBroker::new();
        let hits = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&hits);
        broker.add_entity_listener(EntityKey::new(1, 5), move |_| *sink.borrow_mut() += 1);

        broker.entity_changed(EntityKey::new(1, 4));
        broker.entity_changed(EntityKey::new(1, 5));
        assert_eq!(*hits.borrow(), 1);

        assert_eq!(broker.remove_entity_listeners(EntityKey::new(1, 5)), 1);
        broker.entity_changed(EntityKey::new(1, 5));
        assert_eq!(*hits.borrow(), 1);
    }
}
