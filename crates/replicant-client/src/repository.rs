//! The local entity store the data-load pipeline writes into.
//!
//! The engine never looks inside entities; it drives an external
//! [`ChangeMapper`] to apply wire diffs and an [`EntityRepository`] to
//! register, link and drop instances. [`MemoryEntityRepository`] is a
//! simple map-backed implementation used by tests and demos.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, bail};
use serde_json::{Map, Value};

use replicant_core::{ChannelAddress, EntityChange, EntityKey, Filter};

/// Applies wire-level diffs to local entities.
pub trait ChangeMapper {
    /// Create or update the entity described by `change`.
    ///
    /// Never called for removals.
    fn apply_change(&mut self, change: &EntityChange) -> anyhow::Result<()>;

    /// Resolve the references of an entity after a batch has been applied.
    fn link(&mut self, key: EntityKey) -> anyhow::Result<()>;
}

/// Registry of local entity instances.
pub trait EntityRepository: ChangeMapper {
    /// Drop an entity. Returns whether it was present.
    fn deregister(&mut self, key: EntityKey) -> bool;

    fn contains(&self, key: EntityKey) -> bool;

    fn entity_count(&self) -> usize;

    /// Whether an entity still belongs in a channel after its filter changed.
    fn entity_matches_filter(
        &self,
        _address: &ChannelAddress,
        _filter: Option<&Filter>,
        _key: EntityKey,
    ) -> bool {
        true
    }

    /// Full consistency check, run after a load when enabled.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Human readable listing for debug output.
    fn dump(&self) -> String {
        format!("{} entities", self.entity_count())
    }
}

type FilterPredicate = Box<dyn Fn(&ChannelAddress, Option<&Filter>, &Map<String, Value>) -> bool>;

#[derive(Debug, Clone, PartialEq)]
struct StoredEntity {
    data: Map<String, Value>,
    linked: bool,
}

/// Map-backed entity repository.
#[derive(Default)]
pub struct MemoryEntityRepository {
    entities: BTreeMap<EntityKey, StoredEntity>,
    link_calls: usize,
    fail_on: Option<EntityKey>,
    filter_predicate: Option<FilterPredicate>,
}

impl MemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide filter membership with `predicate` instead of keeping everything.
    pub fn with_filter_predicate(
        mut self,
        predicate: impl Fn(&ChannelAddress, Option<&Filter>, &Map<String, Value>) -> bool + 'static,
    ) -> Self {
        self.filter_predicate = Some(Box::new(predicate));
        self
    }

    /// Make `apply_change` fail for one entity.
    pub fn fail_on(&mut self, key: EntityKey) {
        self.fail_on = Some(key);
    }

    pub fn get(&self, key: EntityKey) -> Option<&Map<String, Value>> {
        self.entities.get(&key).map(|e| &e.data)
    }

    pub fn is_linked(&self, key: EntityKey) -> bool {
        self.entities.get(&key).is_some_and(|e| e.linked)
    }

    /// Total number of `link` calls made.
    pub fn link_calls(&self) -> usize {
        self.link_calls
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }
}

impl ChangeMapper for MemoryEntityRepository {
    fn apply_change(&mut self, change: &EntityChange) -> anyhow::Result<()> {
        let key = change.key();
        if self.fail_on == Some(key) {
            bail!("unable to map entity {}", key);
        }
        let data = change
            .data
            .as_ref()
            .ok_or_else(|| anyhow!("change for {} carries no data", key))?;

        let entry = self.entities.entry(key).or_insert_with(|| StoredEntity {
            data: Map::new(),
            linked: false,
        });
        for (name, value) in data {
            entry.data.insert(name.clone(), value.clone());
        }
        entry.linked = false;
        Ok(())
    }

    fn link(&mut self, key: EntityKey) -> anyhow::Result<()> {
        let entity = self
            .entities
            .get_mut(&key)
            .ok_or_else(|| anyhow!("cannot link unknown entity {}", key))?;
        entity.linked = true;
        self.link_calls += 1;
        Ok(())
    }
}

impl EntityRepository for MemoryEntityRepository {
    fn deregister(&mut self, key: EntityKey) -> bool {
        self.entities.remove(&key).is_some()
    }

    fn contains(&self, key: EntityKey) -> bool {
        self.entities.contains_key(&key)
    }

    fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn entity_matches_filter(
        &self,
        address: &ChannelAddress,
        filter: Option<&Filter>,
        key: EntityKey,
    ) -> bool {
        match (&self.filter_predicate, self.entities.get(&key)) {
            (Some(predicate), Some(entity)) => predicate(address, filter, &entity.data),
            _ => true,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some((key, _)) = self.entities.iter().find(|(_, e)| !e.linked) {
            bail!("entity {} was updated but never linked", key);
        }
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        for (key, entity) in &self.entities {
            let _ = writeln!(out, "{} {}", key, Value::Object(entity.data.clone()));
        }
        out
    }
}
