//! Static schema metadata.
//!
//! A schema lists every channel a system exposes. Channel ids are dense, so
//! the id doubles as an index into the schema's channel table.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelAddress;
use crate::error::SchemaError;

/// Whether a channel spans a whole type or is rooted at one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Type-wide channel; addresses carry no root id.
    Type,
    /// Channel rooted at an instance of `root_entity_type`.
    Instance {
        /// Entity type of the root.
        root_entity_type: u32,
    },
}

/// How a channel's contents are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    /// Unfiltered.
    None,
    /// Filtered by the server without client parameters.
    Internal,
    /// Client-supplied filter, fixed for the life of the subscription.
    Static,
    /// As `Static`, with a filter instance id in the address.
    StaticInstanced,
    /// Client-supplied filter that may be updated in place.
    Dynamic,
    /// As `Dynamic`, with a filter instance id in the address.
    DynamicInstanced,
}

impl FilterType {
    /// Whether subscriptions carry a client supplied filter parameter.
    pub fn has_filter_parameter(self) -> bool {
        !matches!(self, FilterType::None | FilterType::Internal)
    }

    /// Whether addresses must carry a filter instance id.
    pub fn requires_instance_id(self) -> bool {
        matches!(self, FilterType::StaticInstanced | FilterType::DynamicInstanced)
    }

    /// Whether the filter may be changed on a live subscription.
    pub fn is_dynamic(self) -> bool {
        matches!(self, FilterType::Dynamic | FilterType::DynamicInstanced)
    }

    /// Whether the filter is fixed once subscribed.
    pub fn is_static(self) -> bool {
        matches!(self, FilterType::Static | FilterType::StaticInstanced)
    }
}

/// Whether the server caches a channel's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheType {
    None,
    Internal,
}

/// Per-channel schema entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetaData {
    pub id: u32,
    pub name: String,
    pub kind: ChannelKind,
    pub filter_type: FilterType,
    pub cache_type: CacheType,
    /// Whether clients may subscribe directly.
    pub external: bool,
    /// Type channels that must be subscribed before this one.
    pub required_type_channels: Vec<u32>,
    /// Whether several instances can be collected in one pass.
    pub bulk_load: bool,
}

impl ChannelMetaData {
    /// A type-wide, unfiltered, uncached, external channel.
    pub fn type_channel(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ChannelKind::Type,
            filter_type: FilterType::None,
            cache_type: CacheType::None,
            external: true,
            required_type_channels: Vec::new(),
            bulk_load: false,
        }
    }

    /// An instance-rooted, unfiltered, uncached, external channel.
    pub fn instance_channel(id: u32, name: impl Into<String>, root_entity_type: u32) -> Self {
        Self {
            kind: ChannelKind::Instance { root_entity_type },
            ..Self::type_channel(id, name)
        }
    }

    pub fn filter(mut self, filter_type: FilterType) -> Self {
        self.filter_type = filter_type;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache_type = CacheType::Internal;
        self
    }

    pub fn internal(mut self) -> Self {
        self.external = false;
        self
    }

    pub fn requires(mut self, channel_id: u32) -> Self {
        self.required_type_channels.push(channel_id);
        self
    }

    pub fn bulk_load(mut self) -> Self {
        self.bulk_load = true;
        self
    }

    /// Whether addresses of this channel carry a root id.
    pub fn is_instance_rooted(&self) -> bool {
        matches!(self.kind, ChannelKind::Instance { .. })
    }

    /// Root entity type for instance-rooted channels.
    pub fn root_entity_type(&self) -> Option<u32> {
        match self.kind {
            ChannelKind::Type => None,
            ChannelKind::Instance { root_entity_type } => Some(root_entity_type),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache_type == CacheType::Internal
    }
}

/// The complete channel table for one system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetaData {
    pub id: u32,
    pub name: String,
    channels: Vec<ChannelMetaData>,
}

impl SchemaMetaData {
    /// Build and validate a schema.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        channels: Vec<ChannelMetaData>,
    ) -> Result<Self, SchemaError> {
        for (index, channel) in channels.iter().enumerate() {
            if channel.id as usize != index {
                return Err(SchemaError::NonDenseChannelId {
                    index,
                    id: channel.id,
                });
            }
        }

        for channel in &channels {
            for &required in &channel.required_type_channels {
                if required == channel.id {
                    return Err(SchemaError::SelfRequirement(channel.id));
                }
                let target = channels.get(required as usize).ok_or(
                    SchemaError::UnknownRequiredChannel {
                        channel: channel.id,
                        required,
                    },
                )?;
                if target.is_instance_rooted() {
                    return Err(SchemaError::RequiredChannelNotTypeChannel {
                        channel: channel.id,
                        required,
                    });
                }
            }
            if channel.is_cacheable() && channel.filter_type.has_filter_parameter() {
                return Err(SchemaError::CachedChannelFiltered(channel.id));
            }
        }

        Ok(Self {
            id,
            name: name.into(),
            channels,
        })
    }

    pub fn channels(&self) -> &[ChannelMetaData] {
        &self.channels
    }

    pub fn channel(&self, channel_id: u32) -> Option<&ChannelMetaData> {
        self.channels.get(channel_id as usize)
    }

    /// Look up the channel an address refers to.
    pub fn channel_for(&self, address: &ChannelAddress) -> Result<&ChannelMetaData, SchemaError> {
        if address.schema_id != self.id {
            return Err(SchemaError::UnknownChannel {
                schema: address.schema_id,
                channel: address.channel_id,
            });
        }
        self.channel(address.channel_id)
            .ok_or(SchemaError::UnknownChannel {
                schema: self.id,
                channel: address.channel_id,
            })
    }

    /// All channels that must be subscribed before `channel_id`, dependencies first.
    ///
    /// The channel itself is not included.
    pub fn required_channel_closure(&self, channel_id: u32) -> Vec<u32> {
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(channel_id);
        if let Some(channel) = self.channel(channel_id) {
            for &required in &channel.required_type_channels {
                self.visit_required(required, &mut visited, &mut ordered);
            }
        }
        ordered
    }

    fn visit_required(&self, channel_id: u32, visited: &mut HashSet<u32>, ordered: &mut Vec<u32>) {
        if !visited.insert(channel_id) {
            return;
        }
        if let Some(channel) = self.channel(channel_id) {
            for &required in &channel.required_type_channels {
                self.visit_required(required, visited, ordered);
            }
        }
        ordered.push(channel_id);
    }

    /// Cacheable type channels that transitively require `channel_id`.
    pub fn cache_dependents(&self, channel_id: u32) -> Vec<u32> {
        self.channels
            .iter()
            .filter(|c| c.id != channel_id && c.is_cacheable() && !c.is_instance_rooted())
            .filter(|c| self.required_channel_closure(c.id).contains(&channel_id))
            .map(|c| c.id)
            .collect()
    }

    /// Instance channels whose root is an entity of `entity_type`.
    pub fn channels_rooted_at(&self, entity_type: u32) -> impl Iterator<Item = &ChannelMetaData> {
        self.channels
            .iter()
            .filter(move |c| c.root_entity_type() == Some(entity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaMetaData {
        SchemaMetaData::new(
            1,
            "Test",
            vec![
                ChannelMetaData::type_channel(0, "MetaData").cached(),
                ChannelMetaData::type_channel(1, "Lookups").cached().requires(0),
                ChannelMetaData::instance_channel(2, "Project", 10).requires(1),
                ChannelMetaData::instance_channel(3, "Task", 11)
                    .filter(FilterType::Dynamic)
                    .bulk_load(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_required_closure_orders_dependencies_first() {
        assert_eq!(schema().required_channel_closure(2), vec![0, 1]);
        assert!(schema().required_channel_closure(0).is_empty());
    }

    #[test]
    fn test_cache_dependents() {
        assert_eq!(schema().cache_dependents(0), vec![1]);
        assert!(schema().cache_dependents(1).is_empty());
    }

    #[test]
    fn test_channels_rooted_at() {
        let schema = schema();
        let rooted: Vec<u32> = schema.channels_rooted_at(11).map(|c| c.id).collect();
        assert_eq!(rooted, vec![3]);
    }

    #[test]
    fn test_rejects_non_dense_ids() {
        let err = SchemaMetaData::new(1, "Bad", vec![ChannelMetaData::type_channel(1, "A")]);
        assert_eq!(err, Err(SchemaError::NonDenseChannelId { index: 0, id: 1 }));
    }

    #[test]
    fn test_rejects_instance_requirement() {
        let err = SchemaMetaData::new(
            1,
            "Bad",
            vec![
                ChannelMetaData::instance_channel(0, "A", 1),
                ChannelMetaData::type_channel(1, "B").requires(0),
            ],
        );
        assert_eq!(
            err,
            Err(SchemaError::RequiredChannelNotTypeChannel {
                channel: 1,
                required: 0
            })
        );
    }

    #[test]
    fn test_rejects_filtered_cached_channel() {
        let err = SchemaMetaData::new(
            1,
            "Bad",
            vec![ChannelMetaData::type_channel(0, "A")
                .cached()
                .filter(FilterType::Static)],
        );
        assert_eq!(err, Err(SchemaError::CachedChannelFiltered(0)));
    }

    #[test]
    fn test_channel_for_wrong_schema() {
        let address = ChannelAddress::type_channel(9, 0);
        assert!(schema().channel_for(&address).is_err());
    }
}
