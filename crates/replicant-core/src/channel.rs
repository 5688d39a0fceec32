//! Channel addresses.
//!
//! A channel is either type-wide (no root) or rooted at a single entity
//! instance. Filter-instanced channels additionally carry an instance id so
//! that several differently filtered copies of the same channel can coexist.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Identifies one subscribable channel.
///
/// Immutable. Ordering is by `(schema_id, channel_id, root_id, filter_instance_id)`,
/// which groups addresses of the same channel type together.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    /// The schema (system) that declares the channel.
    pub schema_id: u32,
    /// Dense channel index within the schema.
    pub channel_id: u32,
    /// Root entity id for instance-rooted channels.
    pub root_id: Option<i32>,
    /// Instance id for filter-instanced channels.
    pub filter_instance_id: Option<String>,
}

impl ChannelAddress {
    /// Address of a type-wide channel.
    pub fn type_channel(schema_id: u32, channel_id: u32) -> Self {
        Self {
            schema_id,
            channel_id,
            root_id: None,
            filter_instance_id: None,
        }
    }

    /// Address of an instance-rooted channel.
    pub fn instance_channel(schema_id: u32, channel_id: u32, root_id: i32) -> Self {
        Self {
            schema_id,
            channel_id,
            root_id: Some(root_id),
            filter_instance_id: None,
        }
    }

    /// Attach a filter instance id.
    pub fn with_filter_instance(mut self, filter_instance_id: impl Into<String>) -> Self {
        self.filter_instance_id = Some(filter_instance_id.into());
        self
    }

    /// Whether two addresses refer to the same channel type.
    pub fn same_channel_type(&self, other: &ChannelAddress) -> bool {
        self.schema_id == other.schema_id && self.channel_id == other.channel_id
    }

    /// Key used for caching this channel's payload on the client.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_id, self.channel_id)?;
        if let Some(root_id) = self.root_id {
            write!(f, ".{}", root_id)?;
        }
        if let Some(instance) = &self.filter_instance_id {
            write!(f, "#{}", instance)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelAddress({})", self)
    }
}

impl FromStr for ChannelAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedAddress(s.to_string());

        let (body, filter_instance_id) = match s.split_once('#') {
            Some((body, instance)) if !instance.is_empty() => (body, Some(instance.to_string())),
            Some(_) => return Err(malformed()),
            None => (s, None),
        };

        let mut parts = body.split('.');
        let schema_id = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let channel_id = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let root_id = match parts.next() {
            Some(p) => Some(p.parse::<i32>().map_err(|_| malformed())?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            schema_id,
            channel_id,
            root_id,
            filter_instance_id,
        })
    }
}

impl Serialize for ChannelAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_channel_display() {
        let address = ChannelAddress::type_channel(1, 0);
        assert_eq!(address.to_string(), "1.0");
        assert_eq!(address.root_id, None);
    }

    #[test]
    fn test_instance_channel_parse() {
        let address: ChannelAddress = "3.2.-7".parse().unwrap();
        assert_eq!(address, ChannelAddress::instance_channel(3, 2, -7));
    }

    #[test]
    fn test_filter_instance_parse() {
        let address: ChannelAddress = "1.4.9#east".parse().unwrap();
        assert_eq!(address.filter_instance_id.as_deref(), Some("east"));
        assert_eq!(address.to_string(), "1.4.9#east");
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        for bad in ["", "1", "a.b", "1.2.x", "1.2.3.4", "1.2#"] {
            assert!(bad.parse::<ChannelAddress>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_ordering_groups_channel_types() {
        let mut addresses = vec![
            ChannelAddress::instance_channel(1, 2, 5),
            ChannelAddress::type_channel(1, 1),
            ChannelAddress::instance_channel(1, 2, 1),
        ];
        addresses.sort();
        assert_eq!(addresses[0], ChannelAddress::type_channel(1, 1));
        assert_eq!(addresses[1].root_id, Some(1));
        assert_eq!(addresses[2].root_id, Some(5));
    }

    #[test]
    fn test_serializes_as_string() {
        let address = ChannelAddress::instance_channel(1, 2, 7);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"1.2.7\"");
        let back: ChannelAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
