//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use replicant_core::{ChangeSet, ChannelAction, ChannelAddress, ChannelChange, EntityChange, Filter};

use crate::fixtures::SCHEMA_ID;

/// Generate a channel address in the reference schema.
pub fn channel_address() -> impl Strategy<Value = ChannelAddress> {
    (0u32..7, proptest::option::of(1i32..50), proptest::option::of("[a-z]{1,4}")).prop_map(
        |(channel_id, root_id, instance)| ChannelAddress {
            schema_id: SCHEMA_ID,
            channel_id,
            root_id,
            filter_instance_id: instance,
        },
    )
}

/// Generate a channel action.
pub fn channel_action() -> impl Strategy<Value = ChannelAction> {
    prop_oneof![
        Just(ChannelAction::Add),
        Just(ChannelAction::Remove),
        Just(ChannelAction::Update),
        Just(ChannelAction::Delete),
    ]
}

/// Generate a `{"prefix": ...}` filter.
pub fn filter() -> impl Strategy<Value = Filter> {
    "[a-z]{0,3}".prop_map(|prefix| json!({ "prefix": prefix }))
}

/// Generate entity attributes.
pub fn attributes() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..4).prop_map(|values| {
        values
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect()
    })
}

/// Generate an entity change; `None` data makes it a removal.
pub fn entity_change() -> impl Strategy<Value = EntityChange> {
    (
        1u32..4,
        1i32..100,
        prop::collection::vec(channel_address(), 0..3),
        proptest::option::weighted(0.8, attributes()),
    )
        .prop_map(|(entity_type, id, channels, data)| EntityChange {
            entity_type,
            id,
            channels,
            data,
        })
}

/// Generate a channel-level change.
pub fn channel_change() -> impl Strategy<Value = ChannelChange> {
    (channel_address(), channel_action(), proptest::option::of(filter())).prop_map(
        |(channel, action, filter)| ChannelChange {
            channel,
            action,
            filter,
        },
    )
}

/// Generate a change set of up to `max_changes` entity changes.
pub fn change_set(max_changes: usize) -> impl Strategy<Value = ChangeSet> {
    (
        1u32..1000,
        proptest::option::of(1u32..1000),
        proptest::option::of("[0-9a-f]{8}"),
        prop::collection::vec(channel_change(), 0..4),
        prop::collection::vec(entity_change(), 0..=max_changes),
    )
        .prop_map(|(sequence, request_id, etag, channel_actions, changes)| ChangeSet {
            sequence,
            request_id,
            etag,
            channel_actions,
            changes,
        })
}

/// A change set of `count` updates to distinct entities of one channel.
pub fn bulk_change_set(sequence: u32, channel: &ChannelAddress, count: i32) -> ChangeSet {
    let changes = (1..=count)
        .map(|id| {
            let mut data = Map::new();
            data.insert("name".into(), Value::from(format!("entity-{}", id)));
            EntityChange {
                entity_type: 2,
                id,
                channels: vec![channel.clone()],
                data: Some(data),
            }
        })
        .collect();
    ChangeSet {
        sequence,
        request_id: None,
        etag: None,
        channel_actions: vec![ChannelChange {
            channel: channel.clone(),
            action: ChannelAction::Add,
            filter: None,
        }],
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicant_core::{FrameHeader, ServerMessage};

    proptest! {
        #[test]
        fn test_address_text_form_parses_back(address in channel_address()) {
            let parsed: ChannelAddress = address.to_string().parse().unwrap();
            prop_assert_eq!(parsed, address);
        }

        #[test]
        fn test_update_frame_preserves_change_set(set in change_set(20)) {
            let frame = ServerMessage::Update(set.clone()).encode().unwrap();
            prop_assert_eq!(ServerMessage::decode(&frame).unwrap(), ServerMessage::Update(set));
        }

        #[test]
        fn test_update_frame_header_peeks_as_update(set in change_set(5)) {
            let frame = ServerMessage::Update(set).encode().unwrap();
            prop_assert_eq!(FrameHeader::peek(&frame).unwrap().kind, FrameHeader::UPDATE);
        }
    }

    #[test]
    fn test_bulk_change_set() {
        let channel = crate::fixtures::project_channel(1);
        let set = bulk_change_set(3, &channel, 10);
        assert_eq!(set.changes.len(), 10);
        assert!(set.changes.iter().all(|c| !c.is_removal()));
    }
}
