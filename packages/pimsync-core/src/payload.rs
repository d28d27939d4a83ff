//! Tagged, schema-evolution-friendly command payloads (spec.md §6).
//!
//! Encoded with `MessagePack` (`rmp-serde`), the same mechanism
//! `topgun-core::messages` uses for its wire schema — field-tagged and
//! forward-compatible the way the spec's "tagged binary-record format"
//! calls for, without hand-rolling a bespoke TLV scheme.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityType, Uid};
use crate::value::PropertyValue;

/// Payload carried by `CreateEntity`/`ModifyEntity`/`DeleteEntity` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPayload {
    pub entity_type: EntityType,
    /// Identifies the entity to change for `ModifyEntity`/`DeleteEntity`
    /// (always `Some`). For `CreateEntity`, `None` lets the store allocate a
    /// fresh uid (the common case for user-submitted creates); `Some`
    /// carries a uid the caller pre-allocated, which a `Synchronizer` does
    /// so it can bind the uid to a remote id before the command is even
    /// drained from the queue.
    pub uid: Option<Uid>,
    /// The delta entity buffer: changed local properties by name.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Raw resource-adapter-specific bytes, opaque to the pipeline.
    pub resource_buffer: Vec<u8>,
    /// Optimistic-concurrency check: the revision the client last observed.
    pub expected_previous_revision: Option<u64>,
    /// Whether change-replay must write this revision back to the remote
    /// source. `true` for user-submitted mutations; `false` for the
    /// synthetic commands a `Synchronizer` produces from remote state it
    /// just fetched, which must not be echoed back to where they came from.
    pub replay_to_source: bool,
}

/// Payload carried by a `Synchronize` command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SynchronizeQuery {
    pub resource_filter: Option<String>,
    pub type_filter: Option<EntityType>,
    pub property_filters: BTreeMap<String, PropertyValue>,
}

/// Decoded, typed view of a command frame's payload.
///
/// `CommandProcessor` (spec.md §4.8) decodes a frame's raw bytes into one of
/// these before invoking the pipeline or synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandPayload {
    Mutate(MutationPayload),
    Synchronize(SynchronizeQuery),
    Ping,
    Shutdown,
}

impl CommandPayload {
    /// Serializes the payload for storage as a queue entry / frame payload.
    ///
    /// # Errors
    /// Propagates `rmp_serde` encoding failures (never expected for these types).
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserializes a payload previously produced by [`Self::encode`].
    ///
    /// # Errors
    /// Returns an error if `bytes` is not a valid encoding of `CommandPayload`.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_payload_round_trips() {
        let mut properties = BTreeMap::new();
        properties.insert("subject".to_string(), PropertyValue::Text("Foobar".into()));
        let payload = CommandPayload::Mutate(MutationPayload {
            entity_type: EntityType::Mail,
            uid: Some(Uid::new_random()),
            properties,
            resource_buffer: vec![1, 2, 3],
            expected_previous_revision: Some(7),
            replay_to_source: true,
        });
        let encoded = payload.encode().unwrap();
        let decoded = CommandPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn synchronize_query_round_trips() {
        let payload = CommandPayload::Synchronize(SynchronizeQuery {
            resource_filter: Some("account-1".to_string()),
            type_filter: Some(EntityType::Folder),
            property_filters: BTreeMap::new(),
        });
        let encoded = payload.encode().unwrap();
        assert_eq!(CommandPayload::decode(&encoded).unwrap(), payload);
    }
}
