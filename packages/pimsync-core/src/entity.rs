//! Entity identity and revision-chain types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally unique identifier for an entity, opaque outside the engine.
///
/// Allocated by [`crate::error`]-free code paths in `pimsync-resource`'s
/// `RemoteIdMap` as a fresh random 128-bit value (spec §4.4), or derived
/// deterministically in tests. Stored as the first component of the
/// `<uid>\0<revision>` key (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(Uuid);

impl Uid {
    /// Allocates a fresh, collision-free uid.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps a caller-provided byte sequence as a uid, for deterministic tests.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw 16-byte representation, used as key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The closed set of entity kinds this resource engine stores.
///
/// Grounded in `original_source`'s domain types (`common/domain/*.h`) and
/// spec.md §1: mails, folders, events, contacts, addressbooks. The set is
/// closed and known at build time, per spec.md §9's code-generation note —
/// no type-erased property mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Mail,
    Folder,
    Event,
    Contact,
    Addressbook,
}

impl EntityType {
    /// All entity kinds, in a stable order used for sub-database enumeration.
    pub const ALL: [EntityType; 5] = [
        EntityType::Mail,
        EntityType::Folder,
        EntityType::Event,
        EntityType::Contact,
        EntityType::Addressbook,
    ];

    /// Lowercase name used as the sub-database prefix (`<type>.main`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Mail => "mail",
            EntityType::Folder => "folder",
            EntityType::Event => "event",
            EntityType::Contact => "contact",
            EntityType::Addressbook => "addressbook",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of mutation a revision records.
///
/// Encoded as a single byte in the `EntityBuffer` header (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    Create = 0,
    Modify = 1,
    Delete = 2,
}

impl Operation {
    /// Decodes the header byte, rejecting unknown discriminants.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Operation::Create),
            1 => Some(Operation::Modify),
            2 => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_through_bytes() {
        let uid = Uid::new_random();
        let bytes = *uid.as_bytes();
        assert_eq!(Uid::from_bytes(bytes), uid);
    }

    #[test]
    fn operation_round_trips_through_u8() {
        for op in [Operation::Create, Operation::Modify, Operation::Delete] {
            assert_eq!(Operation::from_u8(op as u8), Some(op));
        }
        assert_eq!(Operation::from_u8(99), None);
    }

    #[test]
    fn entity_type_all_covers_spec_types() {
        let names: Vec<_> = EntityType::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, ["mail", "folder", "event", "contact", "addressbook"]);
    }
}
