//! Typed property values for the canonical "local" domain fields.
//!
//! Replaces the original's type-erased property mapper (spec.md §9): each
//! entity type exposes a fixed set of named properties, each holding one of
//! these variants. `pimsync-resource`'s per-type property table maps a
//! property name to a `(get, set, index-key)` triple operating on this enum.

use serde::{Deserialize, Serialize};

use crate::entity::Uid;

/// A single property value as stored in an entity's local (canonical) buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Bool(bool),
    Int(i64),
    Uid(Uid),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Encodes the value as the byte string an `Index` stores it under.
    ///
    /// Text sorts lexicographically, integers are encoded big-endian so
    /// byte order matches numeric order, letting `Index::lookup` double as
    /// a prefix-scan range query (spec.md §4.3).
    #[must_use]
    pub fn to_index_bytes(&self) -> Vec<u8> {
        match self {
            PropertyValue::Text(s) => s.as_bytes().to_vec(),
            PropertyValue::Bytes(b) => b.clone(),
            PropertyValue::Bool(b) => vec![u8::from(*b)],
            PropertyValue::Int(i) => {
                // XOR the sign bit so two's-complement negatives sort before positives.
                (*i as u64 ^ (1u64 << 63)).to_be_bytes().to_vec()
            }
            PropertyValue::Uid(u) => u.as_bytes().to_vec(),
            PropertyValue::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    let bytes = item.to_index_bytes();
                    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    out.extend_from_slice(&bytes);
                }
                out
            }
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_uid(&self) -> Option<Uid> {
        match self {
            PropertyValue::Uid(u) => Some(*u),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_index_bytes_preserve_numeric_order() {
        let a = PropertyValue::Int(-5).to_index_bytes();
        let b = PropertyValue::Int(0).to_index_bytes();
        let c = PropertyValue::Int(5).to_index_bytes();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn text_index_bytes_match_string_bytes() {
        let v = PropertyValue::Text("INBOX".to_string());
        assert_eq!(v.to_index_bytes(), b"INBOX".to_vec());
    }
}
