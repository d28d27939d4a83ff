//! On-disk entity buffer framing (spec.md §3), the storage analogue of
//! `pimsync_core::command::CommandFrame`: a fixed header followed by three
//! independently length-prefixed byte sections, mirroring how
//! `original_source/common/entitybuffer.cpp` splits one stored entity into a
//! resource buffer, a metadata buffer, and a local (canonical) buffer.

use thiserror::Error;

use pimsync_core::entity::Operation;

/// `revision:u64 | operation:u8 | replay_flag:u8 | resource_len:u32 | metadata_len:u32 | local_len:u32`
const HEADER_SIZE: usize = 8 + 1 + 1 + 4 + 4 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("entity buffer too short: need at least {HEADER_SIZE} header bytes, got {0}")]
    TooShort(usize),
    #[error("unknown operation byte {0}")]
    UnknownOperation(u8),
    #[error("section offsets overrun buffer: declared {declared} bytes, available {available}")]
    OffsetOutOfBounds { declared: usize, available: usize },
}

/// One revision of one entity as stored in an [`crate::entity::store::EntityStore`]
/// table: the revision and operation that produced it, whether it is still
/// waiting to be replayed to the remote, and its three payload sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBuffer {
    pub revision: u64,
    pub operation: Operation,
    /// Whether this revision originated locally and must be written back to
    /// the remote source by [`crate::replay`] (spec.md §4.9). Fixed at the
    /// moment the revision is committed and never changed afterward — a
    /// revision is never edited in place (spec.md §3/§4.5); replay progress
    /// is tracked separately via `ChangeReplay`'s persisted checkpoint.
    pub replay_to_source: bool,
    /// Resource-adapter-specific bytes, opaque to the pipeline and synchronizer.
    pub resource: Vec<u8>,
    /// Internal bookkeeping (e.g. conflict markers), never sent to a remote.
    pub metadata: Vec<u8>,
    /// The canonical, typed local properties, `rmp-serde`-encoded.
    pub local: Vec<u8>,
}

impl EntityBuffer {
    #[must_use]
    pub fn new(
        revision: u64,
        operation: Operation,
        replay_to_source: bool,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
    ) -> Self {
        Self {
            revision,
            operation,
            replay_to_source,
            resource,
            metadata,
            local,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.resource.len() + self.metadata.len() + self.local.len(),
        );
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.push(self.operation as u8);
        out.push(u8::from(self.replay_to_source));
        out.extend_from_slice(&(self.resource.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.metadata.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.local.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.resource);
        out.extend_from_slice(&self.metadata);
        out.extend_from_slice(&self.local);
        out
    }

    /// Decodes and verifies a buffer previously produced by [`Self::encode`],
    /// checking every declared section length fits inside the available bytes
    /// before slicing (the safe-Rust equivalent of `entitybuffer.cpp`'s
    /// flatbuffers verifier pass).
    pub fn decode(bytes: &[u8]) -> Result<Self, BufferError> {
        if bytes.len() < HEADER_SIZE {
            return Err(BufferError::TooShort(bytes.len()));
        }
        let revision = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let operation_byte = bytes[8];
        let operation =
            Operation::from_u8(operation_byte).ok_or(BufferError::UnknownOperation(operation_byte))?;
        let replay_to_source = bytes[9] != 0;
        let resource_len = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;
        let metadata_len = u32::from_le_bytes(bytes[14..18].try_into().unwrap()) as usize;
        let local_len = u32::from_le_bytes(bytes[18..22].try_into().unwrap()) as usize;

        let declared = resource_len + metadata_len + local_len;
        let available = bytes.len() - HEADER_SIZE;
        if declared > available {
            return Err(BufferError::OffsetOutOfBounds { declared, available });
        }

        let mut offset = HEADER_SIZE;
        let resource = bytes[offset..offset + resource_len].to_vec();
        offset += resource_len;
        let metadata = bytes[offset..offset + metadata_len].to_vec();
        offset += metadata_len;
        let local = bytes[offset..offset + local_len].to_vec();

        Ok(Self {
            revision,
            operation,
            replay_to_source,
            resource,
            metadata,
            local,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntityBuffer {
        EntityBuffer::new(
            7,
            Operation::Modify,
            true,
            b"resource-bytes".to_vec(),
            b"meta".to_vec(),
            b"local-properties".to_vec(),
        )
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let buf = sample();
        let encoded = buf.encode();
        let decoded = EntityBuffer::decode(&encoded).unwrap();
        assert_eq!(decoded, buf);
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert_eq!(EntityBuffer::decode(&[0u8; 4]), Err(BufferError::TooShort(4)));
    }

    #[test]
    fn decode_rejects_unknown_operation() {
        let mut encoded = sample().encode();
        encoded[8] = 99;
        assert_eq!(
            EntityBuffer::decode(&encoded),
            Err(BufferError::UnknownOperation(99))
        );
    }

    #[test]
    fn decode_rejects_section_lengths_overrunning_buffer() {
        let mut encoded = sample().encode();
        // Inflate the declared resource length far past what's actually present.
        encoded[10..14].copy_from_slice(&1_000_000u32.to_le_bytes());
        match EntityBuffer::decode(&encoded) {
            Err(BufferError::OffsetOutOfBounds { .. }) => {}
            other => panic!("expected OffsetOutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn empty_sections_round_trip() {
        let buf = EntityBuffer::new(1, Operation::Delete, false, Vec::new(), Vec::new(), Vec::new());
        let encoded = buf.encode();
        assert_eq!(EntityBuffer::decode(&encoded).unwrap(), buf);
    }
}
