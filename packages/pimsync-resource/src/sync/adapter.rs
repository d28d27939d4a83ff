//! Pluggable connection to a remote source (spec.md §4.9), the Rust shape of
//! `Sink::Synchronizer`'s protocol-specific subclasses
//! (`examples/webdavcommon/webdav.h`'s `WebDavSynchronizer`,
//! `examples/maildirresource/domainadaptor.h`'s maildir factories): the
//! fetch/enumerate/exists operations a concrete resource type would
//! implement against IMAP, CalDAV, a maildir tree, etc., kept behind one
//! trait so [`super::Synchronizer`] never depends on a specific protocol.

use async_trait::async_trait;
use std::collections::BTreeMap;

use pimsync_core::entity::{EntityType, Operation};
use pimsync_core::value::PropertyValue;

/// One remote item as fetched from the source: its opaque remote id, the
/// canonical properties the pipeline would index, and the resource-adapter
/// bytes the entity's `resource` section stores verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub remote_id: Vec<u8>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub resource_buffer: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("remote fetch failed: {0}")]
    Fetch(String),
    #[error("remote operation timed out")]
    Timeout,
}

/// A resource's connection to its remote source. One implementation per
/// protocol (IMAP, CalDAV/WebDAV, maildir); out of scope per spec
/// Non-goals, but the seam the synchronizer drives is in scope.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Fetches every remote item of `entity_type` currently known to the
    /// source, e.g. one IMAP `FETCH` pass over a folder or one maildir scan.
    async fn fetch_items(&self, entity_type: EntityType) -> Result<Vec<RemoteItem>, AdapterError>;

    /// Returns `true` if `remote_id` still exists on the source, used by
    /// [`super::Synchronizer::scan_for_removals`] to find local entities the
    /// source has dropped since the last sync.
    async fn still_exists(&self, entity_type: EntityType, remote_id: &[u8]) -> Result<bool, AdapterError>;
}

/// Writes a locally-committed revision back to the remote source
/// (spec.md §4.10), the Rust shape of `SourceWriteBack`'s per-type `replay()`
/// overloads in `original_source/common/sourcewriteback.h`. One
/// implementation per protocol, pluggable the same way [`RemoteAdapter`] is.
#[async_trait]
pub trait Writeback: Send + Sync {
    /// Replays one committed revision. Returns the remote id to bind the
    /// entity to afterward: `Create`/`Modify` return the (possibly new, for
    /// move semantics) remote id; `Delete` returns `None` and the caller
    /// unbinds. An `Err` leaves `lastReplayedRevision` unadvanced so the same
    /// revision is retried.
    async fn replay(
        &self,
        entity_type: EntityType,
        operation: Operation,
        properties: &BTreeMap<String, PropertyValue>,
        resource: &[u8],
        old_remote_id: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AdapterError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic in-memory adapter, standing in for a real protocol
    /// client so the synchronizer is fully testable without network I/O.
    pub struct StubAdapter {
        items: Mutex<Vec<RemoteItem>>,
    }

    impl StubAdapter {
        pub fn new(items: Vec<RemoteItem>) -> Self {
            Self { items: Mutex::new(items) }
        }

        pub fn set_items(&self, items: Vec<RemoteItem>) {
            *self.items.lock().unwrap() = items;
        }
    }

    #[async_trait]
    impl RemoteAdapter for StubAdapter {
        async fn fetch_items(&self, _entity_type: EntityType) -> Result<Vec<RemoteItem>, AdapterError> {
            Ok(self.items.lock().unwrap().clone())
        }

        async fn still_exists(&self, _entity_type: EntityType, remote_id: &[u8]) -> Result<bool, AdapterError> {
            Ok(self.items.lock().unwrap().iter().any(|i| i.remote_id == remote_id))
        }
    }

    /// Writeback double that fails its first `fail_count` calls with
    /// `AdapterError::Fetch`, then succeeds, minting `remote-{n}` ids for
    /// creates and echoing `old_remote_id` back for modifies.
    pub struct StubWriteback {
        fail_count: Mutex<u32>,
        next_id: std::sync::atomic::AtomicU64,
        pub calls: Mutex<Vec<(EntityType, Operation)>>,
    }

    impl StubWriteback {
        pub fn new(fail_count: u32) -> Self {
            Self {
                fail_count: Mutex::new(fail_count),
                next_id: std::sync::atomic::AtomicU64::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Writeback for StubWriteback {
        async fn replay(
            &self,
            entity_type: EntityType,
            operation: Operation,
            _properties: &BTreeMap<String, PropertyValue>,
            _resource: &[u8],
            old_remote_id: Option<&[u8]>,
        ) -> Result<Option<Vec<u8>>, AdapterError> {
            self.calls.lock().unwrap().push((entity_type, operation));
            let mut remaining = self.fail_count.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AdapterError::Fetch("transient network error".to_string()));
            }
            drop(remaining);
            match operation {
                Operation::Delete => Ok(None),
                Operation::Create => {
                    let n = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Ok(Some(format!("remote-{n}").into_bytes()))
                }
                Operation::Modify => Ok(Some(old_remote_id.expect("modify always has a prior remote id").to_vec())),
            }
        }
    }
}
