//! Bidirectional local uid <-> remote id mapping (spec.md §4.4), the piece
//! the synchronizer uses to reconcile what it sees on the remote with what
//! already exists locally. Two sub-databases kept mutually consistent, the
//! same dual-table pattern `topgun-server::storage::map_data_store` uses to
//! keep its forward and reverse lookup tables in sync.

use pimsync_core::entity::{EntityType, Uid};

use crate::storage::{DataStore, StoreError};

fn forward_table(entity_type: EntityType) -> String {
    format!("{entity_type}.remoteid.local_to_remote")
}

fn reverse_table(entity_type: EntityType) -> String {
    format!("{entity_type}.remoteid.remote_to_local")
}

/// Outcome of [`RemoteIdMap::resolve_remote_id`]: whether the uid it returns
/// was already bound, or freshly allocated by this very call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteIdResolution {
    Existing(Uid),
    Allocated(Uid),
}

impl RemoteIdResolution {
    #[must_use]
    pub fn uid(self) -> Uid {
        match self {
            Self::Existing(uid) | Self::Allocated(uid) => uid,
        }
    }
}

/// Maps local uids to the opaque remote-id byte strings a resource adapter
/// uses to identify the same entity on its remote source, and back.
pub struct RemoteIdMap {
    store: std::sync::Arc<DataStore>,
}

impl RemoteIdMap {
    #[must_use]
    pub fn new(store: std::sync::Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Binds `uid` to `remote_id`, replacing any prior binding for either side.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn rebind(
        &self,
        entity_type: EntityType,
        uid: Uid,
        remote_id: &[u8],
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        let forward = forward_table(entity_type);
        let reverse = reverse_table(entity_type);
        if let Some(old_remote_id) = txn.get(&forward, uid.as_bytes())? {
            txn.remove(&reverse, &old_remote_id)?;
        }
        if let Some(old_uid_bytes) = txn.get(&reverse, remote_id)? {
            txn.remove(&forward, &old_uid_bytes)?;
        }
        txn.put(&forward, uid.as_bytes(), remote_id)?;
        txn.put(&reverse, remote_id, uid.as_bytes())?;
        txn.commit()
    }

    /// Removes both directions of a uid's binding, e.g. after a local delete
    /// for which change-replay no longer needs to resolve a remote id.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn unbind(&self, entity_type: EntityType, uid: Uid) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        let forward = forward_table(entity_type);
        if let Some(remote_id) = txn.get(&forward, uid.as_bytes())? {
            txn.remove(&reverse_table(entity_type), &remote_id)?;
        }
        txn.remove(&forward, uid.as_bytes())?;
        txn.commit()
    }

    /// Resolves a local uid to its bound remote id, if any (spec.md §4.4:
    /// `resolve_local_id(type, uid) -> remoteId`).
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn resolve_local_id(
        &self,
        entity_type: EntityType,
        uid: Uid,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.store.begin_read()?;
        txn.get(&forward_table(entity_type), uid.as_bytes())
    }

    /// Resolves a remote id to its bound local uid, allocating and binding a
    /// fresh one atomically if it has never been seen before (spec.md §4.4:
    /// `resolve_remote_id(type, remoteId) -> uid`, "resolving a
    /// previously-unseen remoteId allocates a fresh uid atomically with the
    /// binding"). One write transaction covers both the lookup and the
    /// allocate-and-bind, so two concurrent callers resolving the same
    /// unseen remote id can never allocate two different uids for it.
    ///
    /// # Errors
    /// Propagates storage failures, or [`StoreError::Corruption`] if a
    /// stored binding is malformed.
    pub fn resolve_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &[u8],
    ) -> Result<RemoteIdResolution, StoreError> {
        let txn = self.store.begin_write()?;
        let reverse = reverse_table(entity_type);
        let resolution = match txn.get(&reverse, remote_id)? {
            Some(bytes) => {
                let uid = <[u8; 16]>::try_from(bytes)
                    .map(Uid::from_bytes)
                    .map_err(|_| StoreError::Corruption("malformed remote-id binding".to_string()))?;
                RemoteIdResolution::Existing(uid)
            }
            None => {
                let uid = Uid::new_random();
                txn.put(&forward_table(entity_type), uid.as_bytes(), remote_id)?;
                txn.put(&reverse, remote_id, uid.as_bytes())?;
                RemoteIdResolution::Allocated(uid)
            }
        };
        txn.commit()?;
        Ok(resolution)
    }

    /// Returns every currently bound `(uid, remote_id)` pair for `entity_type`,
    /// used by [`crate::sync::Synchronizer::scan_for_removals`] to find local
    /// entities the remote no longer reports.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn all_bindings(&self, entity_type: EntityType) -> Result<Vec<(Uid, Vec<u8>)>, StoreError> {
        let txn = self.store.begin_read()?;
        let mut bindings = Vec::new();
        txn.scan(&forward_table(entity_type), &[], |k, v| {
            if let Ok(uid_bytes) = <[u8; 16]>::try_from(k) {
                bindings.push((Uid::from_bytes(uid_bytes), v.to_vec()));
            }
            true
        })?;
        Ok(bindings)
    }
}
