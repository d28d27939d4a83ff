//! The revisioned entity store (spec.md §4.2): a transactional façade over
//! [`crate::storage::DataStore`] assigning every entity mutation the next
//! global revision and keeping its full revision chain under one
//! `<uid><revision>` key prefix per entity type, the append-only layout
//! `original_source/common/entitybuffer.cpp` documents for on-disk entities.

use std::sync::Arc;

use pimsync_core::entity::{EntityType, Operation, Uid};

use crate::entity::buffer::{BufferError, EntityBuffer};
use crate::storage::{DataStore, StoreError};

const META_TABLE: &str = "meta";
const GLOBAL_REVISION_KEY: &[u8] = b"global_revision";

/// Global, cross-entity-type revision log: revision number -> (type, uid,
/// operation, replay_to_source). The per-type `<type>.main` tables are each
/// independently keyed by `<uid><revision>`, so they cannot alone answer "what
/// changed, in revision order, across every type" — the walk `ChangeReplay`
/// needs (spec.md §4.5, §4.10). This table is the secondary index that makes
/// that walk possible without scanning every type's table and merging. Every
/// entry, once written, is immutable: replay progress is tracked separately
/// by `ChangeReplay`'s own persisted checkpoint, never by rewriting an entry
/// here.
const REVLOG_TABLE: &str = "__internal.revlog";

fn main_table(entity_type: EntityType) -> String {
    format!("{entity_type}.main")
}

fn revision_key(uid: &Uid, revision: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[0..16].copy_from_slice(uid.as_bytes());
    key[16..24].copy_from_slice(&revision.to_be_bytes());
    key
}

fn entity_type_byte(entity_type: EntityType) -> u8 {
    EntityType::ALL
        .iter()
        .position(|&t| t == entity_type)
        .expect("EntityType::ALL covers every variant") as u8
}

fn entity_type_from_byte(byte: u8) -> Option<EntityType> {
    EntityType::ALL.get(byte as usize).copied()
}

fn revlog_value(entity_type: EntityType, uid: &Uid, operation: Operation, replay_to_source: bool) -> [u8; 19] {
    let mut value = [0u8; 19];
    value[0] = entity_type_byte(entity_type);
    value[1..17].copy_from_slice(uid.as_bytes());
    value[17] = operation as u8;
    value[18] = u8::from(replay_to_source);
    value
}

fn decode_revlog_value(bytes: &[u8]) -> Option<(EntityType, Uid, Operation, bool)> {
    let entity_type = entity_type_from_byte(*bytes.first()?)?;
    let uid = Uid::from_bytes(bytes.get(1..17)?.try_into().ok()?);
    let operation = Operation::from_u8(*bytes.get(17)?)?;
    let replay_to_source = *bytes.get(18)? != 0;
    Some((entity_type, uid, operation, replay_to_source))
}

/// Describes one committed mutation, handed to the pipeline/synchronizer so
/// they don't need to re-decode the buffer to learn what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    pub entity_type: EntityType,
    pub uid: Uid,
    pub revision: u64,
    pub operation: Operation,
}

/// Transactional façade assigning revisions and appending entity buffers.
pub struct EntityStore {
    store: Arc<DataStore>,
}

impl EntityStore {
    #[must_use]
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Appends a new `Create` revision for a freshly allocated uid.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the underlying transaction fails to commit.
    pub fn create(
        &self,
        entity_type: EntityType,
        uid: Option<Uid>,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let txn = self.store.begin_write()?;
        let event = Self::create_in(&txn, entity_type, uid, resource, metadata, local, replay_to_source)?;
        txn.commit()?;
        Ok(event)
    }

    /// Same as [`Self::create`], but against a caller-supplied write
    /// transaction instead of opening and committing its own. Lets
    /// [`crate::pipeline::Pipeline`] run the entity commit and its
    /// preprocessors' index maintenance as one atomic transaction (spec.md
    /// §4.3, §4.7): either both land, or the caller aborts and neither does.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the underlying transaction operation fails.
    pub fn create_in(
        txn: &crate::storage::WriteTxn<'_>,
        entity_type: EntityType,
        uid: Option<Uid>,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let uid = uid.unwrap_or_else(Uid::new_random);
        let revision = Self::next_global_revision(txn)?;
        let buffer = EntityBuffer::new(revision, Operation::Create, replay_to_source, resource, metadata, local);
        txn.put(&main_table(entity_type), &revision_key(&uid, revision), &buffer.encode())?;
        txn.put(
            REVLOG_TABLE,
            &revision.to_be_bytes(),
            &revlog_value(entity_type, &uid, Operation::Create, replay_to_source),
        )?;
        Ok(StoreEvent {
            entity_type,
            uid,
            revision,
            operation: Operation::Create,
        })
    }

    /// Appends a `Modify` revision for an existing uid.
    ///
    /// If `expected_previous_revision` is `Some`, the write is rejected with
    /// [`StoreError::Conflict`](crate::storage::StoreError) unless it matches
    /// the uid's current latest revision (spec.md §4.2 optimistic concurrency).
    ///
    /// # Errors
    /// Returns [`StoreError`] on conflict, missing uid, or commit failure.
    pub fn modify(
        &self,
        entity_type: EntityType,
        uid: Uid,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        expected_previous_revision: Option<u64>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let txn = self.store.begin_write()?;
        let event = Self::modify_in(
            &txn,
            entity_type,
            uid,
            resource,
            metadata,
            local,
            expected_previous_revision,
            replay_to_source,
        )?;
        txn.commit()?;
        Ok(event)
    }

    /// Same as [`Self::modify`], against a caller-supplied write transaction.
    /// See [`Self::create_in`].
    ///
    /// # Errors
    /// Returns [`StoreError`] on conflict, missing uid, or a transaction
    /// operation failure.
    pub fn modify_in(
        txn: &crate::storage::WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        expected_previous_revision: Option<u64>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let table = main_table(entity_type);
        let current = txn
            .scan_last(&table, uid.as_bytes())?
            .map(|(_, v)| EntityBuffer::decode(&v))
            .transpose()
            .map_err(buffer_error)?;
        let Some(current) = current else {
            return Err(StoreError::NotFound);
        };
        if let Some(expected) = expected_previous_revision {
            if expected != current.revision {
                return Err(StoreError::Conflict {
                    expected,
                    actual: current.revision,
                });
            }
        }
        let revision = Self::next_global_revision(txn)?;
        let buffer = EntityBuffer::new(revision, Operation::Modify, replay_to_source, resource, metadata, local);
        txn.put(&table, &revision_key(&uid, revision), &buffer.encode())?;
        txn.put(
            REVLOG_TABLE,
            &revision.to_be_bytes(),
            &revlog_value(entity_type, &uid, Operation::Modify, replay_to_source),
        )?;
        Ok(StoreEvent {
            entity_type,
            uid,
            revision,
            operation: Operation::Modify,
        })
    }

    /// Appends a tombstone `Delete` revision for an existing uid.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the uid has no current revision,
    /// otherwise propagates storage failures.
    pub fn remove(
        &self,
        entity_type: EntityType,
        uid: Uid,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let txn = self.store.begin_write()?;
        let event = Self::remove_in(&txn, entity_type, uid, replay_to_source)?;
        txn.commit()?;
        Ok(event)
    }

    /// Same as [`Self::remove`], against a caller-supplied write transaction.
    /// See [`Self::create_in`].
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the uid has no current revision,
    /// otherwise propagates a transaction operation failure.
    pub fn remove_in(
        txn: &crate::storage::WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        replay_to_source: bool,
    ) -> Result<StoreEvent, StoreError> {
        let table = main_table(entity_type);
        if txn.scan_last(&table, uid.as_bytes())?.is_none() {
            return Err(StoreError::NotFound);
        }
        let revision = Self::next_global_revision(txn)?;
        let buffer = EntityBuffer::new(
            revision,
            Operation::Delete,
            replay_to_source,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        txn.put(&table, &revision_key(&uid, revision), &buffer.encode())?;
        txn.put(
            REVLOG_TABLE,
            &revision.to_be_bytes(),
            &revlog_value(entity_type, &uid, Operation::Delete, replay_to_source),
        )?;
        Ok(StoreEvent {
            entity_type,
            uid,
            revision,
            operation: Operation::Delete,
        })
    }

    /// Returns the entity's latest revision, or `None` if it has never existed.
    ///
    /// # Errors
    /// Propagates storage or buffer-decode failures.
    pub fn read_latest(
        &self,
        entity_type: EntityType,
        uid: Uid,
    ) -> Result<Option<EntityBuffer>, StoreError> {
        let txn = self.store.begin_read()?;
        txn.scan_last(&main_table(entity_type), uid.as_bytes())?
            .map(|(_, v)| EntityBuffer::decode(&v))
            .transpose()
            .map_err(buffer_error)
    }

    /// Returns the entity buffer at an exact historical revision, if present.
    ///
    /// # Errors
    /// Propagates storage or buffer-decode failures.
    pub fn read_at(
        &self,
        entity_type: EntityType,
        uid: Uid,
        revision: u64,
    ) -> Result<Option<EntityBuffer>, StoreError> {
        let txn = self.store.begin_read()?;
        txn.get(&main_table(entity_type), &revision_key(&uid, revision))?
            .map(|v| EntityBuffer::decode(&v))
            .transpose()
            .map_err(buffer_error)
    }

    /// Same as [`Self::read_at`], against a caller-supplied write
    /// transaction, so [`crate::pipeline::Pipeline`] can read back the
    /// revision it just wrote without closing the transaction first.
    ///
    /// # Errors
    /// Propagates storage or buffer-decode failures.
    pub fn read_at_in(
        txn: &crate::storage::WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        revision: u64,
    ) -> Result<Option<EntityBuffer>, StoreError> {
        txn.get(&main_table(entity_type), &revision_key(&uid, revision))?
            .map(|v| EntityBuffer::decode(&v))
            .transpose()
            .map_err(buffer_error)
    }

    /// Same as [`Self::read_latest`], against a caller-supplied write
    /// transaction. See [`Self::read_at_in`].
    ///
    /// # Errors
    /// Propagates storage or buffer-decode failures.
    pub fn read_latest_in(
        txn: &crate::storage::WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
    ) -> Result<Option<EntityBuffer>, StoreError> {
        txn.scan_last(&main_table(entity_type), uid.as_bytes())?
            .map(|(_, v)| EntityBuffer::decode(&v))
            .transpose()
            .map_err(buffer_error)
    }

    /// Visits every stored revision of `uid`, oldest first, until `visitor`
    /// returns `false`.
    ///
    /// # Errors
    /// Propagates storage or buffer-decode failures.
    pub fn scan_revisions(
        &self,
        entity_type: EntityType,
        uid: Uid,
        mut visitor: impl FnMut(&EntityBuffer) -> bool,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_read()?;
        let mut decode_err = None;
        txn.scan(&main_table(entity_type), uid.as_bytes(), |_, v| {
            match EntityBuffer::decode(v) {
                Ok(buffer) => visitor(&buffer),
                Err(e) => {
                    decode_err = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = decode_err {
            return Err(buffer_error(e));
        }
        Ok(())
    }

    /// Visits every revision in `(from_exclusive, to_inclusive]`, in
    /// ascending global-revision order across all entity types, until
    /// `visitor` returns `false`. This is the scan `ChangeReplay` walks from
    /// its last checkpoint up to the store's current revision (spec.md §4.5,
    /// §4.10), distinct from [`Self::scan_revisions`]'s single-entity chain.
    ///
    /// # Errors
    /// Propagates storage failures, or [`StoreError::Corruption`] if a
    /// revision-log entry is malformed.
    pub fn scan_global_revisions(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        mut visitor: impl FnMut(EntityType, Uid, u64, Operation, bool) -> bool,
    ) -> Result<(), StoreError> {
        if to_inclusive <= from_exclusive {
            return Ok(());
        }
        let txn = self.store.begin_read()?;
        let start = (from_exclusive + 1).to_be_bytes();
        let end = to_inclusive.to_be_bytes();
        let mut malformed = false;
        txn.scan_range(REVLOG_TABLE, &start, &end, |k, v| {
            let Ok(revision_bytes) = <[u8; 8]>::try_from(k) else {
                malformed = true;
                return false;
            };
            let revision = u64::from_be_bytes(revision_bytes);
            match decode_revlog_value(v) {
                Some((entity_type, uid, operation, replay_to_source)) => {
                    visitor(entity_type, uid, revision, operation, replay_to_source)
                }
                None => {
                    malformed = true;
                    false
                }
            }
        })?;
        if malformed {
            return Err(StoreError::Corruption("malformed revision-log entry".to_string()));
        }
        Ok(())
    }

    /// Returns the highest revision number ever assigned, or `0` if the
    /// store has never committed a mutation. The upper bound for a
    /// [`Self::scan_global_revisions`] walk.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn max_revision(&self) -> Result<u64, StoreError> {
        let txn = self.store.begin_read()?;
        Ok(txn
            .get(META_TABLE, GLOBAL_REVISION_KEY)?
            .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    fn next_global_revision(txn: &crate::storage::WriteTxn<'_>) -> Result<u64, StoreError> {
        let current = txn
            .get(META_TABLE, GLOBAL_REVISION_KEY)?
            .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
            .unwrap_or(0);
        let next = current + 1;
        txn.put(META_TABLE, GLOBAL_REVISION_KEY, &next.to_be_bytes())?;
        Ok(next)
    }
}

fn buffer_error(err: BufferError) -> StoreError {
    StoreError::Corruption(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (Arc<DataStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path().join("store.redb")).unwrap());
        (store, dir)
    }

    #[test]
    fn create_then_read_latest_round_trips() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let event = entities
            .create(EntityType::Mail, None, vec![1], vec![2], vec![3], true)
            .unwrap();
        assert_eq!(event.revision, 1);

        let latest = entities.read_latest(EntityType::Mail, event.uid).unwrap().unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(latest.operation, Operation::Create);
        assert_eq!(latest.resource, vec![1]);
    }

    #[test]
    fn modify_appends_new_revision_without_losing_history() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let created = entities.create(EntityType::Folder, None, vec![], vec![], b"v1".to_vec(), true).unwrap();
        let modified = entities
            .modify(EntityType::Folder, created.uid, vec![], vec![], b"v2".to_vec(), Some(created.revision), true)
            .unwrap();
        assert_eq!(modified.revision, created.revision + 1);

        let mut revisions = Vec::new();
        entities
            .scan_revisions(EntityType::Folder, created.uid, |buf| {
                revisions.push(buf.local.clone());
                true
            })
            .unwrap();
        assert_eq!(revisions, vec![b"v1".to_vec(), b"v2".to_vec()]);
    }

    #[test]
    fn modify_rejects_stale_expected_revision() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let created = entities.create(EntityType::Contact, None, vec![], vec![], vec![], true).unwrap();
        let err = entities
            .modify(EntityType::Contact, created.uid, vec![], vec![], vec![], Some(created.revision + 1), true)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn remove_on_missing_uid_is_not_found() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let err = entities.remove(EntityType::Event, Uid::new_random(), true).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn revisions_are_globally_monotonic_across_entity_types() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let a = entities.create(EntityType::Mail, None, vec![], vec![], vec![], true).unwrap();
        let b = entities.create(EntityType::Folder, None, vec![], vec![], vec![], true).unwrap();
        assert!(b.revision > a.revision);
    }

    #[test]
    fn scan_global_revisions_visits_every_type_in_revision_order() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let mail = entities.create(EntityType::Mail, None, vec![], vec![], vec![], true).unwrap();
        let folder = entities.create(EntityType::Folder, None, vec![], vec![], vec![], false).unwrap();
        let modified = entities
            .modify(EntityType::Mail, mail.uid, vec![], vec![], b"v2".to_vec(), Some(mail.revision), true)
            .unwrap();

        let mut seen = Vec::new();
        entities
            .scan_global_revisions(0, modified.revision, |entity_type, uid, revision, op, replay_to_source| {
                seen.push((entity_type, uid, revision, op, replay_to_source));
                true
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (EntityType::Mail, mail.uid, mail.revision, Operation::Create, true),
                (EntityType::Folder, folder.uid, folder.revision, Operation::Create, false),
                (EntityType::Mail, mail.uid, modified.revision, Operation::Modify, true),
            ]
        );
    }

    #[test]
    fn scan_global_revisions_respects_from_exclusive_bound() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let a = entities.create(EntityType::Mail, None, vec![], vec![], vec![], true).unwrap();
        let b = entities.create(EntityType::Folder, None, vec![], vec![], vec![], true).unwrap();

        let mut seen = Vec::new();
        entities
            .scan_global_revisions(a.revision, b.revision, |_, uid, _, _, _| {
                seen.push(uid);
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b.uid]);
    }

    #[test]
    fn max_revision_tracks_latest_assigned() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        assert_eq!(entities.max_revision().unwrap(), 0);
        let a = entities.create(EntityType::Mail, None, vec![], vec![], vec![], true).unwrap();
        assert_eq!(entities.max_revision().unwrap(), a.revision);
    }

    #[test]
    fn replay_to_source_bit_is_immutable_once_committed() {
        let (store, _dir) = temp_store();
        let entities = EntityStore::new(store);
        let created = entities.create(EntityType::Mail, None, vec![], vec![], vec![], true).unwrap();
        assert!(entities.read_latest(EntityType::Mail, created.uid).unwrap().unwrap().replay_to_source);
        // No API mutates a committed revision's replay_to_source bit; replay
        // progress lives solely in ChangeReplay's own checkpoint.
        assert!(entities.read_at(EntityType::Mail, created.uid, created.revision).unwrap().unwrap().replay_to_source);
    }
}
