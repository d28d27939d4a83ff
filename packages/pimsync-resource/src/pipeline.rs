//! The preprocessing pipeline (spec.md §4.6): every entity mutation passes
//! through a chain of [`Preprocessor`]s before it is considered committed,
//! the same `on_new`/`on_modify`/`on_delete` hook shape
//! `original_source/common/eventpreprocessor.cpp`'s `EventPropertyExtractor`
//! implements, generalized from one fixed extractor to an ordered chain —
//! `topgun-server::storage::mutation_observer::CompositeMutationObserver`'s
//! fan-out, but for property extraction rather than change notification.

use std::collections::BTreeMap;
use std::sync::Arc;

use pimsync_core::entity::{EntityType, Uid};
use pimsync_core::error::ErrorKind;
use pimsync_core::value::PropertyValue;
use thiserror::Error;

use crate::entity::{EntityBuffer, EntityStore, StoreEvent};
use crate::index::Index;
use crate::storage::{DataStore, StoreError, WriteTxn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("preprocessor rejected mutation: {0}")]
    Rejected(String),
    #[error("malformed local properties: {0}")]
    MalformedProperties(#[from] rmp_serde::decode::Error),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Storage(e) => e.kind(),
            PipelineError::Rejected(_) => ErrorKind::PreprocessorReject,
            PipelineError::MalformedProperties(_) => ErrorKind::InvalidCommand,
        }
    }
}

/// One stage of the preprocessing chain, run synchronously and in order for
/// every mutation before it's considered durable (spec.md §4.6). Returning
/// `Err` aborts the mutation with [`ErrorKind::PreprocessorReject`].
///
/// Takes the same [`WriteTxn`] the entity commit driving the call is writing
/// through, so index maintenance lands in the same transaction as the
/// revision it reacts to (spec.md §4.3, §4.7): a rejection here aborts that
/// transaction wholesale, leaving neither the revision nor a partial index
/// update behind.
pub trait Preprocessor: Send + Sync {
    fn on_new(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        buffer: &EntityBuffer,
    ) -> Result<(), PipelineError>;

    fn on_modify(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        old: &EntityBuffer,
        new: &EntityBuffer,
    ) -> Result<(), PipelineError>;

    fn on_delete(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        old: &EntityBuffer,
    ) -> Result<(), PipelineError>;
}

/// Decodes an entity's `local` buffer into its named properties, re-indexing
/// every property that changed. Grounded in `EventPropertyExtractor`, but
/// generalized from one hardcoded iCal field set to whatever properties the
/// caller encoded (spec.md §3's per-type property table).
#[derive(Default)]
pub struct PropertyExtractor;

impl PropertyExtractor {
    fn decode(buffer: &EntityBuffer) -> Result<BTreeMap<String, PropertyValue>, PipelineError> {
        if buffer.local.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(rmp_serde::from_slice(&buffer.local)?)
    }
}

impl Preprocessor for PropertyExtractor {
    fn on_new(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        buffer: &EntityBuffer,
    ) -> Result<(), PipelineError> {
        let properties = Self::decode(buffer)?;
        for (name, value) in &properties {
            Index::add_in(txn, entity_type, name, value, uid)?;
        }
        Ok(())
    }

    fn on_modify(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        old: &EntityBuffer,
        new: &EntityBuffer,
    ) -> Result<(), PipelineError> {
        let old_properties = Self::decode(old)?;
        let new_properties = Self::decode(new)?;
        for (name, value) in &old_properties {
            if new_properties.get(name) != Some(value) {
                Index::remove_in(txn, entity_type, name, value, uid)?;
            }
        }
        for (name, value) in &new_properties {
            if old_properties.get(name) != Some(value) {
                Index::add_in(txn, entity_type, name, value, uid)?;
            }
        }
        Ok(())
    }

    fn on_delete(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        old: &EntityBuffer,
    ) -> Result<(), PipelineError> {
        let properties = Self::decode(old)?;
        for (name, value) in &properties {
            Index::remove_in(txn, entity_type, name, value, uid)?;
        }
        Ok(())
    }
}

/// Drives every entity mutation through [`EntityStore`] then the
/// preprocessor chain, in the order the chain was constructed, as one write
/// transaction (spec.md §4.3, §4.7): the entity commit and every
/// preprocessor's index maintenance either all land together or, on a
/// [`PipelineError`], none of them do.
pub struct Pipeline {
    store: Arc<DataStore>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(store: Arc<DataStore>, preprocessors: Vec<Arc<dyn Preprocessor>>) -> Self {
        Self { store, preprocessors }
    }

    /// Creates a new entity and runs `on_new` for every preprocessor.
    ///
    /// # Errors
    /// Returns [`PipelineError`] if the store write or any preprocessor
    /// fails; the transaction is aborted and nothing is committed.
    pub fn create(
        &self,
        entity_type: EntityType,
        uid: Option<Uid>,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let txn = self.store.begin_write()?;
        match self.create_in(&txn, entity_type, uid, resource, metadata, local, replay_to_source) {
            Ok(event) => {
                txn.commit()?;
                Ok(event)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    fn create_in(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Option<Uid>,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let event =
            EntityStore::create_in(txn, entity_type, uid, resource, metadata, local, replay_to_source)?;
        let buffer = EntityStore::read_at_in(txn, entity_type, event.uid, event.revision)?
            .expect("just-written revision must be readable");
        for preprocessor in &self.preprocessors {
            preprocessor.on_new(txn, entity_type, event.uid, &buffer)?;
        }
        Ok(event)
    }

    /// Appends a modified revision and runs `on_modify` for every preprocessor.
    ///
    /// # Errors
    /// Returns [`PipelineError`] if the store write or any preprocessor
    /// fails; the transaction is aborted and nothing is committed.
    pub fn modify(
        &self,
        entity_type: EntityType,
        uid: Uid,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        expected_previous_revision: Option<u64>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let txn = self.store.begin_write()?;
        match self.modify_in(
            &txn,
            entity_type,
            uid,
            resource,
            metadata,
            local,
            expected_previous_revision,
            replay_to_source,
        ) {
            Ok(event) => {
                txn.commit()?;
                Ok(event)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_in(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        resource: Vec<u8>,
        metadata: Vec<u8>,
        local: Vec<u8>,
        expected_previous_revision: Option<u64>,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let old = EntityStore::read_latest_in(txn, entity_type, uid)?.ok_or(StoreError::NotFound)?;
        let event = EntityStore::modify_in(
            txn,
            entity_type,
            uid,
            resource,
            metadata,
            local,
            expected_previous_revision,
            replay_to_source,
        )?;
        let new = EntityStore::read_at_in(txn, entity_type, uid, event.revision)?
            .expect("just-written revision must be readable");
        for preprocessor in &self.preprocessors {
            preprocessor.on_modify(txn, entity_type, uid, &old, &new)?;
        }
        Ok(event)
    }

    /// Appends a tombstone revision and runs `on_delete` for every preprocessor.
    ///
    /// # Errors
    /// Returns [`PipelineError`] if the store write or any preprocessor
    /// fails; the transaction is aborted and nothing is committed.
    pub fn remove(
        &self,
        entity_type: EntityType,
        uid: Uid,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let txn = self.store.begin_write()?;
        match self.remove_in(&txn, entity_type, uid, replay_to_source) {
            Ok(event) => {
                txn.commit()?;
                Ok(event)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    fn remove_in(
        &self,
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        uid: Uid,
        replay_to_source: bool,
    ) -> Result<StoreEvent, PipelineError> {
        let old = EntityStore::read_latest_in(txn, entity_type, uid)?.ok_or(StoreError::NotFound)?;
        let event = EntityStore::remove_in(txn, entity_type, uid, replay_to_source)?;
        for preprocessor in &self.preprocessors {
            preprocessor.on_delete(txn, entity_type, uid, &old)?;
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DataStore;
    use pimsync_core::entity::Operation;

    fn properties(pairs: &[(&str, PropertyValue)]) -> Vec<u8> {
        let map: BTreeMap<String, PropertyValue> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        rmp_serde::to_vec_named(&map).unwrap()
    }

    fn temp_pipeline() -> (Pipeline, Arc<Index>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path().join("store.redb")).unwrap());
        let index = Arc::new(Index::new(store.clone()));
        let pipeline = Pipeline::new(store, vec![Arc::new(PropertyExtractor) as Arc<dyn Preprocessor>]);
        (pipeline, index, dir)
    }

    #[test]
    fn create_indexes_local_properties() {
        let (pipeline, index, _dir) = temp_pipeline();
        let local = properties(&[("subject", PropertyValue::Text("Hello".into()))]);
        let event = pipeline.create(EntityType::Mail, None, vec![], vec![], local, true).unwrap();
        assert_eq!(event.operation, Operation::Create);

        let found = index
            .lookup(EntityType::Mail, "subject", &PropertyValue::Text("Hello".into()))
            .unwrap();
        assert_eq!(found, vec![event.uid]);
    }

    #[test]
    fn modify_reindexes_changed_property_only() {
        let (pipeline, index, _dir) = temp_pipeline();
        let local_v1 = properties(&[
            ("subject", PropertyValue::Text("Draft".into())),
            ("flag", PropertyValue::Text("unread".into())),
        ]);
        let created = pipeline.create(EntityType::Mail, None, vec![], vec![], local_v1, true).unwrap();

        let local_v2 = properties(&[
            ("subject", PropertyValue::Text("Final".into())),
            ("flag", PropertyValue::Text("unread".into())),
        ]);
        pipeline
            .modify(EntityType::Mail, created.uid, vec![], vec![], local_v2, Some(created.revision), true)
            .unwrap();

        assert!(index
            .lookup(EntityType::Mail, "subject", &PropertyValue::Text("Draft".into()))
            .unwrap()
            .is_empty());
        assert_eq!(
            index
                .lookup(EntityType::Mail, "subject", &PropertyValue::Text("Final".into()))
                .unwrap(),
            vec![created.uid]
        );
        assert_eq!(
            index
                .lookup(EntityType::Mail, "flag", &PropertyValue::Text("unread".into()))
                .unwrap(),
            vec![created.uid]
        );
    }

    #[test]
    fn delete_removes_all_index_entries() {
        let (pipeline, index, _dir) = temp_pipeline();
        let local = properties(&[("subject", PropertyValue::Text("Bye".into()))]);
        let created = pipeline.create(EntityType::Mail, None, vec![], vec![], local, true).unwrap();
        pipeline.remove(EntityType::Mail, created.uid, true).unwrap();

        assert!(index
            .lookup(EntityType::Mail, "subject", &PropertyValue::Text("Bye".into()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn modify_on_missing_uid_is_storage_not_found() {
        let (pipeline, _index, _dir) = temp_pipeline();
        let err = pipeline
            .modify(EntityType::Mail, Uid::new_random(), vec![], vec![], vec![], None, true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(StoreError::NotFound)));
    }
}
