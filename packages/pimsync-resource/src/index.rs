//! Secondary property indexes (spec.md §4.3): one multimap sub-database per
//! indexed `(entity type, property)` pair, keyed by
//! [`PropertyValue::to_index_bytes`], mapping back to the uids whose current
//! revision carries that value. Mirrors the index-maintenance half of
//! `topgun-server::storage::engine::StorageEngine`, generalized from its
//! fixed CRDT key index to an arbitrary named property per entity type.

use pimsync_core::entity::{EntityType, Uid};
use pimsync_core::value::PropertyValue;

use crate::storage::{DataStore, StoreError, WriteTxn};

fn index_table(entity_type: EntityType, property: &str) -> String {
    format!("{entity_type}.index.{property}")
}

/// Maintains `property value -> uid` lookups for one resource's entities.
///
/// Index entries are eventually consistent with [`crate::entity::EntityStore`]:
/// callers are expected to call [`Index::add`]/[`Index::remove`] in the same
/// write transaction that appends the entity revision driving the change.
pub struct Index {
    store: std::sync::Arc<DataStore>,
}

impl Index {
    #[must_use]
    pub fn new(store: std::sync::Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Records that `uid` currently has `value` for `property`.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn add(
        &self,
        entity_type: EntityType,
        property: &str,
        value: &PropertyValue,
        uid: Uid,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        Self::add_in(&txn, entity_type, property, value, uid)?;
        txn.commit()
    }

    /// Same as [`Self::add`], against a caller-supplied write transaction so
    /// index maintenance commits atomically with the entity revision driving
    /// it (spec.md §4.3, §4.7). See [`crate::entity::EntityStore::create_in`].
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn add_in(
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        property: &str,
        value: &PropertyValue,
        uid: Uid,
    ) -> Result<(), StoreError> {
        txn.multimap_add(
            &index_table(entity_type, property),
            &value.to_index_bytes(),
            uid.as_bytes(),
        )
    }

    /// Removes the `uid` association for `property = value`, e.g. before
    /// writing the entity's next revision with a changed property.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn remove(
        &self,
        entity_type: EntityType,
        property: &str,
        value: &PropertyValue,
        uid: Uid,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        Self::remove_in(&txn, entity_type, property, value, uid)?;
        txn.commit()
    }

    /// Same as [`Self::remove`], against a caller-supplied write
    /// transaction. See [`Self::add_in`].
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn remove_in(
        txn: &WriteTxn<'_>,
        entity_type: EntityType,
        property: &str,
        value: &PropertyValue,
        uid: Uid,
    ) -> Result<(), StoreError> {
        txn.multimap_remove(
            &index_table(entity_type, property),
            &value.to_index_bytes(),
            uid.as_bytes(),
        )?;
        Ok(())
    }

    /// Returns every uid currently indexed under `property = value`.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn lookup(
        &self,
        entity_type: EntityType,
        property: &str,
        value: &PropertyValue,
    ) -> Result<Vec<Uid>, StoreError> {
        let txn = self.store.begin_read()?;
        let raw = txn.multimap_get(&index_table(entity_type, property), &value.to_index_bytes())?;
        Ok(raw
            .into_iter()
            .filter_map(|bytes| <[u8; 16]>::try_from(bytes).ok())
            .map(Uid::from_bytes)
            .collect())
    }
}
