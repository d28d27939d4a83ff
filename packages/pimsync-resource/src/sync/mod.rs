//! Remote-to-local reconciliation (spec.md §4.9), the Rust shape of
//! `Sink::Synchronizer`: fetches remote state through a [`RemoteAdapter`],
//! diffs it against what's already stored via [`RemoteIdMap`]/[`EntityStore`],
//! and emits synthetic commands onto the synchronizer queue rather than
//! writing straight to the pipeline, so those commands drain through the
//! same fairness-gated [`crate::command_processor::CommandProcessor`] path
//! as user commands.

pub mod adapter;

use std::collections::{BTreeMap, HashSet};

use pimsync_core::command::{CommandFrame, CommandId};
use pimsync_core::entity::{EntityType, Uid};
use pimsync_core::payload::{CommandPayload, MutationPayload};
use pimsync_core::value::PropertyValue;

use crate::entity::EntityStore;
use crate::index::Index;
use crate::queue::MessageQueue;
use crate::remoteid::{RemoteIdMap, RemoteIdResolution};
use crate::storage::StoreError;
use adapter::{AdapterError, RemoteAdapter, RemoteItem};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("failed to encode synthetic command: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode stored local properties: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Criterion used to merge a remote item with an existing local entity that
/// has no remote-id binding yet, e.g. a folder matched by its display name
/// before any sync has run. `None` means every remote item with no existing
/// binding is a local `Create`.
pub struct MergeCriteria<'a> {
    pub property: &'a str,
    pub value: &'a PropertyValue,
}

/// Drives one entity type's remote reconciliation against one
/// [`RemoteAdapter`], pushing synthetic commands to a synchronizer queue.
pub struct Synchronizer {
    adapter: std::sync::Arc<dyn RemoteAdapter>,
    remote_ids: std::sync::Arc<RemoteIdMap>,
    index: std::sync::Arc<Index>,
    entities: std::sync::Arc<EntityStore>,
    sync_queue: MessageQueue,
    next_message_id: std::sync::atomic::AtomicI32,
}

impl Synchronizer {
    #[must_use]
    pub fn new(
        adapter: std::sync::Arc<dyn RemoteAdapter>,
        remote_ids: std::sync::Arc<RemoteIdMap>,
        index: std::sync::Arc<Index>,
        entities: std::sync::Arc<EntityStore>,
        sync_queue: MessageQueue,
    ) -> Self {
        Self {
            adapter,
            remote_ids,
            index,
            entities,
            sync_queue,
            next_message_id: std::sync::atomic::AtomicI32::new(1),
        }
    }

    /// Top-level reconciliation job for `entity_type` (spec.md §4.9): fetches
    /// every remote item, reconciles each via [`Self::create_or_modify`],
    /// then drops local entities no longer present on the source via
    /// [`Self::scan_for_removals`].
    ///
    /// Folders must be synchronized before the item types they contain so
    /// their uids are resolvable when items reference them (spec.md §4.9's
    /// ordering guarantee) — the caller is responsible for calling this once
    /// per type in that order.
    ///
    /// # Errors
    /// Returns [`SyncError`] if the adapter fetch, store read, or queue
    /// write fails.
    pub async fn synchronize_with_source(
        &self,
        entity_type: EntityType,
        merge_criteria: Option<MergeCriteria<'_>>,
    ) -> Result<(), SyncError> {
        let items = self.adapter.fetch_items(entity_type).await?;
        for item in &items {
            self.create_or_modify(entity_type, item, merge_criteria.as_ref())?;
        }
        let still_present: HashSet<Vec<u8>> = items.iter().map(|i| i.remote_id.clone()).collect();
        self.scan_for_removals(entity_type, |remote_id| still_present.contains(remote_id))?;
        Ok(())
    }

    /// Resolves `item.remote_id` to a local uid (allocating or merging if
    /// needed) and enqueues a synthetic Create/Modify command if the local
    /// state doesn't already match the remote item (spec.md §4.9). Produces
    /// no command when the properties already match, making repeated calls
    /// with an unchanged remote idempotent.
    ///
    /// # Errors
    /// Propagates storage or queue-encoding failures.
    pub fn create_or_modify(
        &self,
        entity_type: EntityType,
        item: &RemoteItem,
        merge_criteria: Option<&MergeCriteria<'_>>,
    ) -> Result<(), SyncError> {
        // One atomic call resolves an already-bound remote id to its uid, or
        // allocates and binds a fresh one if this remote id has never been
        // seen before (spec.md §4.4) — no separate read-then-write race.
        let uid = match self.remote_ids.resolve_remote_id(entity_type, &item.remote_id)? {
            RemoteIdResolution::Existing(uid) => uid,
            RemoteIdResolution::Allocated(fresh_uid) => {
                let merged = merge_criteria
                    .and_then(|c| self.index.lookup(entity_type, c.property, c.value).ok())
                    .and_then(|uids| uids.into_iter().next());
                match merged {
                    Some(uid) => {
                        self.remote_ids.rebind(entity_type, uid, &item.remote_id)?;
                        uid
                    }
                    None => {
                        return self.enqueue_mutation(
                            entity_type,
                            CommandId::CreateEntity,
                            Some(fresh_uid),
                            item.properties.clone(),
                            item.resource_buffer.clone(),
                            None,
                        );
                    }
                }
            }
        };

        if self.current_properties(entity_type, uid)?.as_ref() == Some(&item.properties) {
            return Ok(());
        }
        self.enqueue_mutation(
            entity_type,
            CommandId::ModifyEntity,
            Some(uid),
            item.properties.clone(),
            item.resource_buffer.clone(),
            None,
        )
    }

    /// Drops every local uid of `entity_type` the remote no longer reports,
    /// per `still_exists` (spec.md §4.9).
    ///
    /// # Errors
    /// Propagates storage or queue-encoding failures.
    pub fn scan_for_removals(
        &self,
        entity_type: EntityType,
        still_exists: impl Fn(&[u8]) -> bool,
    ) -> Result<(), SyncError> {
        for (uid, remote_id) in self.remote_ids.all_bindings(entity_type)? {
            if !still_exists(&remote_id) {
                // Unbind eagerly, symmetric with create_or_modify's eager
                // rebind: the remote already dropped this item, so there is
                // nothing for ChangeReplay to write back and no binding
                // should survive the tombstone.
                self.remote_ids.unbind(entity_type, uid)?;
                self.enqueue_mutation(
                    entity_type,
                    CommandId::DeleteEntity,
                    Some(uid),
                    BTreeMap::new(),
                    Vec::new(),
                    None,
                )?;
            }
        }
        Ok(())
    }

    /// Decodes the currently stored local properties for `uid`, or `None` if
    /// the entity doesn't exist yet (e.g. its synthetic Create is still
    /// sitting unprocessed in the synchronizer queue).
    fn current_properties(
        &self,
        entity_type: EntityType,
        uid: Uid,
    ) -> Result<Option<BTreeMap<String, PropertyValue>>, SyncError> {
        let Some(buffer) = self.entities.read_latest(entity_type, uid)? else {
            return Ok(None);
        };
        if buffer.local.is_empty() {
            return Ok(Some(BTreeMap::new()));
        }
        Ok(Some(rmp_serde::from_slice(&buffer.local)?))
    }

    fn enqueue_mutation(
        &self,
        entity_type: EntityType,
        command_id: CommandId,
        uid: Option<Uid>,
        properties: BTreeMap<String, PropertyValue>,
        resource_buffer: Vec<u8>,
        expected_previous_revision: Option<u64>,
    ) -> Result<(), SyncError> {
        let payload = CommandPayload::Mutate(MutationPayload {
            entity_type,
            uid,
            properties,
            resource_buffer,
            expected_previous_revision,
            replay_to_source: false,
        });
        let message_id = self
            .next_message_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let frame = CommandFrame::new(message_id, command_id, payload.encode()?);
        self.sync_queue.enqueue(&frame.encode())?;
        Ok(())
    }
}
