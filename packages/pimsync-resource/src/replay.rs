//! Writes locally-committed revisions back to the remote source (spec.md
//! §4.10), the Rust shape of `Sink::ChangeReplay`/`SourceWriteBack`
//! (`original_source/common/sourcewriteback.h`): a persisted
//! `lastReplayedRevision` checkpoint, a walk of every revision since that
//! checkpoint in global revision order, and a per-type writeback call for
//! each one marked `replay_to_source=true`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pimsync_core::entity::{EntityType, Operation, Uid};

use crate::entity::EntityStore;
use crate::remoteid::RemoteIdMap;
use crate::storage::{DataStore, StoreError};
use crate::sync::adapter::{AdapterError, Writeback};

const CHECKPOINT_TABLE: &str = "__internal.replay";
const LAST_REPLAYED_REVISION_KEY: &[u8] = b"last_replayed_revision";

/// Initial retry delay after a writeback failure (spec.md §4.10).
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Upper bound the backoff doubles toward but never exceeds.
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("failed to decode stored local properties: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("revision log named a revision with no stored entity buffer")]
    MissingBuffer,
    #[error("writeback failed for {entity_type} {uid} at revision {revision}: {source}")]
    Writeback {
        entity_type: EntityType,
        uid: Uid,
        revision: u64,
        #[source]
        source: AdapterError,
    },
}

/// One completed pass over the pending revision range.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Nothing past the checkpoint was waiting to be replayed.
    UpToDate,
    /// Replayed every pending revision; `lastReplayedRevision` now equals
    /// the store's max revision.
    Drained(usize),
}

/// Per-resource change-replay loop: advances `lastReplayedRevision` by one
/// writeback call at a time, stopping at (and not advancing past) the first
/// failure so out-of-order replay of a later revision for the same entity
/// can never happen.
pub struct ChangeReplay {
    entities: Arc<EntityStore>,
    remote_ids: Arc<RemoteIdMap>,
    writeback: Arc<dyn Writeback>,
    store: Arc<DataStore>,
}

impl ChangeReplay {
    #[must_use]
    pub fn new(
        entities: Arc<EntityStore>,
        remote_ids: Arc<RemoteIdMap>,
        writeback: Arc<dyn Writeback>,
        store: Arc<DataStore>,
    ) -> Self {
        Self {
            entities,
            remote_ids,
            writeback,
            store,
        }
    }

    /// Returns the persisted checkpoint, `0` if change-replay has never run.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn last_replayed_revision(&self) -> Result<u64, StoreError> {
        let txn = self.store.begin_read()?;
        Ok(txn
            .get(CHECKPOINT_TABLE, LAST_REPLAYED_REVISION_KEY)?
            .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
            .unwrap_or(0))
    }

    fn advance_checkpoint(&self, revision: u64) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        txn.put(CHECKPOINT_TABLE, LAST_REPLAYED_REVISION_KEY, &revision.to_be_bytes())?;
        txn.commit()
    }

    /// Replays every revision in `(lastReplayedRevision, maxRevision]`, in
    /// global revision order, stopping at the first writeback failure
    /// without advancing the checkpoint past it (step 5, spec.md §4.10).
    ///
    /// # Errors
    /// Returns [`ReplayError::Writeback`] on the first failed writeback, or
    /// a storage/decode error if the store itself is unreadable.
    pub async fn replay_pending(&self) -> Result<ReplayOutcome, ReplayError> {
        let last = self.last_replayed_revision()?;
        let max = self.entities.max_revision()?;
        if max <= last {
            return Ok(ReplayOutcome::UpToDate);
        }

        let mut pending = Vec::new();
        self.entities
            .scan_global_revisions(last, max, |entity_type, uid, revision, operation, replay_to_source| {
                if replay_to_source {
                    pending.push((entity_type, uid, revision, operation));
                }
                true
            })?;

        // The checkpoint, not a per-revision flag, is the only record of
        // replay progress (spec.md §4.5 forbids rewriting a committed
        // revision). It advances after each successful writeback so a retry
        // following a mid-batch failure resumes exactly after the last
        // success instead of replaying already-written-back revisions again.
        let mut replayed = 0;
        for (entity_type, uid, revision, operation) in pending {
            self.replay_one(entity_type, uid, revision, operation).await?;
            self.advance_checkpoint(revision)?;
            replayed += 1;
        }
        // Revisions in the scanned range with replay_to_source=false were
        // never pending, so the checkpoint can advance past them too.
        self.advance_checkpoint(max)?;
        Ok(ReplayOutcome::Drained(replayed))
    }

    async fn replay_one(
        &self,
        entity_type: EntityType,
        uid: Uid,
        revision: u64,
        operation: Operation,
    ) -> Result<(), ReplayError> {
        let buffer = self
            .entities
            .read_at(entity_type, uid, revision)?
            .ok_or(ReplayError::MissingBuffer)?;
        let properties: BTreeMap<String, pimsync_core::value::PropertyValue> = if buffer.local.is_empty() {
            BTreeMap::new()
        } else {
            rmp_serde::from_slice(&buffer.local)?
        };
        let old_remote_id = self.remote_ids.resolve_local_id(entity_type, uid)?;

        let result = self
            .writeback
            .replay(entity_type, operation, &properties, &buffer.resource, old_remote_id.as_deref())
            .await;

        match result {
            Ok(new_remote_id) => {
                match operation {
                    Operation::Delete => self.remote_ids.unbind(entity_type, uid)?,
                    Operation::Create | Operation::Modify => {
                        if let Some(remote_id) = new_remote_id.or(old_remote_id) {
                            self.remote_ids.rebind(entity_type, uid, &remote_id)?;
                        }
                    }
                }
                Ok(())
            }
            Err(source) => Err(ReplayError::Writeback {
                entity_type,
                uid,
                revision,
                source,
            }),
        }
    }

    /// Runs [`Self::replay_pending`] in a loop until `shutdown` fires,
    /// backing off exponentially (starting at 1 s, capped at 5 min) after
    /// each failure and resetting to the initial delay after any successful
    /// pass, mirroring the retry posture `topgun-server`'s long-running
    /// background tasks use around their own fallible steps.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                result = self.replay_pending() => {
                    match result {
                        Ok(_) => {
                            backoff = INITIAL_BACKOFF;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, delay_secs = backoff.as_secs(), "change-replay writeback failed, backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }
}
