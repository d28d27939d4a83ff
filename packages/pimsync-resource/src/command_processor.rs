//! Drains the synchronizer and user command queues into the pipeline
//! (spec.md §4.8), the Rust shape of `GenericResource::processAllMessages`:
//! two named `MessageQueue`s (`mSynchronizerQueue`/`mUserQueue` in
//! `original_source/common/genericresource.h`) drained with the
//! synchronizer queue favored for fairness, since synchronizer-produced
//! commands must not starve behind a backlog of client writes.

use std::sync::Arc;

use pimsync_core::command::{CommandFrame, CommandId, FrameError};
use pimsync_core::payload::{CommandPayload, MutationPayload};

use crate::pipeline::{Pipeline, PipelineError};
use crate::queue::MessageQueue;
use crate::storage::StoreError;

/// Number of synchronizer-queue commands drained before a single user-queue
/// command gets a turn, so a synchronization burst cannot starve user writes
/// indefinitely but still drains ahead of them under contention.
const SYNC_QUEUE_FAIRNESS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed command payload: {0}")]
    Payload(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Queue(#[from] StoreError),
    #[error("command frame carries no payload for {0:?}")]
    MissingUid(CommandId),
}

/// Handles a decoded `Synchronize` command. Implemented by
/// [`crate::sync::Synchronizer`]; kept as a trait here so `CommandProcessor`
/// doesn't need a dependency on the synchronizer's own remote-adapter types.
pub trait SynchronizeHandler: Send + Sync {
    fn handle(&self, query: pimsync_core::payload::SynchronizeQuery) -> Result<(), ProcessorError>;
}

/// What one drained command caused to happen, surfaced for logging/tests.
#[derive(Debug)]
pub enum Outcome {
    Mutated,
    Synchronized,
    Ping,
    Shutdown,
}

pub struct CommandProcessor {
    pipeline: Arc<Pipeline>,
    sync_queue: MessageQueue,
    user_queue: MessageQueue,
    dead_letter: MessageQueue,
    retry_budget: u32,
    synchronize_handler: Option<Arc<dyn SynchronizeHandler>>,
}

impl CommandProcessor {
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline>,
        sync_queue: MessageQueue,
        user_queue: MessageQueue,
        dead_letter: MessageQueue,
        retry_budget: u32,
        synchronize_handler: Option<Arc<dyn SynchronizeHandler>>,
    ) -> Self {
        Self {
            pipeline,
            sync_queue,
            user_queue,
            dead_letter,
            retry_budget,
            synchronize_handler,
        }
    }

    /// Drains up to [`SYNC_QUEUE_FAIRNESS`] synchronizer commands, then at
    /// most one user command. Returns the outcomes of everything processed,
    /// in drain order; an empty result means both queues were empty.
    ///
    /// Each entry is peeked, dispatched, and only deleted from its queue
    /// after the pipeline commit succeeds (spec.md §4.6's
    /// peek-dispatch-then-`dequeue(seq)` contract): a crash between enqueue
    /// and pipeline commit leaves the entry to be retried on restart, rather
    /// than losing it to a destructive dequeue-before-dispatch.
    ///
    /// # Errors
    /// Returns the first [`ProcessorError`] encountered from a command still
    /// within its retry budget; that command's entry stays at the head of
    /// its queue for the next call. Commands that exhaust
    /// [`Self::retry_budget`] are moved to the dead-letter queue instead of
    /// propagating an error, and draining continues past them.
    pub fn run_once(&self) -> Result<Vec<Outcome>, ProcessorError> {
        let mut outcomes = Vec::new();
        for _ in 0..SYNC_QUEUE_FAIRNESS {
            match self.drain_one(&self.sync_queue)? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        if let Some(outcome) = self.drain_one(&self.user_queue)? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Peeks the head of `queue`, dispatches it, and only then deletes it
    /// (spec.md §4.6, §4.7). On a recoverable failure below
    /// [`Self::retry_budget`], the entry is left in place and the error
    /// propagates so the caller stops draining this queue. Once the budget
    /// is exhausted the entry is moved to the dead-letter queue with its
    /// failure reason and draining moves on to the next entry.
    fn drain_one(&self, queue: &MessageQueue) -> Result<Option<Outcome>, ProcessorError> {
        loop {
            let Some((sequence, payload)) = queue.peek_front()? else {
                return Ok(None);
            };
            match self.dispatch(&payload) {
                Ok(outcome) => {
                    queue.remove(sequence)?;
                    return Ok(Some(outcome));
                }
                Err(err) => {
                    let attempts = queue.record_failure(sequence)?;
                    if attempts < self.retry_budget {
                        return Err(err);
                    }
                    tracing::warn!(
                        error = %err,
                        attempts,
                        "command exhausted its retry budget, moving to dead-letter queue"
                    );
                    self.dead_letter.enqueue(&dead_letter_payload(&payload, &err))?;
                    queue.remove(sequence)?;
                }
            }
        }
    }

    fn dispatch(&self, bytes: &[u8]) -> Result<Outcome, ProcessorError> {
        let frame = CommandFrame::decode(bytes)?;
        let payload = CommandPayload::decode(&frame.payload)?;
        match payload {
            CommandPayload::Ping => Ok(Outcome::Ping),
            CommandPayload::Shutdown => Ok(Outcome::Shutdown),
            CommandPayload::Synchronize(query) => {
                if let Some(handler) = &self.synchronize_handler {
                    handler.handle(query)?;
                }
                Ok(Outcome::Synchronized)
            }
            CommandPayload::Mutate(mutation) => {
                self.dispatch_mutation(frame.command_id(), mutation)?;
                Ok(Outcome::Mutated)
            }
        }
    }

    fn dispatch_mutation(
        &self,
        command_id: CommandId,
        mutation: MutationPayload,
    ) -> Result<(), ProcessorError> {
        let local = rmp_serde::to_vec_named(&mutation.properties)
            .expect("PropertyValue encoding cannot fail");
        match command_id {
            CommandId::CreateEntity => {
                self.pipeline.create(
                    mutation.entity_type,
                    mutation.uid,
                    mutation.resource_buffer,
                    Vec::new(),
                    local,
                    mutation.replay_to_source,
                )?;
            }
            CommandId::ModifyEntity => {
                let uid = mutation.uid.ok_or(ProcessorError::MissingUid(command_id))?;
                self.pipeline.modify(
                    mutation.entity_type,
                    uid,
                    mutation.resource_buffer,
                    Vec::new(),
                    local,
                    mutation.expected_previous_revision,
                    mutation.replay_to_source,
                )?;
            }
            CommandId::DeleteEntity => {
                let uid = mutation.uid.ok_or(ProcessorError::MissingUid(command_id))?;
                self.pipeline
                    .remove(mutation.entity_type, uid, mutation.replay_to_source)?;
            }
            other => return Err(ProcessorError::MissingUid(other)),
        }
        Ok(())
    }
}

/// Dead-letter entry layout: `reason_len:u32 | reason (utf-8) | original frame bytes`,
/// so an operator inspecting the dead-letter queue can recover both why a
/// command was dropped and the exact command that was dropped.
fn dead_letter_payload(original_frame: &[u8], err: &ProcessorError) -> Vec<u8> {
    let reason = err.to_string();
    let reason_bytes = reason.as_bytes();
    let mut out = Vec::with_capacity(4 + reason_bytes.len() + original_frame.len());
    out.extend_from_slice(&(reason_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(reason_bytes);
    out.extend_from_slice(original_frame);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PropertyExtractor;
    use crate::storage::DataStore;
    use pimsync_core::entity::EntityType;
    use pimsync_core::value::PropertyValue;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn create_command(entity_type: EntityType, subject: &str) -> Vec<u8> {
        let mut properties = BTreeMap::new();
        properties.insert("subject".to_string(), PropertyValue::Text(subject.to_string()));
        let payload = CommandPayload::Mutate(MutationPayload {
            entity_type,
            uid: None,
            properties,
            resource_buffer: Vec::new(),
            expected_previous_revision: None,
            replay_to_source: true,
        });
        CommandFrame::new(1, CommandId::CreateEntity, payload.encode().unwrap()).encode()
    }

    const TEST_RETRY_BUDGET: u32 = 3;

    fn build_processor(
        dir: &std::path::Path,
    ) -> (CommandProcessor, MessageQueue, MessageQueue, MessageQueue) {
        let store = Arc::new(DataStore::open(dir.join("store.redb")).unwrap());
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            vec![Arc::new(PropertyExtractor) as Arc<dyn crate::pipeline::Preprocessor>],
        ));
        let sync_queue = MessageQueue::new(store.clone(), "synchronizerqueue");
        let user_queue = MessageQueue::new(store.clone(), "userqueue");
        let dead_letter = MessageQueue::new(store, "deadletter");
        let processor = CommandProcessor::new(
            pipeline,
            sync_queue.clone_handle(),
            user_queue.clone_handle(),
            dead_letter.clone_handle(),
            TEST_RETRY_BUDGET,
            None,
        );
        (processor, sync_queue, user_queue, dead_letter)
    }

    #[test]
    fn create_command_mutates_through_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _sync_queue, user_queue, _dead_letter) = build_processor(dir.path());

        user_queue.enqueue(&create_command(EntityType::Mail, "Hello")).unwrap();
        let outcomes = processor.run_once().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Outcome::Mutated));
    }

    #[test]
    fn sync_queue_drains_before_user_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path().join("store.redb")).unwrap());
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            vec![Arc::new(PropertyExtractor) as Arc<dyn crate::pipeline::Preprocessor>],
        ));
        let sync_queue = MessageQueue::new(store.clone(), "synchronizerqueue");
        let user_queue = MessageQueue::new(store.clone(), "userqueue");
        let dead_letter = MessageQueue::new(store, "deadletter");
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Recorder(Arc<Mutex<Vec<&'static str>>>, &'static str);
        impl SynchronizeHandler for Recorder {
            fn handle(&self, _query: pimsync_core::payload::SynchronizeQuery) -> Result<(), ProcessorError> {
                self.0.lock().unwrap().push(self.1);
                Ok(())
            }
        }

        let processor = CommandProcessor::new(
            pipeline,
            sync_queue.clone_handle(),
            user_queue.clone_handle(),
            dead_letter.clone_handle(),
            TEST_RETRY_BUDGET,
            Some(Arc::new(Recorder(order.clone(), "sync"))),
        );

        let sync_cmd = CommandFrame::new(
            1,
            CommandId::Synchronize,
            CommandPayload::Synchronize(Default::default()).encode().unwrap(),
        )
        .encode();
        user_queue.enqueue(&create_command(EntityType::Mail, "user-first")).unwrap();
        sync_queue.enqueue(&sync_cmd).unwrap();

        let outcomes = processor.run_once().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], Outcome::Synchronized));
        assert!(matches!(outcomes[1], Outcome::Mutated));
    }

    #[test]
    fn empty_queues_produce_no_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _sync, _user, _dead_letter) = build_processor(dir.path());
        assert!(processor.run_once().unwrap().is_empty());
    }

    #[test]
    fn modify_without_uid_is_rejected_and_stays_queued_below_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _sync_queue, user_queue, dead_letter) = build_processor(dir.path());

        let payload = CommandPayload::Mutate(MutationPayload {
            entity_type: EntityType::Mail,
            uid: None,
            properties: BTreeMap::new(),
            resource_buffer: Vec::new(),
            expected_previous_revision: None,
            replay_to_source: true,
        });
        let frame = CommandFrame::new(1, CommandId::ModifyEntity, payload.encode().unwrap()).encode();
        user_queue.enqueue(&frame).unwrap();

        let err = processor.run_once().unwrap_err();
        assert!(matches!(err, ProcessorError::MissingUid(CommandId::ModifyEntity)));
        // Below the retry budget: the entry is neither dropped nor dead-lettered.
        assert_eq!(user_queue.available().unwrap(), 1);
        assert_eq!(dead_letter.available().unwrap(), 0);
    }

    #[test]
    fn command_moves_to_dead_letter_after_exhausting_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _sync_queue, user_queue, dead_letter) = build_processor(dir.path());

        let payload = CommandPayload::Mutate(MutationPayload {
            entity_type: EntityType::Mail,
            uid: None,
            properties: BTreeMap::new(),
            resource_buffer: Vec::new(),
            expected_previous_revision: None,
            replay_to_source: true,
        });
        let frame = CommandFrame::new(1, CommandId::ModifyEntity, payload.encode().unwrap()).encode();
        user_queue.enqueue(&frame).unwrap();

        for _ in 0..TEST_RETRY_BUDGET - 1 {
            assert!(processor.run_once().is_err());
            assert_eq!(user_queue.available().unwrap(), 1);
        }
        // The budget-th failure dead-letters the entry instead of erroring.
        assert!(processor.run_once().unwrap().is_empty());
        assert_eq!(user_queue.available().unwrap(), 0);
        assert_eq!(dead_letter.available().unwrap(), 1);
    }
}
