//! Durable FIFO message queue (spec.md §4.5) backed by one KV sub-database:
//! entries keyed by a monotonic 8-byte big-endian sequence number so the
//! lowest key is always the head of the queue, mirroring how
//! `EntityStore`'s revision chain uses a monotonic suffix for ordering but
//! applied to a queue instead of a revision history.

use crate::storage::{DataStore, StoreError};

/// One durable FIFO queue over a dedicated sub-database.
///
/// Used for both the synchronizer-produced command queue and the user
/// (client-submitted) command queue feeding `CommandProcessor` (spec.md §4.8),
/// and the replay queue feeding change-replay (spec.md §4.9).
pub struct MessageQueue {
    store: std::sync::Arc<DataStore>,
    table: String,
}

impl MessageQueue {
    /// `table` is the exact sub-database name (spec.md §6: `userqueue`,
    /// `synchronizerqueue`, `deadletter`) — callers pass the literal name
    /// rather than a suffix, so the on-disk table name matches the spec
    /// exactly instead of being derived from it.
    #[must_use]
    pub fn new(store: std::sync::Arc<DataStore>, table: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
        }
    }

    /// Returns a second handle onto the same underlying queue, sharing the
    /// store `Arc` so multiple owners (e.g. an enqueuing producer and the
    /// `CommandProcessor` that drains it) can hold independent handles.
    #[must_use]
    pub fn clone_handle(&self) -> Self {
        Self {
            store: self.store.clone(),
            table: self.table.clone(),
        }
    }

    /// Appends `payload` to the tail of the queue.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn enqueue(&self, payload: &[u8]) -> Result<u64, StoreError> {
        let txn = self.store.begin_write()?;
        let sequence = Self::next_sequence(&txn, &self.table)?;
        txn.put(&self.table, &sequence.to_be_bytes(), payload)?;
        txn.commit()?;
        Ok(sequence)
    }

    /// Returns the head entry without removing it, or `None` if empty.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn peek_front(&self) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let txn = self.store.begin_read()?;
        let mut head = None;
        txn.scan(&self.table, &[], |k, v| {
            head = Some((sequence_of(k), v.to_vec()));
            false
        })?;
        Ok(head)
    }

    /// Removes and returns the head entry, or `None` if empty.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn dequeue(&self) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let txn = self.store.begin_write()?;
        let mut head = None;
        txn.scan(&self.table, &[], |k, v| {
            head = Some((k.to_vec(), v.to_vec()));
            false
        })?;
        let Some((key, value)) = head else {
            return Ok(None);
        };
        txn.remove(&self.table, &key)?;
        txn.commit()?;
        Ok(Some((sequence_of(&key), value)))
    }

    /// Removes a specific entry by sequence number, e.g. to acknowledge a
    /// command that dispatched successfully (spec.md §4.6: "`dequeue(seq)`
    /// deletes the entry inside the caller's write transaction") or to drop
    /// one that lost a fairness race. Also clears any retry count recorded
    /// for this sequence by [`Self::record_failure`].
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn remove(&self, sequence: u64) -> Result<bool, StoreError> {
        let txn = self.store.begin_write()?;
        let removed = txn.remove(&self.table, &sequence.to_be_bytes())?;
        txn.remove(&self.retries_table(), &sequence.to_be_bytes())?;
        txn.commit()?;
        Ok(removed)
    }

    /// Records one more failed dispatch attempt for `sequence` and returns
    /// the new consecutive-failure count (spec.md §4.7: "fatally bad only
    /// after N consecutive identical failures"). The entry itself is left in
    /// place; the caller decides whether the returned count has crossed its
    /// retry budget and the entry should move to a dead-letter queue.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn record_failure(&self, sequence: u64) -> Result<u32, StoreError> {
        let txn = self.store.begin_write()?;
        let table = self.retries_table();
        let current = txn
            .get(&table, &sequence.to_be_bytes())?
            .map(|bytes| u32::from_be_bytes(bytes.try_into().unwrap_or([0; 4])))
            .unwrap_or(0);
        let next = current + 1;
        txn.put(&table, &sequence.to_be_bytes(), &next.to_be_bytes())?;
        txn.commit()?;
        Ok(next)
    }

    fn retries_table(&self) -> String {
        format!("{}.retries", self.table)
    }

    /// Returns the number of entries currently queued.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn available(&self) -> Result<u64, StoreError> {
        let txn = self.store.begin_read()?;
        let mut count = 0u64;
        txn.scan(&self.table, &[], |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    const SEQUENCE_META_TABLE_SUFFIX: &'static str = ".next_sequence";

    fn next_sequence(txn: &crate::storage::WriteTxn<'_>, table: &str) -> Result<u64, StoreError> {
        let meta_table = format!("{table}{}", Self::SEQUENCE_META_TABLE_SUFFIX);
        let current = txn
            .get(&meta_table, b"seq")?
            .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
            .unwrap_or(0);
        let next = current + 1;
        txn.put(&meta_table, b"seq", &next.to_be_bytes())?;
        Ok(next)
    }
}

fn sequence_of(key: &[u8]) -> u64 {
    u64::from_be_bytes(key.try_into().unwrap_or([0; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_queue(name: &str) -> (MessageQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path().join("store.redb")).unwrap());
        (MessageQueue::new(store, name), dir)
    }

    #[test]
    fn enqueue_dequeue_preserves_fifo_order() {
        let (queue, _dir) = temp_queue("user");
        queue.enqueue(b"first").unwrap();
        queue.enqueue(b"second").unwrap();
        queue.enqueue(b"third").unwrap();

        let (_, first) = queue.dequeue().unwrap().unwrap();
        let (_, second) = queue.dequeue().unwrap().unwrap();
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
        assert_eq!(queue.available().unwrap(), 1);
    }

    #[test]
    fn peek_does_not_remove() {
        let (queue, _dir) = temp_queue("sync");
        queue.enqueue(b"only").unwrap();
        let (seq, payload) = queue.peek_front().unwrap().unwrap();
        assert_eq!(payload, b"only");
        assert_eq!(queue.peek_front().unwrap().unwrap().0, seq);
        assert_eq!(queue.available().unwrap(), 1);
    }

    #[test]
    fn dequeue_on_empty_queue_is_none() {
        let (queue, _dir) = temp_queue("empty");
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn separate_named_queues_do_not_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::open(dir.path().join("store.redb")).unwrap());
        let user_queue = MessageQueue::new(store.clone(), "user");
        let sync_queue = MessageQueue::new(store, "sync");

        user_queue.enqueue(b"user-command").unwrap();
        assert_eq!(sync_queue.available().unwrap(), 0);
        assert_eq!(user_queue.available().unwrap(), 1);
    }

    #[test]
    fn remove_drops_arbitrary_entry() {
        let (queue, _dir) = temp_queue("replay");
        let seq = queue.enqueue(b"doomed").unwrap();
        queue.enqueue(b"survivor").unwrap();
        assert!(queue.remove(seq).unwrap());

        let (_, remaining) = queue.dequeue().unwrap().unwrap();
        assert_eq!(remaining, b"survivor");
    }

    #[test]
    fn record_failure_counts_consecutively_and_resets_on_remove() {
        let (queue, _dir) = temp_queue("dlq-source");
        let seq = queue.enqueue(b"flaky").unwrap();
        assert_eq!(queue.record_failure(seq).unwrap(), 1);
        assert_eq!(queue.record_failure(seq).unwrap(), 2);
        assert!(queue.remove(seq).unwrap());

        let seq = queue.enqueue(b"flaky-again").unwrap();
        assert_eq!(queue.record_failure(seq).unwrap(), 1);
    }

    #[test]
    fn peek_then_remove_is_a_non_destructive_ack_cycle() {
        let (queue, _dir) = temp_queue("ack");
        queue.enqueue(b"one").unwrap();
        let (seq, payload) = queue.peek_front().unwrap().unwrap();
        assert_eq!(payload, b"one");
        assert_eq!(queue.available().unwrap(), 1);
        assert!(queue.remove(seq).unwrap());
        assert_eq!(queue.available().unwrap(), 0);
    }
}
