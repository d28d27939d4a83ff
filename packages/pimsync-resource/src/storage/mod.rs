//! Transactional key/value storage (spec.md §4.1): a thin MVCC wrapper over
//! `redb`, mirroring the shape of `topgun-server::storage::engine::StorageEngine`
//! but replacing its single fixed table set with runtime-named sub-databases,
//! since every entity type and resource gets its own `<type>.main`,
//! `<type>.index.<property>` and similar tables (spec.md §3).

pub mod error;

use std::ops::Bound;
use std::path::Path;

use redb::{Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable,
    ReadableTable, TableDefinition, TableError, WriteTransaction};

pub use error::StoreError;

type KV<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;
type MultiKV<'a> = MultimapTableDefinition<'a, &'static [u8], &'static [u8]>;

fn table_def(name: &str) -> KV<'_> {
    TableDefinition::new(name)
}

fn multimap_def(name: &str) -> MultiKV<'_> {
    MultimapTableDefinition::new(name)
}

/// Computes the exclusive upper bound of a byte-string prefix range, i.e. the
/// smallest key that is strictly greater than every key starting with `prefix`.
/// Returns `None` when `prefix` is all `0xFF` bytes (no finite upper bound).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last != 0xFF {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// The embedded, ACID, single-writer/multi-reader store backing one resource
/// process's entire on-disk state: entity revisions, indexes, the remote id
/// map, and the durable message queues.
///
/// `db` sits behind a `RwLock` purely so [`Self::compact`] can get exclusive
/// access without taking `&mut self` on the shared `Arc<DataStore>` every
/// component holds: [`Self::begin_read`]/[`Self::begin_write`] only take the
/// shared (read) side for the instant it takes to start the transaction —
/// the returned `ReadTransaction`/`WriteTransaction` don't borrow the guard,
/// so readers and writers are never blocked by each other or by one
/// another's open transactions, only by an in-progress compaction sweep.
pub struct DataStore {
    db: parking_lot::RwLock<Database>,
}

impl DataStore {
    /// Opens (creating if absent) the store at `path`.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file cannot be created or is corrupted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Ok(Self { db: parking_lot::RwLock::new(db) })
    }

    /// Begins a read-only snapshot transaction. Readers never block writers
    /// and vice versa (spec.md §4.1, §5).
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O failure acquiring the snapshot.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>, StoreError> {
        Ok(ReadTxn {
            inner: self.db.read().begin_read()?,
            _marker: std::marker::PhantomData,
        })
    }

    /// Begins the single concurrent write transaction. A second call from
    /// another task blocks until the first commits or aborts.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O failure acquiring the transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>, StoreError> {
        Ok(WriteTxn {
            inner: self.db.read().begin_write()?,
            _marker: std::marker::PhantomData,
        })
    }

    /// Reclaims space freed by deleted/superseded revisions by compacting
    /// the backing file (spec.md §9, compaction sweep). Blocks until no
    /// transaction is mid-acquisition, then fails gracefully (returning
    /// `Ok(false)`) rather than corrupting the store if redb reports the
    /// database still has transactions open.
    ///
    /// # Errors
    /// Returns [`StoreError`] if compaction fails for a reason other than
    /// the store being in use.
    pub fn compact(&self) -> Result<bool, StoreError> {
        self.db.write().compact().map_err(|e| StoreError::Corruption(e.to_string()))
    }
}

/// A read-only snapshot: consistent point-in-time view across all sub-databases.
pub struct ReadTxn<'db> {
    inner: ReadTransaction,
    _marker: std::marker::PhantomData<&'db Database>,
}

impl<'db> ReadTxn<'db> {
    pub fn get(&self, sub_db: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = match self.inner.open_table(table_def(sub_db)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Visits every `(key, value)` pair whose key starts with `prefix`, in
    /// ascending key order, until `visitor` returns `false`.
    pub fn scan(
        &self,
        sub_db: &str,
        prefix: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        let table = match self.inner.open_table(table_def(sub_db)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let upper = prefix_upper_bound(prefix);
        let range = match &upper {
            Some(end) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))?,
            None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded))?,
        };
        for entry in range {
            let (k, v) = entry?;
            if !visitor(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Returns the highest key/value pair whose key starts with `prefix`,
    /// without scanning the rest of the range (used by
    /// [`crate::entity::store::EntityStore`] to find an entity's latest
    /// revision in O(log n) rather than walking its whole revision chain).
    pub fn scan_last(
        &self,
        sub_db: &str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let table = match self.inner.open_table(table_def(sub_db)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let upper = prefix_upper_bound(prefix);
        let mut range = match &upper {
            Some(end) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))?,
            None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded))?,
        };
        let result = match range.next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Some((k.value().to_vec(), v.value().to_vec()))
            }
            None => None,
        };
        Ok(result)
    }

    /// Visits every `(key, value)` pair with `start_inclusive <= key <=
    /// end_inclusive`, in ascending key order, until `visitor` returns
    /// `false`. Unlike [`Self::scan`], bounds need not share a prefix — used
    /// by [`crate::entity::store::EntityStore`] to walk a range of global
    /// revision numbers.
    pub fn scan_range(
        &self,
        sub_db: &str,
        start_inclusive: &[u8],
        end_inclusive: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        let table = match self.inner.open_table(table_def(sub_db)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let range = table.range::<&[u8]>((Bound::Included(start_inclusive), Bound::Included(end_inclusive)))?;
        for entry in range {
            let (k, v) = entry?;
            if !visitor(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Looks up every value associated with `key` in a multimap sub-database
    /// (used by [`crate::index::Index`] for non-unique property values).
    pub fn multimap_get(
        &self,
        sub_db: &str,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let table = match self.inner.open_multimap_table(multimap_def(sub_db)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in table.get(key)? {
            out.push(entry?.value().to_vec());
        }
        Ok(out)
    }
}

/// The single in-flight write transaction. Commits atomically; an early
/// return/drop without `commit` aborts (and leaves the store unchanged).
pub struct WriteTxn<'db> {
    inner: WriteTransaction,
    _marker: std::marker::PhantomData<&'db Database>,
}

impl<'db> WriteTxn<'db> {
    pub fn put(&self, sub_db: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut table = self.inner.open_table(table_def(sub_db))?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, sub_db: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.inner.open_table(table_def(sub_db))?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn remove(&self, sub_db: &str, key: &[u8]) -> Result<bool, StoreError> {
        let mut table = self.inner.open_table(table_def(sub_db))?;
        let existed = table.remove(key)?.is_some();
        Ok(existed)
    }

    /// Deletes every key starting with `prefix`. Returns the number removed.
    pub fn remove_range(&self, sub_db: &str, prefix: &[u8]) -> Result<usize, StoreError> {
        let mut table = self.inner.open_table(table_def(sub_db))?;
        let upper = prefix_upper_bound(prefix);
        let keys: Vec<Vec<u8>> = {
            let range = match &upper {
                Some(end) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))?,
                None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded))?,
            };
            range
                .map(|entry| entry.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()?
        };
        let count = keys.len();
        for key in &keys {
            table.remove(key.as_slice())?;
        }
        Ok(count)
    }

    pub fn scan(
        &self,
        sub_db: &str,
        prefix: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        let table = self.inner.open_table(table_def(sub_db))?;
        let upper = prefix_upper_bound(prefix);
        let range = match &upper {
            Some(end) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))?,
            None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded))?,
        };
        for entry in range {
            let (k, v) = entry?;
            if !visitor(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }

    pub fn scan_last(
        &self,
        sub_db: &str,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let table = self.inner.open_table(table_def(sub_db))?;
        let upper = prefix_upper_bound(prefix);
        let mut range = match &upper {
            Some(end) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))?,
            None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded))?,
        };
        let result = match range.next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Some((k.value().to_vec(), v.value().to_vec()))
            }
            None => None,
        };
        Ok(result)
    }

    pub fn multimap_add(&self, sub_db: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut table = self.inner.open_multimap_table(multimap_def(sub_db))?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn multimap_remove(&self, sub_db: &str, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut table = self.inner.open_multimap_table(multimap_def(sub_db))?;
        Ok(table.remove(key, value)?)
    }

    pub fn multimap_get(&self, sub_db: &str, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let table = self.inner.open_multimap_table(multimap_def(sub_db))?;
        let mut out = Vec::new();
        for entry in table.get(key)? {
            out.push(entry?.value().to_vec());
        }
        Ok(out)
    }

    /// Commits all writes made through this transaction atomically.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the commit fails (disk full, I/O error).
    pub fn commit(self) -> Result<(), StoreError> {
        self.inner.commit()?;
        Ok(())
    }

    /// Discards all writes made through this transaction.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the abort itself fails.
    pub fn abort(self) -> Result<(), StoreError> {
        self.inner.abort().map_err(|e| StoreError::Corruption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (DataStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path().join("store.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        txn.put("mail.main", b"k1", b"v1").unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("mail.main", b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn get_on_missing_table_is_none_not_error() {
        let (store, _dir) = temp_store();
        let read = store.begin_read().unwrap();
        assert_eq!(read.get("nonexistent", b"k").unwrap(), None);
    }

    #[test]
    fn prefix_scan_visits_only_matching_keys_in_order() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        for key in [&b"a/1"[..], b"a/2", b"a/3", b"b/1"] {
            txn.put("idx", key, b"").unwrap();
        }
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut seen = Vec::new();
        read.scan("idx", b"a/", |k, _| {
            seen.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen, vec![b"a/1".to_vec(), b"a/2".to_vec(), b"a/3".to_vec()]);
    }

    #[test]
    fn remove_range_deletes_only_prefixed_keys() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        txn.put("idx", b"a/1", b"").unwrap();
        txn.put("idx", b"a/2", b"").unwrap();
        txn.put("idx", b"b/1", b"").unwrap();
        txn.commit().unwrap();

        let txn = store.begin_write().unwrap();
        let removed = txn.remove_range("idx", b"a/").unwrap();
        txn.commit().unwrap();
        assert_eq!(removed, 2);

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("idx", b"a/1").unwrap(), None);
        assert_eq!(read.get("idx", b"b/1").unwrap(), Some(b"".to_vec()));
    }

    #[test]
    fn compact_succeeds_with_no_open_transactions() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        txn.put("mail.main", b"k1", b"v1").unwrap();
        txn.commit().unwrap();

        store.compact().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("mail.main", b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn abort_discards_writes() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        txn.put("mail.main", b"k1", b"v1").unwrap();
        txn.abort().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("mail.main", b"k1").unwrap(), None);
    }

    #[test]
    fn multimap_allows_duplicate_keys() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        txn.multimap_add("index.subject", b"inbox", b"uid-1").unwrap();
        txn.multimap_add("index.subject", b"inbox", b"uid-2").unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut values = read.multimap_get("index.subject", b"inbox").unwrap();
        values.sort();
        assert_eq!(values, vec![b"uid-1".to_vec(), b"uid-2".to_vec()]);
    }

    #[test]
    fn scan_range_visits_keys_within_bounds_regardless_of_prefix() {
        let (store, _dir) = temp_store();
        let txn = store.begin_write().unwrap();
        for n in 1u64..=5 {
            txn.put("revlog", &n.to_be_bytes(), b"").unwrap();
        }
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let mut seen = Vec::new();
        read.scan_range("revlog", &2u64.to_be_bytes(), &4u64.to_be_bytes(), |k, _| {
            seen.push(u64::from_be_bytes(k.try_into().unwrap()));
            true
        })
        .unwrap();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn prefix_upper_bound_handles_all_ff() {
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_upper_bound(&[0x01, 0xFF]), Some(vec![0x02]));
    }
}
