//! Ordered key-value store backing the whole system.
//!
//! One untyped byte-key table holds file blobs, metadata records, the
//! event log, and the latest-event pointer; the key prefixes of
//! [`schema`](crate::schema) keep their ranges disjoint. Mutations are
//! applied as atomic batches: either every operation of a batch is
//! visible or none is. Reads and range scans run inside a read
//! transaction and never observe a partially-applied batch.

use std::path::Path;

use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};

use crate::error::Result;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("stash-v1");

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered list of put/delete operations applied atomically.
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(Op::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(Op::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the database file at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Database::create(path)?)
    }

    /// A store backed by memory only. Used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Database::builder().create_with_backend(InMemoryBackend::new())?)
    }

    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write()?;
        txn.open_table(TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Point lookup. A missing key is `None`, not an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    /// Apply a batch atomically. An error aborts the whole batch.
    pub fn write(&self, batch: Batch) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            for op in batch.ops {
                match op {
                    Op::Put(key, value) => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    Op::Delete(key) => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Ordered scan of the half-open range `[start, end)`, up to `limit`
    /// pairs. Runs on one read snapshot. An inverted range is empty.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let mut out = Vec::new();
        for item in table.range::<&[u8]>(start..end)? {
            let (key, value) = item?;
            out.push((key.value().to_vec(), value.value().to_vec()));
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_key_is_none() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.get(b"nope").unwrap(), None);
        assert!(!store.has(b"nope").unwrap());
    }

    #[test]
    fn batch_put_and_get() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        store.write(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert!(store.has(b"a").unwrap());
    }

    #[test]
    fn batch_delete() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        store.write(batch).unwrap();

        let mut batch = Batch::new();
        batch.delete(b"a".to_vec());
        store.write(batch).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn later_put_in_same_batch_wins() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), b"old".to_vec());
        batch.put(b"k".to_vec(), b"new".to_vec());
        store.write(batch).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn scan_is_ordered_and_half_open() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        for key in ["event:3", "event:1", "file:x", "event:2"] {
            batch.put(key.as_bytes().to_vec(), key.as_bytes().to_vec());
        }
        store.write(batch).unwrap();

        let pairs = store.scan(b"event:", b"event:~", usize::MAX).unwrap();
        let keys: Vec<_> = pairs
            .iter()
            .map(|(k, _)| String::from_utf8(k.clone()).unwrap())
            .collect();
        assert_eq!(keys, vec!["event:1", "event:2", "event:3"]);
    }

    #[test]
    fn scan_respects_limit_and_anchoring() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        for i in 0..5u8 {
            batch.put(vec![b'k', b'0' + i], vec![i]);
        }
        store.write(batch).unwrap();

        let first = store.scan(b"k", b"l", 2).unwrap();
        assert_eq!(first.len(), 2);

        // Anchor the next page just past the last key seen.
        let mut next_start = first.last().unwrap().0.clone();
        next_start.push(0);
        let rest = store.scan(&next_start, b"l", usize::MAX).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].0, b"k2");
    }

    #[test]
    fn inverted_range_is_empty() {
        let store = Store::in_memory().unwrap();
        let mut batch = Batch::new();
        batch.put(b"event:1".to_vec(), b"x".to_vec());
        store.write(batch).unwrap();
        assert!(store.scan(b"event:~zzz", b"event:~", usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let store = Store::open(&path).unwrap();
        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        store.write(batch).unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
