//! In-memory storage backend.
//!
//! Same semantics as [`Database`](crate::Database) without touching disk.
//! Intended for tests and short-lived tooling.

use crate::{ColumnFamily, Storage, StorageResult, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Thread-safe in-memory key-value store keyed by column family.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<BTreeMap<ColumnFamily, Table>>,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored in a column family.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.tables.read().get(&cf).map_or(0, |t| t.len())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&cf)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.tables
            .write()
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        // One write guard for the whole batch keeps it atomic for readers.
        let mut tables = self.tables.write();
        for put in batch {
            tables.entry(put.cf).or_default().insert(put.key, put.value);
        }
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let entries: Vec<_> = self
            .tables
            .read()
            .get(&cf)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(entries.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_overwrites() {
        let store = MemoryStorage::new();
        store.put(ColumnFamily::Headers, b"k", b"v1").unwrap();
        store.put(ColumnFamily::Headers, b"k", b"v2").unwrap();

        assert_eq!(store.get(ColumnFamily::Headers, b"k").unwrap(), Some(b"v2".to_vec()));
        assert!(!store.contains(ColumnFamily::Operations, b"k").unwrap());
        assert_eq!(store.len(ColumnFamily::Headers), 1);
    }

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch
            .put(ColumnFamily::Metadata, &b"k"[..], &b"first"[..])
            .put(ColumnFamily::Metadata, &b"k"[..], &b"last"[..]);
        store.write_batch(batch).unwrap();

        assert_eq!(
            store.get(ColumnFamily::Metadata, b"k").unwrap(),
            Some(b"last".to_vec())
        );
        assert_eq!(store.len(ColumnFamily::Metadata), 1);
    }
}
