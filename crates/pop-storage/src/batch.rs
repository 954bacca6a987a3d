//! Atomic multi-key writes.

use crate::ColumnFamily;

/// One key/value write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPut {
    pub cf: ColumnFamily,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Writes applied together or not at all.
///
/// Headers, operations and tracker metadata are only ever added or
/// overwritten, so a batch carries puts only. A later put to the same key
/// wins.
#[derive(Debug, Default)]
pub struct WriteBatch {
    puts: Vec<BatchPut>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write of `value` under `key`.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.puts.push(BatchPut {
            cf,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }

    /// Queued writes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BatchPut> {
        self.puts.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = BatchPut;
    type IntoIter = std::vec::IntoIter<BatchPut>;

    fn into_iter(self) -> Self::IntoIter {
        self.puts.into_iter()
    }
}
