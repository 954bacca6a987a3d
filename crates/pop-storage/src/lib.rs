//! # pop-storage
//!
//! Storage layer for the PoP mining client.
//!
//! Key/value records split into column families, written one at a time or
//! in atomic batches. Records are added or overwritten, never removed.
//! [`Database`] keeps them in RocksDB, [`MemoryStorage`] in memory.
//!
//! ## Column Families
//!
//! - `Headers`: Fixed-size header records indexed by block hash
//! - `Operations`: Serialized mining operations indexed by operation id
//! - `Metadata`: Tracker bookkeeping (best header, checkpoint)

mod batch;
mod database;
mod error;
mod memory;

pub use batch::{BatchPut, WriteBatch};
pub use database::{ColumnFamily, Database};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;

/// Storage trait for abstracting database operations.
///
/// Every component that persists state takes an `Arc<dyn Storage>` so tests
/// can swap RocksDB for the in-memory backend.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Create an iterator over a column family, in key order.
    fn iter(&self, cf: ColumnFamily)
        -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;
}
