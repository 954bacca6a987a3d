//! Storage errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB rejected the call; includes writes to a read-only store.
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),

    /// No handle for a column family the client expects.
    #[error("Store has no '{0}' column family")]
    MissingColumnFamily(&'static str),
}

pub type StorageResult<T> = Result<T, StorageError>;
