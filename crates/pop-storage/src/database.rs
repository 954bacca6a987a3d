//! RocksDB backend.

use crate::{Storage, StorageError, StorageResult, WriteBatch};
use rocksdb::{BlockBasedOptions, ColumnFamilyDescriptor, DBCompressionType, Options, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Column families of the client's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    /// Fixed-size header records indexed by block hash.
    Headers,
    /// JSON mining operations indexed by operation id.
    Operations,
    /// Tracker bookkeeping (best header, best height, checkpoint).
    Metadata,
    /// Required by RocksDB, unused by the client.
    Default,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 4] = [
        ColumnFamily::Headers,
        ColumnFamily::Operations,
        ColumnFamily::Metadata,
        ColumnFamily::Default,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ColumnFamily::Headers => "headers",
            ColumnFamily::Operations => "operations",
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Default => "default",
        }
    }

    fn options(self) -> Options {
        let mut opts = Options::default();
        match self {
            // Hashes and work values do not compress; lookups are by key.
            ColumnFamily::Headers => {
                opts.set_compression_type(DBCompressionType::None);
                let mut block = BlockBasedOptions::default();
                block.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block);
            }
            ColumnFamily::Operations => opts.set_compression_type(DBCompressionType::Lz4),
            ColumnFamily::Metadata | ColumnFamily::Default => {
                opts.set_compression_type(DBCompressionType::None)
            }
        }
        opts
    }
}

/// The client's on-disk store.
///
/// Cheap to clone; clones share one RocksDB handle.
#[derive(Clone)]
pub struct Database {
    db: Arc<DB>,
    path: PathBuf,
}

impl Database {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(128);
        opts.set_keep_log_file_num(1);

        let descriptors = ColumnFamily::ALL
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.name(), cf.options()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        debug!("Database opened");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store without write access.
    ///
    /// Used by the inspection CLI so it can run next to a live miner. Writes
    /// through the returned handle fail.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database read-only at {:?}", path);

        let names = ColumnFamily::ALL.iter().map(|cf| cf.name());
        let db = DB::open_cf_for_read_only(&Options::default(), path, names, false)?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables of every column family to disk.
    pub fn flush(&self) -> StorageResult<()> {
        for cf in ColumnFamily::ALL {
            self.db.flush_cf(self.handle(cf)?)?;
        }
        Ok(())
    }

    fn handle(&self, cf: ColumnFamily) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf.name())
            .ok_or(StorageError::MissingColumnFamily(cf.name()))
    }
}

impl Storage for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.handle(cf)?, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.db.put_cf(self.handle(cf)?, key, value)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for put in batch {
            rocks_batch.put_cf(self.handle(put.cf)?, &put.key, &put.value);
        }
        self.db.write(rocks_batch)?;
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let entries = self
            .db
            .iterator_cf(self.handle(cf)?, rocksdb::IteratorMode::Start)
            .map(|entry| entry.map(|(k, v)| (k.into_vec(), v.into_vec())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(entries.into_iter()))
    }
}
