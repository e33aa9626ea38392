//! RocksDB-backed durable update log.
//!
//! Column families:
//! - `updates`: encoded records keyed by id (8 bytes big-endian), so
//!   forward iteration is ascending id order
//!
//! Payloads are already LZ4-compressed by the envelope, so the column
//! family itself runs without block compression.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    ErrorKind, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{LogBackend, StoreError};

const CF_UPDATES: &str = "updates";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync on every append (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("calsync_data"),
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small buffers, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => StoreError::Conflict(e.to_string()),
            ErrorKind::IOError | ErrorKind::ShutdownInProgress | ErrorKind::TimedOut => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Durable backend on a single RocksDB column family.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(16 * 1024);
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_UPDATES, cf_opts)],
        )?;

        log::info!("Opened update log store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_UPDATES}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

fn decode_key(key: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

impl LogBackend for RocksBackend {
    fn last_id(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf()?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_key(&key))
            }
            None => Ok(None),
        }
    }

    fn put(&self, id: u64, bytes: Vec<u8>) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.put_cf_opt(cf, id.to_be_bytes(), bytes, &self.write_options())?;
        Ok(())
    }

    fn scan_after(&self, since: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf()?;
        let Some(start) = since.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start_key = start.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item?;
            match decode_key(&key) {
                Some(id) => entries.push((id, value.to_vec())),
                None => log::warn!("Skipping update log key of length {}", key.len()),
            }
        }
        Ok(entries)
    }

    fn delete(&self, ids: &[u64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(cf, id.to_be_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(ids.len())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let cf = self.cf()?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
