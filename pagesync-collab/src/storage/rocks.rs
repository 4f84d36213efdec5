//! RocksDB-backed operation log.
//!
//! Column families:
//! - `snapshots`  — latest `(content, version)` per document (bincode + LZ4)
//! - `operations` — accepted ops, keyed by `<name>\0<version:8 BE>` (bincode + LZ4)
//! - `metadata`   — per-document bookkeeping (bincode)
//!
//! Document names never contain a NUL byte, so `<name>\0` is an exact prefix:
//! `s/page` and `s/page-details` never share a scan range.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

use pagesync_core::{DocumentName, Revision, Snapshot};

use super::{split_at_snapshot, OperationLog, StoredDocument};
use crate::error::StoreError;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPERATIONS, CF_METADATA];

/// Op log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Logged ops kept behind the latest snapshot before compaction.
    pub retain_operations: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pagesync_data/oplog"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            retain_operations: 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            retain_operations: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Full document name, `<session>/<logical name>`
    pub name: String,
    /// Version of the latest snapshot
    pub snapshot_version: u64,
    /// Highest op version appended
    pub last_version: u64,
    /// Ops appended over the document's lifetime
    pub op_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &DocumentName) -> Self {
        let now = now_secs();
        Self {
            name: name.to_string(),
            snapshot_version: 0,
            last_version: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// RocksDB operation log.
///
/// Each public call is one atomic `WriteBatch`; metadata is always written
/// alongside the data it describes.
pub struct RocksLog {
    /// Single-threaded column family mode; callers serialize per document.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksLog {
    /// Open (or create) the log at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened operation log at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load document bookkeeping, if any.
    pub fn metadata(&self, name: &DocumentName) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, name_key(name))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ops with `version >= since`, oldest first.
    pub fn operations_since(
        &self,
        name: &DocumentName,
        since: u64,
    ) -> Result<Vec<Revision>, StoreError> {
        let mut revisions = Vec::new();
        self.scan_operations(name, since, |_, value| {
            revisions.push(decode_compressed(value)?);
            Ok(true)
        })?;
        Ok(revisions)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn metadata_or_new(&self, name: &DocumentName) -> Result<DocumentMetadata, StoreError> {
        Ok(self
            .metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name)))
    }

    /// Walk this document's op keys from `since` upward. `visit` returns
    /// `false` to stop early.
    fn scan_operations<F>(&self, name: &DocumentName, since: u64, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = op_prefix(name);
        let start = op_key(name, since);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl OperationLog for RocksLog {
    fn load(&self, name: &DocumentName) -> Result<Option<StoredDocument>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let snapshot: Snapshot = match self.db.get_cf(&cf, name_key(name))? {
            Some(bytes) => decode_compressed(&bytes)?,
            None => return Ok(None),
        };
        let revisions = self.operations_since(name, 0)?;
        Ok(Some(split_at_snapshot(snapshot, revisions)))
    }

    fn append(&self, name: &DocumentName, revision: &Revision) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(name)?;
        meta.last_version = meta.last_version.max(revision.version);
        meta.op_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, op_key(name, revision.version), encode_compressed(revision)?);
        batch.put_cf(&cf_meta, name_key(name), encode(&meta)?);
        self.write(batch)
    }

    fn save_snapshot(&self, name: &DocumentName, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = encode_compressed(snapshot)?;
        let mut meta = self.metadata_or_new(name)?;
        meta.snapshot_version = snapshot.version;
        meta.snapshot_size = snapshot.content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, name_key(name), compressed);
        batch.put_cf(&cf_meta, name_key(name), encode(&meta)?);
        self.write(batch)
    }

    fn compact(&self, name: &DocumentName, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        self.scan_operations(name, 0, |key, _| {
            if key_version(key) > up_to_version {
                return Ok(false);
            }
            batch.delete_cf(&cf, key);
            count += 1;
            Ok(true)
        })?;

        if count > 0 {
            self.write(batch)?;
            log::debug!("Compacted {count} ops of {name} up to v{up_to_version}");
        }
        Ok(count)
    }

    fn delete(&self, name: &DocumentName) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, name_key(name));
        batch.delete_cf(&self.cf(CF_METADATA)?, name_key(name));

        self.scan_operations(name, 0, |key, _| {
            batch.delete_cf(&cf_ops, key);
            Ok(true)
        })?;

        self.write(batch)
    }

    fn list(&self) -> Result<Vec<DocumentName>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let raw = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(format!("invalid document key: {e}")))?;
            let name = DocumentName::parse(raw)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            names.push(name);
        }

        Ok(names)
    }
}

// ─── Keys & codecs ────────────────────────────────────────────────────

fn name_key(name: &DocumentName) -> Vec<u8> {
    name.to_string().into_bytes()
}

fn op_prefix(name: &DocumentName) -> Vec<u8> {
    let mut key = name_key(name);
    key.push(0);
    key
}

/// `<name>\0<version:8 bytes big-endian>`
fn op_key(name: &DocumentName, version: u64) -> Vec<u8> {
    let mut key = op_prefix(name);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn key_version(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    u64::from_be_bytes(buf)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(value)?))
}

fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode(&raw)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
