//! RocksDB-backed document records.
//!
//! Column families:
//! - `documents` — one record per path (bincode, LZ4 compressed), keyed by path bytes
//! - `visitors`  — pageview visitor markers, keyed by `path \0 visitor_key`, empty value
//!
//! Keys sort by path, so child listings are a forward prefix scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{Result, StorageBackend, StoreError};
use crate::document::Document;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_VISITORS: &str = "visitors";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_VISITORS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pathpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB record store.
pub struct RocksBackend {
    /// RocksDB instance (single-threaded mode; writers are serialized above)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self> {
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
        log::info!("Opened document store at {}", config.path.display());

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
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_VISITORS => {
                // Many tiny keys, point lookups only
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn visitor_key(path: &str, visitor_key: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(path.len() + 1 + visitor_key.len());
        key.extend_from_slice(path.as_bytes());
        key.push(0);
        key.extend_from_slice(visitor_key.as_bytes());
        key
    }
}

/// bincode, then LZ4 with the size prepended.
fn encode_record(doc: &Document) -> Result<Vec<u8>> {
    let raw = bincode::serde::encode_to_vec(doc, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_record(bytes: &[u8]) -> Result<Document> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (doc, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(doc)
}

impl StorageBackend for RocksBackend {
    fn load(&self, path: &str) -> Result<Option<Document>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, path.as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, doc: &Document) -> Result<()> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let value = encode_record(doc)?;
        self.db
            .put_cf_opt(cf, doc.path.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn save_with_visitor(&self, doc: &Document, visitor_key: &str) -> Result<()> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_visitors = self.cf(CF_VISITORS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc.path.as_bytes(), encode_record(doc)?);
        batch.put_cf(cf_visitors, Self::visitor_key(&doc.path, visitor_key), b"");
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn has_visitor(&self, path: &str, visitor_key: &str) -> Result<bool> {
        let cf = self.cf(CF_VISITORS)?;
        Ok(self
            .db
            .get_pinned_cf(cf, Self::visitor_key(path, visitor_key))?
            .is_some())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<Document>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix.as_bytes(), Direction::Forward)
        };

        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            docs.push(decode_record(&value)?);
        }
        Ok(docs)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
