//! RocksDB-backed [`FileStore`] implementation.
//!
//! Every document's paths live in one shared `RocksDB` instance (opened
//! once per process via [`RocksBackend::open`]), keyed by `<doc_id>\0<path>`
//! in a single column family; a second column family holds per-document
//! metadata (the file revision counter used by `when_change`, and whether
//! the file currently exists). Values are LZ4-compressed before they hit
//! the column family, the same tradeoff this storage layer already made
//! for document snapshots and deltas.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, Options, SingleThreaded,
    WriteBatch, WriteOptions,
};
use tokio::sync::Notify;

use crate::path::StoragePath;

use super::{FileStore, StoreError, TransactOp, TransactResult, TransactValue, TransactionSpec};

const CF_PATHS: &str = "paths";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_PATHS, CF_META];

/// Backend configuration. Mirrors the shape of the storage layer's
/// pre-existing `StoreConfig`: production defaults plus a small/fast
/// `for_testing` profile.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub path: PathBuf,
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bayou_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

fn cf_options(config: &RocksConfig) -> Options {
    let mut opts = Options::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts
}

fn path_key(doc_id: &str, path: &StoragePath) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 1 + path.as_str().len());
    key.extend_from_slice(doc_id.as_bytes());
    key.push(0);
    key.extend_from_slice(path.as_str().as_bytes());
    key
}

fn path_prefix(doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 1);
    key.extend_from_slice(doc_id.as_bytes());
    key.push(0);
    key
}

fn decode_path_suffix(doc_id: &str, key: &[u8]) -> Option<StoragePath> {
    let prefix = path_prefix(doc_id);
    let suffix = key.strip_prefix(prefix.as_slice())?;
    StoragePath::parse(String::from_utf8(suffix.to_vec()).ok()?).ok()
}

fn compress(value: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(value)
}

fn decompress(value: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(value).map_err(|e| StoreError::Compression(e.to_string()))
}

/// Shared RocksDB handle; [`RocksFileStore`]s for individual documents are
/// cheap views into it.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBackend {
    pub fn open(config: RocksConfig) -> Result<Arc<Self>, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Arc::new(Self { db, config }))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family: {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    pub fn file_store(self: &Arc<Self>, doc_id: impl Into<String>) -> RocksFileStore {
        let doc_id = doc_id.into();
        let file_rev = self.read_file_rev(&doc_id).unwrap_or(0);
        RocksFileStore {
            backend: self.clone(),
            doc_id,
            file_rev: AtomicU64::new(file_rev),
            notify: Notify::new(),
        }
    }

    fn read_file_rev(&self, doc_id: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_be_bytes(bytes.try_into().unwrap())),
            _ => Ok(0),
        }
    }
}

/// A [`FileStore`] for one document, backed by [`RocksBackend`].
pub struct RocksFileStore {
    backend: Arc<RocksBackend>,
    doc_id: String,
    file_rev: AtomicU64,
    notify: Notify,
}

#[async_trait]
impl FileStore for RocksFileStore {
    async fn create(&self) -> Result<(), StoreError> {
        let meta_cf = self.backend.cf(CF_META)?;
        self.backend
            .db
            .put_cf_opt(meta_cf, self.doc_id.as_bytes(), 0u64.to_be_bytes(), &self.backend.write_opts())?;
        self.file_rev.store(0, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self) -> Result<(), StoreError> {
        let paths_cf = self.backend.cf(CF_PATHS)?;
        let meta_cf = self.backend.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        let prefix = path_prefix(&self.doc_id);
        let iter = self.backend.db.prefix_iterator_cf(paths_cf, &prefix);
        for item in iter {
            let (key, _) = item.map_err(StoreError::from)?;
            if !key.starts_with(&prefix[..]) {
                break;
            }
            batch.delete_cf(paths_cf, key);
        }
        batch.delete_cf(meta_cf, self.doc_id.as_bytes());
        self.backend.db.write_opt(batch, &self.backend.write_opts())?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        let meta_cf = self.backend.cf(CF_META)?;
        Ok(self.backend.db.get_cf(meta_cf, self.doc_id.as_bytes())?.is_some())
    }

    async fn transact(&self, spec: TransactionSpec) -> Result<TransactResult, StoreError> {
        let paths_cf = self.backend.cf(CF_PATHS)?;
        let meta_cf = self.backend.cf(CF_META)?;
        let mut values = Vec::with_capacity(spec.ops.len());
        let mut batch = WriteBatch::default();

        for op in &spec.ops {
            match op {
                TransactOp::CheckPathExists(p) => {
                    let key = path_key(&self.doc_id, p);
                    if self.backend.db.get_cf(paths_cf, &key)?.is_none() {
                        return Err(StoreError::TransactionAborted(format!("missing path: {p}")));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::CheckPathEmpty(p) => {
                    let key = path_key(&self.doc_id, p);
                    if self.backend.db.get_cf(paths_cf, &key)?.is_some() {
                        return Err(StoreError::PathNotEmpty(p.to_string()));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::CheckPathIs(p, expected) => {
                    let key = path_key(&self.doc_id, p);
                    let current = self.backend.db.get_cf(paths_cf, &key)?;
                    let matches = match &current {
                        Some(bytes) => decompress(bytes)? == *expected,
                        None => false,
                    };
                    if !matches {
                        return Err(StoreError::PathHashMismatch(p.to_string()));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::ReadPath(p) => {
                    let key = path_key(&self.doc_id, p);
                    let value = match self.backend.db.get_cf(paths_cf, &key)? {
                        Some(bytes) => Some(decompress(&bytes)?),
                        None => None,
                    };
                    values.push(TransactValue::Read(value));
                }
                TransactOp::ListPath(prefix) => {
                    let raw_prefix = path_key(&self.doc_id, prefix);
                    let mut matches = Vec::new();
                    for item in self.backend.db.prefix_iterator_cf(paths_cf, &raw_prefix) {
                        let (key, _) = item.map_err(StoreError::from)?;
                        if !key.starts_with(&raw_prefix[..]) {
                            break;
                        }
                        if let Some(path) = decode_path_suffix(&self.doc_id, &key) {
                            matches.push(path);
                        }
                    }
                    values.push(TransactValue::List(matches));
                }
                TransactOp::WritePath(p, value) => {
                    let key = path_key(&self.doc_id, p);
                    batch.put_cf(paths_cf, key, compress(value));
                    values.push(TransactValue::Ack);
                }
                TransactOp::DeletePath(p) => {
                    let key = path_key(&self.doc_id, p);
                    batch.delete_cf(paths_cf, key);
                    values.push(TransactValue::Ack);
                }
            }
        }

        let file_rev = self.file_rev.fetch_add(1, Ordering::SeqCst) + 1;
        batch.put_cf(meta_cf, self.doc_id.as_bytes(), file_rev.to_be_bytes());
        self.backend.db.write_opt(batch, &self.backend.write_opts())?;
        self.notify.notify_waiters();
        Ok(TransactResult { file_rev, values })
    }

    async fn when_change(
        &self,
        timeout: Option<Duration>,
        after_file_rev: u64,
        _path: &StoragePath,
    ) -> Result<(), StoreError> {
        loop {
            if self.file_rev.load(Ordering::SeqCst) > after_file_rev {
                return Ok(());
            }
            let notified = self.notify.notified();
            match timeout {
                None => notified.await,
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        return Err(StoreError::TimedOut);
                    }
                }
            }
            if self.file_rev.load(Ordering::SeqCst) > after_file_rev {
                return Ok(());
            }
        }
    }

    fn file_rev(&self) -> u64 {
        self.file_rev.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (Arc<RocksBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksBackend::open(RocksConfig::for_testing(dir.path())).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn create_exists_delete_round_trip() {
        let (backend, _dir) = backend();
        let store = backend.file_store("doc-1");
        assert!(!store.exists().await.unwrap());
        store.create().await.unwrap();
        assert!(store.exists().await.unwrap());
        store.delete().await.unwrap();
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_compression() {
        let (backend, _dir) = backend();
        let store = backend.file_store("doc-1");
        store.create().await.unwrap();
        let path = StoragePath::parse("/format_version").unwrap();
        store.transact(TransactionSpec::new().write_path(path.clone(), b"1".to_vec())).await.unwrap();
        let result = store.transact(TransactionSpec::new().read_path(path)).await.unwrap();
        assert_eq!(result.read_at(0), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn check_path_empty_conflicts_once_written() {
        let (backend, _dir) = backend();
        let store = backend.file_store("doc-1");
        store.create().await.unwrap();
        let path = StoragePath::parse("/body/change/1").unwrap();
        store
            .transact(TransactionSpec::new().check_path_empty(path.clone()).write_path(path.clone(), b"x".to_vec()))
            .await
            .unwrap();
        let err = store.transact(TransactionSpec::new().check_path_empty(path)).await.unwrap_err();
        assert!(matches!(err, StoreError::PathNotEmpty(_)));
    }

    #[tokio::test]
    async fn two_documents_in_one_backend_are_isolated() {
        let (backend, _dir) = backend();
        let a = backend.file_store("doc-a");
        let b = backend.file_store("doc-b");
        a.create().await.unwrap();
        b.create().await.unwrap();
        let path = StoragePath::parse("/format_version").unwrap();
        a.transact(TransactionSpec::new().write_path(path.clone(), b"a".to_vec())).await.unwrap();
        let result = b.transact(TransactionSpec::new().read_path(path)).await.unwrap();
        assert_eq!(result.read_at(0), None);
    }

    #[tokio::test]
    async fn file_rev_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = StoragePath::parse("/format_version").unwrap();
        {
            let backend = RocksBackend::open(RocksConfig::for_testing(dir.path())).unwrap();
            let store = backend.file_store("doc-1");
            store.create().await.unwrap();
            store.transact(TransactionSpec::new().write_path(path.clone(), b"1".to_vec())).await.unwrap();
            assert_eq!(store.file_rev(), 2);
        }
        let backend = RocksBackend::open(RocksConfig::for_testing(dir.path())).unwrap();
        let store = backend.file_store("doc-1");
        assert_eq!(store.file_rev(), 2);
    }
}
