//! The file store contract the control layer consumes (§6), plus two
//! implementations: [`memory::MemoryFileStore`] (fast, in-process, used by
//! most of this crate's own tests) and [`rocks::RocksFileStore`] (a
//! RocksDB-backed implementation adapted from this codebase's existing
//! document storage layer).
//!
//! The control layer only ever talks to the [`FileStore`] trait; it must
//! not assume anything about which implementation backs it.

pub mod memory;
pub mod rocks;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::path::StoragePath;

/// A single operation within a [`TransactionSpec`]. Operations execute in
/// order; the whole spec either wholly commits or raises a [`StoreError`].
#[derive(Debug, Clone)]
pub enum TransactOp {
    CheckPathExists(StoragePath),
    CheckPathEmpty(StoragePath),
    CheckPathIs(StoragePath, Vec<u8>),
    ReadPath(StoragePath),
    WritePath(StoragePath, Vec<u8>),
    DeletePath(StoragePath),
    ListPath(StoragePath),
}

/// An ordered list of operations to execute as one atomic transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionSpec {
    pub ops: Vec<TransactOp>,
    pub timeout: Option<Duration>,
}

impl TransactionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn check_path_exists(mut self, path: StoragePath) -> Self {
        self.ops.push(TransactOp::CheckPathExists(path));
        self
    }

    pub fn check_path_empty(mut self, path: StoragePath) -> Self {
        self.ops.push(TransactOp::CheckPathEmpty(path));
        self
    }

    pub fn read_path(mut self, path: StoragePath) -> Self {
        self.ops.push(TransactOp::ReadPath(path));
        self
    }

    pub fn write_path(mut self, path: StoragePath, value: Vec<u8>) -> Self {
        self.ops.push(TransactOp::WritePath(path, value));
        self
    }

    pub fn delete_path(mut self, path: StoragePath) -> Self {
        self.ops.push(TransactOp::DeletePath(path));
        self
    }

    pub fn list_path(mut self, prefix: StoragePath) -> Self {
        self.ops.push(TransactOp::ListPath(prefix));
        self
    }
}

/// Per-op result, in the same order as the submitted [`TransactOp`]s.
/// Checks and writes produce [`TransactValue::Ack`]; reads and lists
/// produce their payload.
#[derive(Debug, Clone)]
pub enum TransactValue {
    Ack,
    Read(Option<Vec<u8>>),
    List(Vec<StoragePath>),
}

#[derive(Debug, Clone)]
pub struct TransactResult {
    pub file_rev: u64,
    pub values: Vec<TransactValue>,
}

impl TransactResult {
    pub fn read_at(&self, index: usize) -> Option<&[u8]> {
        match self.values.get(index) {
            Some(TransactValue::Read(Some(bytes))) => Some(bytes),
            _ => None,
        }
    }
}

/// Storage-layer error kinds (§6/§7). `PathNotEmpty` and `PathHashMismatch`
/// are the two distinguished conflict kinds the retry loop watches for;
/// every other variant is surfaced to the caller unchanged.
#[derive(Debug, Clone)]
pub enum StoreError {
    PathNotEmpty(String),
    PathHashMismatch(String),
    TimedOut,
    TransactionAborted(String),
    NotFound(String),
    Database(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::PathNotEmpty(p) => write!(f, "path not empty: {p}"),
            StoreError::PathHashMismatch(p) => write!(f, "path value mismatch: {p}"),
            StoreError::TimedOut => write!(f, "storage operation timed out"),
            StoreError::TransactionAborted(reason) => write!(f, "transaction aborted: {reason}"),
            StoreError::NotFound(doc) => write!(f, "document not found: {doc}"),
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "compression error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A single document's transactional file (§6). One instance per document,
/// owned by its [`crate::doc_complex::DocComplex`].
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn create(&self) -> Result<(), StoreError>;
    async fn delete(&self) -> Result<(), StoreError>;
    async fn exists(&self) -> Result<bool, StoreError>;

    /// Executes `spec` as a single atomic transaction.
    async fn transact(&self, spec: TransactionSpec) -> Result<TransactResult, StoreError>;

    /// Suspends until `path` is observed to have changed after
    /// `after_file_rev`, or `timeout` elapses (`None` means no timeout).
    async fn when_change(
        &self,
        timeout: Option<Duration>,
        after_file_rev: u64,
        path: &StoragePath,
    ) -> Result<(), StoreError>;

    /// The file's current revision counter, bumped on every committed
    /// transaction. Used by callers to pin a `when_change` baseline.
    fn file_rev(&self) -> u64;
}
