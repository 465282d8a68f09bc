//! An in-process [`FileStore`] backed by a `BTreeMap`. Used by the bulk of
//! this crate's control-layer tests, where spinning up RocksDB per test
//! would dominate wall-clock time for no extra coverage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::path::StoragePath;

use super::{FileStore, StoreError, TransactOp, TransactResult, TransactValue, TransactionSpec};

struct Inner {
    exists: bool,
    data: BTreeMap<String, Vec<u8>>,
}

/// In-memory reference [`FileStore`]. `always_conflict` turns every
/// `CheckPathEmpty` into a forced `path_not_empty` failure, simulating the
/// adversarial storage used by §8 Scenario E (retry budget exhaustion).
pub struct MemoryFileStore {
    inner: RwLock<Inner>,
    file_rev: AtomicU64,
    notify: Notify,
    always_conflict: AtomicBool,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { exists: false, data: BTreeMap::new() }),
            file_rev: AtomicU64::new(0),
            notify: Notify::new(),
            always_conflict: AtomicBool::new(false),
        }
    }

    pub fn always_conflicting() -> Self {
        let store = Self::new();
        store.always_conflict.store(true, Ordering::SeqCst);
        store
    }

    /// Toggles conflict simulation on an already-created store, so a test
    /// can set up a document normally and only force contention afterward.
    pub fn set_always_conflicting(&self, value: bool) {
        self.always_conflict.store(value, Ordering::SeqCst);
    }
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn create(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.exists = true;
        inner.data.clear();
        self.file_rev.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.exists = false;
        inner.data.clear();
        self.file_rev.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        Ok(self.inner.read().unwrap().exists)
    }

    async fn transact(&self, spec: TransactionSpec) -> Result<TransactResult, StoreError> {
        // Checks run against a snapshot so a failing check never leaves a
        // partial write behind; writes are applied only once every check
        // has passed.
        let mut inner = self.inner.write().unwrap();
        let mut values = Vec::with_capacity(spec.ops.len());

        for op in &spec.ops {
            match op {
                TransactOp::CheckPathExists(p) => {
                    if !inner.data.contains_key(p.as_str()) {
                        return Err(StoreError::TransactionAborted(format!("missing path: {p}")));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::CheckPathEmpty(p) => {
                    if self.always_conflict.load(Ordering::SeqCst) || inner.data.contains_key(p.as_str()) {
                        return Err(StoreError::PathNotEmpty(p.to_string()));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::CheckPathIs(p, expected) => {
                    if inner.data.get(p.as_str()) != Some(expected) {
                        return Err(StoreError::PathHashMismatch(p.to_string()));
                    }
                    values.push(TransactValue::Ack);
                }
                TransactOp::ReadPath(p) => {
                    values.push(TransactValue::Read(inner.data.get(p.as_str()).cloned()));
                }
                TransactOp::ListPath(prefix) => {
                    let matches: Vec<StoragePath> = inner
                        .data
                        .keys()
                        .filter(|k| k.starts_with(prefix.as_str()))
                        .filter_map(|k| StoragePath::parse(k.clone()).ok())
                        .collect();
                    values.push(TransactValue::List(matches));
                }
                TransactOp::WritePath(..) | TransactOp::DeletePath(..) => {
                    // applied in the second pass below.
                    values.push(TransactValue::Ack);
                }
            }
        }

        for op in &spec.ops {
            match op {
                TransactOp::WritePath(p, value) => {
                    inner.data.insert(p.as_str().to_string(), value.clone());
                }
                TransactOp::DeletePath(p) => {
                    inner.data.remove(p.as_str());
                }
                _ => {}
            }
        }

        let file_rev = self.file_rev.fetch_add(1, Ordering::SeqCst) + 1;
        drop(inner);
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
