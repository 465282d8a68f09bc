//! Batched range reads and wait-for-change against the file store (§4.5).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::control::{decode_change, Change};
use crate::delta::DeltaAlgebra;
use crate::error::BayouError;
use crate::path::{change_path, revision_number_path};
use crate::storage::{FileStore, TransactionSpec};

/// At most this many `change/<N>` reads are batched into one transaction.
const MAX_READS_PER_TX: u64 = 20;

pub struct ChangeReader<D> {
    store: Arc<dyn FileStore>,
    prefix: &'static str,
    _marker: PhantomData<D>,
}

impl<D: DeltaAlgebra> ChangeReader<D> {
    pub fn new(store: Arc<dyn FileStore>, prefix: &'static str) -> Self {
        Self { store, prefix, _marker: PhantomData }
    }

    /// Current storage-level file revision, used as a `when_change` baseline.
    pub fn file_rev(&self) -> u64 {
        self.store.file_rev()
    }

    /// Reads `change/start_inc..end_exc`. `start_inc == end_exc` is always
    /// valid and returns an empty result; otherwise `end_exc - 1` must not
    /// exceed `head`.
    pub async fn read_range(&self, start_inc: u64, end_exc: u64, head: u64) -> Result<Vec<Change<D>>, BayouError> {
        if start_inc == end_exc {
            return Ok(Vec::new());
        }
        if end_exc == 0 || end_exc - 1 > head {
            return Err(BayouError::revision_not_available(format!(
                "{} range {start_inc}..{end_exc} exceeds head {head}",
                self.prefix
            )));
        }

        let mut changes = Vec::with_capacity((end_exc - start_inc) as usize);
        let mut cursor = start_inc;
        while cursor < end_exc {
            let batch_end = (cursor + MAX_READS_PER_TX).min(end_exc);
            let mut spec = TransactionSpec::new();
            for rev in cursor..batch_end {
                spec = spec.read_path(change_path(self.prefix, rev));
            }
            let result = self.store.transact(spec).await?;
            for (i, rev) in (cursor..batch_end).enumerate() {
                let bytes = result.read_at(i).ok_or_else(|| {
                    BayouError::revision_not_available(format!("{}/change/{rev}", self.prefix))
                })?;
                changes.push(decode_change(bytes)?);
            }
            cursor = batch_end;
        }
        Ok(changes)
    }

    /// Suspends until the stream's `revision_number` path changes after
    /// `baseline_file_rev`, or `timeout` elapses. `baseline_file_rev` should
    /// be read *before* checking the in-memory head, so that a change
    /// landing in between makes this resolve immediately rather than miss
    /// a wakeup.
    pub async fn wait_for_change_after(&self, baseline_file_rev: u64, timeout: Option<Duration>) -> Result<(), BayouError> {
        let path = revision_number_path(self.prefix);
        self.store.when_change(timeout, baseline_file_rev, &path).await.map_err(BayouError::from)
    }
}
