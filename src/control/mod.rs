//! The generic revisioned-log control-stream abstraction (§4.1, §9). All
//! three streams (body, caret, property) are instances of `Control<D>`
//! parameterized by their delta algebra; [`body`], [`caret`], [`property`]
//! are thin stream-specific wrappers that add each stream's own public
//! methods and carry a [`StreamKind`].

pub mod body;
pub mod caret;
pub mod property;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::change_reader::ChangeReader;
use crate::delta::{DeltaAlgebra, Priority};
use crate::error::BayouError;
use crate::path::{change_path, revision_number_path};
use crate::snapshot_cache::SnapshotCache;
use crate::storage::{FileStore, TransactionSpec};

/// A single entry in a stream's append-only log (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<D> {
    pub rev_num: u64,
    pub delta: D,
    /// Absent only for `rev_num == 0`, the stream's empty change.
    pub timestamp_ms: Option<u64>,
    pub author_id: Option<String>,
}


/// A stream's composed state at a revision (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<D> {
    pub rev_num: u64,
    pub contents: D,
}

/// Capabilities a stream adapter must supply for its `Control<D>` (§9:
/// replaces the source's `_impl_*` override hooks with an explicit trait).
pub trait StreamKind {
    /// The path component under which this stream's keys live, e.g. `"body"`.
    fn path_prefix() -> &'static str;

    /// Stream-specific acceptance check run before a delta is ever composed
    /// against a snapshot. The default accepts anything that isn't itself a
    /// full document (an edit, not a replacement).
    fn validate_change<D: DeltaAlgebra>(delta: &D) -> Result<(), BayouError> {
        if delta.is_document() && !delta.is_empty() {
            return Err(BayouError::bad_value("applyChange delta must not be a document delta"));
        }
        Ok(())
    }
}

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_GROWTH_FACTOR: u32 = 5;
const RETRY_BUDGET: Duration = Duration::from_secs(20);

/// One document stream's revisioned log: the generic engine behind
/// `BodyControl`, `CaretControl`, `PropertyControl` (§4.1, §9).
///
/// A single [`tokio::sync::Mutex`] serializes `apply_change` attempts per
/// stream (§5's single-writer discipline); readers never take it.
pub struct Control<D: DeltaAlgebra> {
    store: Arc<dyn FileStore>,
    prefix: &'static str,
    reader: ChangeReader<D>,
    cache: SnapshotCache<D>,
    write_lock: AsyncMutex<()>,
    head: AtomicU64,
}

impl<D: DeltaAlgebra> Control<D> {
    /// Opens a control over an already-initialized stream (`change/0` must
    /// already exist; see [`crate::doc_complex::DocComplex::create`]).
    pub fn new(store: Arc<dyn FileStore>, prefix: &'static str, head: u64) -> Self {
        Self {
            store: store.clone(),
            prefix,
            reader: ChangeReader::new(store, prefix),
            cache: SnapshotCache::new(),
            write_lock: AsyncMutex::new(()),
            head: AtomicU64::new(head),
        }
    }

    pub fn current_rev_num(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub async fn get_change(&self, rev: u64) -> Result<Change<D>, BayouError> {
        let mut changes = self.reader.read_range(rev, rev + 1, self.current_rev_num()).await?;
        changes.pop().ok_or_else(|| BayouError::revision_not_available(format!("{}/change/{rev}", self.prefix)))
    }

    /// Composes `base` with `change/start_inc..end_exc`.
    pub async fn get_composed_changes(&self, base: D, start_inc: u64, end_exc: u64) -> Result<D, BayouError> {
        let changes = self.reader.read_range(start_inc, end_exc, self.current_rev_num()).await?;
        let mut acc = base;
        for change in changes {
            acc = acc.compose(&change.delta).map_err(|e| BayouError::invariant_violation(e.to_string()))?;
        }
        Ok(acc)
    }

    /// Snapshot at `rev` (defaults to current head), via the bounded cache
    /// (§4.4): search downward for a cached base, else revision 0, then
    /// forward-compose.
    pub async fn get_snapshot(&self, rev: Option<u64>) -> Result<Snapshot<D>, BayouError> {
        let head = self.current_rev_num();
        let rev = rev.unwrap_or(head);
        if rev > head {
            return Err(BayouError::revision_not_available(format!("{}@{rev} > head {head}", self.prefix)));
        }
        self.cache
            .get_or_compute(rev, |base_rev, base_contents| {
                let reader = &self.reader;
                let head = head;
                async move {
                    let delta = reader
                        .read_range(base_rev + 1, rev + 1, head)
                        .await?
                        .into_iter()
                        .try_fold(base_contents, |acc, change| {
                            acc.compose(&change.delta).map_err(|e| BayouError::invariant_violation(e.to_string()))
                        })?;
                    Ok(delta)
                }
            })
            .await
    }

    /// Suspends until the head advances past `base_rev`, then returns the
    /// synthesized change composing `base_rev+1..=head` (§4.1, Scenario D).
    pub async fn get_change_after(
        &self,
        base_rev: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Change<D>, BayouError> {
        loop {
            // Captured before the head check: a change landing in between
            // only makes `wait_for_change_after` resolve immediately below,
            // it can never be missed.
            let baseline_file_rev = self.reader.file_rev();
            let head = self.current_rev_num();
            if head > base_rev {
                let delta = self.get_composed_changes(D::identity(), base_rev + 1, head + 1).await?;
                return Ok(Change { rev_num: head, delta, timestamp_ms: None, author_id: None });
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BayouError::aborted("getChangeAfter cancelled")),
                res = self.reader.wait_for_change_after(baseline_file_rev, timeout) => { res?; }
            }
        }
    }

    /// The OT apply/rebase algorithm (§4.1). `validate` is the stream's
    /// [`StreamKind::validate_change`], applied before anything else.
    pub async fn apply_change<K: StreamKind>(
        &self,
        base_rev: u64,
        delta: D,
        author_id: Option<String>,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<D>, BayouError> {
        K::validate_change(&delta)?;
        if base_rev > self.current_rev_num() {
            return Err(BayouError::bad_value(format!("baseRev {base_rev} is ahead of the log")));
        }
        if delta.is_empty() {
            return Ok(Change { rev_num: base_rev, delta: D::identity(), timestamp_ms: None, author_id: None });
        }

        let base = self.get_snapshot(Some(base_rev)).await?;
        let expected =
            base.contents.compose(&delta).map_err(|e| BayouError::bad_value(e.to_string()))?;

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BayouError::aborted("applyChange cancelled")),
            guard = self.write_lock.lock() => guard,
        };

        let mut delay = RETRY_BASE_DELAY;
        let deadline = tokio::time::Instant::now() + RETRY_BUDGET;

        loop {
            if cancel.is_cancelled() {
                return Err(BayouError::aborted("applyChange cancelled"));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BayouError::too_many_retries(format!(
                    "{} applyChange exceeded retry budget",
                    self.prefix
                )));
            }

            let current = self.get_snapshot(None).await?;
            let (to_append, correction) = if base.rev_num == current.rev_num {
                (delta.clone(), None)
            } else {
                let d_server = self
                    .get_composed_changes(D::identity(), base.rev_num + 1, current.rev_num + 1)
                    .await?;
                let d_next = d_server
                    .transform(&delta, Priority::Left)
                    .map_err(|e| BayouError::invariant_violation(e.to_string()))?;
                if d_next.is_empty() {
                    return Ok(Change {
                        rev_num: current.rev_num,
                        delta: D::identity(),
                        timestamp_ms: None,
                        author_id: None,
                    });
                }
                (d_next, Some(d_server))
            };

            match self.try_append(current.rev_num + 1, to_append.clone(), author_id.clone(), now_ms).await {
                Ok(()) => {
                    self.head.store(current.rev_num + 1, Ordering::SeqCst);
                    if correction.is_none() {
                        return Ok(Change {
                            rev_num: current.rev_num + 1,
                            delta: D::identity(),
                            timestamp_ms: None,
                            author_id: None,
                        });
                    }
                    let new_head = self.get_snapshot(Some(current.rev_num + 1)).await?;
                    let correction = expected
                        .diff(&new_head.contents)
                        .map_err(|e| BayouError::invariant_violation(e.to_string()))?;
                    return Ok(Change {
                        rev_num: current.rev_num + 1,
                        delta: correction,
                        timestamp_ms: None,
                        author_id: None,
                    });
                }
                Err(BayouError { kind: crate::error::ErrorKind::PathNotEmpty, .. }) => {
                    log::debug!(
                        "{} applyChange lost the append race at rev {}, retrying after {delay:?}",
                        self.prefix,
                        current.rev_num + 1
                    );
                    tokio::time::sleep(delay).await;
                    delay *= RETRY_GROWTH_FACTOR;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The conditional-append primitive (§4.1): `checkPathEmpty
    /// change/<N+1>`, `writePath change/<N+1>`, `writePath
    /// revision_number=N+1`, as a single atomic transaction.
    async fn try_append(
        &self,
        next_rev: u64,
        delta: D,
        author_id: Option<String>,
        now_ms: u64,
    ) -> Result<(), BayouError> {
        let change = Change { rev_num: next_rev, delta, timestamp_ms: Some(now_ms), author_id };
        let encoded = encode_change(&change)?;
        let path = change_path(self.prefix, next_rev);
        let rev_path = revision_number_path(self.prefix);
        self.store
            .transact(
                TransactionSpec::new()
                    .check_path_empty(path.clone())
                    .write_path(path, encoded)
                    .write_path(rev_path, next_rev.to_le_bytes().to_vec()),
            )
            .await?;
        Ok(())
    }
}

/// On-wire shape of [`Change<D>`] (§3.1): `Change<D>` itself isn't
/// `Serialize` because `author_id`/`timestamp_ms` need no special handling,
/// but keeping an explicit wire struct keeps the encoding stable even if
/// `Change<D>`'s field order changes.
#[derive(serde::Serialize, serde::Deserialize)]
struct EncodedChange<D> {
    rev_num: u64,
    delta: D,
    timestamp_ms: Option<u64>,
    author_id: Option<String>,
}

impl<D: Clone> From<&Change<D>> for EncodedChange<D> {
    fn from(c: &Change<D>) -> Self {
        Self { rev_num: c.rev_num, delta: c.delta.clone(), timestamp_ms: c.timestamp_ms, author_id: c.author_id.clone() }
    }
}

impl<D> From<EncodedChange<D>> for Change<D> {
    fn from(c: EncodedChange<D>) -> Self {
        Self { rev_num: c.rev_num, delta: c.delta, timestamp_ms: c.timestamp_ms, author_id: c.author_id }
    }
}

pub(crate) fn decode_change<D: DeltaAlgebra>(bytes: &[u8]) -> Result<Change<D>, BayouError> {
    let (encoded, _): (EncodedChange<D>, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BayouError::storage_corrupt(e.to_string()))?;
    Ok(encoded.into())
}

pub(crate) fn encode_change<D: DeltaAlgebra>(change: &Change<D>) -> Result<Vec<u8>, BayouError> {
    bincode::serde::encode_to_vec(&EncodedChange::from(change), bincode::config::standard())
        .map_err(|e| BayouError::storage_corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::body::BodyStreamKind;
    use crate::delta::text::{TextDelta, TextOp};
    use crate::storage::memory::MemoryFileStore;
    use tokio_util::sync::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Bootstraps a `Control<TextDelta>` over a fresh in-memory store with
    /// the empty `change/0` a real `DocComplex::create` would have written.
    async fn fresh_control() -> Control<TextDelta> {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        store.create().await.unwrap();
        let change0 = encode_change(&Change { rev_num: 0, delta: TextDelta::identity(), timestamp_ms: None, author_id: None }).unwrap();
        store.transact(TransactionSpec::new().write_path(change_path("body", 0), change0)).await.unwrap();
        Control::new(store, "body", 0)
    }

    #[tokio::test]
    async fn apply_change_appends_sequentially_and_advances_head() {
        let control = fresh_control().await;
        let c = cancel();

        let first = control.apply_change::<BodyStreamKind>(0, TextDelta::insert("hi"), None, 0, &c).await.unwrap();
        assert_eq!(first.rev_num, 1);
        assert!(first.delta.is_empty());
        assert_eq!(control.current_rev_num(), 1);

        let snapshot = control.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.contents.content().unwrap(), "hi");
    }

    #[tokio::test]
    async fn apply_change_rebases_a_concurrent_edit_and_returns_a_correction() {
        let control = fresh_control().await;
        let c = cancel();

        control.apply_change::<BodyStreamKind>(0, TextDelta::insert("X"), None, 0, &c).await.unwrap();

        let correction = control.apply_change::<BodyStreamKind>(0, TextDelta::insert("Y"), None, 0, &c).await.unwrap();
        assert_eq!(correction.rev_num, 2);
        assert!(!correction.delta.is_empty());

        let snapshot = control.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.contents.content().unwrap(), "XY");
    }

    #[tokio::test]
    async fn apply_change_where_rebase_collapses_to_empty_appends_nothing() {
        let control = fresh_control().await;
        let c = cancel();

        control.apply_change::<BodyStreamKind>(0, TextDelta::insert("ab"), None, 0, &c).await.unwrap();
        control
            .apply_change::<BodyStreamKind>(1, TextDelta { ops: vec![TextOp::Delete(2)] }, None, 0, &c)
            .await
            .unwrap();
        assert_eq!(control.current_rev_num(), 2);

        // A second client, still on base_rev=1, submits the same delete.
        // Transformed against the server's already-applied delete, this
        // collapses to empty: nothing new should be appended.
        let result = control
            .apply_change::<BodyStreamKind>(1, TextDelta { ops: vec![TextOp::Delete(2)] }, None, 0, &c)
            .await
            .unwrap();
        assert_eq!(result.rev_num, 2);
        assert!(result.delta.is_empty());
        assert_eq!(control.current_rev_num(), 2);
    }

    #[tokio::test]
    async fn apply_change_rejects_a_base_rev_ahead_of_the_log() {
        let control = fresh_control().await;
        let err = control.apply_change::<BodyStreamKind>(5, TextDelta::insert("z"), None, 0, &cancel()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BadValue);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_change_exhausts_the_retry_budget_against_an_always_conflicting_store() {
        let store = Arc::new(MemoryFileStore::new());
        store.create().await.unwrap();
        let change0 = encode_change(&Change { rev_num: 0, delta: TextDelta::identity(), timestamp_ms: None, author_id: None }).unwrap();
        store.transact(TransactionSpec::new().write_path(change_path("body", 0), change0)).await.unwrap();
        store.set_always_conflicting(true);

        let control = Control::new(store, "body", 0);
        let err = control.apply_change::<BodyStreamKind>(0, TextDelta::insert("z"), None, 0, &cancel()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TooManyRetries);
    }
}
