//! The document body stream: a thin, stream-specific face on `Control<TextDelta>`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::delta::text::TextDelta;
use crate::error::BayouError;
use crate::storage::FileStore;

use super::{Change, Control, Snapshot, StreamKind};

pub struct BodyStreamKind;

impl StreamKind for BodyStreamKind {
    fn path_prefix() -> &'static str {
        "body"
    }
}

/// Revisioned log of body deltas and the OT apply/rebase loop (§4.1).
pub struct BodyControl {
    inner: Control<TextDelta>,
}

impl BodyControl {
    pub fn new(store: Arc<dyn FileStore>, head: u64) -> Self {
        Self { inner: Control::new(store, BodyStreamKind::path_prefix(), head) }
    }

    pub fn current_rev_num(&self) -> u64 {
        self.inner.current_rev_num()
    }

    pub async fn get_snapshot(&self, rev: Option<u64>) -> Result<Snapshot<TextDelta>, BayouError> {
        self.inner.get_snapshot(rev).await
    }

    pub async fn get_change(&self, rev: u64) -> Result<Change<TextDelta>, BayouError> {
        self.inner.get_change(rev).await
    }

    pub async fn get_composed_changes(
        &self,
        base: TextDelta,
        start_inc: u64,
        end_exc: u64,
    ) -> Result<TextDelta, BayouError> {
        self.inner.get_composed_changes(base, start_inc, end_exc).await
    }

    pub async fn get_change_after(
        &self,
        base_rev: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Change<TextDelta>, BayouError> {
        self.inner.get_change_after(base_rev, timeout, cancel).await
    }

    /// Applies a client edit (§4.1). Returns the correction change.
    pub async fn apply_change(
        &self,
        base_rev: u64,
        delta: TextDelta,
        author_id: Option<String>,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<TextDelta>, BayouError> {
        self.inner.apply_change::<BodyStreamKind>(base_rev, delta, author_id, now_ms, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{encode_change, Change};
    use crate::delta::DeltaAlgebra;
    use crate::path::change_path;
    use crate::storage::memory::MemoryFileStore;
    use crate::storage::TransactionSpec;

    async fn fresh_body() -> BodyControl {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        store.create().await.unwrap();
        let change0 =
            encode_change(&Change { rev_num: 0, delta: TextDelta::identity(), timestamp_ms: None, author_id: None }).unwrap();
        store.transact(TransactionSpec::new().write_path(change_path("body", 0), change0)).await.unwrap();
        BodyControl::new(store, 0)
    }

    #[tokio::test]
    async fn fresh_body_is_empty_at_revision_zero() {
        let body = fresh_body().await;
        let snapshot = body.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.rev_num, 0);
        assert_eq!(snapshot.contents.content().unwrap(), "");
    }

    #[tokio::test]
    async fn apply_change_then_get_change_returns_the_same_delta() {
        let body = fresh_body().await;
        let cancel = CancellationToken::new();
        body.apply_change(0, TextDelta::insert("hi"), Some("a1".into()), 0, &cancel).await.unwrap();

        let recorded = body.get_change(1).await.unwrap();
        assert_eq!(recorded.delta, TextDelta::insert("hi"));
        assert_eq!(recorded.author_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn get_change_after_returns_immediately_when_already_behind_head() {
        let body = fresh_body().await;
        let cancel = CancellationToken::new();
        body.apply_change(0, TextDelta::insert("hi"), None, 0, &cancel).await.unwrap();

        let change = body.get_change_after(0, Some(Duration::from_secs(1)), &cancel).await.unwrap();
        assert_eq!(change.rev_num, 1);
        assert_eq!(change.delta, TextDelta::insert("hi"));
    }
}
