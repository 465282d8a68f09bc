//! The document-properties stream: a thin face on `Control<PropertyDelta>`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::delta::property::PropertyDelta;
use crate::error::BayouError;
use crate::storage::FileStore;

use super::{Change, Control, Snapshot, StreamKind};

pub struct PropertyStreamKind;

impl StreamKind for PropertyStreamKind {
    fn path_prefix() -> &'static str {
        "property"
    }
}

/// Revisioned log of key/value document properties (§4.3).
pub struct PropertyControl {
    inner: Control<PropertyDelta>,
}

impl PropertyControl {
    pub fn new(store: Arc<dyn FileStore>, head: u64) -> Self {
        Self { inner: Control::new(store, PropertyStreamKind::path_prefix(), head) }
    }

    pub fn current_rev_num(&self) -> u64 {
        self.inner.current_rev_num()
    }

    pub async fn get_snapshot(&self, rev: Option<u64>) -> Result<Snapshot<PropertyDelta>, BayouError> {
        self.inner.get_snapshot(rev).await
    }

    pub async fn get_change(&self, rev: u64) -> Result<Change<PropertyDelta>, BayouError> {
        self.inner.get_change(rev).await
    }

    pub async fn get_change_after(
        &self,
        base_rev: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Change<PropertyDelta>, BayouError> {
        self.inner.get_change_after(base_rev, timeout, cancel).await
    }

    pub async fn set(
        &self,
        base_rev: u64,
        name: impl Into<String>,
        value: impl Into<String>,
        author_id: Option<String>,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<PropertyDelta>, BayouError> {
        let delta = PropertyDelta::set(name, value);
        self.inner.apply_change::<PropertyStreamKind>(base_rev, delta, author_id, now_ms, cancel).await
    }

    pub async fn delete(
        &self,
        base_rev: u64,
        name: impl Into<String>,
        author_id: Option<String>,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Change<PropertyDelta>, BayouError> {
        let delta = PropertyDelta::delete(name);
        self.inner.apply_change::<PropertyStreamKind>(base_rev, delta, author_id, now_ms, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::encode_change;
    use crate::delta::DeltaAlgebra;
    use crate::path::change_path;
    use crate::storage::memory::MemoryFileStore;
    use crate::storage::TransactionSpec;

    async fn fresh_property() -> PropertyControl {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        store.create().await.unwrap();
        let change0 = encode_change(&Change {
            rev_num: 0,
            delta: PropertyDelta::identity(),
            timestamp_ms: None,
            author_id: None,
        })
        .unwrap();
        store.transact(TransactionSpec::new().write_path(change_path("property", 0), change0)).await.unwrap();
        PropertyControl::new(store, 0)
    }

    #[tokio::test]
    async fn set_then_delete_round_trips_through_snapshots() {
        let properties = fresh_property().await;
        let cancel = CancellationToken::new();

        properties.set(0, "title", "Untitled", None, 0, &cancel).await.unwrap();
        let snapshot = properties.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.contents.table().unwrap().get("title").map(String::as_str), Some("Untitled"));

        properties.delete(snapshot.rev_num, "title", None, 1, &cancel).await.unwrap();
        let snapshot = properties.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.contents.table().unwrap().get("title"), None);
    }

    #[tokio::test]
    async fn concurrent_sets_on_different_keys_both_survive() {
        let properties = fresh_property().await;
        let cancel = CancellationToken::new();

        properties.set(0, "title", "A", None, 0, &cancel).await.unwrap();
        properties.set(0, "author", "B", None, 0, &cancel).await.unwrap();

        let snapshot = properties.get_snapshot(None).await.unwrap();
        let table = snapshot.contents.table().unwrap();
        assert_eq!(table.get("title").map(String::as_str), Some("A"));
        assert_eq!(table.get("author").map(String::as_str), Some("B"));
    }
}
