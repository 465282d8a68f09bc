//! `DocComplex` lifecycle and the process-owned registry keyed by doc id
//! (§4.7, §9). Replaces the source's mutable process-wide singletons with
//! an explicit registry constructed once at the edge.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex as AsyncMutex;

use crate::control::body::BodyControl;
use crate::control::caret::CaretControl;
use crate::control::property::PropertyControl;
use crate::delta::text::TextDelta;
use crate::delta::DeltaAlgebra;
use crate::error::{BayouError, ErrorKind};
use crate::path::{change_path, format_version_path, revision_number_path};
use crate::session::{Session, SessionRegistry};
use crate::storage::FileStore;

/// The core's configured persisted format. An on-disk file whose
/// `/format_version` differs is not opened for mutation (§4.7, §8 property 8).
pub const FORMAT_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    NotFound,
    Migrate,
    Ok,
    Error,
}

pub enum OpenOutcome {
    NotFound,
    Migrate,
    Error,
    Ready(Arc<DocComplex>),
}

impl OpenOutcome {
    pub fn status(&self) -> DocStatus {
        match self {
            OpenOutcome::NotFound => DocStatus::NotFound,
            OpenOutcome::Migrate => DocStatus::Migrate,
            OpenOutcome::Error => DocStatus::Error,
            OpenOutcome::Ready(_) => DocStatus::Ok,
        }
    }
}

/// The per-document in-memory coordinator (§2, §GLOSSARY): owns the three
/// streams plus the session registry. At most one instance per document id
/// lives at a time, enforced by [`DocComplexRegistry`].
pub struct DocComplex {
    store: Arc<dyn FileStore>,
    body: BodyControl,
    caret: CaretControl,
    property: PropertyControl,
    sessions: SessionRegistry,
    failed: StdMutex<Option<ErrorKind>>,
}

impl DocComplex {
    pub fn body(&self) -> &BodyControl {
        &self.body
    }

    pub fn caret(&self) -> &CaretControl {
        &self.caret
    }

    pub fn property(&self) -> &PropertyControl {
        &self.property
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Fails fast with the recorded kind if a prior call already hit fatal
    /// corruption (§4.8, §7): `storage_corrupt` and `invariant_violation`
    /// mark the whole document unusable until it is re-opened.
    pub fn check_not_failed(&self) -> Result<(), BayouError> {
        match *self.failed.lock().unwrap() {
            Some(kind) => Err(BayouError::new(kind, format!("document previously failed with {kind}"))),
            None => Ok(()),
        }
    }

    /// Records `result`'s error as the document's permanent failure if its
    /// kind is fatal (§4.8), then returns `result` unchanged.
    pub(crate) fn note_result<T>(&self, result: Result<T, BayouError>) -> Result<T, BayouError> {
        if let Err(e) = &result {
            if e.kind.is_fatal() {
                *self.failed.lock().unwrap() = Some(e.kind);
            }
        }
        result
    }

    async fn read_head(store: &Arc<dyn FileStore>, prefix: &'static str) -> Result<u64, BayouError> {
        let result = store
            .transact(crate::storage::TransactionSpec::new().read_path(revision_number_path(prefix)))
            .await?;
        match result.read_at(0) {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_le_bytes(bytes.try_into().expect("checked length")))
            }
            Some(_) => Err(BayouError::storage_corrupt(format!("{prefix}/revision_number has the wrong width"))),
            None => Err(BayouError::storage_corrupt(format!("{prefix}/revision_number is missing"))),
        }
    }

    /// Verifies, for `0..=head`, that every change exists, decodes, and has
    /// `rev_num == i` (change 0 additionally must be empty), then checks
    /// that no stray `change/*` keys exist up to 10 revisions past head
    /// (§4.1 Validation).
    async fn validate_stream<D: crate::delta::DeltaAlgebra>(
        store: &Arc<dyn FileStore>,
        prefix: &'static str,
        head: u64,
    ) -> Result<(), BayouError> {
        let mut spec = crate::storage::TransactionSpec::new();
        for rev in 0..=head {
            spec = spec.read_path(change_path(prefix, rev));
        }
        for rev in (head + 1)..=(head + 10) {
            spec = spec.read_path(change_path(prefix, rev));
        }
        let result = store.transact(spec).await?;

        for rev in 0..=head {
            let bytes = result
                .read_at(rev as usize)
                .ok_or_else(|| BayouError::storage_corrupt(format!("{prefix}/change/{rev} missing")))?;
            let change: crate::control::Change<D> = crate::control::decode_change(bytes)?;
            if change.rev_num != rev {
                return Err(BayouError::storage_corrupt(format!(
                    "{prefix}/change/{rev} has rev_num {}",
                    change.rev_num
                )));
            }
            if rev == 0 && !change.delta.is_empty() {
                return Err(BayouError::storage_corrupt(format!("{prefix}/change/0 must be the empty change")));
            }
        }
        for rev in (head + 1)..=(head + 10) {
            if result.read_at(rev as usize).is_some() {
                return Err(BayouError::storage_corrupt(format!(
                    "{prefix}/change/{rev} exists past the recorded head {head}"
                )));
            }
        }
        Ok(())
    }

    /// Opens the document file backed by `store` (§4.7).
    pub async fn open(store: Arc<dyn FileStore>) -> Result<OpenOutcome, BayouError> {
        if !store.exists().await? {
            return Ok(OpenOutcome::NotFound);
        }

        let fmt_result =
            store.transact(crate::storage::TransactionSpec::new().read_path(format_version_path())).await?;
        let format_version = fmt_result.read_at(0).map(|b| String::from_utf8_lossy(b).into_owned());
        if format_version.as_deref() != Some(FORMAT_VERSION) {
            log::debug!("format_version mismatch on open: found {:?}, expected {FORMAT_VERSION}", format_version);
            return Ok(OpenOutcome::Migrate);
        }

        let validation = async {
            let body_head = Self::read_head(&store, "body").await?;
            let caret_head = Self::read_head(&store, "caret").await?;
            let property_head = Self::read_head(&store, "property").await?;
            Self::validate_stream::<TextDelta>(&store, "body", body_head).await?;
            Self::validate_stream::<crate::delta::caret::CaretDelta>(&store, "caret", caret_head).await?;
            Self::validate_stream::<crate::delta::property::PropertyDelta>(&store, "property", property_head).await?;
            Ok::<(u64, u64, u64), BayouError>((body_head, caret_head, property_head))
        }
        .await;

        let (body_head, caret_head, property_head) = match validation {
            Ok(heads) => heads,
            Err(e) if e.kind.is_fatal() => {
                log::error!("document failed validation on open with {}: {}", e.kind, e.message);
                return Ok(OpenOutcome::Error);
            }
            Err(e) => return Err(e),
        };

        Ok(OpenOutcome::Ready(Arc::new(DocComplex {
            store: store.clone(),
            body: BodyControl::new(store.clone(), body_head),
            caret: CaretControl::new(store.clone(), caret_head),
            property: PropertyControl::new(store, property_head),
            sessions: SessionRegistry::new(),
            failed: StdMutex::new(None),
        })))
    }

    /// Creates a new document file (§4.7): atomic transaction requiring
    /// `format_version` and each stream's `revision_number` to be absent.
    pub async fn create(store: Arc<dyn FileStore>, initial_body_delta: Option<TextDelta>) -> Result<Arc<DocComplex>, BayouError> {
        store.create().await?;

        let body_change0 = crate::control::encode_change(&crate::control::Change::<TextDelta> {
            rev_num: 0,
            delta: TextDelta::identity(),
            timestamp_ms: None,
            author_id: None,
        })?;
        let caret_change0 = crate::control::encode_change(&crate::control::Change::<crate::delta::caret::CaretDelta> {
            rev_num: 0,
            delta: crate::delta::caret::CaretDelta::identity(),
            timestamp_ms: None,
            author_id: None,
        })?;
        let property_change0 =
            crate::control::encode_change(&crate::control::Change::<crate::delta::property::PropertyDelta> {
                rev_num: 0,
                delta: crate::delta::property::PropertyDelta::identity(),
                timestamp_ms: None,
                author_id: None,
            })?;

        let body_head: u64 = if initial_body_delta.is_some() { 1 } else { 0 };

        let mut spec = crate::storage::TransactionSpec::new()
            .check_path_empty(format_version_path())
            .check_path_empty(revision_number_path("body"))
            .check_path_empty(revision_number_path("caret"))
            .check_path_empty(revision_number_path("property"))
            .write_path(format_version_path(), FORMAT_VERSION.as_bytes().to_vec())
            .write_path(change_path("body", 0), body_change0)
            .write_path(change_path("caret", 0), caret_change0)
            .write_path(change_path("property", 0), property_change0)
            .write_path(revision_number_path("body"), body_head.to_le_bytes().to_vec())
            .write_path(revision_number_path("caret"), 0u64.to_le_bytes().to_vec())
            .write_path(revision_number_path("property"), 0u64.to_le_bytes().to_vec());

        if let Some(delta) = initial_body_delta {
            let change = crate::control::encode_change(&crate::control::Change {
                rev_num: 1,
                delta,
                timestamp_ms: Some(0),
                author_id: None,
            })?;
            spec = spec.write_path(change_path("body", 1), change);
        }

        store.transact(spec).await?;

        Ok(Arc::new(DocComplex {
            store: store.clone(),
            body: BodyControl::new(store.clone(), body_head),
            caret: CaretControl::new(store.clone(), 0),
            property: PropertyControl::new(store, 0),
            sessions: SessionRegistry::new(),
            failed: StdMutex::new(None),
        }))
    }

    /// Storage-layer delete; in-memory state is discarded (§4.7).
    pub async fn delete(&self) -> Result<(), BayouError> {
        self.store.delete().await?;
        Ok(())
    }

    /// Allocates a fresh caret session for `author_id` (§4.2, §4.6).
    pub async fn open_session(
        self: &Arc<Self>,
        author_id: impl Into<String>,
        now_ms: u64,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Session, BayouError> {
        self.check_not_failed()?;
        let author_id = author_id.into();
        let doc_rev = self.body.current_rev_num();
        let session =
            self.note_result(self.caret.make_new_session(author_id.clone(), doc_rev, now_ms, cancel).await)?;
        Ok(Session::new(self.clone(), session.author_id, session.caret_id))
    }
}

/// Process-owned registry guaranteeing at most one live [`DocComplex`] per
/// document id (§5, §9). `open_doc` is the caller-supplied mapping from a
/// document id to its backing [`FileStore`], decoupling the registry from
/// any one storage backend.
pub struct DocComplexRegistry {
    docs: AsyncMutex<HashMap<String, Arc<DocComplex>>>,
}

impl DocComplexRegistry {
    pub fn new() -> Self {
        Self { docs: AsyncMutex::new(HashMap::new()) }
    }

    /// Returns the live `DocComplex` for `doc_id`, opening it via
    /// `make_store` if this is the first request for it. Only `Ready`
    /// outcomes are cached; `NotFound`/`Migrate`/`Error` are recomputed on
    /// every call since they don't produce a usable coordinator.
    pub async fn get_or_open(
        &self,
        doc_id: &str,
        make_store: impl FnOnce() -> Arc<dyn FileStore>,
    ) -> Result<OpenOutcome, BayouError> {
        {
            let docs = self.docs.lock().await;
            if let Some(doc) = docs.get(doc_id) {
                return Ok(OpenOutcome::Ready(doc.clone()));
            }
        }

        let mut docs = self.docs.lock().await;
        if let Some(doc) = docs.get(doc_id) {
            return Ok(OpenOutcome::Ready(doc.clone()));
        }

        let outcome = DocComplex::open(make_store()).await?;
        if let OpenOutcome::Ready(doc) = &outcome {
            docs.insert(doc_id.to_string(), doc.clone());
        }
        Ok(outcome)
    }

    /// Removes `doc_id`'s cached instance, if any, without touching storage.
    pub async fn evict(&self, doc_id: &str) {
        self.docs.lock().await.remove(doc_id);
    }

    pub async fn live_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

impl Default for DocComplexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryFileStore;
    use tokio_util::sync::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn create_rejects_a_store_with_a_preexisting_stream_revision_number() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        store.create().await.unwrap();
        store
            .transact(crate::storage::TransactionSpec::new().write_path(revision_number_path("caret"), 0u64.to_le_bytes().to_vec()))
            .await
            .unwrap();

        let err = DocComplex::create(store, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathNotEmpty);
    }

    #[tokio::test]
    async fn open_returns_not_found_for_an_absent_store() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let outcome = DocComplex::open(store).await.unwrap();
        assert_eq!(outcome.status(), DocStatus::NotFound);
    }

    #[tokio::test]
    async fn check_not_failed_latches_the_first_fatal_kind() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let doc = DocComplex::create(store, None).await.unwrap();
        assert!(doc.check_not_failed().is_ok());

        let result: Result<(), BayouError> = Err(BayouError::storage_corrupt("change/3 failed to decode"));
        doc.note_result(result).unwrap_err();

        let err = doc.check_not_failed().unwrap_err();
        assert_eq!(err.kind, ErrorKind::StorageCorrupt);

        // a later, non-fatal result must not clear or override the latch
        let later: Result<(), BayouError> = Err(BayouError::bad_value("unrelated"));
        doc.note_result(later).unwrap_err();
        let err = doc.check_not_failed().unwrap_err();
        assert_eq!(err.kind, ErrorKind::StorageCorrupt);
    }

    #[tokio::test]
    async fn note_result_passes_through_non_fatal_errors_without_latching() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let doc = DocComplex::create(store, None).await.unwrap();

        let result: Result<(), BayouError> = Err(BayouError::bad_value("bad baseRev"));
        doc.note_result(result).unwrap_err();
        assert!(doc.check_not_failed().is_ok());
    }

    #[tokio::test]
    async fn open_session_fails_fast_once_the_document_is_marked_failed() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let doc = DocComplex::create(store, None).await.unwrap();
        let result: Result<(), BayouError> = Err(BayouError::invariant_violation("compose left the algebra"));
        doc.note_result(result).unwrap_err();

        let err = doc.open_session("a1", 0, &cancel()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvariantViolation);
    }
}
