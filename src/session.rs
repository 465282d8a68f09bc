//! `SessionRegistry` and the author-facing `Session` handle (§4.6).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::delta::caret::CaretDelta;
use crate::delta::property::PropertyDelta;
use crate::delta::text::TextDelta;
use crate::doc_complex::DocComplex;
use crate::error::BayouError;

/// Maps `authorId` to the set of caret ids it currently owns a session
/// through. Sessions are reaped alongside carets (§4.2).
#[derive(Default)]
pub struct SessionRegistry {
    by_author: StdMutex<HashMap<String, HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, author_id: &str, caret_id: &str) {
        self.by_author.lock().unwrap().entry(author_id.to_string()).or_default().insert(caret_id.to_string());
    }

    pub fn unregister(&self, author_id: &str, caret_id: &str) {
        let mut guard = self.by_author.lock().unwrap();
        if let Some(carets) = guard.get_mut(author_id) {
            carets.remove(caret_id);
            if carets.is_empty() {
                guard.remove(author_id);
            }
        }
    }

    pub fn carets_for(&self, author_id: &str) -> Vec<String> {
        self.by_author.lock().unwrap().get(author_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }
}

/// An author's edit handle into one document (§4.6). Every method stamps
/// `author_id` automatically; the wire-visible edit API in §6 is exposed
/// through these methods.
pub struct Session {
    doc: Arc<DocComplex>,
    author_id: String,
    caret_id: String,
}

impl Session {
    pub(crate) fn new(doc: Arc<DocComplex>, author_id: String, caret_id: String) -> Self {
        doc.sessions().register(&author_id, &caret_id);
        Self { doc, author_id, caret_id }
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn caret_id(&self) -> &str {
        &self.caret_id
    }

    pub async fn get_change_after(
        &self,
        base_rev: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<crate::control::Change<TextDelta>, BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(self.doc.body().get_change_after(base_rev, timeout, cancel).await)
    }

    pub async fn apply_change(
        &self,
        base_rev: u64,
        delta: TextDelta,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<crate::control::Change<TextDelta>, BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(
            self.doc.body().apply_change(base_rev, delta, Some(self.author_id.clone()), now_ms, cancel).await,
        )
    }

    pub async fn get_snapshot(&self, rev: Option<u64>) -> Result<crate::control::Snapshot<TextDelta>, BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(self.doc.body().get_snapshot(rev).await)
    }

    pub async fn update_caret(
        &self,
        index: u64,
        length: u64,
        doc_rev: u64,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<crate::control::Change<CaretDelta>, BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(
            self.doc
                .caret()
                .update_caret(&self.caret_id, &self.author_id, index, length, doc_rev, now_ms, cancel)
                .await,
        )
    }

    pub async fn end_session(&self, now_ms: u64, cancel: &CancellationToken) -> Result<(), BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(
            self.doc.caret().end_session(&self.caret_id, &self.author_id, now_ms, cancel).await,
        )?;
        self.doc.sessions().unregister(&self.author_id, &self.caret_id);
        Ok(())
    }

    pub async fn set_property(
        &self,
        base_rev: u64,
        name: impl Into<String>,
        value: impl Into<String>,
        now_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<crate::control::Change<PropertyDelta>, BayouError> {
        self.doc.check_not_failed()?;
        self.doc.note_result(self.doc.property().set(base_rev, name, value, Some(self.author_id.clone()), now_ms, cancel).await)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.doc.sessions().unregister(&self.author_id, &self.caret_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_tracks_carets_per_author() {
        let registry = SessionRegistry::new();
        registry.register("a1", "c1");
        registry.register("a1", "c2");
        assert_eq!(registry.carets_for("a1").len(), 2);
        registry.unregister("a1", "c1");
        assert_eq!(registry.carets_for("a1"), vec!["c2".to_string()]);
        registry.unregister("a1", "c2");
        assert!(registry.carets_for("a1").is_empty());
    }
}
