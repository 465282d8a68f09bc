//! End-to-end scenarios exercising `DocComplex` + `Control` together
//! (Scenarios A-F).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use bayou_docs::delta::text::TextDelta;
use bayou_docs::doc_complex::{DocComplex, DocStatus, OpenOutcome};
use bayou_docs::error::ErrorKind;
use bayou_docs::storage::memory::MemoryFileStore;
use bayou_docs::storage::FileStore;
use bayou_docs::DeltaAlgebra;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

async fn fresh_doc() -> Arc<DocComplex> {
    let _ = env_logger::try_init();
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    DocComplex::create(store, None).await.unwrap()
}

#[tokio::test]
async fn scenario_a_empty_create() {
    let doc = fresh_doc().await;
    assert_eq!(doc.body().current_rev_num(), 0);
    let snapshot = doc.body().get_snapshot(None).await.unwrap();
    assert_eq!(snapshot.rev_num, 0);
    assert_eq!(snapshot.contents.content().unwrap(), "");
}

#[tokio::test]
async fn scenario_b_linear_edits() {
    let doc = fresh_doc().await;
    let c = cancel();

    let first = doc.body().apply_change(0, TextDelta::insert("hi"), Some("a1".into()), 1, &c).await.unwrap();
    assert_eq!(first.rev_num, 1);
    assert!(first.delta.is_empty());

    let second = doc
        .body()
        .apply_change(1, TextDelta::retain_then_insert(2, "!"), Some("a1".into()), 2, &c)
        .await
        .unwrap();
    assert_eq!(second.rev_num, 2);
    assert!(second.delta.is_empty());

    let snapshot = doc.body().get_snapshot(None).await.unwrap();
    assert_eq!(snapshot.rev_num, 2);
    assert_eq!(snapshot.contents.content().unwrap(), "hi!");
}

#[tokio::test]
async fn scenario_c_conflict_and_correction() {
    let doc = fresh_doc().await;
    let c = cancel();

    let x = doc.body().apply_change(0, TextDelta::insert("X"), Some("x".into()), 1, &c).await.unwrap();
    assert_eq!(x.rev_num, 1);
    assert!(x.delta.is_empty());

    let y = doc.body().apply_change(0, TextDelta::insert("Y"), Some("y".into()), 2, &c).await.unwrap();
    assert_eq!(y.rev_num, 2);
    assert!(!y.delta.is_empty(), "client Y must receive a non-trivial correction");

    // Replaying client Y's own view (base="", submitted Ins("Y")) through
    // the correction must land on the same document the server now holds.
    let base_view = TextDelta::identity();
    let client_expected = base_view.compose(&TextDelta::insert("Y")).unwrap();
    let corrected = client_expected.compose(&y.delta).unwrap();
    let snapshot = doc.body().get_snapshot(None).await.unwrap();
    assert_eq!(corrected.content().unwrap(), snapshot.contents.content().unwrap());
    assert_eq!(snapshot.contents.content().unwrap(), "XY");
}

#[tokio::test]
async fn scenario_d_long_poll_resolves_on_concurrent_append() {
    let doc = fresh_doc().await;
    let c = cancel();

    for i in 0..5 {
        doc.body().apply_change(i, TextDelta::insert("x"), Some("a1".into()), i, &c).await.unwrap();
    }
    assert_eq!(doc.body().current_rev_num(), 5);

    let waiter_doc = doc.clone();
    let waiter_cancel = cancel();
    let waiter = tokio::spawn(async move {
        waiter_doc.body().get_change_after(5, Some(Duration::from_secs(30)), &waiter_cancel).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let applied = doc.body().apply_change(5, TextDelta::insert("y"), Some("a1".into()), 6, &c).await.unwrap();
    assert_eq!(applied.rev_num, 6);

    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.rev_num, 6);
    assert!(resolved.rev_num > 5);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_retry_budget_exhausted() {
    let _ = env_logger::try_init();
    let store = Arc::new(MemoryFileStore::new());
    let doc = DocComplex::create(store.clone(), None).await.unwrap();
    store.set_always_conflicting(true);

    let c = cancel();
    let started = tokio::time::Instant::now();
    let err = doc.body().apply_change(0, TextDelta::insert("z"), Some("a1".into()), 0, &c).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TooManyRetries);
    assert!(started.elapsed() >= Duration::from_secs(20));
}

#[tokio::test]
async fn scenario_f_caret_idle_reap() {
    let doc = fresh_doc().await;
    let c = cancel();

    let session = doc.open_session("a1", 0, &c).await.unwrap();
    let before = doc.caret().get_snapshot(None).await.unwrap();
    assert!(before.contents.table().unwrap().contains_key(session.caret_id()));

    session.update_caret(3, 0, 0, 1, &c).await.unwrap();

    // now_ms far past the idle threshold from the last touch at t=1ms.
    let reaped = doc.caret().reap_idle(u64::MAX, &c).await.unwrap();
    assert_eq!(reaped, vec![session.caret_id().to_string()]);

    let after = doc.caret().get_snapshot(None).await.unwrap();
    assert!(!after.contents.table().unwrap().contains_key(session.caret_id()));
}

#[tokio::test]
async fn scenario_open_reports_not_found_then_ok_after_create() {
    let _ = env_logger::try_init();
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    let not_found = DocComplex::open(store.clone()).await.unwrap();
    assert_eq!(not_found.status(), DocStatus::NotFound);

    let _doc = DocComplex::create(store.clone(), None).await.unwrap();
    let ready = DocComplex::open(store).await.unwrap();
    assert_eq!(ready.status(), DocStatus::Ok);
    assert!(matches!(ready, OpenOutcome::Ready(_)));
}

#[tokio::test]
async fn scenario_open_reports_migrate_on_format_mismatch() {
    let _ = env_logger::try_init();
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    let _doc = DocComplex::create(store.clone(), None).await.unwrap();

    store
        .transact(
            bayou_docs::storage::TransactionSpec::new()
                .write_path(bayou_docs::path::format_version_path(), b"999".to_vec()),
        )
        .await
        .unwrap();

    let outcome = DocComplex::open(store).await.unwrap();
    assert_eq!(outcome.status(), DocStatus::Migrate);
}

#[tokio::test]
async fn scenario_open_reports_error_on_corrupted_revision_number() {
    let _ = env_logger::try_init();
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    let _doc = DocComplex::create(store.clone(), None).await.unwrap();

    // Simulate out-of-band corruption: caret's revision_number is left with
    // the wrong byte width, so `read_head` must report storage_corrupt.
    store
        .transact(
            bayou_docs::storage::TransactionSpec::new()
                .write_path(bayou_docs::path::revision_number_path("caret"), b"not-eight-bytes".to_vec()),
        )
        .await
        .unwrap();

    let outcome = DocComplex::open(store).await.unwrap();
    assert_eq!(outcome.status(), DocStatus::Error);
    assert!(matches!(outcome, OpenOutcome::Error));
}
