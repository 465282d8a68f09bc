use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bayou_docs::delta::text::TextDelta;
use bayou_docs::doc_complex::DocComplex;
use bayou_docs::storage::memory::MemoryFileStore;
use bayou_docs::storage::FileStore;
use bayou_docs::DeltaAlgebra;

fn bench_text_compose(c: &mut Criterion) {
    let doc = TextDelta::insert("the quick brown fox jumps over the lazy dog");
    let edit = TextDelta::retain_then_insert(9, "very ");

    c.bench_function("text_compose_small_insert", |b| {
        b.iter(|| black_box(doc.compose(black_box(&edit)).unwrap()));
    });
}

fn bench_text_transform(c: &mut Criterion) {
    let server = TextDelta::retain_then_insert(4, "X");
    let client = TextDelta::retain_then_insert(4, "Y");

    c.bench_function("text_transform_concurrent_insert", |b| {
        b.iter(|| {
            black_box(server.transform(black_box(&client), bayou_docs::Priority::Left).unwrap())
        });
    });
}

fn bench_text_diff(c: &mut Criterion) {
    let a = TextDelta::insert("the quick brown fox");
    let b_doc = TextDelta::insert("the very quick brown fox jumps");

    c.bench_function("text_diff_prefix_suffix", |b| {
        b.iter(|| black_box(a.diff(black_box(&b_doc)).unwrap()));
    });
}

async fn setup_doc() -> Arc<DocComplex> {
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    DocComplex::create(store, None).await.unwrap()
}

fn bench_sequential_apply_change(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("body_apply_change_sequential_append", |b| {
        b.iter_batched(
            || rt.block_on(setup_doc()),
            |doc| {
                rt.block_on(async {
                    let cancel = tokio_util::sync::CancellationToken::new();
                    let body = doc.body();
                    let mut base_rev = body.current_rev_num();
                    for i in 0..20 {
                        let change = body
                            .apply_change(
                                base_rev,
                                TextDelta::insert(format!("{i}")),
                                Some("bench-author".to_string()),
                                0,
                                &cancel,
                            )
                            .await
                            .unwrap();
                        base_rev = if change.delta.is_empty() { base_rev + 1 } else { change.rev_num };
                    }
                    black_box(body.current_rev_num())
                })
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_snapshot_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let doc = rt.block_on(async {
        let doc = setup_doc().await;
        let cancel = tokio_util::sync::CancellationToken::new();
        doc.body().apply_change(0, TextDelta::insert("warm"), None, 0, &cancel).await.unwrap();
        doc
    });

    c.bench_function("body_get_snapshot_cache_hit", |b| {
        b.iter(|| rt.block_on(async { black_box(doc.body().get_snapshot(None).await.unwrap()) }));
    });
}

criterion_group!(
    benches,
    bench_text_compose,
    bench_text_transform,
    bench_text_diff,
    bench_sequential_apply_change,
    bench_snapshot_cache_hit,
);
criterion_main!(benches);
