use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use patterndb::codec::{max_pattern_distance, PATTERN_VALUES};
use patterndb::pivot::select_pivots;
use patterndb::{Pattern, PatternStore, PivotIndex, SearchOptions, SimilarityEngine, StoreOptions};

const RECORDS: u64 = 20_000;

fn options() -> StoreOptions {
    StoreOptions {
        fsync_writes: false,
        chunk_records: 128,
    }
}

fn random_pattern(rng: &mut StdRng) -> Pattern {
    let base = [
        rng.gen_range(0.0f32..100.0),
        rng.gen_range(-60.0f32..60.0),
        rng.gen_range(-60.0f32..60.0),
    ];
    let mut values = Vec::with_capacity(PATTERN_VALUES);
    for _ in 0..PATTERN_VALUES / 3 {
        for c in base {
            values.push(c + rng.gen_range(-4.0f32..4.0));
        }
    }
    Pattern::from_values(values).expect("finite pattern")
}

fn preload(store: &PatternStore, n: u64) {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for id in 0..n {
        store.put(id, &random_pattern(&mut rng)).expect("put");
    }
}

fn engine(prune: bool) -> SimilarityEngine {
    let store = Arc::new(PatternStore::in_memory(options()));
    preload(&store, RECORDS);
    let engine = SimilarityEngine::new(
        store,
        SearchOptions {
            prune_with_pivots: prune,
            ..SearchOptions::default()
        },
    );
    if prune {
        let candidates: Vec<(u64, Pattern)> = engine
            .store()
            .records()
            .into_iter()
            .map(|r| (r.artwork_id, r.pattern))
            .collect();
        let index = PivotIndex::build(select_pivots(&candidates, 32)).expect("pivots");
        engine.install_pivots(Some(Arc::new(index)));
    }
    engine
}

fn queries() -> Vec<Pattern> {
    let mut rng = StdRng::seed_from_u64(0xfeed);
    (0..16).map(|_| random_pattern(&mut rng)).collect()
}

fn bench_put(c: &mut Criterion) {
    c.bench_function("put/10k", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let store = PatternStore::open(dir.path(), options()).expect("open");
                (dir, store)
            },
            |(_dir, store)| preload(&store, 10_000),
            BatchSize::LargeInput,
        );
    });
}

fn bench_search(c: &mut Criterion) {
    let radius = max_pattern_distance() * 0.05;
    let queries = queries();
    for (name, prune) in [("search/linear", false), ("search/pruned", true)] {
        let engine = engine(prune);
        c.bench_function(name, |b| {
            b.iter(|| {
                for q in &queries {
                    let _ = engine.search(q, radius, 20).expect("search");
                }
            });
        });
    }
}

fn bench_select_pivots(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xabcd);
    let candidates: Vec<(u64, Pattern)> = (0..2_000)
        .map(|id| (id, random_pattern(&mut rng)))
        .collect();
    c.bench_function("select-pivots/2k", |b| {
        b.iter(|| select_pivots(&candidates, 32));
    });
}

fn benches(c: &mut Criterion) {
    bench_put(c);
    bench_search(c);
    bench_select_pivots(c);
}

criterion_group!(patterndb_benches, benches);
criterion_main!(patterndb_benches);
