//! Concurrency test
//!
//! Readers on plain OS threads page through facets while a store streams
//! into them, and independent stores load in parallel without sharing
//! state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use explorer_cache::{
    BucketConfig, Buckets, ContextManager, Facet, PeriodAccumulator, Registry, SortSpec,
};
use explorer_types::ids::ScopeKey;
use explorer_types::period::Period;
use explorer_types::state::LoadState;
use simulation::{Scenario, SyntheticProducer, SyntheticRecord};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_readers_during_stream() {
    let rt = runtime();
    let producer = SyntheticProducer::new(Scenario::Slow(300, Duration::from_micros(500)), 11);
    let store = Arc::new(producer.store("slow", Arc::new(ContextManager::new())));

    let facets: Vec<_> = ["ETH", "USDC", "DAI"]
        .into_iter()
        .map(|asset| {
            Facet::builder(asset, Arc::clone(&store))
                .with_filter(move |r: &SyntheticRecord| r.asset == asset)
                .build()
        })
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = facets
        .iter()
        .map(|facet| {
            let facet = Arc::clone(facet);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0;
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let count = facet.count();
                    // A view only grows while one fetch streams into it.
                    assert!(count >= last, "view shrank from {} to {}", last, count);
                    last = count;
                    reads += 1;
                    thread::yield_now();
                }
                reads
            })
        })
        .collect();

    let collected = rt.block_on(store.fetch()).unwrap();
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    assert_eq!(collected, 300);
    assert_eq!(store.state(), LoadState::Loaded);
    let total: usize = facets.iter().map(|f| f.count()).sum();
    assert_eq!(total, 300);
}

#[test]
fn test_pages_from_many_threads_after_load() {
    let rt = runtime();
    let producer = SyntheticProducer::new(Scenario::Clean(500), 3);
    let store = Arc::new(producer.store("paged", Arc::new(ContextManager::new())));
    let facet = Facet::new("all", Arc::clone(&store));
    rt.block_on(store.fetch()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let facet = Arc::clone(&facet);
            thread::spawn(move || {
                let mut seen = 0;
                let mut first = worker * 125;
                while first < (worker + 1) * 125 {
                    let page = facet
                        .get_page(first as i64, 25, None, &SortSpec::default(), None)
                        .unwrap();
                    assert_eq!(page.total_items, 500);
                    seen += page.items.len();
                    first += 25;
                }
                seen
            })
        })
        .collect();

    let seen: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(seen, 500);
}

#[test]
fn test_independent_stores_in_parallel() {
    let handles: Vec<_> = (0..4u64)
        .map(|seed| {
            thread::spawn(move || {
                let rt = runtime();
                let producer = SyntheticProducer::new(Scenario::Clean(1_000), seed);
                let store = Arc::new(producer.store("transfers", Arc::new(ContextManager::new())));
                let daily = Arc::new(PeriodAccumulator::<SyntheticRecord>::flows(Period::Daily));
                let facet = Facet::builder("daily", Arc::clone(&store))
                    .with_accumulator(daily.clone())
                    .build();

                let collected = rt.block_on(store.fetch()).unwrap();
                assert_eq!(facet.count(), 1_000);
                assert_eq!(daily.summaries().len(), 1_000);
                collected
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 4_000);
}

#[test]
fn test_registry_clear_stops_streams() {
    let rt = runtime();
    let registry = Registry::new();
    let producer = SyntheticProducer::new(Scenario::Slow(10_000, Duration::from_millis(1)), 5);

    let store = registry
        .get_or_insert_with("transfers", &ScopeKey::chain("mainnet"), |contexts| {
            Arc::new(producer.store("transfers/mainnet", Arc::clone(contexts)))
        })
        .unwrap();

    let result = rt.block_on(async {
        let fetching = Arc::clone(&store);
        let task = tokio::spawn(async move { fetching.fetch().await });
        while store.count() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        registry.clear();
        task.await.unwrap()
    });

    let collected = result.unwrap();
    assert!(collected >= 5 && collected < 10_000);
    assert_eq!(store.state(), LoadState::Loaded);
    assert!(registry.is_empty());
}

#[test]
fn test_chart_fold_across_threads() {
    let rt = runtime();
    let producer = SyntheticProducer::new(Scenario::Clean(2_000), 21);
    let store = Arc::new(producer.store("chart", Arc::new(ContextManager::new())));
    let config = BucketConfig {
        bucket_size: 10_000,
        columns: 10,
        max_buckets: 4_096,
    };
    let facet = Facet::builder("chart", Arc::clone(&store))
        .with_bucket_fold(config, |r: &SyntheticRecord, buckets: &mut Buckets| {
            buckets.add_fact(&r.asset, r.block, r.block, r.value)
        })
        .build();

    rt.block_on(store.fetch()).unwrap();

    let buckets = facet.get_buckets();
    let charted: f64 = buckets
        .series
        .values()
        .flat_map(|series| series.iter().map(|b| b.total))
        .sum();
    let streamed: f64 = producer.records().iter().map(|r| r.value).sum();
    assert!((charted - streamed).abs() < 1e-6 * streamed.max(1.0));
    assert!(buckets.grid_info.rows >= 1);
}
