//! Query integration tests for `alloc_trace`.
//!
//! These tests ingest randomized traces and compare query results against a brute-force scan
//! of the same events. They also cover concurrent queries, cancellation and shutdown.

use std::collections::HashSet;
use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alloc_trace::{
    AllocationItem, AllocationsProvider, CallstackHandle, CallstackResolver, QueryHandle,
    QueryRule, QueryStatus, ThreadScopes,
};
use new_zealand::nz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use testing::with_watchdog;

/// One allocation as the test saw it being ingested.
#[derive(Clone, Copy, Debug)]
struct Recorded {
    start_event_index: u32,
    start: f64,
    end: f64,
}

/// Ingests a random trace of `steps` events and returns every allocation it contained.
///
/// Times advance in steps of 10 ms, with three events sharing each time, so that column start
/// times repeat.
fn ingest_random(provider: &AllocationsProvider, seed: u64, steps: u32) -> Vec<Recorded> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scopes = ThreadScopes::new();
    let mut state = provider.write(&scopes);

    state.init(0.0, 8, 0, 0);

    let mut live: Vec<(u64, Recorded)> = Vec::new();
    let mut recorded = Vec::new();
    let mut next_address = 0x1_0000_u64;

    for event_index in 0..steps {
        let time = f64::from(event_index / 3) * 0.01;

        if live.is_empty() || rng.random_bool(0.55) {
            let owner = rng.random_range(1..50_u64);
            let size = rng.random_range(1..4096_u64);

            state.add_alloc(time, owner, next_address, size, 8, 0);
            live.push((
                next_address,
                Recorded {
                    start_event_index: event_index,
                    start: time,
                    end: f64::INFINITY,
                },
            ));
            next_address += 0x10;
        } else {
            let (address, mut item) = live.swap_remove(rng.random_range(0..live.len()));

            state.add_free(time, address);
            item.end = time;
            recorded.push(item);
        }
    }

    state.on_analysis_completed();
    assert_eq!(state.ingestion_counters().total(), 0);

    recorded.extend(live.into_iter().map(|(_, item)| item));
    recorded
}

fn expected(recorded: &[Recorded], rule: &QueryRule) -> Vec<u32> {
    let mut starts: Vec<u32> = recorded
        .iter()
        .filter(|item| rule.matches(item.start, item.end))
        .map(|item| item.start_event_index)
        .collect();
    starts.sort_unstable();
    starts
}

fn drain(query: &QueryHandle) -> Vec<AllocationItem> {
    let mut items = Vec::new();

    loop {
        match query.poll() {
            QueryStatus::Available(batch) => items.extend(batch),
            QueryStatus::Done => return items,
            _ => thread::yield_now(),
        }
    }
}

fn run(provider: &AllocationsProvider, rule: QueryRule) -> Vec<u32> {
    let query = provider.start_query(rule);

    let mut starts: Vec<u32> = drain(&query)
        .iter()
        .map(AllocationItem::start_event_index)
        .collect();
    starts.sort_unstable();
    starts
}

fn provider(workers: u32) -> AllocationsProvider {
    AllocationsProvider::builder()
        .column_shift(3)
        .query_workers(NonZero::new(workers).unwrap())
        .build()
}

fn random_time(rng: &mut StdRng) -> f64 {
    f64::from(rng.random_range(0..800_u32)) * 0.005
}

fn sample_rules(rng: &mut StdRng) -> Vec<QueryRule> {
    let mut times: Vec<f64> = (0..4).map(|_| random_time(rng)).collect();
    times.sort_by(f64::total_cmp);
    let [a, b, c, d] = [times[0], times[1], times[2], times[3]];

    vec![
        QueryRule::ActiveAt { a },
        QueryRule::EndedBefore { a },
        QueryRule::StartedAfter { a },
        QueryRule::Decline { a, b },
        QueryRule::Growth { a, b },
        QueryRule::FreeEvents { a, b },
        QueryRule::AllocEvents { a, b },
        QueryRule::ShortLived { a, b },
        QueryRule::LongLived { a, b },
        QueryRule::Leaked { a, b, c },
        QueryRule::LimitedLifetime { a, b, c },
        QueryRule::DecliningLongLived { a, b, c },
        QueryRule::SpecificLifetime { a, b, c, d },
    ]
}

#[cfg_attr(miri, ignore)]
#[test]
fn specific_lifetime_round_trip() {
    with_watchdog(|| {
        let provider = provider(2);
        let recorded = ingest_random(&provider, 0xA11C, 2000);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..40 {
            let (first, second) = (random_time(&mut rng), random_time(&mut rng));
            let (b, c) = if first <= second {
                (first, second)
            } else {
                (second, first)
            };

            let rule = QueryRule::SpecificLifetime {
                a: 0.0,
                b,
                c,
                d: f64::INFINITY,
            };

            assert_eq!(run(&provider, rule), expected(&recorded, &rule), "{rule:?}");
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn every_rule_matches_reference_scan() {
    with_watchdog(|| {
        let provider = provider(2);
        let recorded = ingest_random(&provider, 0xBEEF, 1500);
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..10 {
            for rule in sample_rules(&mut rng) {
                assert_eq!(run(&provider, rule), expected(&recorded, &rule), "{rule:?}");
            }
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn closed_allocations_have_unique_start_events() {
    with_watchdog(|| {
        let provider = provider(1);
        let recorded = ingest_random(&provider, 3, 1000);

        let closed = run(&provider, QueryRule::EndedBefore { a: f64::MAX });
        let unique: HashSet<u32> = closed.iter().copied().collect();

        assert_eq!(unique.len(), closed.len());
        assert_eq!(
            closed.len(),
            recorded.iter().filter(|item| item.end.is_finite()).count()
        );
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_queries_see_the_same_items() {
    with_watchdog(|| {
        let provider = provider(4);
        let recorded = ingest_random(&provider, 0xC0C0, 3000);
        let rule = QueryRule::LongLived { a: 1.0, b: 3.0 };
        let reference = expected(&recorded, &rule);

        let results: Vec<Vec<u32>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| run(&provider, rule)))
                .collect();

            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect()
        });

        for result in results {
            assert_eq!(result, reference);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn live_allocations_arrive_in_first_batch() {
    with_watchdog(|| {
        let provider = provider(1);
        let scopes = ThreadScopes::new();

        {
            let mut state = provider.write(&scopes);
            state.init(0.0, 8, 0, 0);
            state.add_alloc(0.0, 1, 0x1000, 8, 8, 0);
            state.add_alloc(0.1, 1, 0x2000, 8, 8, 0);
            state.add_free(0.2, 0x1000);
        }

        let query = provider.start_query(QueryRule::StartedAfter { a: 0.0 });

        let mut batches = Vec::new();
        loop {
            match query.poll() {
                QueryStatus::Available(batch) => batches.push(batch),
                QueryStatus::Done => break,
                _ => thread::yield_now(),
            }
        }

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items()[0].address(), 0x2000);
        assert!(batches[0].items()[0].is_live());
        assert_eq!(batches[1].items()[0].address(), 0x1000);
        assert_eq!(batches[1].items()[0].end_event_index(), Some(2));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_releases_the_read_scope() {
    with_watchdog(|| {
        let provider = provider(1);
        ingest_random(&provider, 5, 20_000);

        let query = provider.start_query(QueryRule::StartedAfter { a: 0.0 });
        provider.cancel_query(&query);

        assert!(query.is_finished());

        let scopes = ThreadScopes::new();
        assert!(provider.try_write(&scopes).is_some());

        // Whatever was produced before the cancel is still delivered, then the query is done.
        drain(&query);
        assert!(matches!(query.poll(), QueryStatus::Done));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_while_writer_holds_the_lock() {
    with_watchdog(|| {
        let provider = provider(1);
        ingest_random(&provider, 9, 100);

        let scopes = ThreadScopes::new();
        let write = provider.write(&scopes);

        // The query cannot get its read scope while we write, but cancel must still return.
        let query = provider.start_query(QueryRule::StartedAfter { a: 0.0 });
        query.cancel();

        assert!(matches!(query.poll(), QueryStatus::Done));
        drop(write);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_queued_query_while_writer_holds_the_lock() {
    with_watchdog(|| {
        let provider = provider(1);
        ingest_random(&provider, 10, 100);

        let scopes = ThreadScopes::new();
        let write = provider.write(&scopes);

        // The only worker is stuck on `running` until we stop writing, so `queued` never starts.
        let running = provider.start_query(QueryRule::StartedAfter { a: 0.0 });
        thread::sleep(Duration::from_millis(50));
        let queued = provider.start_query(QueryRule::StartedAfter { a: 0.0 });

        queued.cancel();
        assert!(queued.is_finished());
        assert!(matches!(queued.poll(), QueryStatus::Done));

        // Dropping a queued handle must not wait for the worker either.
        let dropped = provider.start_query(QueryRule::EndedBefore { a: f64::MAX });
        drop(dropped);

        assert!(!running.is_finished());
        running.cancel();
        assert!(matches!(running.poll(), QueryStatus::Done));

        drop(write);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_handle_cancels_query() {
    with_watchdog(|| {
        let provider = provider(1);
        ingest_random(&provider, 6, 20_000);

        let query = provider.start_query(QueryRule::EndedBefore { a: f64::MAX });
        drop(query);

        let scopes = ThreadScopes::new();
        assert!(provider.try_write(&scopes).is_some());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_provider_finishes_all_queries() {
    with_watchdog(|| {
        let provider = provider(1);
        ingest_random(&provider, 8, 5000);

        let queries: Vec<QueryHandle> = (0..5)
            .map(|_| provider.start_query(QueryRule::StartedAfter { a: 0.0 }))
            .collect();

        drop(provider);

        for query in &queries {
            assert!(query.is_finished());
            drain(query);
        }
    });
}

#[derive(Debug, Default)]
struct CountingResolver {
    calls: AtomicUsize,
}

impl CallstackResolver for CountingResolver {
    fn resolve(&self, owner: u64) -> CallstackHandle {
        self.calls.fetch_add(1, Ordering::Relaxed);
        CallstackHandle::new(owner + 1)
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn callstacks_resolve_once_per_owner() {
    with_watchdog(|| {
        let resolver = Arc::new(CountingResolver::default());
        let provider = AllocationsProvider::builder()
            .query_workers(nz!(1_u32))
            .callstack_resolver(Arc::clone(&resolver) as Arc<dyn CallstackResolver>)
            .build();

        let scopes = ThreadScopes::new();
        {
            let mut state = provider.write(&scopes);
            state.init(0.0, 8, 0, 0);

            for i in 0..100_u64 {
                state.add_alloc(0.0, i % 4, 0x1000 + i * 0x10, 8, 8, 0);
            }
        }

        let query = provider.start_query(QueryRule::StartedAfter { a: 0.0 });
        let items = drain(&query);

        assert_eq!(items.len(), 100);
        assert!(
            items
                .iter()
                .all(|item| item.callstack() == Some(CallstackHandle::new(item.owner() + 1)))
        );
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 4);

        // The items remember their callstacks, so another query resolves nothing.
        let again = provider.start_query(QueryRule::StartedAfter { a: 0.0 });
        assert_eq!(drain(&again).len(), 100);
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 4);
    });
}
