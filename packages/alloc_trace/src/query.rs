//! Background queries over the live table and the allocation index.
//!
//! A query runs on a pool worker. It holds one read scope on the provider state for the whole
//! scan, so ingestion waits until the query finishes or is canceled. Results are handed over in
//! batches through a lock-free queue: first one batch with the matching live allocations, then
//! one batch per index cell that contributed matches, in the order the index enumerates cells.
//!
//! Cancellation is cooperative. The task checks the flag while waiting for its read scope and
//! before each index cell, so the latency of a cancel is bounded by the scan of one cell.

use std::any::type_name;
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use std::vec;

use crossbeam::queue::SegQueue;
use event_listener::{Event, Listener};
use tracing::{debug, trace};

use crate::callstack::CallstackCache;
use crate::metrics::{QUERIES_CANCELED, QUERY_BATCHES, QUERY_DURATION_MS, QUERY_ITEMS};
use crate::{
    AllocationItem, AllocationsState, CallstackResolver, ProviderLock, QueryRule, ReadScope,
    ThreadScopes,
};

/// How long a query waits for its read scope before checking for cancellation again.
const READ_SCOPE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

// Lifecycle of a query task. Transitions only go forward.
const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Allocations produced by one step of a query.
#[derive(Debug)]
pub struct QueryBatch {
    items: Vec<AllocationItem>,
}

impl QueryBatch {
    /// The allocations in this batch. Their callstacks are resolved.
    #[must_use]
    pub fn items(&self) -> &[AllocationItem] {
        &self.items
    }

    /// Iterates over the allocations in this batch.
    pub fn iter(&self) -> slice::Iter<'_, AllocationItem> {
        self.items.iter()
    }

    /// Number of allocations in this batch. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false`; queries never produce empty batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Takes the allocations out of the batch.
    #[must_use]
    pub fn into_items(self) -> Vec<AllocationItem> {
        self.items
    }
}

impl IntoIterator for QueryBatch {
    type Item = AllocationItem;
    type IntoIter = vec::IntoIter<AllocationItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryBatch {
    type Item = &'a AllocationItem;
    type IntoIter = slice::Iter<'a, AllocationItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Outcome of polling a query.
#[derive(Debug)]
#[non_exhaustive]
pub enum QueryStatus {
    /// No batch is ready yet but the query is still running.
    Working,

    /// The next batch of results.
    Available(QueryBatch),

    /// The query has finished and every batch has been taken.
    Done,
}

/// State shared between a query task and its handle.
pub(crate) struct QueryShared {
    id: u64,
    rule: QueryRule,

    batches: SegQueue<QueryBatch>,

    cancel_requested: AtomicBool,
    lifecycle: AtomicU8,
    finished_event: Event,
}

impl fmt::Debug for QueryShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("rule", &self.rule)
            .field("pending_batches", &self.batches.len())
            .field("cancel_requested", &self.cancel_requested.load(Ordering::Relaxed))
            .field("lifecycle", &self.lifecycle.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl QueryShared {
    pub(crate) fn new(id: u64, rule: QueryRule) -> Self {
        Self {
            id,
            rule,
            batches: SegQueue::new(),
            cancel_requested: AtomicBool::new(false),
            lifecycle: AtomicU8::new(QUEUED),
            finished_event: Event::new(),
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == FINISHED
    }

    /// Claims the query for a worker. Fails if the query was canceled while still queued.
    fn try_start(&self) -> bool {
        self.lifecycle
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Finishes the query if no worker has claimed it yet.
    fn try_cancel_queued(&self) -> bool {
        let canceled = self
            .lifecycle
            .compare_exchange(QUEUED, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if canceled {
            self.finished_event.notify(usize::MAX);
        }

        canceled
    }

    /// Queues a batch unless it is empty. Returns the number of items queued.
    fn enqueue(&self, items: Vec<AllocationItem>) -> usize {
        let batch_len = items.len();

        if batch_len == 0 {
            return 0;
        }

        self.batches.push(QueryBatch { items });

        QUERY_BATCHES.with(|event| event.observe_once());
        trace!(query_id = self.id, batch_len, "query batch enqueued");

        batch_len
    }

    fn finish(&self) {
        // Release pairs with the Acquire in poll(), so a poller that sees the flag also sees
        // every batch pushed before it.
        self.lifecycle.store(FINISHED, Ordering::Release);
        self.finished_event.notify(usize::MAX);
    }

    #[cfg_attr(test, mutants::skip)] // Mutations here hang the process instead of failing a test.
    fn wait_until_finished(&self) {
        while !self.is_finished() {
            let listener = self.finished_event.listen();

            // Re-check after registering the listener to avoid a lost wakeup.
            if self.is_finished() {
                break;
            }

            listener.wait();
        }
    }
}

/// The unit of work a pool worker runs for one query.
///
/// Dropping the task, whether it ran or not, marks the query finished.
pub(crate) struct QueryTask {
    shared: Arc<QueryShared>,
    state: Arc<ProviderLock<AllocationsState>>,
    resolver: Arc<dyn CallstackResolver>,
}

impl fmt::Debug for QueryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("shared", &self.shared)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl QueryTask {
    pub(crate) fn new(
        shared: Arc<QueryShared>,
        state: Arc<ProviderLock<AllocationsState>>,
        resolver: Arc<dyn CallstackResolver>,
    ) -> Self {
        Self {
            shared,
            state,
            resolver,
        }
    }

    pub(crate) fn run(self) {
        let shared = &*self.shared;
        let rule = shared.rule;
        let scopes = ThreadScopes::new();

        if !shared.try_start() {
            trace!(query_id = shared.id, "query canceled while queued, skipping");
            return;
        }

        let Some(state) = self.wait_for_read_scope(&scopes) else {
            QUERIES_CANCELED.with(|event| event.observe_once());
            debug!(query_id = shared.id, "query canceled before it started");
            return;
        };

        debug!(query_id = shared.id, rule = rule.name(), "query started");

        let started = Instant::now();
        let mut callstacks = CallstackCache::new(self.resolver.as_ref());

        let live = resolved(
            state
                .live_allocations()
                .iter()
                .filter(|item| rule.matches_item(item)),
            &mut callstacks,
        );
        let mut item_count = shared.enqueue(live);

        let mut canceled = shared.is_cancel_requested();

        if !canceled {
            for cell in state.tree().candidate_cells(&rule.hull()) {
                if shared.is_cancel_requested() {
                    canceled = true;
                    break;
                }

                let items = resolved(cell.matching(&rule), &mut callstacks);
                item_count = item_count.saturating_add(shared.enqueue(items));
            }
        }

        drop(state);

        QUERY_DURATION_MS.with(|event| event.observe_millis(started.elapsed()));
        QUERY_ITEMS.with(|event| event.observe(item_count));

        if canceled {
            QUERIES_CANCELED.with(|event| event.observe_once());
            debug!(query_id = shared.id, item_count, "query canceled");
        } else {
            debug!(query_id = shared.id, item_count, "query finished");
        }
    }

    /// Opens the read scope, giving up if the query is canceled while a writer holds the lock.
    fn wait_for_read_scope<'a>(
        &'a self,
        scopes: &'a ThreadScopes,
    ) -> Option<ReadScope<'a, AllocationsState>> {
        loop {
            if self.shared.is_cancel_requested() {
                return None;
            }

            if let Some(scope) = self.state.try_read_for(scopes, READ_SCOPE_RETRY_INTERVAL) {
                return Some(scope);
            }
        }
    }
}

impl Drop for QueryTask {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

/// Clones the items into a batch, resolving the callstack of each.
fn resolved<'a>(
    items: impl Iterator<Item = &'a AllocationItem>,
    callstacks: &mut CallstackCache<'_>,
) -> Vec<AllocationItem> {
    items
        .map(|item| {
            item.resolve_callstack(|owner| callstacks.resolve(owner));
            item.clone()
        })
        .collect()
}

/// A running or finished query.
///
/// Poll it for result batches until it reports [`QueryStatus::Done`]. Dropping the handle of a
/// query that is still running cancels the query and waits for it to stop.
pub struct QueryHandle {
    shared: Arc<QueryShared>,
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("shared", &self.shared)
            .finish()
    }
}

impl QueryHandle {
    pub(crate) fn new(shared: Arc<QueryShared>) -> Self {
        Self { shared }
    }

    /// Identifier of the query, unique within its provider.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The rule the query selects allocations by.
    #[must_use]
    pub fn rule(&self) -> QueryRule {
        self.shared.rule
    }

    /// Takes the next result batch, if one is ready. Never blocks.
    #[must_use]
    pub fn poll(&self) -> QueryStatus {
        // Read the flag before looking at the queue. If the task had finished by then, every
        // batch is already in the queue and an empty queue really means done.
        let finished = self.shared.is_finished();

        if let Some(batch) = self.shared.batches.pop() {
            return QueryStatus::Available(batch);
        }

        if finished {
            QueryStatus::Done
        } else {
            QueryStatus::Working
        }
    }

    /// Whether the background task has stopped. Batches may still be waiting to be polled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Asks the query to stop and blocks until the background task no longer touches provider
    /// state.
    ///
    /// A query that no worker has picked up yet is finished on the spot, without waiting for the
    /// queries ahead of it. Batches produced before the task noticed the cancellation remain
    /// available to [`poll()`][Self::poll].
    pub fn cancel(&self) {
        if self.shared.is_finished() {
            return;
        }

        if self.shared.try_cancel_queued() {
            QUERIES_CANCELED.with(|event| event.observe_once());
            debug!(query_id = self.shared.id, "query canceled while queued");
            return;
        }

        debug!(query_id = self.shared.id, "canceling query");

        self.shared.request_cancel();
        self.shared.wait_until_finished();
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::callstack::MockCallstackResolver;
    use crate::{CallstackHandle, NoCallstacks};

    assert_impl_all!(QueryHandle: Send, Sync);
    assert_impl_all!(QueryBatch: Send, Sync);
    assert_impl_all!(QueryTask: Send);

    /// A session with `count` freed allocations, each stored in a cell of its own, plus
    /// `live` allocations that are never freed.
    fn state_with(count: u64, live: u64) -> Arc<ProviderLock<AllocationsState>> {
        let lock = Arc::new(ProviderLock::new(AllocationsState::new(0)));
        let scopes = ThreadScopes::new();

        {
            let mut state = lock.write(&scopes);
            state.init(0.0, 8, 0, 0);

            for i in 0..count {
                let time = f64::from(u32::try_from(i).unwrap());
                let address = 0x1000 + i * 0x10;

                state.add_alloc(time, i + 1, address, 32, 8, 0);
                state.add_free(time + 0.5, address);
            }

            for i in 0..live {
                state.add_alloc(1000.0, 500 + i, 0x10_0000 + i * 0x10, 32, 8, 0);
            }
        }

        lock
    }

    fn drain(handle: &QueryHandle) -> Vec<QueryBatch> {
        let mut batches = Vec::new();

        loop {
            match handle.poll() {
                QueryStatus::Available(batch) => batches.push(batch),
                QueryStatus::Done => return batches,
                QueryStatus::Working => panic!("a finished task must not report Working"),
            }
        }
    }

    fn run_to_completion(
        state: Arc<ProviderLock<AllocationsState>>,
        rule: QueryRule,
        resolver: Arc<dyn CallstackResolver>,
    ) -> QueryHandle {
        let shared = Arc::new(QueryShared::new(1, rule));
        QueryTask::new(Arc::clone(&shared), state, resolver).run();
        QueryHandle::new(shared)
    }

    #[test]
    fn live_batch_comes_first() {
        let state = state_with(4, 2);

        let handle = run_to_completion(
            state,
            QueryRule::StartedAfter { a: 0.0 },
            Arc::new(NoCallstacks),
        );
        let batches = drain(&handle);

        assert_eq!(batches.len(), 5);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].iter().all(AllocationItem::is_live));
        assert!(batches[1..].iter().all(|batch| batch.len() == 1));
        assert!(
            batches[1..]
                .iter()
                .flatten()
                .all(|item| !item.is_live())
        );
    }

    #[test]
    fn callstacks_are_resolved_once_per_owner() {
        let state = state_with(3, 0);

        let mut resolver = MockCallstackResolver::new();
        resolver
            .expect_resolve()
            .times(3)
            .returning(|owner| CallstackHandle::new(owner * 100));

        let handle = run_to_completion(
            Arc::clone(&state),
            QueryRule::StartedAfter { a: 0.0 },
            Arc::new(resolver),
        );

        for item in drain(&handle).iter().flatten() {
            assert_eq!(
                item.callstack(),
                Some(CallstackHandle::new(item.owner() * 100))
            );
        }

        // The stored items keep their resolved callstacks, so a second query resolves nothing.
        let mut resolver = MockCallstackResolver::new();
        resolver.expect_resolve().never();

        let handle = run_to_completion(
            state,
            QueryRule::StartedAfter { a: 0.0 },
            Arc::new(resolver),
        );
        assert_eq!(drain(&handle).len(), 3);
    }

    #[test]
    fn cancel_mid_scan_keeps_batches_of_visited_cells() {
        const CELLS: u64 = 8;
        const VISITED: usize = 3;

        let state = state_with(CELLS, 0);
        let shared = Arc::new(QueryShared::new(1, QueryRule::StartedAfter { a: 0.0 }));

        // Every cell holds one item with its own owner, so each resolver call is one cell.
        // Cancel while the third cell is being scanned.
        let mut resolver = MockCallstackResolver::new();
        let canceling = Arc::clone(&shared);
        let mut calls = 0;
        resolver.expect_resolve().times(VISITED).returning(move |owner| {
            calls += 1;
            if calls == VISITED {
                canceling.request_cancel();
            }
            CallstackHandle::new(owner)
        });

        QueryTask::new(Arc::clone(&shared), state, Arc::new(resolver)).run();

        let handle = QueryHandle::new(shared);
        let batches = drain(&handle);

        assert_eq!(batches.len(), VISITED);
        assert!(batches.iter().all(|batch| batch.len() == 1));
    }

    #[test]
    fn canceled_before_start_produces_nothing() {
        let state = state_with(4, 1);
        let shared = Arc::new(QueryShared::new(1, QueryRule::StartedAfter { a: 0.0 }));
        shared.request_cancel();

        let mut resolver = MockCallstackResolver::new();
        resolver.expect_resolve().never();

        QueryTask::new(Arc::clone(&shared), state, Arc::new(resolver)).run();

        let handle = QueryHandle::new(shared);
        assert!(handle.is_finished());
        assert!(matches!(handle.poll(), QueryStatus::Done));
    }

    #[test]
    fn canceling_queued_query_skips_the_task() {
        let state = state_with(4, 1);
        let shared = Arc::new(QueryShared::new(1, QueryRule::StartedAfter { a: 0.0 }));

        let mut resolver = MockCallstackResolver::new();
        resolver.expect_resolve().never();

        let task = QueryTask::new(Arc::clone(&shared), state, Arc::new(resolver));
        let handle = QueryHandle::new(shared);

        // Nothing will ever run the task before this returns, so it must not wait for it.
        handle.cancel();

        assert!(handle.is_finished());
        assert!(matches!(handle.poll(), QueryStatus::Done));

        task.run();

        assert!(matches!(handle.poll(), QueryStatus::Done));
    }

    #[test]
    fn unrun_task_finishes_when_dropped() {
        let state = state_with(1, 0);
        let shared = Arc::new(QueryShared::new(7, QueryRule::ActiveAt { a: 0.0 }));
        let task = QueryTask::new(Arc::clone(&shared), state, Arc::new(NoCallstacks));

        let handle = QueryHandle::new(shared);
        assert!(matches!(handle.poll(), QueryStatus::Working));

        drop(task);

        assert!(matches!(handle.poll(), QueryStatus::Done));
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.rule(), QueryRule::ActiveAt { a: 0.0 });
    }

    #[test]
    fn no_matches_means_no_batches() {
        let state = state_with(4, 0);

        let handle = run_to_completion(
            state,
            QueryRule::EndedBefore { a: -1.0 },
            Arc::new(NoCallstacks),
        );

        assert!(drain(&handle).is_empty());
    }
}
