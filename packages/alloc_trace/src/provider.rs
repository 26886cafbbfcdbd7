use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use new_zealand::nz;
use tracing::debug;

use crate::pool::QueryPool;
use crate::query::{QueryShared, QueryTask};
use crate::{
    AllocationsState, CallstackResolver, NoCallstacks, ProviderLock, QueryHandle, QueryRule,
    QueryStatus, ReadScope, ThreadScopes, WriteScope,
};

const DEFAULT_COLUMN_SHIFT: u32 = 10;
const MAX_COLUMN_SHIFT: u32 = 20;
const DEFAULT_QUERY_WORKERS: NonZero<u32> = nz!(2_u32);

/// Ingests a stream of allocation events and answers time-range queries over them.
///
/// Ingestion happens inside the write scope obtained from [`write()`][Self::write]. Read-only
/// accessors are reached through [`read()`][Self::read]. Queries started with
/// [`start_query()`][Self::start_query] run on background worker threads and hold a read scope
/// while they scan, so ingestion waits for running queries.
///
/// # Lifetime
///
/// When the provider is dropped, queries that have not started yet are finished without results
/// and the drop blocks until running queries complete.
///
/// # Example
///
/// ```
/// use alloc_trace::{AllocationsProvider, QueryRule, QueryStatus, ThreadScopes};
///
/// let provider = AllocationsProvider::new();
/// let scopes = ThreadScopes::new();
///
/// {
///     let mut state = provider.write(&scopes);
///     state.init(0.0, 8, 0, 0);
///     state.add_alloc(1.0, 42, 0x1000, 64, 8, 0);
///     state.add_alloc(2.0, 42, 0x2000, 32, 8, 0);
///     state.add_free(3.0, 0x1000);
/// }
///
/// let query = provider.start_query(QueryRule::ActiveAt { a: 2.5 });
///
/// let mut addresses = Vec::new();
/// loop {
///     match query.poll() {
///         QueryStatus::Available(batch) => {
///             addresses.extend(batch.iter().map(|item| item.address()));
///         }
///         QueryStatus::Done => break,
///         _ => std::thread::yield_now(),
///     }
/// }
///
/// addresses.sort_unstable();
/// assert_eq!(addresses, vec![0x1000, 0x2000]);
/// ```
pub struct AllocationsProvider {
    state: Arc<ProviderLock<AllocationsState>>,
    resolver: Arc<dyn CallstackResolver>,
    next_query_id: AtomicU64,
    pool: QueryPool,
}

impl fmt::Debug for AllocationsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.state)
            .field("resolver", &self.resolver)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl AllocationsProvider {
    /// Creates a provider with default settings.
    ///
    /// Use [`AllocationsProvider::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the provider.
    #[must_use]
    pub fn builder() -> AllocationsProviderBuilder {
        AllocationsProviderBuilder::new()
    }

    /// Opens a read scope on the provider state.
    ///
    /// # Panics
    ///
    /// Panics if the thread owning `scopes` holds the write scope.
    pub fn read<'a>(&'a self, scopes: &'a ThreadScopes) -> ReadScope<'a, AllocationsState> {
        self.state.read(scopes)
    }

    /// Opens the write scope on the provider state, waiting for running queries to finish.
    ///
    /// # Panics
    ///
    /// Panics if the thread owning `scopes` already holds any scope on the provider.
    pub fn write<'a>(&'a self, scopes: &'a ThreadScopes) -> WriteScope<'a, AllocationsState> {
        self.state.write(scopes)
    }

    /// Opens the write scope if no query or other thread holds a scope.
    ///
    /// # Panics
    ///
    /// Panics if the thread owning `scopes` already holds any scope on the provider.
    pub fn try_write<'a>(
        &'a self,
        scopes: &'a ThreadScopes,
    ) -> Option<WriteScope<'a, AllocationsState>> {
        self.state.try_write(scopes)
    }

    /// Starts a background query for the allocations selected by `rule`.
    ///
    /// The query sees the state as of the moment it acquires its read scope.
    #[must_use]
    pub fn start_query(&self, rule: QueryRule) -> QueryHandle {
        // Relaxed is enough, we only need uniqueness.
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new(QueryShared::new(id, rule));
        let task = QueryTask::new(
            Arc::clone(&shared),
            Arc::clone(&self.state),
            Arc::clone(&self.resolver),
        );

        debug!(query_id = id, rule = rule.name(), "query queued");
        self.pool.spawn(move || task.run());

        QueryHandle::new(shared)
    }

    /// Takes the next result batch of `query`. Same as [`QueryHandle::poll()`].
    #[must_use]
    pub fn poll_query(&self, query: &QueryHandle) -> QueryStatus {
        query.poll()
    }

    /// Cancels `query` and waits for it to stop. Same as [`QueryHandle::cancel()`].
    pub fn cancel_query(&self, query: &QueryHandle) {
        query.cancel();
    }
}

impl Default for AllocationsProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring an [`AllocationsProvider`].
#[derive(Debug)]
pub struct AllocationsProviderBuilder {
    column_shift: u32,
    query_workers: NonZero<u32>,
    resolver: Arc<dyn CallstackResolver>,
}

impl AllocationsProviderBuilder {
    fn new() -> Self {
        Self {
            column_shift: DEFAULT_COLUMN_SHIFT,
            query_workers: DEFAULT_QUERY_WORKERS,
            resolver: Arc::new(NoCallstacks),
        }
    }

    /// Sets the base-2 logarithm of the number of events per index column.
    ///
    /// Smaller columns make queries more selective at the cost of more index cells. Values
    /// above 20 are clamped to 20. Default is 10.
    #[must_use]
    pub fn column_shift(mut self, column_shift: u32) -> Self {
        self.column_shift = column_shift.min(MAX_COLUMN_SHIFT);
        self
    }

    /// Sets the number of worker threads that run queries.
    ///
    /// Default is 2.
    #[must_use]
    pub fn query_workers(mut self, count: NonZero<u32>) -> Self {
        self.query_workers = count;
        self
    }

    /// Sets the resolver queries use to attach callstacks to allocations.
    ///
    /// Default is [`NoCallstacks`].
    #[must_use]
    pub fn callstack_resolver(mut self, resolver: Arc<dyn CallstackResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the provider with the configured settings.
    #[must_use]
    pub fn build(self) -> AllocationsProvider {
        debug!(
            column_shift = self.column_shift,
            query_workers = self.query_workers.get(),
            "creating allocations provider"
        );

        AllocationsProvider {
            state: Arc::new(ProviderLock::new(AllocationsState::new(self.column_shift))),
            resolver: self.resolver,
            next_query_id: AtomicU64::new(1),
            pool: QueryPool::new(self.query_workers),
        }
    }
}
