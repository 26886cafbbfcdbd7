//! Metrics for ingestion and queries.
//!
//! The events are per-thread instances. Query events are observed on the query worker threads,
//! ingestion events on the ingestion thread.

use nm::{Event, Magnitude};

/// Histogram buckets for query duration in milliseconds, from start of the scan to the last
/// enqueued batch.
const QUERY_DURATION_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000];

/// Histogram buckets for the number of items a query returns.
const QUERY_ITEMS_BUCKETS: &[Magnitude] = &[0, 1, 10, 100, 1000, 10_000, 100_000, 1_000_000];

thread_local! {
    /// How long a query scan took.
    ///
    /// The magnitude is the duration in milliseconds.
    pub(crate) static QUERY_DURATION_MS: Event = Event::builder()
        .name("alloc_trace_query_duration_ms")
        .histogram(QUERY_DURATION_MS_BUCKETS)
        .build();

    /// One observation per result batch enqueued by a query.
    pub(crate) static QUERY_BATCHES: Event = Event::builder()
        .name("alloc_trace_query_batches")
        .build();

    /// Number of items returned by a query, observed once per finished query.
    pub(crate) static QUERY_ITEMS: Event = Event::builder()
        .name("alloc_trace_query_items")
        .histogram(QUERY_ITEMS_BUCKETS)
        .build();

    /// One observation per query that stopped because it was canceled.
    pub(crate) static QUERIES_CANCELED: Event = Event::builder()
        .name("alloc_trace_queries_canceled")
        .build();

    /// One observation per dropped ingestion event.
    pub(crate) static INGESTION_ANOMALIES: Event = Event::builder()
        .name("alloc_trace_ingestion_anomalies")
        .build();
}
