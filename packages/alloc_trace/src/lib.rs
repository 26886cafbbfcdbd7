#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Time-range and lifetime queries over a stream of traced memory allocation events.
//!
//! A profiler feeds the alloc and free events of an instrumented process into an
//! [`AllocationsProvider`], in trace order. The provider keeps the allocations that are still
//! live in a table keyed by address and moves every freed allocation into an index built for
//! time queries. Interactive tools then ask questions such as "what was allocated between A and B
//! and never freed" through a [`QueryRule`] and receive the matching allocations in batches from
//! a background query.
//!
//! # Quick start
//!
//! ```rust
//! use alloc_trace::{AllocationsProvider, QueryRule, QueryStatus, ThreadScopes};
//!
//! let provider = AllocationsProvider::new();
//! let scopes = ThreadScopes::new();
//!
//! {
//!     let mut state = provider.write(&scopes);
//!     state.init(0.0, 8, 0, 0);
//!     state.add_alloc(0.5, 1, 0x1000, 128, 16, 0);
//!     state.add_alloc(1.5, 1, 0x2000, 64, 16, 0);
//!     state.add_free(2.0, 0x2000);
//!     state.on_analysis_completed();
//! }
//!
//! // Allocated during [0, 1] and still alive at 10.
//! let query = provider.start_query(QueryRule::Leaked {
//!     a: 0.0,
//!     b: 1.0,
//!     c: 10.0,
//! });
//!
//! let mut leaked = Vec::new();
//! loop {
//!     match query.poll() {
//!         QueryStatus::Available(batch) => leaked.extend(batch),
//!         QueryStatus::Done => break,
//!         _ => std::thread::yield_now(),
//!     }
//! }
//!
//! assert_eq!(leaked.len(), 1);
//! assert_eq!(leaked[0].address(), 0x1000);
//! assert!(leaked[0].is_live());
//! ```
//!
//! # Access discipline
//!
//! The provider state sits behind a [`ProviderLock`]. The ingestion thread opens the write scope
//! for each stretch of events; queries and accessors use read scopes. Scopes nest on the same
//! thread, tracked by a [`ThreadScopes`] value the thread owns. Opening a write scope while
//! holding a read scope, or a read scope while holding the write scope, panics.
//!
//! # Ingestion anomalies
//!
//! Traces of real processes are not always clean. An alloc for an address that is already live,
//! a free for an address that is not live and similar events are dropped and counted in
//! [`IngestionCounters`]. They never stop ingestion.
//!
//! # Queries
//!
//! A query scans the live table first and then the index cells that can hold matches. Results
//! arrive as [`QueryBatch`]es through [`QueryHandle::poll()`]. [`QueryHandle::cancel()`] stops a
//! query and waits until it no longer touches provider state. Batches produced before the cancel
//! stay available.
//!
//! # Timelines
//!
//! While ingesting, the provider samples the allocation totals at least every
//! [`SAMPLE_GRANULARITY`] of trace time. See [`TimelineSeries`] for the recorded statistics and
//! [`AllocationsState::enumerate_timeline()`] for reading them.

mod callstack;
mod error;
mod histogram;
mod item;
mod live;
mod lock;
mod metrics;
mod paged;
mod pool;
mod provider;
mod query;
mod rule;
mod sbtree;
mod state;
mod timeline;

pub use callstack::*;
pub use error::*;
pub use histogram::*;
pub use item::*;
pub use lock::*;
pub use provider::*;
pub use query::*;
pub use rule::*;
pub use state::*;
pub use timeline::*;
