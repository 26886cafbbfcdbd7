//! Ingestion of alloc and free events into the live table, the index and the timelines.

use std::any::type_name;
use std::fmt;
use std::ops::RangeInclusive;

use tracing::{debug, warn};

use crate::error::Result;
use crate::item::LIVE_EVENT_INDEX;
use crate::live::LiveAllocations;
use crate::metrics::INGESTION_ANOMALIES;
use crate::sbtree::SbTree;
use crate::timeline::Timelines;
use crate::{
    AllocationItem, IngestionCounters, IngestionError, Log2Histogram, SizeAndAlignment,
    TimelineSeries,
};

/// Largest accepted size shift. The low size bits travel in a 32-bit field.
const MAX_SIZE_SHIFT: u32 = u32::BITS;

/// Session parameters fixed by [`AllocationsState::init()`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionConfig {
    start_time: f64,
    min_alignment: u32,
    size_shift: u32,
    summary_size_shift: u32,
}

impl SessionConfig {
    /// Trace time at which the session was initialized.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Smallest alignment any allocation is reported with.
    #[must_use]
    pub fn min_alignment(&self) -> u32 {
        self.min_alignment
    }

    /// Number of low size bits carried in the alignment field of alloc events.
    #[must_use]
    pub fn size_shift(&self) -> u32 {
        self.size_shift
    }

    /// Size shift used by summary events of the trace. Stored for consumers, not interpreted.
    #[must_use]
    pub fn summary_size_shift(&self) -> u32 {
        self.summary_size_shift
    }

    fn lower_size_mask(&self) -> u32 {
        u32::MAX
            .checked_shr(u32::BITS - self.size_shift)
            .unwrap_or(0)
    }

    /// Rebuilds the size and alignment from the split encoding of an alloc event.
    fn decode(&self, size: u64, alignment_and_size_lower: u32) -> SizeAndAlignment {
        let lower_mask = self.lower_size_mask();

        let size = size.checked_shl(self.size_shift).unwrap_or(0)
            | u64::from(alignment_and_size_lower & lower_mask);
        let alignment = (alignment_and_size_lower & !lower_mask).max(self.min_alignment);

        SizeAndAlignment::new(size, alignment)
    }
}

/// Everything the provider knows about a trace session.
///
/// Reached through the provider's lock: [`AllocationsProvider::write()`] for ingestion and
/// [`AllocationsProvider::read()`] for the accessors.
///
/// [`AllocationsProvider::write()`]: crate::AllocationsProvider::write
/// [`AllocationsProvider::read()`]: crate::AllocationsProvider::read
pub struct AllocationsState {
    config: Option<SessionConfig>,

    next_event_index: u32,
    last_time: f64,

    live: LiveAllocations,
    tree: SbTree,
    timelines: Timelines,

    total_allocated_memory: u64,
    size_histogram: Log2Histogram,
    event_distance_histogram: Log2Histogram,

    counters: IngestionCounters,
}

impl fmt::Debug for AllocationsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("config", &self.config)
            .field("event_count", &self.next_event_index)
            .field("live_allocations", &self.live.len())
            .field("total_allocated_memory", &self.total_allocated_memory)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl AllocationsState {
    pub(crate) fn new(column_shift: u32) -> Self {
        Self {
            config: None,
            next_event_index: 0,
            last_time: f64::NEG_INFINITY,
            live: LiveAllocations::new(),
            tree: SbTree::new(column_shift),
            timelines: Timelines::new(),
            total_allocated_memory: 0,
            size_histogram: Log2Histogram::new(),
            event_distance_histogram: Log2Histogram::new(),
            counters: IngestionCounters::default(),
        }
    }

    /// Starts the session. Later calls are counted as anomalies and otherwise ignored.
    ///
    /// `size_shift` is clamped to 32.
    pub fn init(
        &mut self,
        time: f64,
        min_alignment: u32,
        size_shift: u32,
        summary_size_shift: u32,
    ) {
        let result = self.try_init(time, min_alignment, size_shift, summary_size_shift);
        self.absorb(result);
    }

    fn try_init(
        &mut self,
        time: f64,
        min_alignment: u32,
        size_shift: u32,
        summary_size_shift: u32,
    ) -> Result<()> {
        if self.config.is_some() {
            return Err(IngestionError::AlreadyInitialized);
        }

        self.config = Some(SessionConfig {
            start_time: time,
            min_alignment,
            size_shift: size_shift.min(MAX_SIZE_SHIFT),
            summary_size_shift,
        });

        self.last_time = time;
        self.timelines.start(time);

        debug!(time, min_alignment, size_shift, "allocation session initialized");

        Ok(())
    }

    /// Records an alloc event.
    ///
    /// `size` carries the upper size bits and `alignment_and_size_lower` the lower
    /// [`size_shift`][SessionConfig::size_shift] bits of the size with the alignment above them.
    /// Events for the null address or an address that is already live are dropped and counted.
    pub fn add_alloc(
        &mut self,
        time: f64,
        owner: u64,
        address: u64,
        size: u64,
        alignment_and_size_lower: u32,
        tag: u32,
    ) {
        let result = self.try_add_alloc(time, owner, address, size, alignment_and_size_lower, tag);
        self.absorb(result);
    }

    fn try_add_alloc(
        &mut self,
        time: f64,
        owner: u64,
        address: u64,
        size: u64,
        alignment_and_size_lower: u32,
        tag: u32,
    ) -> Result<()> {
        let config = self.config.ok_or(IngestionError::NotInitialized)?;

        if address == 0 {
            return Err(IngestionError::NullAddress);
        }

        if self.live.contains(address) {
            return Err(IngestionError::DuplicateAlloc { address });
        }

        let (event_index, time) = self.begin_event(time)?;

        let size_and_alignment = config.decode(size, alignment_and_size_lower);
        let item = AllocationItem::live(
            event_index,
            time,
            owner,
            address,
            size_and_alignment,
            tag,
        );

        self.live.insert(item);
        self.total_allocated_memory = self
            .total_allocated_memory
            .saturating_add(size_and_alignment.size());
        self.size_histogram.record(size_and_alignment.size());

        self.timelines
            .record_alloc(self.total_allocated_memory, self.live_allocation_count());

        Ok(())
    }

    /// Records a free event. Events for an address that is not live are dropped and counted.
    pub fn add_free(&mut self, time: f64, address: u64) {
        let result = self.try_add_free(time, address);
        self.absorb(result);
    }

    fn try_add_free(&mut self, time: f64, address: u64) -> Result<()> {
        if self.config.is_none() {
            return Err(IngestionError::NotInitialized);
        }

        if !self.live.contains(address) {
            return Err(IngestionError::StrayFree { address });
        }

        let (event_index, time) = self.begin_event(time)?;

        let Some(mut item) = self.live.remove(address) else {
            return Err(IngestionError::StrayFree { address });
        };

        item.close(event_index, time);

        self.total_allocated_memory = self.total_allocated_memory.saturating_sub(item.size());
        self.event_distance_histogram
            .record(u64::from(event_index.saturating_sub(item.start_event_index())));

        self.tree.insert(item);

        self.timelines
            .record_free(self.total_allocated_memory, self.live_allocation_count());

        Ok(())
    }

    /// Assigns the next event index and its time, and moves the timeline forward to it.
    fn begin_event(&mut self, time: f64) -> Result<(u32, f64)> {
        let event_index = self.next_event_index;

        if event_index == LIVE_EVENT_INDEX {
            return Err(IngestionError::EventIndexExhausted);
        }

        // Times never go backwards. NaN keeps the previous time.
        let time = time.max(self.last_time);

        self.next_event_index = event_index.wrapping_add(1);
        self.last_time = time;

        self.tree.set_time_for_event(event_index, time);
        self.timelines.advance(
            time,
            self.total_allocated_memory,
            self.live_allocation_count(),
        );

        Ok((event_index, time))
    }

    /// Closes the open timeline sample. Call once the whole trace has been ingested.
    pub fn on_analysis_completed(&mut self) {
        if self.config.is_none() {
            return;
        }

        self.timelines
            .flush(self.total_allocated_memory, self.live_allocation_count());
    }

    fn absorb(&mut self, result: Result<()>) {
        let Err(error) = result else {
            return;
        };

        self.counters.count(error);
        INGESTION_ANOMALIES.with(|event| event.observe_once());

        match error {
            IngestionError::AlreadyInitialized => {
                warn!(%error, "ignoring repeated session initialization");
            }
            IngestionError::DuplicateAlloc { address } | IngestionError::StrayFree { address } => {
                debug!(address, %error, "dropping ingestion event");
            }
            _ => {
                debug!(%error, "dropping ingestion event");
            }
        }
    }

    /// Session parameters, once the session is initialized.
    #[must_use]
    pub fn session_config(&self) -> Option<SessionConfig> {
        self.config
    }

    /// Bytes held by live allocations.
    #[must_use]
    pub fn total_allocated_memory(&self) -> u64 {
        self.total_allocated_memory
    }

    /// Number of allocations that have not been freed.
    #[must_use]
    pub fn live_allocation_count(&self) -> u64 {
        self.live.len() as u64
    }

    /// The live allocation at `address`, if any.
    #[must_use]
    pub fn live_allocation(&self, address: u64) -> Option<&AllocationItem> {
        self.live.get(address)
    }

    /// Number of accepted alloc and free events.
    #[must_use]
    pub fn event_count(&self) -> u32 {
        self.next_event_index
    }

    /// Allocation sizes, one entry per accepted alloc event.
    #[must_use]
    pub fn size_histogram(&self) -> &Log2Histogram {
        &self.size_histogram
    }

    /// Number of events between alloc and free, one entry per accepted free event.
    #[must_use]
    pub fn event_distance_histogram(&self) -> &Log2Histogram {
        &self.event_distance_histogram
    }

    /// Base-2 logarithm of the number of events per index column.
    #[must_use]
    pub fn column_shift(&self) -> u32 {
        self.tree.column_shift()
    }

    /// Number of index columns that have received events.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.tree.column_count()
    }

    /// Number of index cells holding at least one freed allocation.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.tree.materialized_cells()
    }

    /// Dropped ingestion events, by reason.
    #[must_use]
    pub fn ingestion_counters(&self) -> IngestionCounters {
        self.counters
    }

    /// Number of closed timeline samples.
    #[must_use]
    pub fn timeline_len(&self) -> usize {
        self.timelines.len()
    }

    /// Index of the last timeline sample starting at or before `time`, or `None` if `time`
    /// precedes the first sample.
    #[must_use]
    pub fn timeline_index_at(&self, time: f64) -> Option<usize> {
        self.timelines.index_at(time)
    }

    /// Samples needed to cover `start_time..=end_time`, or `None` if the range ends before the
    /// first sample.
    #[must_use]
    pub fn timeline_index_range(
        &self,
        start_time: f64,
        end_time: f64,
    ) -> Option<RangeInclusive<usize>> {
        let end = self.timelines.index_at(end_time)?;
        let start = self.timelines.index_at(start_time).unwrap_or(0);

        (start <= end).then_some(start..=end)
    }

    /// Calls `callback(time, duration, value)` for each sample of `series` in `range`.
    ///
    /// The last sample of the timeline reports an infinite duration.
    pub fn enumerate_timeline(
        &self,
        series: TimelineSeries,
        range: RangeInclusive<usize>,
        callback: impl FnMut(f64, f64, u64),
    ) {
        self.timelines.enumerate(series, range, callback);
    }

    pub(crate) fn live_allocations(&self) -> &LiveAllocations {
        &self.live
    }

    pub(crate) fn tree(&self) -> &SbTree {
        &self.tree
    }
}
