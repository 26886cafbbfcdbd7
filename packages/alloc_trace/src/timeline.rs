//! Periodic samples of the allocation totals.
//!
//! Ingestion keeps one open sample that covers at least [`SAMPLE_GRANULARITY`] of trace time.
//! Every event moves the end of the open sample forward. When an event arrives past the
//! granularity, the open sample is appended to the timeline and a new one starts. If the trace
//! was silent for longer than the granularity, a flat sample is also appended at the time of the
//! last event so that consumers do not interpolate across the silent gap.

use std::ops::RangeInclusive;

use crate::paged::PagedSeries;

/// Minimum span of trace time covered by one timeline sample, in seconds.
pub const SAMPLE_GRANULARITY: f64 = 0.001;

const TIMELINE_PAGE_SIZE: usize = 1024;

/// Selects one of the statistics recorded in each timeline sample.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum TimelineSeries {
    /// Lowest total of allocated bytes seen during the sample.
    MinTotalAllocatedMemory,

    /// Highest total of allocated bytes seen during the sample.
    MaxTotalAllocatedMemory,

    /// Lowest number of live allocations seen during the sample.
    MinLiveAllocations,

    /// Highest number of live allocations seen during the sample.
    MaxLiveAllocations,

    /// Number of alloc events during the sample.
    AllocEvents,

    /// Number of free events during the sample.
    FreeEvents,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Sample {
    min_total_allocated_memory: u64,
    max_total_allocated_memory: u64,
    min_live_allocations: u64,
    max_live_allocations: u64,
    alloc_events: u64,
    free_events: u64,
}

impl Sample {
    /// A sample without events in which the totals stay at the given values.
    fn flat(total_allocated_memory: u64, live_allocations: u64) -> Self {
        Self {
            min_total_allocated_memory: total_allocated_memory,
            max_total_allocated_memory: total_allocated_memory,
            min_live_allocations: live_allocations,
            max_live_allocations: live_allocations,
            alloc_events: 0,
            free_events: 0,
        }
    }

    fn value(&self, series: TimelineSeries) -> u64 {
        match series {
            TimelineSeries::MinTotalAllocatedMemory => self.min_total_allocated_memory,
            TimelineSeries::MaxTotalAllocatedMemory => self.max_total_allocated_memory,
            TimelineSeries::MinLiveAllocations => self.min_live_allocations,
            TimelineSeries::MaxLiveAllocations => self.max_live_allocations,
            TimelineSeries::AllocEvents => self.alloc_events,
            TimelineSeries::FreeEvents => self.free_events,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Timelines {
    times: PagedSeries<f64>,
    samples: PagedSeries<Sample>,

    current: Sample,
    current_start: f64,
    current_end: f64,
}

impl Timelines {
    pub(crate) fn new() -> Self {
        Self {
            times: PagedSeries::new(TIMELINE_PAGE_SIZE),
            samples: PagedSeries::new(TIMELINE_PAGE_SIZE),
            current: Sample::default(),
            current_start: 0.0,
            current_end: 0.0,
        }
    }

    /// Opens the first sample at the session start time.
    pub(crate) fn start(&mut self, time: f64) {
        self.current_start = time;
        self.current_end = time;
    }

    /// Moves the open sample forward to `time`, closing it if it spans the granularity.
    ///
    /// The totals are the values before the event at `time` is applied.
    pub(crate) fn advance(&mut self, time: f64, total_allocated_memory: u64, live_allocations: u64) {
        if time - self.current_start > SAMPLE_GRANULARITY {
            self.append(self.current_start, self.current);

            self.current_start = time;
            self.current = Sample::flat(total_allocated_memory, live_allocations);

            if time - self.current_end > SAMPLE_GRANULARITY {
                self.append(
                    self.current_end,
                    Sample::flat(total_allocated_memory, live_allocations),
                );
            }
        }

        self.current_end = time;
    }

    pub(crate) fn record_alloc(&mut self, total_allocated_memory: u64, live_allocations: u64) {
        let sample = &mut self.current;

        sample.max_total_allocated_memory = sample
            .max_total_allocated_memory
            .max(total_allocated_memory);
        sample.max_live_allocations = sample.max_live_allocations.max(live_allocations);
        sample.alloc_events = sample.alloc_events.saturating_add(1);
    }

    pub(crate) fn record_free(&mut self, total_allocated_memory: u64, live_allocations: u64) {
        let sample = &mut self.current;

        sample.min_total_allocated_memory = sample
            .min_total_allocated_memory
            .min(total_allocated_memory);
        sample.min_live_allocations = sample.min_live_allocations.min(live_allocations);
        sample.free_events = sample.free_events.saturating_add(1);
    }

    /// Closes the open sample at the end of the analysis.
    pub(crate) fn flush(&mut self, total_allocated_memory: u64, live_allocations: u64) {
        self.advance(f64::INFINITY, total_allocated_memory, live_allocations);
    }

    fn append(&mut self, time: f64, sample: Sample) {
        self.times.push(time);
        self.samples.push(sample);
    }

    pub(crate) fn len(&self) -> usize {
        self.times.len()
    }

    /// Index of the last sample that starts at or before `time`.
    pub(crate) fn index_at(&self, time: f64) -> Option<usize> {
        self.times
            .partition_point(|sample_time| *sample_time <= time)
            .checked_sub(1)
    }

    /// Calls `callback(time, duration, value)` for each sample in `range`, clamped to the
    /// existing samples. The last sample of the timeline has an infinite duration.
    pub(crate) fn enumerate(
        &self,
        series: TimelineSeries,
        range: RangeInclusive<usize>,
        mut callback: impl FnMut(f64, f64, u64),
    ) {
        let start = *range.start();
        let end = (*range.end()).min(self.len().saturating_sub(1));

        if self.times.is_empty() || start > end {
            return;
        }

        let mut times = self.times.iter_from(start).copied().peekable();
        let samples = self.samples.iter_from(start);

        for (_, sample) in (start..=end).zip(samples) {
            let Some(time) = times.next() else {
                break;
            };

            let next_time = times.peek().copied().unwrap_or(f64::INFINITY);
            callback(time, next_time - time, sample.value(series));
        }
    }
}
