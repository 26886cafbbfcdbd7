use crate::AllocationItem;

/// A time-relation predicate that selects allocations by when they started and ended.
///
/// The times are trace times with `a <= b <= c <= d`. Bounds are inclusive unless stated
/// otherwise. Live allocations have an end time of positive infinity.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum QueryRule {
    /// Allocations active at `a`: `start <= a < end`.
    ActiveAt {
        /// Point in time.
        a: f64,
    },

    /// Allocations freed at or before `a`: `end <= a`.
    EndedBefore {
        /// Point in time.
        a: f64,
    },

    /// Allocations made at or after `a`: `start >= a`.
    StartedAfter {
        /// Point in time.
        a: f64,
    },

    /// Memory in decline: allocated at or before `a`, freed during `(a, b]`.
    Decline {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Memory growth: allocated during `[a, b]` and still alive after `b`.
    Growth {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Free events during `[a, b]`.
    FreeEvents {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Alloc events during `[a, b]`.
    AllocEvents {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Short-lived allocations, made and freed within `[a, b]`.
    ShortLived {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Long-lived allocations, alive for the whole of `[a, b]`.
    LongLived {
        /// Start of the range.
        a: f64,
        /// End of the range.
        b: f64,
    },

    /// Leaks: allocated during `[a, b]` and still alive at `c`.
    Leaked {
        /// Start of the allocation range.
        a: f64,
        /// End of the allocation range.
        b: f64,
        /// Point at which the allocation must still be alive.
        c: f64,
    },

    /// Limited lifetime: allocated during `[a, b]`, freed during `[b, c]`.
    LimitedLifetime {
        /// Start of the allocation range.
        a: f64,
        /// End of the allocation range and start of the free range.
        b: f64,
        /// End of the free range.
        c: f64,
    },

    /// Decline of long-lived allocations: allocated at or before `a`, freed during `[b, c]`.
    DecliningLongLived {
        /// Point at which the allocation must already exist.
        a: f64,
        /// Start of the free range.
        b: f64,
        /// End of the free range.
        c: f64,
    },

    /// Specific lifetime: allocated during `[a, b]`, freed during `[c, d]`.
    SpecificLifetime {
        /// Start of the allocation range.
        a: f64,
        /// End of the allocation range.
        b: f64,
        /// Start of the free range.
        c: f64,
        /// End of the free range.
        d: f64,
    },
}

/// Closed ranges of start and end times that contain every allocation a rule can select.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TimeHull {
    pub(crate) start_min: f64,
    pub(crate) start_max: f64,
    pub(crate) end_min: f64,
    pub(crate) end_max: f64,
}

impl TimeHull {
    fn new(start: (f64, f64), end: (f64, f64)) -> Self {
        Self {
            start_min: start.0,
            // An allocation never ends before it starts.
            start_max: start.1.min(end.1),
            end_min: end.0.max(start.0),
            end_max: end.1,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        // Written to also treat NaN bounds as empty.
        !(self.start_min <= self.start_max && self.end_min <= self.end_max)
    }
}

const NEG_INF: f64 = f64::NEG_INFINITY;
const INF: f64 = f64::INFINITY;

impl QueryRule {
    /// Short name of the rule, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActiveAt { .. } => "active_at",
            Self::EndedBefore { .. } => "ended_before",
            Self::StartedAfter { .. } => "started_after",
            Self::Decline { .. } => "decline",
            Self::Growth { .. } => "growth",
            Self::FreeEvents { .. } => "free_events",
            Self::AllocEvents { .. } => "alloc_events",
            Self::ShortLived { .. } => "short_lived",
            Self::LongLived { .. } => "long_lived",
            Self::Leaked { .. } => "leaked",
            Self::LimitedLifetime { .. } => "limited_lifetime",
            Self::DecliningLongLived { .. } => "declining_long_lived",
            Self::SpecificLifetime { .. } => "specific_lifetime",
        }
    }

    /// Whether an allocation that lived from `start` to `end` satisfies the rule.
    #[must_use]
    pub fn matches(&self, start: f64, end: f64) -> bool {
        match *self {
            Self::ActiveAt { a } => start <= a && a < end,
            Self::EndedBefore { a } => end <= a,
            Self::StartedAfter { a } => start >= a,
            Self::Decline { a, b } => start <= a && a < end && end <= b,
            Self::Growth { a, b } => a <= start && start <= b && end > b,
            Self::FreeEvents { a, b } => a <= end && end <= b,
            Self::AllocEvents { a, b } => a <= start && start <= b,
            Self::ShortLived { a, b } => start >= a && end <= b,
            Self::LongLived { a, b } => start <= a && end >= b,
            Self::Leaked { a, b, c } => a <= start && start <= b && end >= c,
            Self::LimitedLifetime { a, b, c } => {
                a <= start && start <= b && b <= end && end <= c
            }
            Self::DecliningLongLived { a, b, c } => start <= a && b <= end && end <= c,
            Self::SpecificLifetime { a, b, c, d } => {
                a <= start && start <= b && c <= end && end <= d
            }
        }
    }

    /// Whether `item` satisfies the rule.
    #[must_use]
    pub fn matches_item(&self, item: &AllocationItem) -> bool {
        self.matches(item.start_time(), item.end_time())
    }

    pub(crate) fn hull(&self) -> TimeHull {
        match *self {
            Self::ActiveAt { a } => TimeHull::new((NEG_INF, a), (a, INF)),
            Self::EndedBefore { a } => TimeHull::new((NEG_INF, a), (NEG_INF, a)),
            Self::StartedAfter { a } => TimeHull::new((a, INF), (a, INF)),
            Self::Decline { a, b } => TimeHull::new((NEG_INF, a), (a, b)),
            Self::Growth { a, b } => TimeHull::new((a, b), (b, INF)),
            Self::FreeEvents { a, b } => TimeHull::new((NEG_INF, b), (a, b)),
            Self::AllocEvents { a, b } => TimeHull::new((a, b), (a, INF)),
            Self::ShortLived { a, b } => TimeHull::new((a, b), (a, b)),
            Self::LongLived { a, b } => TimeHull::new((NEG_INF, a), (b, INF)),
            Self::Leaked { a, b, c } => TimeHull::new((a, b), (c, INF)),
            Self::LimitedLifetime { a, b, c } => TimeHull::new((a, b), (b, c)),
            Self::DecliningLongLived { a, b, c } => TimeHull::new((NEG_INF, a), (b, c)),
            Self::SpecificLifetime { a, b, c, d } => TimeHull::new((a, b), (c, d)),
        }
    }
}
