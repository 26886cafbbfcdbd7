use thiserror::Error;

/// Anomalies detected while ingesting trace events.
///
/// Ingestion never fails from the caller's point of view: the offending event is dropped, the
/// anomaly is counted in [`IngestionCounters`] and ingestion continues. This type describes what
/// was dropped and why.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum IngestionError {
    /// An alloc or free event arrived before the session was initialized.
    #[error("event received before the session was initialized")]
    NotInitialized,

    /// An alloc event carried the null address, which can never be live.
    #[error("alloc event with null address")]
    NullAddress,

    /// An alloc event named an address that is already live.
    #[error("alloc event for address {address:#x} which is already live")]
    DuplicateAlloc {
        /// The address of the rejected allocation.
        address: u64,
    },

    /// A free event named an address that is not live.
    #[error("free event for address {address:#x} which is not live")]
    StrayFree {
        /// The address named by the free event.
        address: u64,
    },

    /// The session was initialized a second time.
    #[error("session is already initialized")]
    AlreadyInitialized,

    /// Every event index of the session has been assigned.
    #[error("event index space is exhausted")]
    EventIndexExhausted,
}

pub(crate) type Result<T> = std::result::Result<T, IngestionError>;

/// Number of ingestion events dropped, by reason. All counters only ever grow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct IngestionCounters {
    /// Alloc events for an address that was already live.
    pub duplicate_allocs: u64,

    /// Free events for an address that was not live.
    pub stray_frees: u64,

    /// Alloc events with the null address.
    pub null_address_allocs: u64,

    /// Alloc or free events that arrived before the session was initialized.
    pub writes_before_init: u64,

    /// Calls to initialize an already initialized session.
    pub repeated_inits: u64,

    /// Events dropped because the event index space was exhausted.
    pub index_exhausted: u64,
}

impl IngestionCounters {
    pub(crate) fn count(&mut self, error: IngestionError) {
        let counter = match error {
            IngestionError::NotInitialized => &mut self.writes_before_init,
            IngestionError::NullAddress => &mut self.null_address_allocs,
            IngestionError::DuplicateAlloc { .. } => &mut self.duplicate_allocs,
            IngestionError::StrayFree { .. } => &mut self.stray_frees,
            IngestionError::AlreadyInitialized => &mut self.repeated_inits,
            IngestionError::EventIndexExhausted => &mut self.index_exhausted,
        };

        *counter = counter.saturating_add(1);
    }

    /// Sum of all counters.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.duplicate_allocs
            .saturating_add(self.stray_frees)
            .saturating_add(self.null_address_allocs)
            .saturating_add(self.writes_before_init)
            .saturating_add(self.repeated_inits)
            .saturating_add(self.index_exhausted)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(IngestionError: Send, Sync, Debug, std::error::Error);
    assert_impl_all!(IngestionCounters: Send, Sync, Copy);

    #[test]
    fn messages_include_address() {
        let error = IngestionError::DuplicateAlloc { address: 0x1000 };

        assert_eq!(
            error.to_string(),
            "alloc event for address 0x1000 which is already live"
        );
    }

    #[test]
    fn count_routes_to_matching_counter() {
        let mut counters = IngestionCounters::default();

        counters.count(IngestionError::StrayFree { address: 8 });
        counters.count(IngestionError::StrayFree { address: 16 });
        counters.count(IngestionError::AlreadyInitialized);

        assert_eq!(counters.stray_frees, 2);
        assert_eq!(counters.repeated_inits, 1);
        assert_eq!(counters.duplicate_allocs, 0);
        assert_eq!(counters.total(), 3);
    }
}
