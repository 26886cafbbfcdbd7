use std::sync::OnceLock;

/// Event index recorded as the end of an allocation that has not been freed yet.
pub(crate) const LIVE_EVENT_INDEX: u32 = u32::MAX;

const ALIGNMENT_SHIFT: u32 = 56;
const SIZE_MASK: u64 = (1 << ALIGNMENT_SHIFT) - 1;

/// Allocation size and alignment packed into one 64-bit word.
///
/// The low 56 bits hold the size in bytes, the high 8 bits hold the base-2 logarithm of the
/// alignment. Alignments that are not a power of two are rounded up to the next one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SizeAndAlignment(u64);

impl SizeAndAlignment {
    /// Packs a size and alignment. Sizes beyond 56 bits are truncated.
    #[must_use]
    pub fn new(size: u64, alignment: u32) -> Self {
        let alignment_log2 = alignment
            .max(1)
            .checked_next_power_of_two()
            .unwrap_or(1 << (u32::BITS - 1))
            .trailing_zeros();

        Self((size & SIZE_MASK) | (u64::from(alignment_log2) << ALIGNMENT_SHIFT))
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(self) -> u64 {
        self.0 & SIZE_MASK
    }

    /// Alignment of the allocation in bytes, always a power of two.
    #[must_use]
    pub fn alignment(self) -> u32 {
        // The stored logarithm came from a u32 power of two, so it is at most 31.
        1 << (self.0 >> ALIGNMENT_SHIFT)
    }
}

/// Opaque reference to a resolved callstack, handed out by a
/// [`CallstackResolver`][crate::CallstackResolver].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CallstackHandle(u64);

impl CallstackHandle {
    /// The handle returned when no callstack information is available.
    pub const UNKNOWN: Self = Self(0);

    /// Wraps a resolver-specific callstack identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The resolver-specific callstack identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// One traced allocation, live or freed.
///
/// Items are created by an alloc event and closed by the matching free event. After closing,
/// an item is stored in the allocation index and never changes again, except for the lazily
/// resolved callstack, which is set at most once.
#[derive(Clone, Debug)]
pub struct AllocationItem {
    start_event_index: u32,
    end_event_index: u32,
    start_time: f64,
    end_time: f64,
    owner: u64,
    address: u64,
    size_and_alignment: SizeAndAlignment,
    tag: u32,
    callstack: OnceLock<CallstackHandle>,
}

impl AllocationItem {
    pub(crate) fn live(
        start_event_index: u32,
        start_time: f64,
        owner: u64,
        address: u64,
        size_and_alignment: SizeAndAlignment,
        tag: u32,
    ) -> Self {
        debug_assert_ne!(address, 0, "null addresses are rejected before items are created");

        Self {
            start_event_index,
            end_event_index: LIVE_EVENT_INDEX,
            start_time,
            end_time: f64::INFINITY,
            owner,
            address,
            size_and_alignment,
            tag,
            callstack: OnceLock::new(),
        }
    }

    pub(crate) fn close(&mut self, end_event_index: u32, end_time: f64) {
        debug_assert!(self.is_live(), "an allocation can only be closed once");
        debug_assert!(end_event_index > self.start_event_index);
        debug_assert!(end_time >= self.start_time);

        self.end_event_index = end_event_index;
        self.end_time = end_time;
    }

    /// Index of the alloc event that created this allocation.
    #[must_use]
    pub fn start_event_index(&self) -> u32 {
        self.start_event_index
    }

    /// Index of the free event that released this allocation, or `None` while it is live.
    #[must_use]
    pub fn end_event_index(&self) -> Option<u32> {
        (!self.is_live()).then_some(self.end_event_index)
    }

    /// Trace time of the alloc event.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Trace time of the free event, or positive infinity while the allocation is live.
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    /// Whether the allocation has not been freed (yet).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.end_event_index == LIVE_EVENT_INDEX
    }

    /// Opaque identifier of the code that made the allocation.
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Virtual address of the allocation. Never zero.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size_and_alignment.size()
    }

    /// Alignment of the allocation in bytes.
    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.size_and_alignment.alignment()
    }

    /// User classification tag.
    #[must_use]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// The callstack of the owner, if it has been resolved.
    #[must_use]
    pub fn callstack(&self) -> Option<CallstackHandle> {
        self.callstack.get().copied()
    }

    /// Resolves the callstack unless that already happened. Returns the cached handle.
    pub(crate) fn resolve_callstack(
        &self,
        resolve: impl FnOnce(u64) -> CallstackHandle,
    ) -> CallstackHandle {
        *self.callstack.get_or_init(|| resolve(self.owner))
    }
}
