use foldhash::{HashMap, HashMapExt};

use crate::AllocationItem;

/// Allocations that have been made but not freed yet, keyed by address.
#[derive(Debug)]
pub(crate) struct LiveAllocations {
    by_address: HashMap<u64, AllocationItem>,
}

impl LiveAllocations {
    pub(crate) fn new() -> Self {
        Self {
            by_address: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_address.len()
    }

    pub(crate) fn contains(&self, address: u64) -> bool {
        self.by_address.contains_key(&address)
    }

    pub(crate) fn get(&self, address: u64) -> Option<&AllocationItem> {
        self.by_address.get(&address)
    }

    /// Inserts a new live allocation. The caller has checked that the address is not live.
    pub(crate) fn insert(&mut self, item: AllocationItem) {
        let previous = self.by_address.insert(item.address(), item);
        debug_assert!(previous.is_none(), "duplicate live address slipped through");
    }

    pub(crate) fn remove(&mut self, address: u64) -> Option<AllocationItem> {
        self.by_address.remove(&address)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &AllocationItem> {
        self.by_address.values()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::SizeAndAlignment;

    fn item(address: u64) -> AllocationItem {
        AllocationItem::live(0, 0.0, 1, address, SizeAndAlignment::new(16, 8), 0)
    }

    #[test]
    fn insert_get_remove() {
        let mut live = LiveAllocations::new();
        live.insert(item(0x10));
        live.insert(item(0x20));

        assert_eq!(live.len(), 2);
        assert!(live.contains(0x10));
        assert_eq!(live.get(0x20).map(AllocationItem::address), Some(0x20));

        let removed = live.remove(0x10).unwrap();
        assert_eq!(removed.address(), 0x10);
        assert!(!live.contains(0x10));
        assert!(live.remove(0x10).is_none());
        assert_eq!(live.iter().count(), 1);
    }
}
