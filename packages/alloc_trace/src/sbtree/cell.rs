use crate::rule::TimeHull;
use crate::{AllocationItem, QueryRule};

/// One node of the segment binary tree: the freed allocations whose column span it covers.
///
/// Items are append-only. The cell also tracks the extremes of its items' start and end times
/// so a query can skip a cell without looking at any item.
#[derive(Debug)]
pub(crate) struct SbCell {
    items: Vec<AllocationItem>,

    start_min: f64,
    start_max: f64,
    end_min: f64,
    end_max: f64,
}

impl SbCell {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            start_min: f64::INFINITY,
            start_max: f64::NEG_INFINITY,
            end_min: f64::INFINITY,
            end_max: f64::NEG_INFINITY,
        }
    }

    pub(crate) fn push(&mut self, item: AllocationItem) {
        debug_assert!(!item.is_live(), "only freed allocations are stored in cells");

        self.start_min = self.start_min.min(item.start_time());
        self.start_max = self.start_max.max(item.start_time());
        self.end_min = self.end_min.min(item.end_time());
        self.end_max = self.end_max.max(item.end_time());

        self.items.push(item);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub(crate) fn items(&self) -> &[AllocationItem] {
        &self.items
    }

    /// Whether any item of this cell can lie inside `hull`.
    pub(crate) fn overlaps(&self, hull: &TimeHull) -> bool {
        self.start_min <= hull.start_max
            && hull.start_min <= self.start_max
            && self.end_min <= hull.end_max
            && hull.end_min <= self.end_max
    }

    /// The items of this cell that satisfy `rule`.
    pub(crate) fn matching<'a>(
        &'a self,
        rule: &'a QueryRule,
    ) -> impl Iterator<Item = &'a AllocationItem> + 'a {
        let candidates = if self.overlaps(&rule.hull()) {
            self.items.as_slice()
        } else {
            &[]
        };

        candidates.iter().filter(|item| rule.matches_item(item))
    }
}
