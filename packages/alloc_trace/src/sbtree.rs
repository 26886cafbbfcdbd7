//! Segment binary tree over event columns.
//!
//! Event indices are grouped into columns of `1 << column_shift` consecutive events. The tree is
//! an implicit binary tree over columns, stored in an array using in-order numbering: leaves
//! (depth 0) sit at even indices and a node at depth `d` covers `2^d` columns. Each freed
//! allocation is stored in exactly one cell, the smallest node that covers the columns of both
//! its alloc and its free event.
//!
//! A second array of "offsetted" cells holds nodes shifted by half their width. A span that
//! straddles a large power-of-two boundary but is itself short fits into an offsetted node one
//! level below the regular node, instead of being pushed up to the coarse regular node.
//!
//! Queries translate trace times to columns through the start time of each column and then
//! collect every cell whose span can hold a matching allocation. This over-selects; the caller
//! applies the exact per-item predicate.

mod cell;

pub(crate) use cell::SbCell;

use crate::AllocationItem;
use crate::rule::TimeHull;

/// Depth of the tree needed to cover columns `0..=value`, or the bit width of `value`.
#[must_use]
pub(crate) fn max_depth(value: u32) -> u32 {
    u32::BITS - value.leading_zeros()
}

/// Index of the node at `depth` that covers `column`.
#[must_use]
pub(crate) fn cell_at_depth(column: u32, depth: u32) -> usize {
    let k = 1_u64 << depth;

    // Fits in usize on all supported targets: at most 2^33.
    (((2 * u64::from(column)) & !k) | (k - 1)) as usize
}

/// The shallowest depth at which both columns fall under the same node.
#[must_use]
pub(crate) fn common_depth(column_a: u32, column_b: u32) -> u32 {
    max_depth(column_a ^ column_b)
}

/// Where a freed allocation is stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CellAddress {
    pub(crate) offsetted: bool,
    pub(crate) index: usize,
}

impl CellAddress {
    /// The cell for an allocation spanning `start_column..=end_column`.
    pub(crate) fn for_span(start_column: u32, end_column: u32) -> Self {
        debug_assert!(start_column <= end_column);

        let depth = common_depth(start_column, end_column);

        if depth >= 2 {
            // The span crosses the middle of its regular node. If it starts in the upper half of
            // its child node and ends in the lower half of the next child, the offsetted node one
            // level down (covering the middle of the regular node) holds it.
            let half_cell_width = 1_u32 << (depth - 2);

            if start_column & half_cell_width != 0 && end_column & half_cell_width == 0 {
                return Self {
                    offsetted: true,
                    index: cell_at_depth(start_column, depth - 1),
                };
            }
        }

        Self {
            offsetted: false,
            index: cell_at_depth(start_column, depth),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SbTree {
    column_shift: u32,
    column_start_times: Vec<f64>,

    /// Highest column that any stored allocation ends in.
    current_column: u32,

    cells: Vec<Option<SbCell>>,
    offsetted_cells: Vec<Option<SbCell>>,

    materialized_cells: usize,
}

impl SbTree {
    pub(crate) fn new(column_shift: u32) -> Self {
        Self {
            column_shift,
            column_start_times: Vec::new(),
            current_column: 0,
            cells: vec![None, None],
            offsetted_cells: vec![None, None],
            materialized_cells: 0,
        }
    }

    pub(crate) fn column_shift(&self) -> u32 {
        self.column_shift
    }

    pub(crate) fn column_of(&self, event_index: u32) -> u32 {
        event_index >> self.column_shift
    }

    /// Number of columns that have received at least one event.
    pub(crate) fn column_count(&self) -> usize {
        self.column_start_times.len()
    }

    /// Number of cells that hold at least one allocation.
    pub(crate) fn materialized_cells(&self) -> usize {
        self.materialized_cells
    }

    /// Records the time of an event. The first event of each column sets the column start time.
    pub(crate) fn set_time_for_event(&mut self, event_index: u32, time: f64) {
        let column = self.column_of(event_index) as usize;

        if column == self.column_start_times.len() {
            self.column_start_times.push(time);
        }

        debug_assert!(
            column < self.column_start_times.len(),
            "events must be recorded in order"
        );
    }

    /// Stores a freed allocation. Its cell is a pure function of its event columns.
    pub(crate) fn insert(&mut self, item: AllocationItem) {
        let start_column = self.column_of(item.start_event_index());
        let end_column = self.column_of(
            item.end_event_index()
                .expect("live allocations are never stored in the tree"),
        );

        self.grow_to(end_column);

        let address = CellAddress::for_span(start_column, end_column);
        let cells = if address.offsetted {
            &mut self.offsetted_cells
        } else {
            &mut self.cells
        };

        let slot = cells
            .get_mut(address.index)
            .expect("cell arrays always cover twice the current column count");

        if slot.is_none() {
            self.materialized_cells = self.materialized_cells.wrapping_add(1);
        }

        slot.get_or_insert_with(SbCell::new).push(item);
    }

    fn grow_to(&mut self, column: u32) {
        self.current_column = self.current_column.max(column);

        let required = (self.current_column as usize + 1) * 2;

        while self.cells.len() < required {
            self.cells.extend([None, None]);
            self.offsetted_cells.extend([None, None]);
        }
    }

    /// Last column whose first event happened at or before `time`.
    pub(crate) fn column_at_time(&self, time: f64) -> Option<u32> {
        let count = self
            .column_start_times
            .partition_point(|start_time| *start_time <= time);

        count
            .checked_sub(1)
            .map(|column| u32::try_from(column).unwrap_or(u32::MAX))
    }

    /// First column that can hold an event happening at or after `time`.
    fn first_column_from(&self, time: f64) -> u32 {
        let count = self
            .column_start_times
            .partition_point(|start_time| *start_time < time);

        // The column before the first one starting at or after `time` may still contain later
        // events that happen at `time` or after.
        u32::try_from(count.saturating_sub(1)).unwrap_or(u32::MAX)
    }

    fn column_range(&self, min_time: f64, max_time: f64) -> Option<(u32, u32)> {
        let first = if min_time == f64::NEG_INFINITY {
            0
        } else {
            self.first_column_from(min_time)
        };

        let last = if max_time == f64::INFINITY {
            self.current_column
        } else {
            self.column_at_time(max_time)?.min(self.current_column)
        };

        (first <= last).then_some((first, last))
    }

    /// Every materialized cell that can hold an allocation inside `hull`, shallowest depth first.
    pub(crate) fn candidate_cells(&self, hull: &TimeHull) -> Vec<&SbCell> {
        let mut candidates = Vec::new();

        if hull.is_empty() {
            return candidates;
        }

        let Some(start_columns) = self.column_range(hull.start_min, hull.start_max) else {
            return candidates;
        };
        let Some(end_columns) = self.column_range(hull.end_min, hull.end_max) else {
            return candidates;
        };

        let (start_first, start_last) = (u64::from(start_columns.0), u64::from(start_columns.1));
        let (end_first, end_last) = (u64::from(end_columns.0), u64::from(end_columns.1));

        let overlaps = |lo: u64, hi: u64, first: u64, last: u64| lo <= last && first <= hi;

        for depth in 0..=max_depth(self.current_column) {
            let width = 1_u64 << depth;
            let half = width / 2;

            // Nodes that start more than two widths before the end range cannot reach it.
            let lowest = start_first.max(end_first.saturating_sub(2 * width)) & !(width - 1);
            let highest = start_last.min(end_last);

            let mut base = lowest;
            while base <= highest {
                // A regular node holds spans inside [base, base + width).
                if overlaps(base, base + width - 1, start_first, start_last)
                    && overlaps(base, base + width - 1, end_first, end_last)
                {
                    Self::push_cell(&self.cells, base, depth, &mut candidates);
                }

                // An offsetted node holds spans starting in [base + half, base + width) and
                // ending in [base + width, base + width + half).
                if depth > 0
                    && overlaps(base + half, base + width - 1, start_first, start_last)
                    && overlaps(base + width, base + width + half - 1, end_first, end_last)
                {
                    Self::push_cell(&self.offsetted_cells, base, depth, &mut candidates);
                }

                base += width;
            }
        }

        candidates
    }

    fn push_cell<'a>(
        cells: &'a [Option<SbCell>],
        base: u64,
        depth: u32,
        candidates: &mut Vec<&'a SbCell>,
    ) {
        let Ok(base) = u32::try_from(base) else {
            return;
        };

        if let Some(Some(cell)) = cells.get(cell_at_depth(base, depth)) {
            candidates.push(cell);
        }
    }

    #[cfg(test)]
    pub(crate) fn cell(&self, address: CellAddress) -> Option<&SbCell> {
        let cells = if address.offsetted {
            &self.offsetted_cells
        } else {
            &self.cells
        };

        cells.get(address.index).and_then(Option::as_ref)
    }

    #[cfg(test)]
    pub(crate) fn cell_capacity(&self) -> usize {
        self.cells.len()
    }
}
