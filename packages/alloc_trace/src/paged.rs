/// Append-only sequence stored in fixed-size pages.
///
/// Appending never moves existing elements, so growth costs stay flat even for series with
/// millions of entries.
#[derive(Debug)]
pub(crate) struct PagedSeries<T> {
    pages: Vec<Vec<T>>,
    page_size: usize,
    len: usize,
}

impl<T> PagedSeries<T> {
    pub(crate) fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");

        Self {
            pages: Vec::new(),
            page_size,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push(&mut self, value: T) {
        let needs_page = self
            .pages
            .last()
            .is_none_or(|page| page.len() == self.page_size);

        if needs_page {
            self.pages.push(Vec::with_capacity(self.page_size));
        }

        self.pages
            .last_mut()
            .expect("a page with free space exists after the check above")
            .push(value);

        self.len = self.len.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.pages
            .get(index / self.page_size)
            .and_then(|page| page.get(index % self.page_size))
    }

    /// Iterates from `start` to the end of the series.
    pub(crate) fn iter_from(&self, start: usize) -> impl Iterator<Item = &T> {
        let first_page = start / self.page_size;
        let skip = start % self.page_size;

        self.pages
            .iter()
            .skip(first_page)
            .flatten()
            .skip(skip)
    }

    /// Number of leading elements for which `is_before` holds, for a series partitioned so that
    /// all such elements precede the rest.
    ///
    /// Searches the first elements of the pages, then within the located page.
    pub(crate) fn partition_point(&self, mut is_before: impl FnMut(&T) -> bool) -> usize {
        let full_pages = self
            .pages
            .partition_point(|page| page.first().is_some_and(&mut is_before));

        let Some(page_index) = full_pages.checked_sub(1) else {
            return 0;
        };

        let page = self
            .pages
            .get(page_index)
            .expect("page index comes from a partition point over the same pages");

        page_index
            .wrapping_mul(self.page_size)
            .wrapping_add(page.partition_point(is_before))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn series_of(values: &[u32], page_size: usize) -> PagedSeries<u32> {
        let mut series = PagedSeries::new(page_size);

        for value in values {
            series.push(*value);
        }

        series
    }

    #[test]
    fn push_and_get_across_pages() {
        let series = series_of(&[10, 20, 30, 40, 50], 2);

        assert_eq!(series.len(), 5);
        assert_eq!(series.get(0), Some(&10));
        assert_eq!(series.get(3), Some(&40));
        assert_eq!(series.get(4), Some(&50));
        assert_eq!(series.get(5), None);
    }

    #[test]
    fn iter_from_middle() {
        let series = series_of(&[1, 2, 3, 4, 5, 6, 7], 3);

        let tail: Vec<u32> = series.iter_from(4).copied().collect();
        assert_eq!(tail, vec![5, 6, 7]);
        assert_eq!(series.iter_from(7).count(), 0);
    }

    #[test]
    fn partition_point_matches_slice() {
        let values = [1, 1, 2, 3, 3, 3, 5, 8, 8, 13];

        for page_size in 1..5 {
            let series = series_of(&values, page_size);

            for key in 0..15 {
                assert_eq!(
                    series.partition_point(|value| *value <= key),
                    values.partition_point(|value| *value <= key),
                    "page size {page_size}, key {key}"
                );
            }
        }
    }

    #[test]
    fn partition_point_on_empty_series() {
        let series = PagedSeries::<u32>::new(4);

        assert!(series.is_empty());
        assert_eq!(series.partition_point(|_| true), 0);
    }
}
