/// Number of buckets needed to hold any `u64` value.
pub const LOG2_BUCKET_COUNT: usize = 65;

/// Power-of-two bucket of `value`.
///
/// Bucket 0 holds only the value 0. Bucket `i > 0` holds `2^(i-1) ..= 2^i - 1`.
#[must_use]
pub fn log2_bucket(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

/// Histogram with one bucket per power of two.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Log2Histogram {
    buckets: [u64; LOG2_BUCKET_COUNT],
}

impl Log2Histogram {
    pub(crate) fn new() -> Self {
        Self {
            buckets: [0; LOG2_BUCKET_COUNT],
        }
    }

    pub(crate) fn record(&mut self, value: u64) {
        if let Some(bucket) = self.buckets.get_mut(log2_bucket(value)) {
            *bucket = bucket.saturating_add(1);
        }
    }

    /// Counts per bucket, indexed as described on [`log2_bucket()`].
    #[must_use]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Total number of recorded values.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .fold(0_u64, |total, count| total.saturating_add(*count))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 0),
            (1, 1),
            (2, 2),
            (3, 2),
            (4, 3),
            (511, 9),
            (512, 10),
            (1023, 10),
            (1024, 11),
            (u64::MAX, 64),
        ];

        for &(value, bucket) in cases {
            assert_eq!(log2_bucket(value), bucket, "value {value}");
        }
    }

    #[test]
    fn records_into_buckets() {
        let mut histogram = Log2Histogram::new();

        for value in [0, 1, 2, 3, 4, 1023, 1024] {
            histogram.record(value);
        }

        let buckets = histogram.buckets();
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[1], 1);
        assert_eq!(buckets[2], 2);
        assert_eq!(buckets[3], 1);
        assert_eq!(buckets[10], 1);
        assert_eq!(buckets[11], 1);
        assert_eq!(histogram.total(), 7);
    }
}
