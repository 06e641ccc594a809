//! Fixed-capacity rolling sample window.

/// Number of samples retained per window.
pub const ROLLING_CAPACITY: usize = 16;

/// Circular buffer of the most recent samples with a percentile-filtered maximum.
///
/// Once full, new samples overwrite the oldest in place.
#[derive(Debug, Clone, Default)]
pub struct RollingStat {
    samples: Vec<u64>,
    position: usize,
}

impl RollingStat {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(ROLLING_CAPACITY),
            position: 0,
        }
    }

    /// Record a sample, overwriting the oldest once the window is full
    pub fn add(&mut self, sample: u64) {
        if self.samples.len() < ROLLING_CAPACITY {
            self.samples.push(sample);
        } else {
            self.samples[self.position] = sample;
            self.position = (self.position + 1) % ROLLING_CAPACITY;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The 75th-percentile sample: element `⌊0.75 × n⌋` of the sorted window.
    ///
    /// Returns `None` when no sample has been recorded yet.
    pub fn filtered_max(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let index = (3 * sorted.len()) / 4;
        Some(sorted[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtered_max_sixteen_samples() {
        let mut stat = RollingStat::new();
        for sample in 1..=16 {
            stat.add(sample);
        }
        // index 12 of [1..=16]
        assert_eq!(stat.filtered_max(), Some(13));
    }

    #[test]
    fn test_filtered_max_empty() {
        let stat = RollingStat::new();
        assert!(stat.is_empty());
        assert_eq!(stat.filtered_max(), None);
    }

    #[test]
    fn test_filtered_max_single_sample() {
        let mut stat = RollingStat::new();
        stat.add(42);
        assert_eq!(stat.filtered_max(), Some(42));
    }

    #[test]
    fn test_filtered_max_ignores_insertion_order() {
        let mut stat = RollingStat::new();
        for sample in [9, 1, 7, 3] {
            stat.add(sample);
        }
        // sorted [1, 3, 7, 9], index 3
        assert_eq!(stat.filtered_max(), Some(9));
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut stat = RollingStat::new();
        for sample in 1..=16 {
            stat.add(sample);
        }
        // Replace the four oldest samples (1..=4) with large values
        for _ in 0..4 {
            stat.add(1000);
        }
        assert_eq!(stat.len(), ROLLING_CAPACITY);
        // sorted [5..=16, 1000 x4], index 12 is the first 1000
        assert_eq!(stat.filtered_max(), Some(1000));

        // Cursor keeps wrapping without growing the buffer
        for _ in 0..100 {
            stat.add(1);
        }
        assert_eq!(stat.len(), ROLLING_CAPACITY);
        assert_eq!(stat.filtered_max(), Some(1));
    }
}
