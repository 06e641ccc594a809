//! Linearly decaying per-source request counters.

use std::hash::Hash;
use std::time::Instant;

use moka::sync::Cache;

/// A request count that decays at one unit per second since it was last touched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgedCount {
    pub count: f64,
    pub since: Instant,
}

impl AgedCount {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0.0,
            since: now,
        }
    }

    /// The count aged up to `now`, floored at zero.
    ///
    /// The returned entry is stamped with `now`, so aging it again is idempotent
    /// for the same instant.
    pub fn aged(self, now: Instant) -> Self {
        let mut count = self.count;
        if count > 0.0 {
            count -= now.saturating_duration_since(self.since).as_secs_f64();
            if count < 0.0 {
                count = 0.0;
            }
        }
        Self { count, since: now }
    }
}

/// Bounded, concurrently accessible map of [`AgedCount`]s keyed by client identity.
///
/// Least-recently-used identities are evicted once `capacity` is reached.
pub struct AgedCounter<K> {
    entries: Cache<K, AgedCount>,
}

impl<K> AgedCounter<K>
where
    K: Hash + Eq + Send + Sync + Clone + 'static,
{
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    /// Current decayed rate for `key` without recording a new event.
    pub fn rate(&self, key: &K) -> f64 {
        self.rate_at(key, Instant::now())
    }

    pub fn rate_at(&self, key: &K, now: Instant) -> f64 {
        self.entries
            .get(key)
            .map(|entry| entry.aged(now).count)
            .unwrap_or(0.0)
    }

    /// Age the entry for `key` and count one more event.
    pub fn touch(&self, key: K) -> f64 {
        self.touch_at(key, Instant::now())
    }

    pub fn touch_at(&self, key: K, now: Instant) -> f64 {
        let mut entry = self
            .entries
            .get(&key)
            .map(|entry| entry.aged(now))
            .unwrap_or_else(|| AgedCount::new(now));
        entry.count += 1.0;
        self.entries.insert(key, entry);
        entry.count
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_linear_decay() {
        let start = Instant::now();
        let count = AgedCount {
            count: 5.0,
            since: start,
        };
        let aged = count.aged(start + Duration::from_secs(3));
        assert!((aged.count - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decay_floors_at_zero() {
        let start = Instant::now();
        let count = AgedCount {
            count: 2.0,
            since: start,
        };
        let aged = count.aged(start + Duration::from_secs(10));
        assert_eq!(aged.count, 0.0);
    }

    #[test]
    fn test_touch_accumulates_and_decays() {
        let counter: AgedCounter<String> = AgedCounter::new(16);
        let start = Instant::now();

        counter.touch_at("a".to_string(), start);
        counter.touch_at("a".to_string(), start);
        counter.touch_at("a".to_string(), start);
        assert!((counter.rate_at(&"a".to_string(), start) - 3.0).abs() < 1e-9);

        let later = start + Duration::from_millis(1500);
        assert!((counter.rate_at(&"a".to_string(), later) - 1.5).abs() < 1e-9);

        // Touching after decay starts from the aged value
        let value = counter.touch_at("a".to_string(), later);
        assert!((value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_key_has_zero_rate() {
        let counter: AgedCounter<String> = AgedCounter::new(16);
        assert_eq!(counter.rate(&"nobody".to_string()), 0.0);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let counter: AgedCounter<u32> = AgedCounter::new(8);
        for key in 0..200 {
            counter.touch(key);
        }
        assert!(counter.entry_count() <= 8);
    }
}
