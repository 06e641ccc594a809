//! Per-URL response time and CPU time statistics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::sync::Cache;

use super::rolling::RollingStat;

#[derive(Debug, Default)]
struct PageStat {
    response_times: RollingStat,
    cpu_times: RollingStat,
}

/// Rolling per-page statistics keyed by the job's logical key (path and query).
#[derive(Clone)]
pub struct PageStats {
    pages: Cache<String, Arc<Mutex<PageStat>>>,
}

impl PageStats {
    pub fn new(capacity: u64) -> Self {
        Self {
            pages: Cache::new(capacity),
        }
    }

    pub fn record(&self, key: &str, response_time: Duration, cpu_time: Duration) {
        let stat = self
            .pages
            .get_with(key.to_string(), || Arc::new(Mutex::new(PageStat::default())));
        if let Ok(mut stat) = stat.lock() {
            stat.response_times.add(response_time.as_millis() as u64);
            stat.cpu_times.add(cpu_time.as_millis() as u64);
        }
    }

    /// Filtered recent CPU time in milliseconds, if the page has been seen
    pub fn weighted_cpu_time(&self, key: &str) -> Option<u64> {
        let stat = self.pages.get(key)?;
        let stat = stat.lock().ok()?;
        stat.cpu_times.filtered_max()
    }

    /// Filtered recent response time in milliseconds, if the page has been seen
    pub fn weighted_response_time(&self, key: &str) -> Option<u64> {
        let stat = self.pages.get(key)?;
        let stat = stat.lock().ok()?;
        stat.response_times.filtered_max()
    }
}
