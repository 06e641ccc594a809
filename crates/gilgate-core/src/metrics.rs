//! Prometheus metrics for the gateway.
//!
//! Each [`GatewayMetrics`] owns its own [`Registry`], so several gateways
//! (or tests) can coexist in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Execution latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    pub requests_total: IntCounter,
    /// Terminal results by resolution (completed, timed_out, evicted, cancelled)
    pub resolutions_total: IntCounterVec,
    pub errors_total: IntCounter,
    pub blocked_total: IntCounter,
    pub interrupts_total: IntCounter,

    pub queue_length: IntGauge,
    pub active_executions: IntGauge,
    pub stuck_workers: IntGauge,
    pub parked_jobs: IntGauge,

    pub execution_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some(namespace.to_string()), None)?;

        let requests_total =
            IntCounter::with_opts(Opts::new("requests_total", "Requests admitted to the scheduler"))?;
        let resolutions_total = IntCounterVec::new(
            Opts::new("resolutions_total", "Job terminal results by resolution"),
            &["resolution"],
        )?;
        let errors_total = IntCounter::with_opts(Opts::new(
            "errors_total",
            "Executions that failed inside the application",
        ))?;
        let blocked_total = IntCounter::with_opts(Opts::new(
            "blocked_total",
            "Requests refused because their source is blocked",
        ))?;
        let interrupts_total = IntCounter::with_opts(Opts::new(
            "interrupts_total",
            "Forced interrupts issued by the watchdog",
        ))?;

        let queue_length = IntGauge::with_opts(Opts::new("queue_length", "Pending jobs"))?;
        let active_executions =
            IntGauge::with_opts(Opts::new("active_executions", "Jobs currently executing"))?;
        let stuck_workers =
            IntGauge::with_opts(Opts::new("stuck_workers", "Workers flagged by the watchdog"))?;
        let parked_jobs = IntGauge::with_opts(Opts::new(
            "parked_jobs",
            "Requests suspended awaiting a notification",
        ))?;

        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new("execution_seconds", "Wall time spent executing jobs")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(resolutions_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(blocked_total.clone()))?;
        registry.register(Box::new(interrupts_total.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(active_executions.clone()))?;
        registry.register(Box::new(stuck_workers.clone()))?;
        registry.register(Box::new(parked_jobs.clone()))?;
        registry.register(Box::new(execution_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            resolutions_total,
            errors_total,
            blocked_total,
            interrupts_total,
            queue_length,
            active_executions,
            stuck_workers,
            parked_jobs,
            execution_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolution_count(&self, resolution: &str) -> u64 {
        self.resolutions_total
            .with_label_values(&[resolution])
            .get()
    }

    /// Encode all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = GatewayMetrics::new("gilgate").unwrap();
        let b = GatewayMetrics::new("gilgate").unwrap();
        a.requests_total.inc();
        assert_eq!(a.requests_total.get(), 1);
        assert_eq!(b.requests_total.get(), 0);
    }

    #[test]
    fn test_encode_includes_namespace() {
        let metrics = GatewayMetrics::new("gilgate").unwrap();
        metrics.resolutions_total.with_label_values(&["evicted"]).inc();
        metrics.queue_length.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("gilgate_resolutions_total{resolution=\"evicted\"} 1"));
        assert!(text.contains("gilgate_queue_length 3"));
        assert_eq!(metrics.resolution_count("evicted"), 1);
    }
}
