//! Job scheduler: admission, the exclusive grab protocol and per-source accounting.
//!
//! Producers call [`Scheduler::handle_job`] from async request handlers.
//! Worker threads call [`Scheduler::grab_job`], execute the job, and report
//! back through [`Scheduler::job_started`] / [`Scheduler::job_finished`].
//!
//! Every job reaches exactly one terminal resolution. The resolver is whoever
//! wins [`Job::try_grab`]: a worker, the producer's timeout or cancellation
//! path, or the evictor of an overflowing queue.

mod queue;

pub use queue::{Admission, AdmissionQueue, Take};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{Completion, Job, JobOutcome, JobResponse, JobTiming, Resolution};
use crate::metrics::GatewayMetrics;
use crate::priority::{PriorityCalculator, PriorityInputs, RateLimitKey};
use crate::sink::{CompletionRecord, StatsSink};
use crate::stats::{AgedCounter, PageStats};

/// Fallback poll interval bounds for idle workers, in milliseconds
const WAKE_JITTER_MS: std::ops::Range<u64> = 800..1200;

pub struct Scheduler {
    queue: AdmissionQueue,
    calculator: PriorityCalculator,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    active: AtomicUsize,
    active_by_source: Mutex<HashMap<RateLimitKey, usize>>,
    aged: AgedCounter<RateLimitKey>,
    pages: PageStats,
    metrics: GatewayMetrics,
    sink: Arc<dyn StatsSink>,
    shutdown: AtomicBool,
}

/// Accounting handle returned to the worker that won a job.
#[derive(Debug)]
pub struct ExecutionTicket {
    key: RateLimitKey,
    priority: i64,
    started: Instant,
}

impl ExecutionTicket {
    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

impl Scheduler {
    pub fn new(
        config: &GatewayConfig,
        calculator: PriorityCalculator,
        metrics: GatewayMetrics,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        let max_length = config.max_queue_length.get();
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(max_length);
        Self {
            queue: AdmissionQueue::new(max_length),
            calculator,
            wake_tx,
            wake_rx,
            active: AtomicUsize::new(0),
            active_by_source: Mutex::new(HashMap::new()),
            aged: AgedCounter::new(config.stats_capacity),
            pages: PageStats::new(config.stats_capacity),
            metrics,
            sink,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn page_stats(&self) -> &PageStats {
        &self.pages
    }

    pub fn calculator(&self) -> &PriorityCalculator {
        &self.calculator
    }

    /// Priority of `job` under current load
    pub fn score(&self, job: &Job) -> i64 {
        self.calculator.priority(job.request(), self)
    }

    /// Enqueue a job, evicting the lowest-priority job on overflow.
    pub fn submit(&self, job: Arc<Job>) {
        self.metrics.requests_total.inc();
        match self.queue.push(job, |j| self.score(j)) {
            Admission::Queued => {
                // A full channel means wake-ups are already pending
                let _ = self.wake_tx.try_send(());
            }
            Admission::Evicted(evicted) => {
                if evicted.try_grab() {
                    warn!(
                        job_id = %evicted.id(),
                        priority = evicted.priority(),
                        queue_length = self.queue.max_length(),
                        "Queue full, dropping lowest priority request"
                    );
                    evicted.resolve_synthetic(JobResponse::gateway_timeout(), Resolution::Evicted);
                }
            }
        }
        self.metrics.queue_length.set(self.queue.len() as i64);
    }

    /// Submit a job and wait for its outcome, the producer's cancellation, or `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShuttingDown`] without queueing the job once
    /// [`Scheduler::shutdown`] has run, since no worker would ever take it.
    ///
    /// Returns [`SchedulerError::Cancelled`] when `cancel` fires first. If a worker
    /// already owns the job, the real result is still awaited and recorded before
    /// returning.
    pub async fn handle_job(
        &self,
        job: Arc<Job>,
        completion: Completion,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SchedulerResult<JobOutcome> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut rx = completion.0;
        self.submit(Arc::clone(&job));

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            result = &mut rx => {
                let outcome = result.map_err(|_| SchedulerError::Abandoned { job_id: job.id() })?;
                Ok(self.report(&job, outcome))
            }
            _ = cancel.cancelled() => {
                if job.try_grab() {
                    self.withdraw(&job);
                    job.resolve_synthetic(JobResponse::new(http::StatusCode::NO_CONTENT), Resolution::Cancelled);
                    self.metrics
                        .resolutions_total
                        .with_label_values(&[Resolution::Cancelled.as_str()])
                        .inc();
                    debug!(job_id = %job.id(), "Request cancelled before execution");
                    return Err(SchedulerError::Cancelled { job_id: job.id() });
                }
                // A worker owns it: keep statistics consistent, then discard
                if let Ok(outcome) = rx.await {
                    self.report(&job, outcome);
                }
                Err(SchedulerError::Cancelled { job_id: job.id() })
            }
            _ = &mut sleep => {
                if job.try_grab() {
                    self.withdraw(&job);
                    warn!(
                        job_id = %job.id(),
                        path = %job.request().logical_key(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out waiting for a worker"
                    );
                    job.resolve_synthetic(JobResponse::gateway_timeout(), Resolution::TimedOut);
                }
                let outcome = rx
                    .await
                    .map_err(|_| SchedulerError::Abandoned { job_id: job.id() })?;
                Ok(self.report(&job, outcome))
            }
        }
    }

    fn withdraw(&self, job: &Job) {
        self.queue.remove(job.id());
        self.metrics.queue_length.set(self.queue.len() as i64);
    }

    fn report(&self, job: &Job, outcome: JobOutcome) -> JobOutcome {
        self.metrics
            .resolutions_total
            .with_label_values(&[outcome.resolution.as_str()])
            .inc();
        self.sink.record(CompletionRecord::new(job, &outcome));
        outcome
    }

    /// Block until a job is owned by the calling worker, or return `None` on shutdown.
    pub fn grab_job(&self) -> Option<Arc<Job>> {
        loop {
            if self.is_shutting_down() {
                return None;
            }
            let taken = self.queue.take_highest(
                |j| self.score(j),
                |priority| self.calculator.is_deferred(priority, self.active_count()),
            );
            self.metrics.queue_length.set(self.queue.len() as i64);
            match taken {
                Take::Job(job) => {
                    if job.try_grab() {
                        return Some(job);
                    }
                    // The producer resolved it first
                    continue;
                }
                Take::Deferred | Take::Empty => self.wait_for_work(),
            }
        }
    }

    fn wait_for_work(&self) {
        let wait = Duration::from_millis(rand::rng().random_range(WAKE_JITTER_MS));
        match self.wake_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            // Sender lives in self; unreachable while the scheduler exists
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
        }
    }

    /// Account for a job the calling worker is about to execute.
    pub fn job_started(&self, job: &Job) -> ExecutionTicket {
        let key = self.calculator.rate_limit_key(job.request().client);
        self.active.fetch_add(1, Ordering::AcqRel);
        {
            let mut by_source = self
                .active_by_source
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *by_source.entry(key).or_insert(0) += 1;
        }
        self.aged.touch(key);
        self.metrics.active_executions.inc();
        ExecutionTicket {
            key,
            priority: job.priority(),
            started: Instant::now(),
        }
    }

    /// Release accounting, record statistics and deliver the worker's result.
    pub fn job_finished(
        &self,
        job: &Job,
        ticket: ExecutionTicket,
        response: JobResponse,
        cpu_elapsed: Duration,
        worker: usize,
    ) {
        let elapsed = ticket.started.elapsed();
        self.pages
            .record(&job.request().logical_key(), elapsed, cpu_elapsed);
        self.metrics.execution_seconds.observe(elapsed.as_secs_f64());

        {
            let mut by_source = self
                .active_by_source
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(count) = by_source.get_mut(&ticket.key) {
                *count -= 1;
                if *count == 0 {
                    by_source.remove(&ticket.key);
                }
            }
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.metrics.active_executions.dec();

        job.resolve(JobOutcome {
            response,
            resolution: Resolution::Completed,
            timing: JobTiming {
                finish: Utc::now(),
                elapsed,
                cpu_elapsed,
                worker: Some(worker),
                priority: ticket.priority,
            },
        });
    }

    /// Stop handing out jobs and wake every idle worker.
    pub fn shutdown(&self, workers: usize) {
        self.shutdown.store(true, Ordering::Release);
        for _ in 0..workers {
            let _ = self.wake_tx.try_send(());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl PriorityInputs for Scheduler {
    fn page_cpu_time(&self, logical_key: &str) -> Option<u64> {
        self.pages.weighted_cpu_time(logical_key)
    }

    fn active_executions(&self, key: &RateLimitKey) -> usize {
        self.active_by_source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn aged_rate(&self, key: &RateLimitKey) -> f64 {
        self.aged.rate(key)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue_len", &self.queue.len())
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfigBuilder;
    use crate::job::test_support::job;
    use crate::sink::NullSink;
    use http::StatusCode;

    fn scheduler(max_queue: usize) -> Arc<Scheduler> {
        let config = GatewayConfigBuilder::new()
            .max_queue_length(max_queue)
            .build()
            .unwrap();
        Arc::new(Scheduler::new(
            &config,
            PriorityCalculator::default(),
            GatewayMetrics::new("test").unwrap(),
            Arc::new(NullSink),
        ))
    }

    #[tokio::test]
    async fn test_timeout_without_worker() {
        let scheduler = scheduler(4);
        let (job, completion) = job("/");
        let cancel = CancellationToken::new();

        let outcome = scheduler
            .handle_job(job.clone(), completion, Duration::from_millis(20), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(outcome.resolution, Resolution::TimedOut);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.metrics().resolution_count("timed_out"), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_grab_drops_silently() {
        let scheduler = scheduler(4);
        let (job, completion) = job("/");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scheduler
            .handle_job(job.clone(), completion, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(SchedulerError::Cancelled { .. })));
        assert_eq!(job.resolution(), Some(Resolution::Cancelled));
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_overflow_resolves_evicted_job() {
        let scheduler = scheduler(1);
        let (first, first_done) = job("/a");
        let (second, _second_done) = job("/b?x=1");

        scheduler.submit(first.clone());
        // The query string makes the second job lower priority
        scheduler.submit(second.clone());

        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(second.resolution(), Some(Resolution::Evicted));
        assert!(first.resolution().is_none());
        drop(first_done);
    }

    #[test]
    fn test_worker_round_trip() {
        let scheduler = scheduler(4);
        let (queued, completion) = job("/work");
        scheduler.submit(queued.clone());

        let grabbed = scheduler.grab_job().unwrap();
        assert_eq!(grabbed.id(), queued.id());
        assert!(!grabbed.try_grab());

        let ticket = scheduler.job_started(&grabbed);
        assert_eq!(scheduler.active_count(), 1);
        let key = scheduler.calculator().rate_limit_key(grabbed.request().client);
        assert_eq!(scheduler.active_executions(&key), 1);
        assert!(scheduler.aged_rate(&key) > 0.0);

        scheduler.job_finished(
            &grabbed,
            ticket,
            JobResponse::with_body(StatusCode::OK, "done"),
            Duration::from_millis(3),
            0,
        );
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.active_executions(&key), 0);
        assert_eq!(scheduler.page_stats().weighted_cpu_time("/work"), Some(3));

        let outcome = completion.0.blocking_recv().unwrap();
        assert_eq!(outcome.resolution, Resolution::Completed);
        assert_eq!(outcome.timing.worker, Some(0));
    }

    #[test]
    fn test_low_priority_deferred_while_busy() {
        let scheduler = scheduler(4);

        let (busy, _busy_done) = job("/busy");
        scheduler.submit(busy);
        let running = scheduler.grab_job().unwrap();
        let ticket = scheduler.job_started(&running);

        let mut request = crate::job::test_support::request("/");
        request
            .headers
            .insert(http::header::USER_AGENT, "crawler".parse().unwrap());
        let (bot, _bot_done) = Job::new(request, crate::job::RequestBody::empty());
        scheduler.submit(bot.clone());

        let taken = scheduler
            .queue
            .take_highest(|j| scheduler.score(j), |p| {
                scheduler.calculator().is_deferred(p, scheduler.active_count())
            });
        assert!(matches!(taken, Take::Deferred));

        scheduler.job_finished(&running, ticket, JobResponse::no_content(), Duration::ZERO, 0);
        let grabbed = scheduler.grab_job().unwrap();
        assert_eq!(grabbed.id(), bot.id());
    }

    #[test]
    fn test_shutdown_releases_workers() {
        let scheduler = scheduler(4);
        scheduler.shutdown(1);
        assert!(scheduler.grab_job().is_none());
    }

    #[tokio::test]
    async fn test_submission_refused_after_shutdown() {
        let scheduler = scheduler(4);
        scheduler.shutdown(1);

        let (job, completion) = job("/late");
        let result = scheduler
            .handle_job(job.clone(), completion, Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SchedulerError::ShuttingDown)));
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.metrics().requests_total.get(), 0);
        assert!(job.resolution().is_none());
    }
}
