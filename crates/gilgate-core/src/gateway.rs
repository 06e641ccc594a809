//! The gateway: request admission, execution and suspension handling.
//!
//! [`Gateway::serve`] takes one inbound request through the whole pipeline:
//! block check, scheduling, blocking updates from the response, and the
//! park or retry state machines when the application asks for them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::HeaderValue;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blocking::BlockList;
use crate::config::GatewayConfig;
use crate::engine::{BackgroundSender, BackgroundTask, Engine};
use crate::error::{EngineError, SchedulerError};
use crate::headers;
use crate::job::{Job, JobResponse, RequestBody, RequestInfo, Resolution};
use crate::metrics::GatewayMetrics;
use crate::priority::{PriorityCalculator, RateLimitIdentity, SubnetIdentity};
use crate::scheduler::Scheduler;
use crate::sink::{StatsSink, TracingSink};
use crate::suspend::{
    CorrelationKeys, ParkAction, ParkNotification, ParkPolicy, ParkTable, RetryOutcome, RetryTable,
};
use crate::watchdog::{FatalHandler, Watchdog, WorkerBoard, exit_process};
use crate::worker::WorkerPool;

/// What the transport should do with a finished request
#[derive(Debug)]
pub enum GatewayReply {
    Response(JobResponse),
    /// Close the connection without a meaningful response
    Disconnect,
}

impl GatewayReply {
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::Response(response) => Some(response.status),
            Self::Disconnect => None,
        }
    }
}

/// Optional collaborators for [`Gateway::start`]
pub struct GatewayOptions {
    pub identity: Arc<dyn RateLimitIdentity>,
    /// Defaults to a [`TracingSink`]
    pub sink: Option<Arc<dyn StatsSink>>,
    pub fatal: FatalHandler,
    pub metrics_namespace: String,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            identity: Arc::new(SubnetIdentity),
            sink: None,
            fatal: exit_process(),
            metrics_namespace: "gilgate".to_string(),
        }
    }
}

/// Point-in-time view of gateway load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySnapshot {
    pub workers: usize,
    pub stuck_workers: usize,
    pub queue_length: usize,
    pub active_executions: usize,
    pub parked_requests: i64,
}

pub struct Gateway {
    config: GatewayConfig,
    scheduler: Arc<Scheduler>,
    board: Arc<WorkerBoard>,
    parks: Arc<ParkTable>,
    retries: Arc<RetryTable>,
    blocks: Arc<BlockList>,
    metrics: GatewayMetrics,
    diagnostics: Arc<dyn Fn() + Send + Sync>,
    background: BackgroundSender,
    pool: Mutex<Option<WorkerPool>>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Start the worker pool and background services on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if metrics cannot be registered or any worker cannot bind its slot.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start<E: Engine>(
        config: GatewayConfig,
        engine: Arc<E>,
        options: GatewayOptions,
    ) -> Result<Arc<Self>, EngineError> {
        let metrics = GatewayMetrics::new(&options.metrics_namespace)?;
        let sink = options
            .sink
            .unwrap_or_else(|| Arc::new(TracingSink::spawn()));
        let calculator = PriorityCalculator::new(config.priority.clone(), options.identity);
        let scheduler = Arc::new(Scheduler::new(
            &config,
            calculator,
            metrics.clone(),
            sink,
        ));

        let board = Arc::new(WorkerBoard::new(
            config.workers.get(),
            1,
            options.fatal,
            metrics.clone(),
        ));
        let dump_engine = Arc::clone(&engine);
        let diagnostics: Arc<dyn Fn() + Send + Sync> =
            Arc::new(move || dump_engine.dump_diagnostics());
        let watchdog = Watchdog::new(
            Handle::current(),
            Arc::clone(&board),
            Arc::clone(&diagnostics),
            metrics.clone(),
        );

        let pool = WorkerPool::start(engine, Arc::clone(&scheduler), watchdog, &config)?;
        let background = pool.background();

        let shutdown = CancellationToken::new();
        let blocks = Arc::new(BlockList::new(config.block_wait_slots));
        Arc::clone(&blocks).spawn_sweeper(shutdown.child_token());

        info!(
            workers = config.workers.get(),
            max_queue_length = config.max_queue_length.get(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Gateway started"
        );

        Ok(Arc::new(Self {
            parks: Arc::new(ParkTable::new(metrics.parked_jobs.clone())),
            retries: Arc::new(RetryTable::new()),
            config,
            scheduler,
            board,
            blocks,
            metrics,
            diagnostics,
            background,
            pool: Mutex::new(Some(pool)),
            shutdown,
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn blocks(&self) -> &Arc<BlockList> {
        &self.blocks
    }

    /// Handle one request end to end.
    pub async fn serve(
        &self,
        request: RequestInfo,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> GatewayReply {
        if self.blocks.check(request.client).await {
            self.metrics.blocked_total.inc();
            return GatewayReply::Response(JobResponse::too_many_requests());
        }

        self.board.check_all_stuck();

        let (job, completion) = Job::new(request, body);
        let outcome = match self
            .scheduler
            .handle_job(Arc::clone(&job), completion, self.config.request_timeout, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(SchedulerError::Cancelled { .. }) => return GatewayReply::Disconnect,
            Err(SchedulerError::ShuttingDown) => {
                return GatewayReply::Response(JobResponse::service_unavailable());
            }
            Err(e) => {
                error!(error = %e, "Request failed in scheduler");
                return GatewayReply::Response(JobResponse::bad_gateway());
            }
        };

        let mut response = outcome.response;
        if outcome.resolution != Resolution::Completed {
            return GatewayReply::Response(response);
        }
        self.apply_block(&job, &mut response);

        if let Some(keys) = response.header_str(headers::PARK.as_str()) {
            let keys = CorrelationKeys::parse(keys);
            if !keys.is_empty() {
                let policy = ParkPolicy::from_header(
                    response.header_str(headers::PARK_TIMEOUT.as_str()),
                    self.config.park_default_timeout,
                );
                return self.park(&job, keys, policy, cancel).await;
            }
        }

        if let Some(id) = response.header_str(headers::RETRY.as_str()) {
            let id = id.trim().to_string();
            if !id.is_empty() {
                return self.retry(&job, id, cancel).await;
            }
        }

        strip_control_headers(&mut response);
        GatewayReply::Response(response)
    }

    async fn park(
        &self,
        job: &Job,
        keys: CorrelationKeys,
        policy: ParkPolicy,
        cancel: &CancellationToken,
    ) -> GatewayReply {
        info!(
            job_id = %job.id(),
            keys = %keys,
            timeout_secs = policy.timeout.as_secs(),
            on_timeout = %policy.on_timeout,
            "Parking request"
        );

        let notification = {
            let mut registration = self.parks.register(keys);
            registration.wait(&policy, cancel).await
        };
        debug!(job_id = %job.id(), action = %notification.action, "Parked request woke");

        match notification.action {
            ParkAction::Retry => {
                let value = HeaderValue::from_str(&notification.arg).unwrap_or_else(|_| {
                    warn!(job_id = %job.id(), "Park argument is not a valid header value");
                    HeaderValue::from_static("")
                });
                self.resume(job, headers::PARK_ARG, value, cancel).await
            }
            ParkAction::Disconnect => GatewayReply::Disconnect,
            ParkAction::NoContent => GatewayReply::Response(JobResponse::no_content()),
            ParkAction::GatewayTimeout => GatewayReply::Response(JobResponse::gateway_timeout()),
        }
    }

    async fn retry(&self, job: &Job, id: String, cancel: &CancellationToken) -> GatewayReply {
        info!(job_id = %job.id(), retry_id = %id, "Waiting for retry");
        let outcome = {
            let wait = self.retries.register(id.clone());
            wait.wait(cancel).await
        };

        match outcome {
            RetryOutcome::Resume => match HeaderValue::from_str(&id) {
                Ok(value) => self.resume(job, headers::RETRY, value, cancel).await,
                Err(_) => GatewayReply::Response(JobResponse::bad_gateway()),
            },
            RetryOutcome::Failed => {
                debug!(job_id = %job.id(), retry_id = %id, "Retry failed");
                GatewayReply::Response(JobResponse::bad_gateway())
            }
        }
    }

    /// Resubmit a suspended request with a tag header. The resumed response is
    /// returned as is; it is not examined for further suspension.
    async fn resume(
        &self,
        job: &Job,
        tag: http::HeaderName,
        value: HeaderValue,
        cancel: &CancellationToken,
    ) -> GatewayReply {
        let mut body = job.take_body();
        if body.rewind().is_err() {
            warn!(
                job_id = %job.id(),
                "Request body was not fully buffered, cannot resubmit"
            );
            return GatewayReply::Response(JobResponse::bad_gateway());
        }

        let request = job.request().with_header(tag, value);
        let (resumed, completion) = Job::new(request, body);
        let outcome = match self
            .scheduler
            .handle_job(
                Arc::clone(&resumed),
                completion,
                self.config.resume_timeout(),
                cancel,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(SchedulerError::Cancelled { .. }) => return GatewayReply::Disconnect,
            Err(SchedulerError::ShuttingDown) => {
                return GatewayReply::Response(JobResponse::service_unavailable());
            }
            Err(e) => {
                error!(error = %e, "Resumed request failed in scheduler");
                return GatewayReply::Response(JobResponse::bad_gateway());
            }
        };

        let mut response = outcome.response;
        if outcome.resolution == Resolution::Completed {
            self.apply_block(&resumed, &mut response);
        }
        strip_control_headers(&mut response);
        GatewayReply::Response(response)
    }

    fn apply_block(&self, job: &Job, response: &mut JobResponse) {
        let Some(value) = response.headers.remove(headers::BLOCK) else {
            return;
        };
        match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(seconds) => {
                self.blocks
                    .block(job.request().client, Duration::from_secs(seconds));
            }
            None => warn!(job_id = %job.id(), "Ignoring malformed block header"),
        }
    }

    /// Wake requests parked under any of the comma-separated `keys`.
    pub fn notify_parked(&self, keys: &str, action: ParkAction, arg: impl Into<String>) -> usize {
        let keys = CorrelationKeys::parse(keys);
        let delivered = self
            .parks
            .notify(&keys, &ParkNotification::new(action, arg));
        debug!(keys = %keys, action = %action, delivered, "Park notification");
        delivered
    }

    /// Wake the retry pending under `id`.
    pub fn notify_retry(&self, id: &str) -> bool {
        self.retries.notify(id)
    }

    pub fn submit_background(&self, task: BackgroundTask) -> bool {
        self.background.submit(task)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            workers: self.config.workers.get(),
            stuck_workers: self.board.stuck_count(),
            queue_length: self.scheduler.queue_len(),
            active_executions: self.scheduler.active_count(),
            parked_requests: self.metrics.parked_jobs.get(),
        }
    }

    pub fn dump_diagnostics(&self) {
        (self.diagnostics)();
    }

    /// Log request counters and worker states.
    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        let metrics = &self.metrics;
        info!(
            requests = metrics.requests_total.get(),
            completed = metrics.resolution_count(Resolution::Completed.as_str()),
            timeouts = metrics.resolution_count(Resolution::TimedOut.as_str()),
            drops = metrics.resolution_count(Resolution::Evicted.as_str()),
            cancellations = metrics.resolution_count(Resolution::Cancelled.as_str()),
            errors = metrics.errors_total.get(),
            blocked = metrics.blocked_total.get(),
            queue_length = snapshot.queue_length,
            active = snapshot.active_executions,
            parked = snapshot.parked_requests,
            "Gateway statistics"
        );
        for worker in 0..self.board.len() {
            info!(worker, stuck = self.board.is_stuck(worker), "Worker state");
        }
    }

    /// Stop background services and wait for worker threads to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.stop();
            if tokio::task::spawn_blocking(move || pool.join()).await.is_err() {
                error!("Worker pool shutdown task failed");
            }
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

fn strip_control_headers(response: &mut JobResponse) {
    for name in headers::CONTROL {
        response.headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_control_headers() {
        let mut response = JobResponse::no_content();
        response
            .headers
            .insert(headers::PARK, HeaderValue::from_static("a"));
        response
            .headers
            .insert(headers::BLOCK, HeaderValue::from_static("10"));
        response
            .headers
            .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_control_headers(&mut response);
        assert_eq!(response.headers.len(), 1);
        assert!(response.headers.contains_key(http::header::CONTENT_TYPE));
    }

    #[test]
    fn test_reply_status() {
        let reply = GatewayReply::Response(JobResponse::gateway_timeout());
        assert_eq!(reply.status(), Some(http::StatusCode::GATEWAY_TIMEOUT));
        assert_eq!(GatewayReply::Disconnect.status(), None);
    }
}
