//! Completion statistics reporting.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::job::{Job, JobOutcome, Resolution};

/// One terminal result, reported after every real or synthetic completion.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub job_id: Uuid,
    pub method: String,
    pub logical_key: String,
    pub client: IpAddr,
    pub status: u16,
    pub resolution: Resolution,
    pub priority: i64,
    pub elapsed: Duration,
    pub cpu_elapsed: Duration,
    pub worker: Option<usize>,
    pub finish: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn new(job: &Job, outcome: &JobOutcome) -> Self {
        let request = job.request();
        Self {
            job_id: job.id(),
            method: request.method.to_string(),
            logical_key: request.logical_key(),
            client: request.client,
            status: outcome.response.status.as_u16(),
            resolution: outcome.resolution,
            priority: outcome.timing.priority,
            elapsed: outcome.timing.elapsed,
            cpu_elapsed: outcome.timing.cpu_elapsed,
            worker: outcome.timing.worker,
            finish: outcome.timing.finish,
        }
    }
}

/// Receives completion records. Implementations must not block.
pub trait StatsSink: Send + Sync {
    fn record(&self, record: CompletionRecord);
}

/// Writes completion records as structured `tracing` events on a background task.
#[derive(Debug, Clone)]
pub struct TracingSink {
    tx: mpsc::UnboundedSender<CompletionRecord>,
}

impl TracingSink {
    /// Spawn the writer task on the current tokio runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CompletionRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                tracing::info!(
                    target: "gilgate::access",
                    job_id = %record.job_id,
                    method = %record.method,
                    path = %record.logical_key,
                    client = %record.client,
                    status = record.status,
                    resolution = record.resolution.as_str(),
                    priority = record.priority,
                    elapsed_ms = record.elapsed.as_millis() as u64,
                    cpu_ms = record.cpu_elapsed.as_millis() as u64,
                    worker = record.worker,
                    finish = %record.finish.to_rfc3339(),
                    "request completed"
                );
            }
        });
        Self { tx }
    }
}

impl StatsSink for TracingSink {
    fn record(&self, record: CompletionRecord) {
        // Writer task gone means the runtime is shutting down
        let _ = self.tx.send(record);
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn record(&self, _record: CompletionRecord) {}
}
