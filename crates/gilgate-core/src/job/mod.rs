//! Jobs: one schedulable unit of work wrapping a request and its eventual result.
//!
//! A job is owned by the admission queue while pending. Ownership passes to
//! exactly one resolver through [`Job::try_grab`]; only that resolver may call
//! [`Job::resolve`].

mod body;

pub use body::RequestBody;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Request metadata the scheduler and the application see.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Resolved client address (after trusted proxy handling)
    pub client: IpAddr,
}

impl RequestInfo {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, client: IpAddr) -> Self {
        Self {
            method,
            uri,
            headers,
            client,
        }
    }

    /// Path and query, used to key per-page statistics.
    pub fn logical_key(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| self.uri.path().to_string())
    }

    pub fn has_query(&self) -> bool {
        self.uri.query().is_some_and(|q| !q.is_empty())
    }

    pub fn user_agent(&self) -> &str {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// A copy of this request carrying an extra header, used to tag resumptions.
    pub fn with_header(&self, name: HeaderName, value: HeaderValue) -> Self {
        let mut info = self.clone();
        info.headers.insert(name, value);
        info
    }
}

/// A complete response produced by the application or synthesized by the scheduler.
#[derive(Debug, Clone)]
pub struct JobResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl JobResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn gateway_timeout() -> Self {
        Self::with_body(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
    }

    pub fn bad_gateway() -> Self {
        Self::with_body(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    pub fn service_unavailable() -> Self {
        Self::with_body(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }

    pub fn too_many_requests() -> Self {
        Self::with_body(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// How a job reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A worker executed the job.
    Completed,
    /// The producer's wait expired before a worker took the job.
    TimedOut,
    /// The job was dropped from a full queue.
    Evicted,
    /// The producer went away before a worker took the job.
    Cancelled,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Evicted => "evicted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Timing recorded once by whoever resolves the job.
#[derive(Debug, Clone)]
pub struct JobTiming {
    pub finish: DateTime<Utc>,
    pub elapsed: Duration,
    pub cpu_elapsed: Duration,
    pub worker: Option<usize>,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub response: JobResponse,
    pub resolution: Resolution,
    pub timing: JobTiming,
}

/// Receiving side of a job's completion signal, held by its producer.
#[derive(Debug)]
pub struct Completion(pub(crate) oneshot::Receiver<JobOutcome>);

#[derive(Debug)]
pub struct Job {
    id: Uuid,
    request: RequestInfo,
    body: Mutex<RequestBody>,
    grabbed: AtomicBool,
    priority: AtomicI64,
    created: Instant,
    resolution: OnceLock<Resolution>,
    done: Mutex<Option<oneshot::Sender<JobOutcome>>>,
}

impl Job {
    pub fn new(request: RequestInfo, body: RequestBody) -> (Arc<Self>, Completion) {
        let (tx, rx) = oneshot::channel();
        let job = Arc::new(Self {
            id: Uuid::new_v4(),
            request,
            body: Mutex::new(body),
            grabbed: AtomicBool::new(false),
            priority: AtomicI64::new(0),
            created: Instant::now(),
            resolution: OnceLock::new(),
            done: Mutex::new(Some(tx)),
        });
        (job, Completion(rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Exclusive access to the body. Only the job's current owner reads it.
    pub fn body(&self) -> MutexGuard<'_, RequestBody> {
        self.body.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the body out, leaving an empty one behind.
    pub fn take_body(&self) -> RequestBody {
        std::mem::replace(&mut *self.body(), RequestBody::empty())
    }

    /// Atomically claim the right to resolve this job.
    ///
    /// Returns `true` for exactly one caller over the job's lifetime.
    pub fn try_grab(&self) -> bool {
        !self.grabbed.swap(true, Ordering::AcqRel)
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed.load(Ordering::Acquire)
    }

    /// Last priority computed for this job.
    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution.get().copied()
    }

    /// Deliver the terminal outcome. Must only be called by the grab winner.
    ///
    /// Returns `false` if the job was already resolved.
    pub fn resolve(&self, outcome: JobOutcome) -> bool {
        if self.resolution.set(outcome.resolution).is_err() {
            tracing::error!(
                job_id = %self.id,
                resolution = outcome.resolution.as_str(),
                "Job resolved more than once"
            );
            return false;
        }
        let sender = self
            .done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            // The producer may already be gone
            let _ = sender.send(outcome);
        }
        true
    }

    /// Resolve with a response the scheduler synthesized itself.
    pub(crate) fn resolve_synthetic(&self, response: JobResponse, resolution: Resolution) -> bool {
        let outcome = JobOutcome {
            response,
            resolution,
            timing: JobTiming {
                finish: Utc::now(),
                elapsed: self.created.elapsed(),
                cpu_elapsed: Duration::ZERO,
                worker: None,
                priority: self.priority(),
            },
        };
        self.resolve(outcome)
    }
}
