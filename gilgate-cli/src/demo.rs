//! Built-in demo application for smoke testing a deployment.
//!
//! Routes:
//! - `/park/{key}?timeout=N` parks under `key`; a notification resumes it
//! - `/retry/{id}` waits for `POST /retry/{id}` on the admin API
//! - `/slow?ms=N` burns wall time, stopping early if interrupted
//! - `/block?secs=N` blocks the caller for `N` seconds
//! - `/background/{name}` queues a background task with the request body
//! - anything else echoes the request line

use std::time::{Duration, Instant};

use gilgate_core::headers;
use gilgate_core::{Application, BackgroundTask, ExecutionContext, InterruptFlag, JobResponse};
use http::{HeaderValue, StatusCode};
use tracing::{info, warn};

/// Step between interrupt checks in long-running routes
const POLL_STEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Park { key: String, timeout_secs: Option<u64> },
    Retry { id: String },
    Slow { duration: Duration },
    Block { secs: u64 },
    Background { name: String },
    Echo,
}

impl Route {
    pub fn parse(path: &str, query: Option<&str>) -> Self {
        let mut segments = path.trim_matches('/').splitn(2, '/');
        let head = segments.next().unwrap_or("");
        let tail = segments.next().filter(|s| !s.is_empty());

        match (head, tail) {
            ("park", Some(key)) => Self::Park {
                key: key.to_string(),
                timeout_secs: query_param(query, "timeout"),
            },
            ("retry", Some(id)) => Self::Retry { id: id.to_string() },
            ("slow", None) => Self::Slow {
                duration: Duration::from_millis(query_param(query, "ms").unwrap_or(1000)),
            },
            ("block", None) => Self::Block {
                secs: query_param(query, "secs").unwrap_or(60),
            },
            ("background", Some(name)) => Self::Background {
                name: name.to_string(),
            },
            _ => Self::Echo,
        }
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<u64> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse().ok())
}

fn with_header(mut response: JobResponse, name: http::HeaderName, value: &str) -> JobResponse {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response.headers.insert(name, value);
            response
        }
        Err(_) => JobResponse::with_body(StatusCode::BAD_REQUEST, "invalid header value"),
    }
}

/// Sleep for `duration` unless interrupted. Returns `false` if interrupted.
fn busy_wait(duration: Duration, interrupted: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if interrupted() {
            return false;
        }
        std::thread::sleep(POLL_STEP.min(deadline.saturating_duration_since(Instant::now())));
    }
    true
}

#[derive(Debug, Default)]
pub struct DemoApp;

impl Application for DemoApp {
    fn call(&self, ctx: &mut ExecutionContext<'_>) -> JobResponse {
        let request = ctx.request;
        match Route::parse(request.uri.path(), request.uri.query()) {
            Route::Park { key, timeout_secs } => {
                if let Some(arg) = request.headers.get(headers::PARK_ARG) {
                    let arg = String::from_utf8_lossy(arg.as_bytes());
                    return JobResponse::with_body(StatusCode::OK, format!("resumed {key}: {arg}\n"));
                }
                let response = with_header(JobResponse::new(StatusCode::OK), headers::PARK, &key);
                match timeout_secs {
                    Some(secs) => with_header(
                        response,
                        headers::PARK_TIMEOUT,
                        &format!("{secs} http-204"),
                    ),
                    None => response,
                }
            }
            Route::Retry { id } => {
                if request.headers.contains_key(headers::RETRY) {
                    let body = ctx.body.read_all().unwrap_or_default();
                    return JobResponse::with_body(
                        StatusCode::OK,
                        format!("retried {id} with {} body bytes\n", body.len()),
                    );
                }
                with_header(JobResponse::new(StatusCode::OK), headers::RETRY, &id)
            }
            Route::Slow { duration } => {
                if busy_wait(duration, || ctx.is_interrupted()) {
                    JobResponse::with_body(StatusCode::OK, "done\n")
                } else {
                    JobResponse::with_body(StatusCode::SERVICE_UNAVAILABLE, "interrupted\n")
                }
            }
            Route::Block { secs } => with_header(
                JobResponse::with_body(StatusCode::OK, format!("blocked for {secs}s\n")),
                headers::BLOCK,
                &secs.to_string(),
            ),
            Route::Background { name } => {
                let payload = ctx.body.read_all().unwrap_or_default();
                if ctx.spawn_background(BackgroundTask::new(name, payload)) {
                    JobResponse::with_body(StatusCode::ACCEPTED, "queued\n")
                } else {
                    JobResponse::with_body(StatusCode::SERVICE_UNAVAILABLE, "background worker stopped\n")
                }
            }
            Route::Echo => JobResponse::with_body(
                StatusCode::OK,
                format!(
                    "{} {} from {} on worker {}\n",
                    request.method, request.uri, request.client, ctx.worker
                ),
            ),
        }
    }

    fn run_background(&self, task: &BackgroundTask, interrupt: &InterruptFlag) {
        info!(task = %task.name, payload_bytes = task.payload.len(), "Running background task");
        if !busy_wait(Duration::from_millis(500), || interrupt.is_raised()) {
            warn!(task = %task.name, "Background task interrupted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse() {
        assert_eq!(
            Route::parse("/park/order-1", Some("timeout=30")),
            Route::Park {
                key: "order-1".to_string(),
                timeout_secs: Some(30)
            }
        );
        assert_eq!(
            Route::parse("/retry/abc", None),
            Route::Retry {
                id: "abc".to_string()
            }
        );
        assert_eq!(
            Route::parse("/slow", Some("x=1&ms=250")),
            Route::Slow {
                duration: Duration::from_millis(250)
            }
        );
        assert_eq!(Route::parse("/block", None), Route::Block { secs: 60 });
        assert_eq!(Route::parse("/park", None), Route::Echo);
        assert_eq!(Route::parse("/", None), Route::Echo);
    }

    #[test]
    fn test_query_param_ignores_malformed_pairs() {
        assert_eq!(query_param(Some("ms&ms=abc&ms=7"), "ms"), None);
        assert_eq!(query_param(Some("a=1&ms=7"), "ms"), Some(7));
        assert_eq!(query_param(None, "ms"), None);
    }

    #[test]
    fn test_busy_wait_stops_on_interrupt() {
        let started = Instant::now();
        assert!(!busy_wait(Duration::from_secs(10), || true));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(busy_wait(Duration::from_millis(30), || false));
    }
}
