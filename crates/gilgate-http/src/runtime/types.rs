//! Admin API request and response bodies

use serde::{Deserialize, Serialize};

/// Body of `POST /notify`
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    /// Comma-separated correlation keys
    pub keys: String,
    /// `retry`, `disconnect`, `http-204` or `http-504`
    pub action: String,
    /// Payload handed to resumed requests in `X-Gilgate-Park-Arg`
    #[serde(default)]
    pub arg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    /// Parked requests that received the notification
    pub delivered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResponse {
    pub id: String,
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy`, `degraded` (some workers stuck) or `unhealthy` (all stuck)
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub workers: usize,
    pub stuck_workers: usize,
    pub queue_length: usize,
    pub active_executions: usize,
    pub parked_requests: i64,
}

/// Error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
