//! Adaptive job priority.
//!
//! Priorities are recomputed on every scheduling decision from the request
//! itself and the scheduler's live counters; they are never cached between
//! queue scans.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use crate::job::RequestInfo;

/// User-agent fragments identifying automated clients (matched case-insensitively).
pub const BOT_PATTERNS: [&str; 7] = [
    "facebook", "bot", "crawler", "spider", "index", "http:", "https:",
];

/// Tunable priority constants
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityWeights {
    pub base: i64,
    pub bot_penalty: i64,
    pub query_penalty: i64,
    /// Applied per millisecond of filtered per-page CPU time
    pub cpu_time_factor: i64,
    /// Applied per job currently executing for the same source
    pub active_penalty: i64,
    /// Applied per unit of the source's aged request rate
    pub rate_penalty: i64,
    /// At or below this, a job is not grabbed while any job executes
    pub low_priority_threshold: i64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            base: 1000,
            bot_penalty: 8000,
            query_penalty: 500,
            cpu_time_factor: 10,
            active_penalty: 2000,
            rate_penalty: 1000,
            low_priority_threshold: -7000,
        }
    }
}

/// Key used for per-source accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(pub IpAddr);

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps a client address to its rate-limit key.
pub trait RateLimitIdentity: Send + Sync {
    fn key(&self, addr: IpAddr) -> RateLimitKey;
}

/// Exact address for IPv4, containing /64 network for IPv6.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubnetIdentity;

impl RateLimitIdentity for SubnetIdentity {
    fn key(&self, addr: IpAddr) -> RateLimitKey {
        match addr.to_canonical() {
            IpAddr::V4(v4) => RateLimitKey(IpAddr::V4(v4)),
            IpAddr::V6(v6) => {
                let masked = u128::from(v6) & (u128::MAX << 64);
                RateLimitKey(IpAddr::V6(Ipv6Addr::from(masked)))
            }
        }
    }
}

/// Loopback or private-range address. Such sources are exempt from
/// per-source penalties and blocking, and may forward client addresses.
pub fn is_internal(addr: IpAddr) -> bool {
    match addr.to_canonical() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local(),
    }
}

/// Resolve the client address, honouring `X-Forwarded-For` only from internal peers.
pub fn client_addr(peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
    if !is_internal(peer) {
        return peer;
    }
    forwarded_for
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

/// Live scheduler state consulted when computing a priority.
pub trait PriorityInputs {
    /// Filtered recent CPU time in milliseconds for a logical key
    fn page_cpu_time(&self, logical_key: &str) -> Option<u64>;

    /// Jobs currently executing for the source
    fn active_executions(&self, key: &RateLimitKey) -> usize;

    /// Aged request rate of the source, not modified by reading
    fn aged_rate(&self, key: &RateLimitKey) -> f64;
}

#[derive(Clone)]
pub struct PriorityCalculator {
    weights: PriorityWeights,
    identity: Arc<dyn RateLimitIdentity>,
}

impl PriorityCalculator {
    pub fn new(weights: PriorityWeights, identity: Arc<dyn RateLimitIdentity>) -> Self {
        Self { weights, identity }
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    pub fn rate_limit_key(&self, addr: IpAddr) -> RateLimitKey {
        self.identity.key(addr)
    }

    pub fn priority(&self, request: &RequestInfo, inputs: &dyn PriorityInputs) -> i64 {
        let w = &self.weights;
        let mut priority = w.base;

        let agent = request.user_agent().to_ascii_lowercase();
        if BOT_PATTERNS.iter().any(|pattern| agent.contains(pattern)) {
            priority -= w.bot_penalty;
        }

        if request.has_query() {
            priority -= w.query_penalty;
        }

        if let Some(cpu_ms) = inputs.page_cpu_time(&request.logical_key()) {
            priority -= (cpu_ms as i64).saturating_mul(w.cpu_time_factor);
        }

        if !is_internal(request.client) {
            let key = self.identity.key(request.client);
            priority -= inputs.active_executions(&key) as i64 * w.active_penalty;
            priority -= (inputs.aged_rate(&key) * w.rate_penalty as f64) as i64;
        }

        priority
    }

    /// Whether a job at `priority` must wait while `active` jobs are executing.
    pub fn is_deferred(&self, priority: i64, active: usize) -> bool {
        priority <= self.weights.low_priority_threshold && active > 0
    }
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::new(PriorityWeights::default(), Arc::new(SubnetIdentity))
    }
}

impl std::fmt::Debug for PriorityCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityCalculator")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}
