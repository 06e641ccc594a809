//! Parking: suspending a request until an out-of-band notification arrives.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What to do with a parked request once it wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkAction {
    /// Re-run the request through the scheduler
    Retry,
    /// Drop the connection without a response
    Disconnect,
    /// Answer 204 No Content
    NoContent,
    /// Answer 504 Gateway Timeout
    GatewayTimeout,
}

impl FromStr for ParkAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "disconnect" => Ok(Self::Disconnect),
            "http-204" => Ok(Self::NoContent),
            "http-504" => Ok(Self::GatewayTimeout),
            _ => Err(format!(
                "Invalid park action '{s}'. Valid values: 'retry', 'disconnect', 'http-204', 'http-504'"
            )),
        }
    }
}

impl fmt::Display for ParkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::NoContent => write!(f, "http-204"),
            Self::GatewayTimeout => write!(f, "http-504"),
        }
    }
}

/// How long to stay parked and what happens when nobody notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkPolicy {
    pub timeout: Duration,
    pub on_timeout: ParkAction,
}

impl ParkPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            on_timeout: ParkAction::NoContent,
        }
    }

    /// Parse a `<seconds> <action>` header value.
    ///
    /// Only `retry`, `http-204` and `http-504` are accepted as timeout actions
    /// and the timeout must be positive; anything else keeps the defaults.
    pub fn from_header(value: Option<&str>, default_timeout: Duration) -> Self {
        let default = Self::new(default_timeout);
        let Some(value) = value else {
            return default;
        };
        let parts: Vec<&str> = value.split_whitespace().collect();
        let [secs, action] = parts.as_slice() else {
            return default;
        };
        let action = match action.parse::<ParkAction>() {
            Ok(ParkAction::Disconnect) | Err(_) => return default,
            Ok(action) => action,
        };
        match secs.parse::<u64>() {
            Ok(secs) if secs > 0 => Self {
                timeout: Duration::from_secs(secs),
                on_timeout: action,
            },
            _ => default,
        }
    }
}

/// Set of correlation keys a request is parked under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationKeys(BTreeSet<String>);

impl CorrelationKeys {
    /// Parse a comma-separated key list, trimming blanks and dropping empty entries.
    pub fn parse(value: &str) -> Self {
        Self(
            value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for CorrelationKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.iter().collect();
        write!(f, "{}", keys.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkNotification {
    pub action: ParkAction,
    pub arg: String,
}

impl ParkNotification {
    pub fn new(action: ParkAction, arg: impl Into<String>) -> Self {
        Self {
            action,
            arg: arg.into(),
        }
    }
}

struct Parked {
    id: u64,
    tx: mpsc::Sender<ParkNotification>,
}

/// Registry of parked requests by correlation key.
pub struct ParkTable {
    entries: Mutex<HashMap<String, Vec<Parked>>>,
    next_id: AtomicU64,
    parked: IntGauge,
}

impl ParkTable {
    pub fn new(parked: IntGauge) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            parked,
        }
    }

    /// Register a waiter under every key. The registration is removed when dropped.
    pub fn register(self: &Arc<Self>, keys: CorrelationKeys) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            for key in keys.iter() {
                entries.entry(key.to_string()).or_default().push(Parked {
                    id,
                    tx: tx.clone(),
                });
            }
        }
        self.parked.inc();
        Registration {
            table: Arc::clone(self),
            keys,
            id,
            rx,
        }
    }

    /// Wake every request parked under any of `keys`. Never blocks.
    ///
    /// Returns the number of waiters that accepted the notification.
    pub fn notify(&self, keys: &CorrelationKeys, notification: &ParkNotification) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for key in keys.iter() {
            let Some(waiters) = entries.get(key) else {
                continue;
            };
            for waiter in waiters {
                if waiter.tx.try_send(notification.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Number of keys with at least one waiter
    pub fn key_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn unregister(&self, keys: &CorrelationKeys, id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys.iter() {
            if let Some(waiters) = entries.get_mut(key) {
                waiters.retain(|waiter| waiter.id != id);
                if waiters.is_empty() {
                    entries.remove(key);
                }
            }
        }
        self.parked.dec();
    }
}

/// A parked request's place in the [`ParkTable`].
pub struct Registration {
    table: Arc<ParkTable>,
    keys: CorrelationKeys,
    id: u64,
    rx: mpsc::Receiver<ParkNotification>,
}

impl Registration {
    pub fn keys(&self) -> &CorrelationKeys {
        &self.keys
    }

    /// Wait for a notification, the producer's cancellation, or the policy timeout.
    pub async fn wait(&mut self, policy: &ParkPolicy, cancel: &CancellationToken) -> ParkNotification {
        tokio::select! {
            Some(notification) = self.rx.recv() => notification,
            _ = cancel.cancelled() => ParkNotification::new(ParkAction::Disconnect, ""),
            _ = tokio::time::sleep(policy.timeout) => ParkNotification::new(policy.on_timeout, ""),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.unregister(&self.keys, self.id);
    }
}
