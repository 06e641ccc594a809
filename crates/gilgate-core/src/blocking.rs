//! Temporary blocking of misbehaving client addresses.
//!
//! Application code blocks its caller's address by returning a block header.
//! Requests from a blocked address are delayed (to slow down aggressive
//! clients) and then refused with 429. Only a bounded number of requests are
//! delayed at once; the rest are refused immediately.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::priority::is_internal;

/// Longest a refused request is held before the 429 is sent
pub const MAX_BLOCK_DELAY: Duration = Duration::from_secs(25);

/// Interval between sweeps of expired blocks
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    until: Instant,
    refused: u64,
}

#[derive(Debug)]
pub struct BlockList {
    entries: Mutex<HashMap<IpAddr, BlockEntry>>,
    wait_slots: Semaphore,
}

impl BlockList {
    pub fn new(wait_slots: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wait_slots: Semaphore::new(wait_slots),
        }
    }

    /// Block `addr` for `duration`. Loopback and private addresses are never blocked.
    pub fn block(&self, addr: IpAddr, duration: Duration) -> bool {
        if is_internal(addr) {
            return false;
        }
        info!(client = %addr, seconds = duration.as_secs(), "Blocking client");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(addr).or_insert(BlockEntry {
            until: Instant::now(),
            refused: 0,
        });
        entry.until = Instant::now() + duration;
        true
    }

    /// Time left on the block for `addr`, if any
    pub fn remaining(&self, addr: IpAddr) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&addr)
            .map(|entry| entry.until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Returns `true` if `addr` is blocked, after delaying the caller.
    ///
    /// The caller should answer 429 when this returns `true`.
    pub async fn check(&self, addr: IpAddr) -> bool {
        let remaining = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = entries.get(&addr).copied() else {
                return false;
            };
            let now = Instant::now();
            if entry.until <= now {
                expire(&mut entries, addr);
                return false;
            }
            entry.until - now
        };

        let delay = Duration::from_secs(remaining.as_secs()).min(MAX_BLOCK_DELAY);
        if let Ok(_permit) = self.wait_slots.try_acquire() {
            tokio::time::sleep(delay).await;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&addr) {
            entry.refused += 1;
        }
        true
    }

    /// Remove expired blocks. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<IpAddr> = entries
            .iter()
            .filter(|(_, entry)| entry.until <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &expired {
            expire(&mut entries, *addr);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every [`SWEEP_INTERVAL`] until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}

fn expire(entries: &mut HashMap<IpAddr, BlockEntry>, addr: IpAddr) {
    if let Some(entry) = entries.remove(&addr) {
        info!(
            client = %addr,
            refused = entry.refused,
            "Unblocked client"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public() -> IpAddr {
        "198.51.100.20".parse().unwrap()
    }

    #[test]
    fn test_internal_addresses_never_blocked() {
        let list = BlockList::new(10);
        assert!(!list.block("127.0.0.1".parse().unwrap(), Duration::from_secs(60)));
        assert!(!list.block("10.0.0.8".parse().unwrap(), Duration::from_secs(60)));
        assert!(list.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_request_is_delayed() {
        let list = BlockList::new(10);
        assert!(list.block(public(), Duration::from_secs(10)));

        let started = Instant::now();
        assert!(list.check(public()).await);
        // Delay is the whole seconds left on the block
        assert!(started.elapsed() >= Duration::from_secs(9));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let list = BlockList::new(10);
        list.block(public(), Duration::from_secs(3600));

        let started = Instant::now();
        assert!(list.check(public()).await);
        assert_eq!(started.elapsed(), MAX_BLOCK_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_slots_refuses_immediately() {
        let list = BlockList::new(0);
        list.block(public(), Duration::from_secs(3600));

        let started = Instant::now();
        assert!(list.check(public()).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_sweep() {
        let list = BlockList::new(10);
        list.block(public(), Duration::from_secs(5));
        assert!(list.remaining(public()).is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(list.remaining(public()).is_none());
        assert!(!list.check(public()).await);
        assert!(list.is_empty());

        list.block(public(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(list.sweep(), 1);
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_unblocked_address_passes() {
        let list = BlockList::new(10);
        assert!(!list.check(public()).await);
    }
}
