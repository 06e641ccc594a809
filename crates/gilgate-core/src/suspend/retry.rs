//! Internal retries: a request waits under an id until told to run again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Outcome of waiting on a retry registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Notified: resubmit the request
    Resume,
    /// Superseded by a newer retry under the same id, or cancelled
    Failed,
}

#[derive(Debug, Default)]
struct RetryEntry {
    failed: AtomicBool,
    notified: Notify,
}

#[derive(Debug, Default)]
pub struct RetryTable {
    entries: Mutex<HashMap<String, Arc<RetryEntry>>>,
}

impl RetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending retry under `id`, failing any older one with the same id.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> RetryWait {
        let id = id.into();
        let entry = Arc::new(RetryEntry::default());
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = entries.insert(id.clone(), Arc::clone(&entry)) {
                previous.failed.store(true, Ordering::Release);
                previous.notified.notify_one();
            }
        }
        RetryWait {
            table: Arc::clone(self),
            id,
            entry,
        }
    }

    /// Wake the retry pending under `id`. Returns `false` if none is pending.
    pub fn notify(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(id) {
            Some(entry) => {
                entry.notified.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A pending retry. Removed from its table when dropped.
#[derive(Debug)]
pub struct RetryWait {
    table: Arc<RetryTable>,
    id: String,
    entry: Arc<RetryEntry>,
}

impl RetryWait {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for a notification or cancellation. There is no timeout.
    pub async fn wait(&self, cancel: &CancellationToken) -> RetryOutcome {
        tokio::select! {
            _ = self.entry.notified.notified() => {
                if self.entry.failed.load(Ordering::Acquire) {
                    RetryOutcome::Failed
                } else {
                    RetryOutcome::Resume
                }
            }
            _ = cancel.cancelled() => {
                self.entry.failed.store(true, Ordering::Release);
                RetryOutcome::Failed
            }
        }
    }
}

impl Drop for RetryWait {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock().unwrap_or_else(|e| e.into_inner());
        let is_current = entries
            .get(&self.id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.entry));
        if is_current {
            entries.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_resumes() {
        let table = Arc::new(RetryTable::new());
        let wait = table.register("checkout-42");
        assert!(table.notify("checkout-42"));

        let cancel = CancellationToken::new();
        assert_eq!(wait.wait(&cancel).await, RetryOutcome::Resume);
        drop(wait);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_newer_retry_fails_older() {
        let table = Arc::new(RetryTable::new());
        let older = table.register("job");
        let newer = table.register("job");

        let cancel = CancellationToken::new();
        assert_eq!(older.wait(&cancel).await, RetryOutcome::Failed);

        // Dropping the superseded wait must not remove the newer entry
        drop(older);
        assert_eq!(table.pending(), 1);
        assert!(table.notify("job"));
        assert_eq!(newer.wait(&cancel).await, RetryOutcome::Resume);
    }

    #[tokio::test]
    async fn test_cancel_fails() {
        let table = Arc::new(RetryTable::new());
        let wait = table.register("job");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(wait.wait(&cancel).await, RetryOutcome::Failed);
    }

    #[test]
    fn test_wait_pending_until_notified() {
        let table = Arc::new(RetryTable::new());
        let wait = table.register("job");
        let cancel = CancellationToken::new();

        let mut waiting = tokio_test::task::spawn(wait.wait(&cancel));
        tokio_test::assert_pending!(waiting.poll());

        assert!(table.notify("job"));
        assert!(waiting.is_woken());
        tokio_test::assert_ready_eq!(waiting.poll(), RetryOutcome::Resume);
    }

    #[test]
    fn test_notify_unknown_id() {
        let table = RetryTable::new();
        assert!(!table.notify("missing"));
    }
}
