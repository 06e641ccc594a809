//! In-process engine running Rust application code.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    BackgroundTask, Engine, ExecutionContext, ExecutionSlot, InterruptFlag, Interrupter, SlotToken,
};
use crate::error::EngineError;
use crate::job::JobResponse;

/// Application logic hosted by [`NativeEngine`].
pub trait Application: Send + Sync + 'static {
    fn call(&self, ctx: &mut ExecutionContext<'_>) -> JobResponse;

    fn run_background(&self, task: &BackgroundTask, interrupt: &InterruptFlag) {
        let _ = interrupt;
        warn!(task = %task.name, "Background task ignored by application");
    }
}

/// Counting execution lock shared by all slots of an engine.
///
/// With a capacity of one, at most one thread runs application code at a time.
/// Permits are only ever taken from worker threads, never from inside the
/// async runtime.
#[derive(Debug)]
pub struct EngineLock {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// A held share of an [`EngineLock`]. Returned when dropped.
#[derive(Debug)]
pub struct EnginePermit(Option<OwnedSemaphorePermit>);

impl EngineLock {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Block the calling thread until a permit is free.
    pub fn acquire(&self) -> EnginePermit {
        match futures::executor::block_on(Arc::clone(&self.permits).acquire_owned()) {
            Ok(permit) => EnginePermit(Some(permit)),
            Err(e) => {
                // The semaphore is never closed
                warn!(error = %e, "Engine lock closed, running without a permit");
                EnginePermit(None)
            }
        }
    }

    pub fn held(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
struct Running {
    job: Option<Uuid>,
    label: String,
    since: Instant,
}

type RunningTable = Arc<Mutex<HashMap<usize, Running>>>;

/// Workers that currently own a slot. A worker index binds at most one slot.
type BoundSet = Arc<Mutex<HashSet<usize>>>;

pub struct NativeEngine<A> {
    app: Arc<A>,
    lock: Arc<EngineLock>,
    running: RunningTable,
    bound: BoundSet,
}

impl<A: Application> NativeEngine<A> {
    /// Engine whose slots run application code one at a time.
    pub fn new(app: A) -> Self {
        Self::with_concurrency(app, 1)
    }

    /// Engine allowing up to `concurrency` slots to run application code at once.
    pub fn with_concurrency(app: A, concurrency: usize) -> Self {
        Self {
            app: Arc::new(app),
            lock: Arc::new(EngineLock::new(concurrency)),
            running: Arc::new(Mutex::new(HashMap::new())),
            bound: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn lock(&self) -> &Arc<EngineLock> {
        &self.lock
    }
}

impl<A: Application> Engine for NativeEngine<A> {
    type Slot = NativeSlot<A>;

    fn bind(&self, worker: usize, interrupt: Arc<InterruptFlag>) -> Result<Self::Slot, EngineError> {
        let newly_bound = self
            .bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker);
        if !newly_bound {
            return Err(EngineError::BindFailed {
                worker,
                message: "a slot is already bound for this worker".to_string(),
            });
        }
        Ok(NativeSlot {
            worker,
            app: Arc::clone(&self.app),
            lock: Arc::clone(&self.lock),
            permit: None,
            running: Arc::clone(&self.running),
            bound: Arc::clone(&self.bound),
            interrupt,
        })
    }

    fn dump_diagnostics(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            executing = running.len(),
            lock_held = self.lock.held(),
            "Engine diagnostic dump"
        );
        let mut workers: Vec<_> = running.iter().collect();
        workers.sort_by_key(|(worker, _)| **worker);
        for (worker, entry) in workers {
            info!(
                worker = *worker,
                job_id = ?entry.job,
                task = %entry.label,
                running_ms = entry.since.elapsed().as_millis() as u64,
                "Slot executing"
            );
        }
    }
}

pub struct NativeSlot<A> {
    worker: usize,
    app: Arc<A>,
    lock: Arc<EngineLock>,
    permit: Option<EnginePermit>,
    running: RunningTable,
    bound: BoundSet,
    interrupt: Arc<InterruptFlag>,
}

impl<A> Drop for NativeSlot<A> {
    fn drop(&mut self) {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.worker);
    }
}

impl<A> NativeSlot<A> {
    fn mark_running(&self, job: Option<Uuid>, label: String) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                self.worker,
                Running {
                    job,
                    label,
                    since: Instant::now(),
                },
            );
    }

    fn clear_running(&self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.worker);
    }
}

/// Clears the slot's running entry even if the application panics.
struct RunningGuard<'a, A>(&'a NativeSlot<A>);

impl<A> Drop for RunningGuard<'_, A> {
    fn drop(&mut self) {
        self.0.clear_running();
    }
}

impl<A: Application> ExecutionSlot for NativeSlot<A> {
    fn acquire(&mut self) -> SlotToken {
        self.permit = Some(self.lock.acquire());
        SlotToken::new(self.worker)
    }

    fn release_keeping_state(&mut self, token: SlotToken) {
        drop(token);
        self.permit = None;
    }

    fn execute(&mut self, _token: &SlotToken, ctx: &mut ExecutionContext<'_>) -> JobResponse {
        self.mark_running(Some(ctx.job_id), ctx.request.logical_key());
        let _guard = RunningGuard(self);
        self.app.call(ctx)
    }

    fn execute_background(&mut self, _token: &SlotToken, task: &BackgroundTask) {
        self.mark_running(None, task.name.clone());
        let _guard = RunningGuard(self);
        self.app.run_background(task, &self.interrupt);
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        self.interrupt.clone()
    }

    fn recover_after_interrupt(&mut self, _token: &SlotToken) {
        info!(worker = self.worker, "Recovering slot after forced interrupt");
        self.interrupt.clear();
    }
}
