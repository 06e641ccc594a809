//! Execution engine boundary.
//!
//! An [`Engine`] hosts application code behind an exclusive, thread-affine
//! execution resource. Each worker thread binds one [`ExecutionSlot`] for its
//! whole lifetime; the slot never leaves that thread.
//!
//! Interruption is two-layered: a cooperative [`InterruptFlag`] that
//! application code checks at safe points, and a best-effort
//! [`Interrupter::force_interrupt`] hook that engines may implement when they
//! can preempt running code. Neither is guaranteed to stop an execution.

mod native;

pub use native::{Application, EngineLock, EnginePermit, NativeEngine};

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::error::EngineError;
use crate::job::{JobResponse, RequestBody, RequestInfo};

/// Proof that the calling thread holds its slot's execution resource.
///
/// Not `Send`: a token is released on the thread that acquired it.
#[derive(Debug)]
pub struct SlotToken {
    worker: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl SlotToken {
    /// Engines mint a token once their resource is held
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            _thread_bound: PhantomData,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }
}

/// Cooperative interrupt request shared between a slot and its watchdog.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle used by the watchdog to break into a running execution from another thread.
pub trait Interrupter: Send + Sync {
    /// Attempt to stop the current execution. Returns `true` if an interrupt was issued.
    fn force_interrupt(&self) -> bool;
}

impl Interrupter for InterruptFlag {
    fn force_interrupt(&self) -> bool {
        self.raise();
        true
    }
}

/// Opaque work item for the background worker.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub name: String,
    pub payload: Bytes,
}

impl BackgroundTask {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Submission side of the background task queue.
#[derive(Debug, Clone)]
pub struct BackgroundSender(pub(crate) Sender<BackgroundTask>);

impl BackgroundSender {
    /// Queue a task. Returns `false` if the background worker has stopped.
    pub fn submit(&self, task: BackgroundTask) -> bool {
        self.0.send(task).is_ok()
    }
}

/// Everything application code sees while handling one request.
pub struct ExecutionContext<'a> {
    pub job_id: Uuid,
    pub worker: usize,
    pub request: &'a RequestInfo,
    pub body: &'a mut RequestBody,
    interrupt: &'a InterruptFlag,
    background: &'a BackgroundSender,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        job_id: Uuid,
        worker: usize,
        request: &'a RequestInfo,
        body: &'a mut RequestBody,
        interrupt: &'a InterruptFlag,
        background: &'a BackgroundSender,
    ) -> Self {
        Self {
            job_id,
            worker,
            request,
            body,
            interrupt,
            background,
        }
    }

    /// Whether the watchdog has asked this execution to stop.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    pub fn spawn_background(&self, task: BackgroundTask) -> bool {
        self.background.submit(task)
    }
}

/// A hosted execution engine.
pub trait Engine: Send + Sync + 'static {
    type Slot: ExecutionSlot;

    /// Create the slot for `worker`. Called on the worker's own thread.
    ///
    /// `interrupt` is the cooperative flag the worker's watchdog raises; the
    /// slot must expose it to application code through [`ExecutionContext`].
    fn bind(&self, worker: usize, interrupt: Arc<InterruptFlag>)
    -> Result<Self::Slot, EngineError>;

    /// Emit diagnostics describing what every slot is running.
    fn dump_diagnostics(&self);
}

/// One worker's thread-affine capability to run application code.
pub trait ExecutionSlot {
    /// Block until the exclusive execution resource is held.
    fn acquire(&mut self) -> SlotToken;

    /// Give the resource back without discarding engine state.
    fn release_keeping_state(&mut self, token: SlotToken);

    /// Run application code for one request. May panic.
    fn execute(&mut self, token: &SlotToken, ctx: &mut ExecutionContext<'_>) -> JobResponse;

    /// Run one background task. May panic.
    fn execute_background(&mut self, token: &SlotToken, task: &BackgroundTask);

    fn interrupter(&self) -> Arc<dyn Interrupter>;

    /// Best-effort cleanup after a forced interrupt, e.g. releasing locks the
    /// interrupted code left held.
    fn recover_after_interrupt(&mut self, token: &SlotToken);
}
