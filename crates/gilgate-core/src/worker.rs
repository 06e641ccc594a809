//! Worker thread pool.
//!
//! Each worker is a long-lived OS thread permanently bound to one engine
//! slot. Request workers loop on [`Scheduler::grab_job`]; one extra
//! background worker drains the background task queue.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use crate::config::GatewayConfig;
use crate::cpu_time::thread_cpu_time;
use crate::engine::{
    BackgroundSender, BackgroundTask, Engine, ExecutionContext, ExecutionSlot, InterruptFlag,
};
use crate::error::EngineError;
use crate::job::{Job, JobResponse};
use crate::scheduler::Scheduler;
use crate::watchdog::Watchdog;

/// Poll interval for the background worker's shutdown check
const BACKGROUND_POLL: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    scheduler: Arc<Scheduler>,
    background: BackgroundSender,
    request_workers: usize,
}

impl WorkerPool {
    /// Spawn all workers and wait until each has bound its slot.
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError`] raised while spawning a thread or
    /// binding a slot. Workers already started are stopped.
    pub fn start<E: Engine>(
        engine: Arc<E>,
        scheduler: Arc<Scheduler>,
        watchdog: Watchdog,
        config: &GatewayConfig,
    ) -> Result<Self, EngineError> {
        let request_workers = config.workers.get();
        let (background_tx, background_rx) = crossbeam_channel::unbounded::<BackgroundTask>();
        let background = BackgroundSender(background_tx);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(request_workers + 1);

        let mut pool = Self {
            handles: Vec::with_capacity(request_workers + 1),
            scheduler: Arc::clone(&scheduler),
            background: background.clone(),
            request_workers,
        };

        for id in 0..=request_workers {
            let worker = Worker {
                id,
                engine: Arc::clone(&engine),
                scheduler: Arc::clone(&scheduler),
                watchdog: watchdog.clone(),
                background: background.clone(),
                request_timeout: config.request_timeout,
                background_timeout: config.background_timeout,
            };
            let ready = ready_tx.clone();
            let tasks = background_rx.clone();
            let name = if id == request_workers {
                "gilgate-background".to_string()
            } else {
                format!("gilgate-worker-{id}")
            };

            let spawned = thread::Builder::new().name(name).spawn(move || {
                let interrupt = Arc::new(InterruptFlag::new());
                let slot = match worker.engine.bind(worker.id, Arc::clone(&interrupt)) {
                    Ok(slot) => {
                        let _ = ready.send(Ok(()));
                        slot
                    }
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                drop(ready);
                if worker.id == request_workers {
                    worker.run_background(slot, &interrupt, &tasks);
                } else {
                    worker.run_requests(slot, &interrupt);
                }
            });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.stop();
                    return Err(EngineError::Spawn(e));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..=request_workers {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    pool.stop();
                    return Err(e);
                }
                Err(_) => {
                    pool.stop();
                    return Err(EngineError::Other(
                        "worker exited before binding its slot".to_string(),
                    ));
                }
            }
        }

        info!(workers = request_workers, "Worker pool started");
        Ok(pool)
    }

    pub fn background(&self) -> BackgroundSender {
        self.background.clone()
    }

    pub fn request_workers(&self) -> usize {
        self.request_workers
    }

    /// Signal every worker to exit once its current job is done.
    pub fn stop(&self) {
        self.scheduler.shutdown(self.request_workers);
    }

    /// Stop and wait for all worker threads. Blocks the calling thread.
    pub fn join(mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        info!("Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.handles.len())
            .field("request_workers", &self.request_workers)
            .finish_non_exhaustive()
    }
}

struct Worker<E> {
    id: usize,
    engine: Arc<E>,
    scheduler: Arc<Scheduler>,
    watchdog: Watchdog,
    background: BackgroundSender,
    request_timeout: Duration,
    background_timeout: Duration,
}

impl<E: Engine> Worker<E> {
    fn run_requests(&self, mut slot: E::Slot, interrupt: &InterruptFlag) {
        debug!(worker = self.id, "Worker ready");
        while let Some(job) = self.scheduler.grab_job() {
            self.execute(&mut slot, interrupt, &job);
        }
        debug!(worker = self.id, "Worker exiting");
    }

    fn execute(&self, slot: &mut E::Slot, interrupt: &InterruptFlag, job: &Job) {
        interrupt.clear();
        let ticket = self.scheduler.job_started(job);
        let token = slot.acquire();
        let guard = self.watchdog.arm(
            self.id,
            self.request_timeout,
            slot.interrupter(),
            job.request().logical_key(),
        );
        let cpu_start = thread_cpu_time();

        let response = {
            let mut body = job.body();
            let mut ctx = ExecutionContext::new(
                job.id(),
                self.id,
                job.request(),
                &mut body,
                interrupt,
                &self.background,
            );
            match catch_unwind(AssertUnwindSafe(|| slot.execute(&token, &mut ctx))) {
                Ok(response) => response,
                Err(panic) => {
                    error!(
                        worker = self.id,
                        job_id = %job.id(),
                        path = %job.request().logical_key(),
                        panic = %panic_message(panic.as_ref()),
                        "Application panicked while handling request"
                    );
                    self.scheduler.metrics().errors_total.inc();
                    JobResponse::bad_gateway()
                }
            }
        };

        let cpu_elapsed = thread_cpu_time().saturating_sub(cpu_start);
        if guard.finish() {
            slot.recover_after_interrupt(&token);
        }
        self.watchdog.board().clear_stuck(self.id);
        slot.release_keeping_state(token);

        self.scheduler
            .job_finished(job, ticket, response, cpu_elapsed, self.id);
    }

    fn run_background(
        &self,
        mut slot: E::Slot,
        interrupt: &InterruptFlag,
        tasks: &Receiver<BackgroundTask>,
    ) {
        debug!(worker = self.id, "Background worker ready");
        loop {
            if self.scheduler.is_shutting_down() {
                break;
            }
            let task = match tasks.recv_timeout(BACKGROUND_POLL) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            interrupt.clear();
            let token = slot.acquire();
            let guard = self.watchdog.arm(
                self.id,
                self.background_timeout,
                slot.interrupter(),
                task.name.clone(),
            );
            let started = std::time::Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| slot.execute_background(&token, &task)));
            if guard.finish() {
                slot.recover_after_interrupt(&token);
            }
            self.watchdog.board().clear_stuck(self.id);
            slot.release_keeping_state(token);

            match result {
                Ok(()) => info!(
                    task = %task.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Background task finished"
                ),
                Err(panic) => error!(
                    task = %task.name,
                    panic = %panic_message(panic.as_ref()),
                    "Background task panicked"
                ),
            }
        }
        debug!(worker = self.id, "Background worker exiting");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let panic = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom");

        let panic = catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "code 7");
    }
}
