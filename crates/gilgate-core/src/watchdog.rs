//! Stuck-execution detection and forced interruption.
//!
//! A [`Watchdog`] arms one timer task per execution on the tokio runtime.
//! When the timer expires before the execution finishes, the worker is
//! flagged stuck, diagnostics are dumped and, after a short grace period,
//! the engine's interrupter is invoked. If every request worker is stuck at
//! once the fatal handler runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::engine::Interrupter;
use crate::metrics::GatewayMetrics;

/// Delay between the diagnostic dump and the forced interrupt
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

const ARMED: u8 = 0;
const INTERRUPTING: u8 = 1;
const SETTLED: u8 = 2;

/// Orders the forced interrupt against the end of the execution.
///
/// Once [`InterruptGate::close`] returns, no interrupt for this execution can
/// be issued any more.
#[derive(Debug, Default)]
struct InterruptGate {
    state: AtomicU8,
    interrupted: AtomicBool,
}

impl InterruptGate {
    /// Force an interrupt unless the execution already finished.
    fn interrupt(&self, interrupter: &dyn Interrupter) -> bool {
        if self
            .state
            .compare_exchange(ARMED, INTERRUPTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let issued = interrupter.force_interrupt();
        self.interrupted.store(issued, Ordering::Release);
        self.state.store(SETTLED, Ordering::Release);
        issued
    }

    /// Close the gate, waiting out an interrupt already in flight.
    /// Returns `true` if an interrupt was issued.
    fn close(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                ARMED,
                SETTLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(SETTLED) => return self.interrupted.load(Ordering::Acquire),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }
}

/// Invoked when the process can no longer make progress.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Default fatal handler: log and exit with status 1.
pub fn exit_process() -> FatalHandler {
    Arc::new(|reason: &str| {
        error!(reason, "Unrecoverable gateway state, exiting");
        std::process::exit(1);
    })
}

/// Stuck flags for every worker.
///
/// Indices below `request_workers` are request workers; any further entries
/// (the background worker) never count towards the all-stuck condition.
pub struct WorkerBoard {
    stuck: Vec<AtomicBool>,
    request_workers: usize,
    fatal: FatalHandler,
    metrics: GatewayMetrics,
}

impl WorkerBoard {
    pub fn new(
        request_workers: usize,
        extra_workers: usize,
        fatal: FatalHandler,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            stuck: (0..request_workers + extra_workers)
                .map(|_| AtomicBool::new(false))
                .collect(),
            request_workers,
            fatal,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.stuck.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stuck.is_empty()
    }

    pub fn is_stuck(&self, worker: usize) -> bool {
        self.stuck
            .get(worker)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Flag a worker stuck, escalating if every request worker is now stuck.
    pub fn mark_stuck(&self, worker: usize) {
        let Some(flag) = self.stuck.get(worker) else {
            return;
        };
        if !flag.swap(true, Ordering::AcqRel) {
            self.metrics.stuck_workers.inc();
        }
        self.check_all_stuck();
    }

    pub fn clear_stuck(&self, worker: usize) {
        let was_stuck = self
            .stuck
            .get(worker)
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel));
        if was_stuck {
            self.metrics.stuck_workers.dec();
        }
    }

    pub fn stuck_count(&self) -> usize {
        self.stuck[..self.request_workers]
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    pub fn all_stuck(&self) -> bool {
        self.request_workers > 0 && self.stuck_count() == self.request_workers
    }

    /// Run the fatal handler if every request worker is stuck.
    pub fn check_all_stuck(&self) -> bool {
        if self.all_stuck() {
            (self.fatal)("all workers are stuck");
            return true;
        }
        false
    }
}

/// Arms per-execution timeout monitors.
#[derive(Clone)]
pub struct Watchdog {
    runtime: Handle,
    board: Arc<WorkerBoard>,
    diagnostics: Arc<dyn Fn() + Send + Sync>,
    metrics: GatewayMetrics,
}

impl Watchdog {
    pub fn new(
        runtime: Handle,
        board: Arc<WorkerBoard>,
        diagnostics: Arc<dyn Fn() + Send + Sync>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            runtime,
            board,
            diagnostics,
            metrics,
        }
    }

    pub fn board(&self) -> &Arc<WorkerBoard> {
        &self.board
    }

    /// Start monitoring an execution on `worker`. Drop or [`WatchdogGuard::finish`]
    /// the guard once the execution returns.
    pub fn arm(
        &self,
        worker: usize,
        timeout: Duration,
        interrupter: Arc<dyn Interrupter>,
        label: String,
    ) -> WatchdogGuard {
        let gate = Arc::new(InterruptGate::default());
        let task_gate = Arc::clone(&gate);
        let board = Arc::clone(&self.board);
        let diagnostics = Arc::clone(&self.diagnostics);
        let metrics = self.metrics.clone();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(
                worker,
                task = %label,
                timeout_secs = timeout.as_secs(),
                "Execution exceeded its timeout, interrupting"
            );
            board.mark_stuck(worker);
            diagnostics();
            tokio::time::sleep(INTERRUPT_GRACE).await;
            if task_gate.interrupt(&*interrupter) {
                metrics.interrupts_total.inc();
            }
        });

        WatchdogGuard {
            task: Some(task),
            gate,
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("workers", &self.board.len())
            .finish_non_exhaustive()
    }
}

/// Live monitor for one execution.
#[derive(Debug)]
pub struct WatchdogGuard {
    task: Option<JoinHandle<()>>,
    gate: Arc<InterruptGate>,
}

impl WatchdogGuard {
    /// Disarm the monitor. Returns `true` if a forced interrupt was issued.
    ///
    /// No interrupt reaches the engine after this returns.
    pub fn finish(mut self) -> bool {
        self.disarm()
    }

    fn disarm(&mut self) -> bool {
        let interrupted = self.gate.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        interrupted
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InterruptFlag;
    use std::sync::atomic::AtomicUsize;

    fn counting_fatal() -> (FatalHandler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: FatalHandler = Arc::new(move |_reason: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, calls)
    }

    fn metrics() -> GatewayMetrics {
        GatewayMetrics::new("test").unwrap()
    }

    #[test]
    fn test_all_stuck_is_fatal() {
        let (fatal, calls) = counting_fatal();
        let board = WorkerBoard::new(2, 1, fatal, metrics());

        board.mark_stuck(0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Background worker does not count
        board.mark_stuck(2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!board.all_stuck());

        board.mark_stuck(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(board.all_stuck());
    }

    #[test]
    fn test_clear_stuck() {
        let (fatal, calls) = counting_fatal();
        let metrics = metrics();
        let board = WorkerBoard::new(2, 0, fatal, metrics.clone());

        board.mark_stuck(0);
        assert_eq!(metrics.stuck_workers.get(), 1);
        board.clear_stuck(0);
        board.clear_stuck(0);
        assert_eq!(metrics.stuck_workers.get(), 0);
        assert!(!board.is_stuck(0));
        assert!(!board.check_all_stuck());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_interrupts_after_timeout() {
        let (fatal, _calls) = counting_fatal();
        let metrics = metrics();
        let board = Arc::new(WorkerBoard::new(2, 0, fatal, metrics.clone()));
        let dumps = Arc::new(AtomicUsize::new(0));
        let dump_counter = Arc::clone(&dumps);
        let watchdog = Watchdog::new(
            Handle::current(),
            Arc::clone(&board),
            Arc::new(move || {
                dump_counter.fetch_add(1, Ordering::SeqCst);
            }),
            metrics.clone(),
        );

        let flag = Arc::new(InterruptFlag::new());
        let guard = watchdog.arm(0, Duration::from_secs(5), flag.clone(), "/slow".to_string());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!board.is_stuck(0));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(board.is_stuck(0));
        assert!(flag.is_raised());
        assert_eq!(dumps.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.interrupts_total.get(), 1);
        assert!(guard.finish());
    }

    #[test]
    fn test_closed_gate_blocks_late_interrupt() {
        let gate = InterruptGate::default();
        let flag = InterruptFlag::new();

        assert!(!gate.close());
        assert!(!gate.interrupt(&flag));
        assert!(!flag.is_raised());
        assert!(!gate.close());
    }

    #[test]
    fn test_gate_reports_interrupt_issued_before_close() {
        let gate = InterruptGate::default();
        let flag = InterruptFlag::new();

        assert!(gate.interrupt(&flag));
        assert!(flag.is_raised());
        assert!(gate.close());
        // A second attempt after settling is refused
        flag.clear();
        assert!(!gate.interrupt(&flag));
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_gate_single_outcome_under_race() {
        for _ in 0..200 {
            let gate = Arc::new(InterruptGate::default());
            let flag = Arc::new(InterruptFlag::new());

            let interrupter = {
                let gate = Arc::clone(&gate);
                let flag = Arc::clone(&flag);
                std::thread::spawn(move || gate.interrupt(&*flag))
            };
            let closed_after_interrupt = gate.close();
            let raised_after_close = flag.is_raised();
            let issued = interrupter.join().unwrap();

            // Whatever close() reported is final: no interrupt lands later
            assert_eq!(closed_after_interrupt, issued);
            assert_eq!(raised_after_close, issued);
            assert_eq!(flag.is_raised(), issued);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_during_grace_prevents_interrupt() {
        let (fatal, _calls) = counting_fatal();
        let metrics = metrics();
        let board = Arc::new(WorkerBoard::new(2, 0, fatal, metrics.clone()));
        let watchdog = Watchdog::new(Handle::current(), Arc::clone(&board), Arc::new(|| {}), metrics.clone());

        let flag = Arc::new(InterruptFlag::new());
        let guard = watchdog.arm(0, Duration::from_secs(5), flag.clone(), "/slow".to_string());

        // Timed out and flagged stuck, but still inside the grace period
        tokio::time::sleep(Duration::from_millis(5050)).await;
        assert!(board.is_stuck(0));
        assert!(!guard.finish());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!flag.is_raised());
        assert_eq!(metrics.interrupts_total.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_execution_is_not_interrupted() {
        let (fatal, _calls) = counting_fatal();
        let board = Arc::new(WorkerBoard::new(1, 0, fatal, metrics()));
        let watchdog = Watchdog::new(Handle::current(), Arc::clone(&board), Arc::new(|| {}), metrics());

        let flag = Arc::new(InterruptFlag::new());
        let guard = watchdog.arm(0, Duration::from_secs(5), flag.clone(), "/fast".to_string());
        assert!(!guard.finish());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!flag.is_raised());
        assert!(!board.is_stuck(0));
    }
}
