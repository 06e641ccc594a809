//! # gilgate-core
//!
//! Scheduling, admission control and worker execution for a gateway that
//! fronts an execution engine with a scarce, exclusive, thread-affine
//! execution resource.
//!
//! Requests become [`Job`]s in a priority-ordered [`AdmissionQueue`]. A fixed
//! pool of worker threads, each bound to one [`ExecutionSlot`], grab the
//! highest-priority job; producers race them with their own timeout and
//! cancellation paths, and a single atomic grab decides who resolves each job.
//! A [`Watchdog`] interrupts executions that overrun, and the [`suspend`]
//! module lets application code park a request until notified or ask for an
//! internal retry.
//!
//! [`Gateway`] wires all of it together for a transport such as `gilgate-http`.

pub mod blocking;
pub mod config;
pub mod cpu_time;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod priority;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod suspend;
pub mod watchdog;
pub mod worker;

pub use config::{GatewayConfig, GatewayConfigBuilder, QueueLength, WorkerCount};
pub use engine::{
    Application, BackgroundTask, Engine, ExecutionContext, ExecutionSlot, InterruptFlag,
    NativeEngine,
};
pub use error::{BodyError, ConfigError, EngineError, SchedulerError, SchedulerResult};
pub use gateway::{Gateway, GatewayOptions, GatewayReply, GatewaySnapshot};
pub use job::{Job, JobOutcome, JobResponse, RequestBody, RequestInfo, Resolution};
pub use priority::{PriorityCalculator, PriorityWeights, RateLimitIdentity, RateLimitKey};
pub use scheduler::{AdmissionQueue, Scheduler};
pub use sink::{CompletionRecord, StatsSink, TracingSink};
pub use suspend::{ParkAction, ParkPolicy};
pub use watchdog::{FatalHandler, Watchdog};
