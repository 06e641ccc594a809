//! # gilgate HTTP front end
//!
//! Adapts inbound HTTP requests to [`gilgate_core::Gateway::serve`] and exposes
//! the admin API used to wake parked requests and trigger retries.
//!
//! - **Gateway router**: every path is dispatched to the scheduler. The client
//!   disconnecting cancels the request.
//! - **Admin router**: `POST /notify`, `POST /retry/{id}`, `GET /health`,
//!   `GET /metrics`, bound on a separate address.
//! - **Graceful shutdown**: SIGINT/SIGTERM drain connections, then stop the
//!   worker pool.

pub mod runtime;

pub use runtime::*;
