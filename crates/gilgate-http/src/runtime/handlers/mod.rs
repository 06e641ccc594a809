//! HTTP request handlers

pub mod admin;
pub mod dispatch;
pub mod health;

pub use admin::{notify, retry};
pub use dispatch::{dispatch, reply_to_response};
pub use health::{health_check, metrics_endpoint};
