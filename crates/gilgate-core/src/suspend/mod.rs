//! Request suspension: parking and internal retries.

mod park;
mod retry;

pub use park::{
    CorrelationKeys, ParkAction, ParkNotification, ParkPolicy, ParkTable, Registration,
};
pub use retry::{RetryOutcome, RetryTable, RetryWait};
