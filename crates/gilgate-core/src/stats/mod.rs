//! Load statistics feeding the priority calculation.

mod aged;
mod page;
mod rolling;

pub use aged::{AgedCount, AgedCounter};
pub use page::PageStats;
pub use rolling::{ROLLING_CAPACITY, RollingStat};
