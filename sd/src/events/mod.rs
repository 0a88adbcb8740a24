//! Per-job progress event plane

mod bus;
mod types;

pub use bus::{ProgressBus, SUBSCRIBER_BUFFER};
pub use types::JobEvent;
