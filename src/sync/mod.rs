//! Background reconciliation of local writes with the remote endpoint.
//!
//! - `queue` is the durable list of pending mutation intents
//! - `throttle` serializes and spaces every outbound call
//! - `engine` drains the queue through the throttle

mod engine;
mod queue;
mod throttle;

pub use engine::{DrainReport, SyncEngine, SyncOptions};
pub use queue::{Intent, PendingOperation};
pub use throttle::{Priority, Throttle};
