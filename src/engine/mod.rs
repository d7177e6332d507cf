//! Write path: bounded request queue, debounced updater, timer capability.

pub mod clock;
pub mod debounce;
pub mod queue;

pub use clock::{ManualClock, Scheduler, TimerHandle, TokioScheduler};
pub use debounce::{DebounceConfig, Debouncer, Receipt};
pub use queue::{QueueConfig, RequestQueue, Ticket};
