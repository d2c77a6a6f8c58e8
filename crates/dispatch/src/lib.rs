//! vcsync dispatch: coalescing work queue, per-identity back-off and the
//! driver feeding reconciliation workers from watch events and resyncs.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod driver;
pub mod queue;

pub use backoff::Backoff;
pub use driver::{Side, SyncDriver};
pub use queue::{Scheduler, WorkQueue};
