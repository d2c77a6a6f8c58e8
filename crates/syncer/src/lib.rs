//! vcsync syncer: per-kind field declarations, the diff engine and the
//! reconciliation state machine.

#![forbid(unsafe_code)]

pub mod diff;
pub mod fields;
pub mod plugin;
pub mod reconciler;
pub mod resources;

pub use diff::{backward_diff, build_physical, field_eq, forward_diff, semantic_eq, SyncContext};
pub use fields::{Direction, Field, FieldPath, FieldSpec, Transform};
pub use plugin::{FieldSyncer, HostDeletionPolicy, ResourceSyncer, SyncerSet};
pub use reconciler::{classify, Reconciler, SyncOutcome, SyncState};
