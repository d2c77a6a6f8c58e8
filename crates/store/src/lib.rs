//! vcsync store: the object store interface both clusters are consumed
//! through, plus an in-RAM implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use tokio::sync::broadcast;
use vcsync_core::{Delta, ObjectKey, ResourceKind, StoreError};

mod memory;

pub use memory::{MemoryStore, Op, StoreCall};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Equality label selector: every pair must be present on a match.
pub type LabelSelector = BTreeMap<String, String>;

/// Guards on delete: the call fails with a conflict if the stored object's
/// uid or resourceVersion no longer match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    /// Preconditions pinning the exact object snapshot that was read.
    pub fn of(obj: &DynamicObject) -> Self {
        Self { uid: obj.metadata.uid.clone(), resource_version: obj.metadata.resource_version.clone() }
    }
}

/// One cluster's object store. Updates use resourceVersion-based optimistic
/// locking: an update carrying a stale resourceVersion fails with
/// [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<Option<DynamicObject>>;

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>>;

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Writes the status subresource. Stores without one treat it as a plain update.
    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        self.update(kind, obj).await
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey, preconditions: &Preconditions) -> StoreResult<()>;

    /// Watch feed for every kind this store serves. At-least-once; duplicates happen.
    fn subscribe(&self) -> broadcast::Receiver<Delta>;
}

/// True if `labels` satisfies every pair in `selector`.
pub fn selector_matches(selector: &LabelSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
