//! Reverse index: host object key -> virtual identity.
//!
//! Built from the marker label and origin annotations of owned host objects,
//! never by inverting the name hash. Read by many concurrent passes; written
//! by each pass's own create/delete and by host watch events.

use std::sync::{PoisonError, RwLock};

use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;
use vcsync_core::{Error, Identity, ObjectKey, ResourceKind, Result, TenantConfig};

use crate::labels::{is_owned, origin_identity};

#[derive(Default)]
struct IndexState {
    by_physical: FxHashMap<ObjectKey, Identity>,
    by_virtual: FxHashMap<Identity, SmallVec<[ObjectKey; 1]>>,
}

impl IndexState {
    fn remove(&mut self, key: &ObjectKey) -> Option<Identity> {
        let identity = self.by_physical.remove(key)?;
        if let Some(keys) = self.by_virtual.get_mut(&identity) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_virtual.remove(&identity);
            }
        }
        Some(identity)
    }

    fn insert(&mut self, key: ObjectKey, identity: Identity) {
        if self.by_physical.get(&key) == Some(&identity) {
            return;
        }
        self.remove(&key);
        let keys = self.by_virtual.entry(identity.clone()).or_default();
        if !keys.contains(&key) {
            keys.push(key.clone());
        }
        self.by_physical.insert(key, identity);
    }
}

pub struct ReverseIndex {
    kind: ResourceKind,
    tenant: TenantConfig,
    state: RwLock<IndexState>,
}

impl ReverseIndex {
    pub fn new(kind: ResourceKind, tenant: TenantConfig) -> Self {
        Self { kind, tenant, state: RwLock::new(IndexState::default()) }
    }

    /// Records (or refreshes) a host object. Objects that are not ours or
    /// lack origin annotations are dropped from the index.
    pub fn observe(&self, obj: &DynamicObject) -> Option<Identity> {
        let key = ObjectKey::of(obj)?;
        let origin = if is_owned(&obj.metadata, &self.tenant) {
            origin_identity(&self.kind, &obj.metadata)
        } else {
            None
        };
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match origin {
            Some(identity) => {
                state.insert(key, identity.clone());
                Some(identity)
            }
            None => {
                state.remove(&key);
                None
            }
        }
    }

    pub fn forget(&self, key: &ObjectKey) -> Option<Identity> {
        self.state.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    /// Replaces the whole index with the given host objects (relist).
    pub fn rebuild<'a>(&self, objs: impl IntoIterator<Item = &'a DynamicObject>) {
        let mut next = IndexState::default();
        for obj in objs {
            if !is_owned(&obj.metadata, &self.tenant) {
                continue;
            }
            if let (Some(key), Some(identity)) = (ObjectKey::of(obj), origin_identity(&self.kind, &obj.metadata)) {
                next.insert(key, identity);
            }
        }
        debug!(kind = %self.kind, entries = next.by_physical.len(), "reverse index rebuilt");
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn lookup(&self, key: &ObjectKey) -> Option<Identity> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).by_physical.get(key).cloned()
    }

    /// The single host object claiming `identity`, if any.
    pub fn claimant(&self, identity: &Identity) -> Result<Option<ObjectKey>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.by_virtual.get(identity).map(|k| k.as_slice()) {
            None | Some([]) => Ok(None),
            Some([one]) => Ok(Some(one.clone())),
            Some(many) => Err(Error::AmbiguousIdentity {
                identity: identity.to_string(),
                claimants: many.iter().map(|k| k.to_string()).collect(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).by_physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
