//! vcsync core types shared by the mapping, store, syncer and dispatch crates.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod names;

pub use config::{SyncConfig, TenantConfig};
pub use error::{Error, ErrorClass, Result, StoreError};

/// A served resource kind, keyed like `v1/Kind` or `group/v1/Kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn cluster(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced: false }
    }

    pub fn namespaced(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced: true }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Location of an object inside one store, for a known kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Key of an object as it sits in its store. `None` if the object has no name.
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.as_deref()?;
        Some(Self::new(obj.metadata.namespace.as_deref(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Virtual object identity. Immutable once the object exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl Identity {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn of(kind: &ResourceKind, obj: &DynamicObject) -> Option<Self> {
        let key = ObjectKey::of(obj)?;
        Some(Self { kind: kind.clone(), namespace: key.namespace, name: key.name })
    }

    /// Key of the virtual object in the virtual store.
    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Watch notification from one store. Delivered at least once; duplicates are expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: ResourceKind,
    pub event: DeltaKind,
    /// Last observed state of the object (final state for deletions).
    pub object: DynamicObject,
}

pub mod prelude {
    pub use super::{Delta, DeltaKind, Error, ErrorClass, Identity, ObjectKey, ResourceKind, StoreError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_omits_empty_group() {
        let core = ResourceKind::namespaced("", "v1", "ConfigMap");
        assert_eq!(core.gvk_key(), "v1/ConfigMap");
        assert_eq!(core.api_version(), "v1");
        let pc = ResourceKind::cluster("scheduling.k8s.io", "v1", "PriorityClass");
        assert_eq!(pc.gvk_key(), "scheduling.k8s.io/v1/PriorityClass");
        assert_eq!(pc.api_version(), "scheduling.k8s.io/v1");
    }

    #[test]
    fn identity_display_includes_namespace_only_when_set() {
        let kind = ResourceKind::cluster("scheduling.k8s.io", "v1", "PriorityClass");
        let id = Identity::new(kind.clone(), None, "gold");
        assert_eq!(id.to_string(), "scheduling.k8s.io/v1/PriorityClass gold");
        let id = Identity::new(ResourceKind::namespaced("", "v1", "ConfigMap"), Some("v1"), "cm");
        assert_eq!(id.to_string(), "v1/ConfigMap v1/cm");
        assert_eq!(id.key(), ObjectKey::new(Some("v1"), "cm"));
    }
}
