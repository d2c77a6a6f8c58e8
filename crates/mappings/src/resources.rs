//! Kinds and mappers of the built-in synced resources.

use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use vcsync_core::{ResourceKind, SyncConfig};

use crate::registry::ResourceMapper;

pub fn cluster_kind<K: k8s_openapi::Resource<Scope = ClusterResourceScope>>() -> ResourceKind {
    ResourceKind::cluster(K::GROUP, K::VERSION, K::KIND)
}

pub fn namespaced_kind<K: k8s_openapi::Resource<Scope = NamespaceResourceScope>>() -> ResourceKind {
    ResourceKind::namespaced(K::GROUP, K::VERSION, K::KIND)
}

pub fn priority_class_kind() -> ResourceKind {
    cluster_kind::<PriorityClass>()
}

pub fn storage_class_kind() -> ResourceKind {
    cluster_kind::<StorageClass>()
}

/// Priority classes pass through untranslated unless syncing them is enabled.
pub fn priority_classes_mapper(cfg: &SyncConfig) -> ResourceMapper {
    if cfg.sync_priority_classes {
        ResourceMapper::translate(priority_class_kind(), cfg.tenant.clone())
    } else {
        ResourceMapper::mirror(priority_class_kind(), cfg.tenant.clone())
    }
}

/// Storage classes pass through untranslated unless syncing them is enabled.
pub fn storage_classes_mapper(cfg: &SyncConfig) -> ResourceMapper {
    if cfg.sync_storage_classes {
        ResourceMapper::translate(storage_class_kind(), cfg.tenant.clone())
    } else {
        ResourceMapper::mirror(storage_class_kind(), cfg.tenant.clone())
    }
}
