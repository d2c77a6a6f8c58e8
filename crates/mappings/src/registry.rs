//! Per-kind mappers and the registry resolving them.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::info;
use vcsync_core::{Error, Identity, ObjectKey, ResourceKind, Result, TenantConfig};

use crate::index::ReverseIndex;
use crate::names::physical_name;

/// Where translated objects land in the host store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceMode {
    /// Cluster-scoped kind; no namespace.
    Cluster,
    /// Every virtual namespace collapses into this host namespace.
    Fixed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Host identity equals virtual identity; nothing is owned or written.
    Mirror,
    Translate(NamespaceMode),
}

/// Identity translation for one resource kind.
pub struct ResourceMapper {
    kind: ResourceKind,
    policy: MappingPolicy,
    tenant: TenantConfig,
    index: ReverseIndex,
}

impl ResourceMapper {
    pub fn mirror(kind: ResourceKind, tenant: TenantConfig) -> Self {
        let index = ReverseIndex::new(kind.clone(), tenant.clone());
        Self { kind, policy: MappingPolicy::Mirror, tenant, index }
    }

    /// Translating mapper; namespaced kinds collapse into the tenant's host namespace.
    pub fn translate(kind: ResourceKind, tenant: TenantConfig) -> Self {
        let mode = if kind.namespaced {
            NamespaceMode::Fixed(tenant.host_namespace.clone())
        } else {
            NamespaceMode::Cluster
        };
        let index = ReverseIndex::new(kind.clone(), tenant.clone());
        Self { kind, policy: MappingPolicy::Translate(mode), tenant, index }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn policy(&self) -> &MappingPolicy {
        &self.policy
    }

    pub fn tenant(&self) -> &TenantConfig {
        &self.tenant
    }

    pub fn is_mirror(&self) -> bool {
        self.policy == MappingPolicy::Mirror
    }

    pub fn index(&self) -> &ReverseIndex {
        &self.index
    }

    pub fn virtual_to_host(&self, identity: &Identity) -> ObjectKey {
        match &self.policy {
            MappingPolicy::Mirror => identity.key(),
            MappingPolicy::Translate(NamespaceMode::Cluster) => {
                ObjectKey { namespace: None, name: physical_name(identity, &self.tenant) }
            }
            MappingPolicy::Translate(NamespaceMode::Fixed(ns)) => {
                ObjectKey { namespace: Some(ns.clone()), name: physical_name(identity, &self.tenant) }
            }
        }
    }

    /// Virtual identity behind a host key; mirror kinds map 1:1, translated kinds go through the index.
    pub fn host_to_virtual(&self, key: &ObjectKey) -> Option<Identity> {
        match &self.policy {
            MappingPolicy::Mirror => {
                Some(Identity { kind: self.kind.clone(), namespace: key.namespace.clone(), name: key.name.clone() })
            }
            MappingPolicy::Translate(_) => self.index.lookup(key),
        }
    }
}

/// One mapper per resource kind. Populated at startup, read-only afterwards.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: FxHashMap<ResourceKind, Arc<ResourceMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mapper: ResourceMapper) -> Result<Arc<ResourceMapper>> {
        let kind = mapper.kind().clone();
        if self.mappers.contains_key(&kind) {
            return Err(Error::DuplicateMapper(kind.gvk_key()));
        }
        info!(kind = %kind, mirror = mapper.is_mirror(), "mapper registered");
        let mapper = Arc::new(mapper);
        self.mappers.insert(kind, Arc::clone(&mapper));
        Ok(mapper)
    }

    pub fn resolve(&self, kind: &ResourceKind) -> Result<Arc<ResourceMapper>> {
        self.mappers.get(kind).cloned().ok_or_else(|| Error::UnknownKind(kind.gvk_key()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.mappers.keys()
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
