//! Resource syncer plugins and the set they are registered in.

use std::sync::Arc;

use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::info;
use vcsync_core::{Error, ResourceKind, Result};
use vcsync_mappings::MapperRegistry;

use crate::diff::{self, SyncContext};
use crate::fields::{validate_fields, Direction, FieldSpec};

/// What happens when an owned host object disappears while its virtual object still exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostDeletionPolicy {
    /// Virtual stays authoritative; the host object is created again.
    #[default]
    Recreate,
    /// The host deletion propagates back to the virtual object.
    DeleteVirtual,
}

/// Per-kind sync behaviour. The defaults are driven entirely by [`fields`];
/// a kind overrides hooks only where it needs more than that.
///
/// [`fields`]: ResourceSyncer::fields
pub trait ResourceSyncer: Send + Sync {
    fn kind(&self) -> &ResourceKind;

    /// Empty object of this kind with apiVersion and kind set.
    fn new_object(&self) -> DynamicObject;

    fn fields(&self) -> &[FieldSpec];

    fn deletion_policy(&self) -> HostDeletionPolicy {
        HostDeletionPolicy::Recreate
    }

    /// Host payload for a virtual object with no host counterpart.
    fn translate(&self, ctx: &SyncContext<'_>, virtual_obj: &DynamicObject) -> Result<DynamicObject> {
        let mut out = diff::build_physical(self.fields(), virtual_obj, ctx);
        if out.types.is_none() {
            out.types = self.new_object().types;
        }
        Ok(out)
    }

    fn forward_diff(
        &self,
        ctx: &SyncContext<'_>,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<Option<DynamicObject>> {
        Ok(diff::forward_diff(self.fields(), virtual_obj, physical_obj, ctx))
    }

    fn backward_diff(
        &self,
        _ctx: &SyncContext<'_>,
        physical_obj: &DynamicObject,
        virtual_obj: &DynamicObject,
    ) -> Result<Option<DynamicObject>> {
        Ok(diff::backward_diff(self.fields(), physical_obj, virtual_obj))
    }

    /// Whether this virtual object should exist on the host at all.
    fn forward_create_needed(&self, _virtual_obj: &DynamicObject) -> bool {
        true
    }

    fn forward_update_needed(
        &self,
        ctx: &SyncContext<'_>,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<bool> {
        Ok(self.forward_diff(ctx, virtual_obj, physical_obj)?.is_some())
    }

    fn backward_update_needed(
        &self,
        ctx: &SyncContext<'_>,
        physical_obj: &DynamicObject,
        virtual_obj: &DynamicObject,
    ) -> Result<bool> {
        Ok(self.backward_diff(ctx, physical_obj, virtual_obj)?.is_some())
    }
}

/// Syncer described purely by its field declarations.
#[derive(Debug, Clone)]
pub struct FieldSyncer {
    kind: ResourceKind,
    fields: Vec<FieldSpec>,
    policy: HostDeletionPolicy,
}

impl FieldSyncer {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, fields: Vec::new(), policy: HostDeletionPolicy::default() }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn deletion_policy(mut self, policy: HostDeletionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl ResourceSyncer for FieldSyncer {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn new_object(&self) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: self.kind.api_version(), kind: self.kind.kind.clone() }),
            metadata: ObjectMeta::default(),
            data: json!({}),
        }
    }

    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn deletion_policy(&self) -> HostDeletionPolicy {
        self.policy
    }
}

/// True if any backward field lives under the status subresource.
pub fn writes_status(syncer: &dyn ResourceSyncer) -> bool {
    syncer
        .fields()
        .iter()
        .any(|f| f.direction == Direction::Backward && f.path().map(|p| p.is_status()).unwrap_or(false))
}

/// One syncer per kind. Built at startup, read-only afterwards.
#[derive(Default)]
pub struct SyncerSet {
    syncers: FxHashMap<ResourceKind, Arc<dyn ResourceSyncer>>,
}

impl SyncerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, syncer: Arc<dyn ResourceSyncer>) -> Result<()> {
        let kind = syncer.kind().clone();
        if self.syncers.contains_key(&kind) {
            return Err(Error::DuplicateSyncer(kind.gvk_key()));
        }
        validate_fields(&kind.to_string(), syncer.fields())?;
        info!(kind = %kind, fields = syncer.fields().len(), "registered syncer");
        self.syncers.insert(kind, syncer);
        Ok(())
    }

    pub fn get(&self, kind: &ResourceKind) -> Result<Arc<dyn ResourceSyncer>> {
        self.syncers.get(kind).cloned().ok_or_else(|| Error::UnknownKind(kind.gvk_key()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.syncers.keys()
    }

    pub fn len(&self) -> usize {
        self.syncers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syncers.is_empty()
    }

    /// Every syncer needs a translating mapper for its kind.
    pub fn validate(&self, mappers: &MapperRegistry) -> Result<()> {
        for kind in self.syncers.keys() {
            let mapper = mappers.resolve(kind)?;
            if mapper.is_mirror() {
                return Err(Error::config(format!("{kind}: syncer registered for a mirrored kind")));
            }
        }
        Ok(())
    }
}
