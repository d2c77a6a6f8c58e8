//! Storage classes: cluster-scoped and forward only. Provisioner, parameters,
//! reclaim policy, binding mode, mount options and topologies are immutable
//! on the host, so they are copied on create and never compared afterwards.

use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::{ApiResource, DynamicObject};
use vcsync_core::{Error, ResourceKind, Result};
use vcsync_mappings::resources::storage_class_kind;

use crate::diff::{build_physical, SyncContext};
use crate::fields::FieldSpec;
use crate::plugin::{FieldSyncer, ResourceSyncer};

pub struct StorageClassSyncer {
    inner: FieldSyncer,
}

impl Default for StorageClassSyncer {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageClassSyncer {
    pub fn new() -> Self {
        let inner = FieldSyncer::new(storage_class_kind())
            .field(FieldSpec::labels())
            .field(FieldSpec::annotations())
            .field(FieldSpec::forward("allowVolumeExpansion"));
        Self { inner }
    }
}

impl ResourceSyncer for StorageClassSyncer {
    fn kind(&self) -> &ResourceKind {
        self.inner.kind()
    }

    fn new_object(&self) -> DynamicObject {
        DynamicObject::new("", &ApiResource::erase::<StorageClass>(&()))
    }

    fn fields(&self) -> &[FieldSpec] {
        self.inner.fields()
    }

    fn translate(&self, ctx: &SyncContext<'_>, virtual_obj: &DynamicObject) -> Result<DynamicObject> {
        serde_json::from_value::<StorageClass>(serde_json::to_value(virtual_obj)?)
            .map_err(|e| Error::validation(format!("{}: {e}", ctx.identity)))?;
        let mut out = build_physical(self.fields(), virtual_obj, ctx);
        out.types = self.new_object().types;
        Ok(out)
    }
}
