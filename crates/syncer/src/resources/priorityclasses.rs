//! Priority classes: cluster-scoped, forward only, value clamped below the
//! range reserved for system-critical host classes.

use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::core::{ApiResource, DynamicObject};
use serde_json::Value;
use vcsync_core::{Error, ResourceKind, Result, SyncConfig};
use vcsync_mappings::resources::priority_class_kind;

use crate::diff::{build_physical, SyncContext};
use crate::fields::{FieldSpec, Transform};
use crate::plugin::{FieldSyncer, ResourceSyncer};

pub struct PriorityClassSyncer {
    inner: FieldSyncer,
}

impl PriorityClassSyncer {
    pub fn new(cfg: &SyncConfig) -> Self {
        let inner = FieldSyncer::new(priority_class_kind())
            .field(FieldSpec::labels())
            .field(FieldSpec::annotations())
            .field(FieldSpec::forward("value").with_transform(Transform::Ceiling(cfg.priority_class_ceiling)))
            .field(FieldSpec::forward("description"))
            .field(FieldSpec::forward("preemptionPolicy"))
            // a tenant must never become the host's default class
            .field(
                FieldSpec::forward("globalDefault")
                    .with_transform(Transform::Fixed(Value::Bool(false)))
                    .omit_zero(),
            );
        Self { inner }
    }
}

impl ResourceSyncer for PriorityClassSyncer {
    fn kind(&self) -> &ResourceKind {
        self.inner.kind()
    }

    fn new_object(&self) -> DynamicObject {
        DynamicObject::new("", &ApiResource::erase::<PriorityClass>(&()))
    }

    fn fields(&self) -> &[FieldSpec] {
        self.inner.fields()
    }

    fn translate(&self, ctx: &SyncContext<'_>, virtual_obj: &DynamicObject) -> Result<DynamicObject> {
        // reject anything that does not decode as a priority class before it reaches the host
        serde_json::from_value::<PriorityClass>(serde_json::to_value(virtual_obj)?)
            .map_err(|e| Error::validation(format!("{}: {e}", ctx.identity)))?;
        let mut out = build_physical(self.fields(), virtual_obj, ctx);
        out.types = self.new_object().types;
        Ok(out)
    }
}
