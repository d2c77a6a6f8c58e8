//! Ownership marker and label/annotation rewriting for host objects.

use std::collections::BTreeMap;

use kube::core::{DynamicObject, ObjectMeta};
use vcsync_core::{Identity, ObjectKey, ResourceKind, TenantConfig};

use crate::names::{hash_token, join_components, safe_concat_name};

/// Label stamped on every host object created by this engine.
pub const MARKER_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Holds the virtual namespace of a rewritten namespaced object.
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";

/// Prefix of escaped label keys of namespaced objects.
pub const LABEL_PREFIX: &str = "vcluster.loft.sh/label";

/// Origin of a host object: virtual name.
pub const OBJECT_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";

/// Origin of a host object: virtual namespace (namespaced kinds only).
pub const OBJECT_NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";

/// Marker label value for one tenant. Hashed like a physical name when the
/// tenant's components could be re-split into another tenant's.
pub fn marker_value(tenant: &TenantConfig) -> String {
    join_components(None, &[&tenant.host_namespace, &tenant.suffix])
}

/// True if the object carries this tenant's marker.
pub fn is_owned(meta: &ObjectMeta, tenant: &TenantConfig) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(MARKER_LABEL))
        .map(|v| *v == marker_value(tenant))
        .unwrap_or(false)
}

/// Equality selector matching every host object owned by `tenant`.
pub fn marker_selector(tenant: &TenantConfig) -> BTreeMap<String, String> {
    BTreeMap::from([(MARKER_LABEL.to_string(), marker_value(tenant))])
}

/// Escaped host key for a label of a namespaced virtual object.
pub fn convert_label_key(key: &str, tenant: &TenantConfig) -> String {
    safe_concat_name(&[LABEL_PREFIX, &tenant.suffix, "x", &hash_token(key)])
}

/// Host label set for a virtual label set.
///
/// Namespaced objects from every virtual namespace share one host namespace,
/// so their keys are escaped and the virtual namespace is recorded in
/// [`NAMESPACE_LABEL`]. Cluster-scoped objects keep their keys. The marker is
/// always set and overrides any virtual label with the same key.
pub fn rewrite_labels(
    virtual_namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
    tenant: &TenantConfig,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    match virtual_namespace {
        Some(ns) => {
            for (k, v) in labels {
                out.insert(convert_label_key(k, tenant), v.clone());
            }
            out.insert(NAMESPACE_LABEL.to_string(), ns.to_string());
        }
        None => {
            for (k, v) in labels {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out.insert(MARKER_LABEL.to_string(), marker_value(tenant));
    out
}

/// Whether host labels still reflect the latest virtual labels.
pub fn labels_equal(
    virtual_namespace: Option<&str>,
    virtual_labels: &BTreeMap<String, String>,
    physical_labels: &BTreeMap<String, String>,
    tenant: &TenantConfig,
) -> bool {
    rewrite_labels(virtual_namespace, virtual_labels, tenant) == *physical_labels
}

/// Virtual annotations plus the origin annotations used by the reverse index.
pub fn rewrite_annotations(identity: &Identity, annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = annotations.clone();
    out.remove(OBJECT_NAMESPACE_ANNOTATION);
    out.insert(OBJECT_NAME_ANNOTATION.to_string(), identity.name.clone());
    if let Some(ns) = &identity.namespace {
        out.insert(OBJECT_NAMESPACE_ANNOTATION.to_string(), ns.clone());
    }
    out
}

/// Whether host annotations still reflect the latest virtual annotations.
pub fn annotations_equal(
    identity: &Identity,
    virtual_annotations: &BTreeMap<String, String>,
    physical_annotations: &BTreeMap<String, String>,
) -> bool {
    rewrite_annotations(identity, virtual_annotations) == *physical_annotations
}

/// Virtual identity recorded on an owned host object.
pub fn origin_identity(kind: &ResourceKind, meta: &ObjectMeta) -> Option<Identity> {
    let annotations = meta.annotations.as_ref()?;
    let name = annotations.get(OBJECT_NAME_ANNOTATION)?;
    let namespace = annotations.get(OBJECT_NAMESPACE_ANNOTATION).map(|s| s.as_str());
    if kind.namespaced != namespace.is_some() {
        return None;
    }
    Some(Identity::new(kind.clone(), namespace, name))
}

/// Builds a fresh host payload from a virtual object: translated name and
/// namespace, marker label, and none of the virtual store's bookkeeping
/// (resourceVersion, uid, owner references, managed fields, finalizers,
/// generation, timestamps). The virtual object is left untouched.
pub fn stamp_marker(virtual_obj: &DynamicObject, target: &ObjectKey, tenant: &TenantConfig) -> DynamicObject {
    let mut labels = virtual_obj.metadata.labels.clone().unwrap_or_default();
    labels.insert(MARKER_LABEL.to_string(), marker_value(tenant));
    DynamicObject {
        types: virtual_obj.types.clone(),
        metadata: ObjectMeta {
            name: Some(target.name.clone()),
            namespace: target.namespace.clone(),
            labels: Some(labels),
            annotations: virtual_obj.metadata.annotations.clone(),
            ..ObjectMeta::default()
        },
        data: virtual_obj.data.clone(),
    }
}
