//! Field-level comparison and patch construction between virtual and host objects.
//!
//! Patches are copy-on-write: the observed object is cloned only once a
//! difference is found, and never mutated in place.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vcsync_core::{Identity, ObjectKey, TenantConfig};
use vcsync_mappings::labels::{annotations_equal, labels_equal, rewrite_annotations, rewrite_labels, stamp_marker};

use crate::fields::{Direction, Field, FieldSpec};

/// What a reconcile pass is working on.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext<'a> {
    pub identity: &'a Identity,
    /// Host key the identity translates to.
    pub physical: &'a ObjectKey,
    pub tenant: &'a TenantConfig,
}

fn is_empty(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::Object(m)) => m.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Semantic equality: absent, null, `{}` and `[]` are all "unset"; numbers
/// compare by value; `unordered` arrays compare as multisets. Object members
/// are compared recursively with the same rules.
pub fn semantic_eq(a: Option<&Value>, b: Option<&Value>, unordered: bool) -> bool {
    if is_empty(a) && is_empty(b) {
        return true;
    }
    match (a, b) {
        (Some(a), Some(b)) => values_eq(a, b, unordered),
        _ => false,
    }
}

fn is_zero(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        other => is_empty(other),
    }
}

/// [`semantic_eq`] for one declared field, honouring its `unordered` and
/// `omit_zero` options.
pub fn field_eq(spec: &FieldSpec, a: Option<&Value>, b: Option<&Value>) -> bool {
    if spec.omit_zero && is_zero(a) && is_zero(b) {
        return true;
    }
    semantic_eq(a, b, spec.unordered)
}

fn values_eq(a: &Value, b: &Value, unordered: bool) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Object(x), Value::Object(y)) => {
            x.iter().all(|(k, v)| semantic_eq(Some(v), y.get(k), false))
                && y.iter().all(|(k, v)| x.contains_key(k) || is_empty(Some(v)))
        }
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return false;
            }
            if !unordered {
                return x.iter().zip(y).all(|(a, b)| values_eq(a, b, false));
            }
            let mut used = vec![false; y.len()];
            x.iter().all(|a| {
                let hit = y.iter().enumerate().position(|(i, b)| !used[i] && values_eq(a, b, false));
                match hit {
                    Some(i) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        _ => a == b,
    }
}

fn labels_of(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.clone().unwrap_or_default()
}

fn annotations_of(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.annotations.clone().unwrap_or_default()
}

fn forward_fields(fields: &[FieldSpec]) -> impl Iterator<Item = &FieldSpec> {
    fields.iter().filter(|f| f.direction == Direction::Forward)
}

/// Host payload for a virtual object that has no host counterpart yet.
///
/// Labels and annotations are always rewritten so the marker and origin are
/// present. Declared forward fields carry their transform; backward and
/// ignored fields are left for the host to populate. Undeclared fields are
/// copied as they are.
pub fn build_physical(fields: &[FieldSpec], virtual_obj: &DynamicObject, ctx: &SyncContext<'_>) -> DynamicObject {
    let mut out = stamp_marker(virtual_obj, ctx.physical, ctx.tenant);
    out.metadata.labels = Some(rewrite_labels(ctx.identity.namespace.as_deref(), &labels_of(virtual_obj), ctx.tenant));
    out.metadata.annotations = Some(rewrite_annotations(ctx.identity, &annotations_of(virtual_obj)));
    for spec in fields {
        let Some(path) = spec.path() else { continue };
        match spec.direction {
            Direction::Forward => {
                if spec.transform.is_some() {
                    let desired = spec.desired(path.get(&virtual_obj.data));
                    path.set(&mut out.data, desired);
                }
            }
            Direction::Backward | Direction::Ignored => path.set(&mut out.data, None),
        }
    }
    out
}

/// Host object with every drifted forward field reset to the virtual value,
/// or `None` when the host already matches.
pub fn forward_diff(
    fields: &[FieldSpec],
    virtual_obj: &DynamicObject,
    physical_obj: &DynamicObject,
    ctx: &SyncContext<'_>,
) -> Option<DynamicObject> {
    let mut patch: Option<DynamicObject> = None;
    for spec in forward_fields(fields) {
        match &spec.field {
            Field::Labels => {
                let (vns, labels) = (ctx.identity.namespace.as_deref(), labels_of(virtual_obj));
                if !labels_equal(vns, &labels, &labels_of(physical_obj), ctx.tenant) {
                    patch.get_or_insert_with(|| physical_obj.clone()).metadata.labels =
                        Some(rewrite_labels(vns, &labels, ctx.tenant));
                }
            }
            Field::Annotations => {
                let annotations = annotations_of(virtual_obj);
                if !annotations_equal(ctx.identity, &annotations, &annotations_of(physical_obj)) {
                    patch.get_or_insert_with(|| physical_obj.clone()).metadata.annotations =
                        Some(rewrite_annotations(ctx.identity, &annotations));
                }
            }
            Field::Data(path) => {
                let desired = spec.desired(path.get(&virtual_obj.data));
                if !field_eq(spec, desired.as_ref(), path.get(&physical_obj.data)) {
                    let p = patch.get_or_insert_with(|| physical_obj.clone());
                    path.set(&mut p.data, desired);
                }
            }
        }
    }
    patch
}

/// Virtual object with every drifted backward field set to the host value,
/// or `None` when the virtual side already matches.
pub fn backward_diff(
    fields: &[FieldSpec],
    physical_obj: &DynamicObject,
    virtual_obj: &DynamicObject,
) -> Option<DynamicObject> {
    let mut patch: Option<DynamicObject> = None;
    for spec in fields.iter().filter(|f| f.direction == Direction::Backward) {
        let Some(path) = spec.path() else { continue };
        let host = path.get(&physical_obj.data);
        if !field_eq(spec, host, path.get(&virtual_obj.data)) {
            let p = patch.get_or_insert_with(|| virtual_obj.clone());
            path.set(&mut p.data, host.cloned());
        }
    }
    patch
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Rough size of a change, for logs.
pub fn diff_summary(target: &Value, base: &Value) -> DiffSummary {
    fn walk(a: &Value, b: &Value, s: &mut DiffSummary) {
        match (a, b) {
            (Value::Object(ao), Value::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Value::Array(aa), Value::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use serde_json::json;
    use vcsync_core::ResourceKind;
    use vcsync_mappings::labels::MARKER_LABEL;

    use crate::fields::Transform;

    fn obj(name: &str, labels: &[(&str, &str)], data: Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn unset_values_are_equal() {
        assert!(semantic_eq(None, Some(&Value::Null), false));
        assert!(semantic_eq(Some(&json!({})), Some(&json!([])), false));
        assert!(semantic_eq(Some(&json!({ "a": null })), Some(&json!({})), false));
        assert!(!semantic_eq(Some(&json!("")), None, false));
        assert!(semantic_eq(Some(&json!(1)), Some(&json!(1.0)), false));
    }

    #[test]
    fn unordered_arrays_compare_as_multisets() {
        let a = json!(["ro", "noatime", "ro"]);
        let b = json!(["noatime", "ro", "ro"]);
        let c = json!(["noatime", "noatime", "ro"]);
        assert!(!semantic_eq(Some(&a), Some(&b), false));
        assert!(semantic_eq(Some(&a), Some(&b), true));
        assert!(!semantic_eq(Some(&a), Some(&c), true));
    }

    #[test]
    fn omitted_zero_values_match_absent() {
        let plain = FieldSpec::forward("globalDefault");
        let omit = FieldSpec::forward("globalDefault").omit_zero();
        assert!(!field_eq(&plain, Some(&json!(false)), None));
        assert!(field_eq(&omit, Some(&json!(false)), None));
        assert!(field_eq(&omit, None, Some(&json!(0))));
        assert!(field_eq(&omit, Some(&json!("")), Some(&Value::Null)));
        assert!(!field_eq(&omit, Some(&json!(false)), Some(&json!(true))));
        assert!(!field_eq(&omit, None, Some(&json!(1))));
    }

    #[test]
    fn forward_diff_is_copy_on_write() {
        let tenant = TenantConfig::new("host", "s");
        let id = Identity::new(ResourceKind::cluster("g", "v1", "K"), None, "a");
        let target = ObjectKey::new(None, "vcluster-a-x-host-x-s");
        let ctx = SyncContext { identity: &id, physical: &target, tenant: &tenant };
        let fields = vec![
            FieldSpec::labels(),
            FieldSpec::forward("value").with_transform(Transform::Ceiling(10)),
        ];
        let v = obj("a", &[("team", "x")], json!({ "value": 50 }));
        let created = build_physical(&fields, &v, &ctx);
        assert_eq!(created.data["value"], json!(10));
        assert!(created.metadata.labels.as_ref().unwrap().contains_key(MARKER_LABEL));
        assert_eq!(forward_diff(&fields, &v, &created, &ctx), None);

        let edited = obj("a", &[("team", "y")], json!({ "value": 5 }));
        let before = created.clone();
        let patch = forward_diff(&fields, &edited, &created, &ctx).unwrap();
        assert_eq!(created, before);
        assert_eq!(patch.data["value"], json!(5));
        assert_eq!(patch.metadata.labels.as_ref().unwrap()["team"], "y");
    }

    #[test]
    fn backward_fields_are_not_copied_on_create() {
        let tenant = TenantConfig::new("host", "s");
        let id = Identity::new(ResourceKind::cluster("g", "v1", "K"), None, "a");
        let target = ObjectKey::new(None, "p");
        let ctx = SyncContext { identity: &id, physical: &target, tenant: &tenant };
        let fields = vec![FieldSpec::backward("status"), FieldSpec::ignored("spec.hostOnly")];
        let v = obj("a", &[], json!({ "spec": { "keep": 1, "hostOnly": 2 }, "status": { "phase": "Old" } }));
        let created = build_physical(&fields, &v, &ctx);
        assert_eq!(created.data, json!({ "spec": { "keep": 1 } }));

        let mut host = created.clone();
        host.data["status"] = json!({ "phase": "Ready" });
        let patch = backward_diff(&fields, &host, &v).unwrap();
        assert_eq!(patch.data["status"], json!({ "phase": "Ready" }));
        assert_eq!(patch.data["spec"]["hostOnly"], json!(2));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }
}
