#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use vcsync_core::{DeltaKind, ObjectKey, ResourceKind};
use vcsync_store::{LabelSelector, MemoryStore, ObjectStore};

fn pc() -> ResourceKind {
    ResourceKind::cluster("scheduling.k8s.io", "v1", "PriorityClass")
}

fn cm() -> ResourceKind {
    ResourceKind::namespaced("", "v1", "ConfigMap")
}

fn obj(name: &str, ns: Option<&str>, labels: &[(&str, &str)]) -> DynamicObject {
    let mut meta = serde_json::json!({ "name": name });
    if let Some(ns) = ns {
        meta["namespace"] = serde_json::Value::String(ns.to_string());
    }
    if !labels.is_empty() {
        let l: BTreeMap<_, _> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        meta["labels"] = serde_json::to_value(l).unwrap();
    }
    serde_json::from_value(serde_json::json!({ "apiVersion": "v1", "kind": "Object", "metadata": meta })).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_external_changes_in_order() {
    let store = MemoryStore::new();
    let mut rx = store.subscribe();

    let a1 = store.apply_external(&pc(), &obj("a", None, &[])).unwrap();
    let a2 = store.apply_external(&pc(), &obj("a", None, &[("tier", "gold")])).unwrap();
    store.apply_external(&cm(), &obj("a", Some("ns"), &[])).unwrap();
    store.remove_external(&pc(), &ObjectKey::new(None, "a"));
    // removing twice emits nothing
    assert!(store.remove_external(&pc(), &ObjectKey::new(None, "a")).is_none());

    let mut seen = Vec::new();
    while let Ok(d) = rx.try_recv() {
        seen.push((d.kind.kind.clone(), d.event, d.object.metadata.resource_version.clone()));
    }
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], ("PriorityClass".to_string(), DeltaKind::Applied, a1.metadata.resource_version.clone()));
    assert_eq!(seen[1].2, a2.metadata.resource_version);
    assert_eq!(seen[2].0, "ConfigMap");
    assert_eq!(seen[3].1, DeltaKind::Deleted);

    // replacing keeps the uid, bumps the resourceVersion
    assert_eq!(a1.metadata.uid, a2.metadata.uid);
    assert_ne!(a1.metadata.resource_version, a2.metadata.resource_version);
    assert!(store.peek(&pc(), &ObjectKey::new(None, "a")).is_none());
    assert!(store.peek(&cm(), &ObjectKey::new(Some("ns"), "a")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_filters_by_kind_namespace_and_selector() {
    let store = MemoryStore::new();
    store.apply_external(&cm(), &obj("x", Some("team-a"), &[("owner", "s1")])).unwrap();
    store.apply_external(&cm(), &obj("y", Some("team-a"), &[("owner", "s2")])).unwrap();
    store.apply_external(&cm(), &obj("z", Some("team-b"), &[("owner", "s1")])).unwrap();
    store.apply_external(&pc(), &obj("x", None, &[("owner", "s1")])).unwrap();

    let all = store.list(&cm(), None, &LabelSelector::new()).await.unwrap();
    assert_eq!(all.len(), 3);

    let owned = LabelSelector::from([("owner".to_string(), "s1".to_string())]);
    let mut names: Vec<_> = store
        .list(&cm(), Some("team-a"), &owned)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|o| o.metadata.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["x"]);

    assert_eq!(store.list(&cm(), None, &owned).await.unwrap().len(), 2);
    assert_eq!(store.list(&pc(), None, &owned).await.unwrap().len(), 1);
    // external changes are not calls
    assert_eq!(store.calls().len(), 4);
}
