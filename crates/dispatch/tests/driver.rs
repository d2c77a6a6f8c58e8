#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use vcsync_core::{Error, ErrorClass, Identity, ObjectKey, ResourceKind, StoreError, SyncConfig, TenantConfig};
use vcsync_dispatch::SyncDriver;
use vcsync_mappings::labels::{marker_value, MARKER_LABEL, OBJECT_NAME_ANNOTATION};
use vcsync_mappings::resources::priority_class_kind;
use vcsync_mappings::{MapperRegistry, ResourceMapper};
use vcsync_store::{MemoryStore, ObjectStore, Op, StoreCall};
use vcsync_syncer::resources::builtin;
use vcsync_syncer::{FieldSpec, FieldSyncer, HostDeletionPolicy, Reconciler, SyncerSet};

fn config() -> SyncConfig {
    let mut cfg = SyncConfig::new(TenantConfig::new("team-a", "s1"));
    cfg.workers = 2;
    cfg.backoff_initial = Duration::from_millis(20);
    cfg.backoff_max = Duration::from_millis(200);
    cfg.op_timeout = Duration::from_secs(2);
    cfg.resync_period = Duration::ZERO;
    cfg
}

struct Running {
    virt: Arc<MemoryStore>,
    host: Arc<MemoryStore>,
    driver: Arc<SyncDriver>,
    stop: Option<(oneshot::Sender<()>, JoinHandle<vcsync_core::Result<()>>)>,
}

impl Running {
    fn build(mappers: MapperRegistry, syncers: SyncerSet) -> Self {
        Self::build_with(&config(), mappers, syncers)
    }

    fn build_with(cfg: &SyncConfig, mappers: MapperRegistry, syncers: SyncerSet) -> Self {
        let virt = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryStore::new());
        let v: Arc<dyn ObjectStore> = virt.clone();
        let h: Arc<dyn ObjectStore> = host.clone();
        let reconciler = Arc::new(Reconciler::new(v, h, Arc::new(mappers), Arc::new(syncers), cfg.op_timeout));
        let driver = Arc::new(SyncDriver::new(reconciler, cfg));
        Self { virt, host, driver, stop: None }
    }

    fn priority_classes() -> Self {
        let (mappers, syncers) = builtin(&config()).unwrap();
        Self::build(mappers, syncers)
    }

    fn start(&mut self) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&self.driver).run(async move {
            let _ = rx.await;
        }));
        self.stop = Some((tx, handle));
    }

    async fn stop(mut self) {
        if let Some((tx, handle)) = self.stop.take() {
            let _ = tx.send(());
            handle.await.unwrap().unwrap();
        }
    }

    fn physical(&self, id: &Identity) -> ObjectKey {
        self.driver.reconciler().physical_key(id).unwrap()
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn priority_class(name: &str, value: i64) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "scheduling.k8s.io/v1",
        "kind": "PriorityClass",
        "metadata": { "name": name },
        "value": value,
    }))
    .unwrap()
}

fn pc_id(name: &str) -> Identity {
    Identity::new(priority_class_kind(), None, name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_resync_syncs_existing_objects() {
    let mut r = Running::priority_classes();
    let kind = priority_class_kind();
    r.virt.apply_external(&kind, &priority_class("a", 1)).unwrap();
    r.virt.apply_external(&kind, &priority_class("b", 2)).unwrap();
    r.start();

    let (ka, kb) = (r.physical(&pc_id("a")), r.physical(&pc_id("b")));
    eventually("both host objects", || r.host.peek(&kind, &ka).is_some() && r.host.peek(&kind, &kb).is_some()).await;
    r.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_events_drive_create_update_and_delete() {
    let mut r = Running::priority_classes();
    let kind = priority_class_kind();
    r.start();

    r.virt.apply_external(&kind, &priority_class("live", 10)).unwrap();
    let key = r.physical(&pc_id("live"));
    eventually("create", || r.host.peek(&kind, &key).is_some()).await;

    let mut v = r.virt.peek(&kind, &ObjectKey::new(None, "live")).unwrap();
    v.data["value"] = json!(20);
    r.virt.apply_external(&kind, &v).unwrap();
    eventually("update", || r.host.peek(&kind, &key).map(|p| p.data["value"] == json!(20)).unwrap_or(false)).await;

    r.virt.remove_external(&kind, &ObjectKey::new(None, "live"));
    eventually("delete", || r.host.peek(&kind, &key).is_none()).await;
    r.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failure_is_retried_with_backoff() {
    let mut r = Running::priority_classes();
    let kind = priority_class_kind();
    r.host.fail_next(Op::Create, StoreError::Unavailable("api server restarting".into()));
    r.virt.apply_external(&kind, &priority_class("retry", 1)).unwrap();
    r.start();

    let key = r.physical(&pc_id("retry"));
    eventually("create after retry", || r.host.peek(&kind, &key).is_some()).await;
    let creates = r.host.calls().into_iter().filter(|c| *c == StoreCall::Create(key.clone())).count();
    assert_eq!(creates, 2);
    r.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_host_object_is_recreated() {
    let mut r = Running::priority_classes();
    let kind = priority_class_kind();
    r.virt.apply_external(&kind, &priority_class("heal", 1)).unwrap();
    r.start();
    let key = r.physical(&pc_id("heal"));
    eventually("create", || r.host.peek(&kind, &key).is_some()).await;
    let uid = r.host.peek(&kind, &key).unwrap().metadata.uid;

    r.host.remove_external(&kind, &key);
    eventually("recreate", || r.host.peek(&kind, &key).map(|p| p.metadata.uid != uid).unwrap_or(false)).await;
    r.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orphans_found_on_resync_are_deleted() {
    let mut r = Running::priority_classes();
    let kind = priority_class_kind();

    // leftover from an earlier run: owned host object, no virtual object
    let tenant = TenantConfig::new("team-a", "s1");
    let key = r.physical(&pc_id("gone"));
    let mut orphan = priority_class(&key.name, 1);
    orphan.metadata.labels = Some([(MARKER_LABEL.to_string(), marker_value(&tenant))].into());
    orphan.metadata.annotations = Some([(OBJECT_NAME_ANNOTATION.to_string(), "gone".to_string())].into());
    r.host.apply_external(&kind, &orphan).unwrap();
    // not ours: must survive
    let stranger = priority_class("system-critical", 5);
    r.host.apply_external(&kind, &stranger).unwrap();

    r.start();
    eventually("orphan delete", || r.host.peek(&kind, &key).is_none()).await;
    assert!(r.host.peek(&kind, &ObjectKey::new(None, "system-critical")).is_some());
    r.stop().await;
}

fn widget_kind() -> ResourceKind {
    ResourceKind::namespaced("example.com", "v1", "Widget")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_deletion_can_propagate_to_virtual() {
    let cfg = config();
    let mut mappers = MapperRegistry::new();
    mappers.register(ResourceMapper::translate(widget_kind(), cfg.tenant.clone())).unwrap();
    let mut syncers = SyncerSet::new();
    syncers
        .register(Arc::new(
            FieldSyncer::new(widget_kind())
                .field(FieldSpec::labels())
                .field(FieldSpec::forward("spec"))
                .deletion_policy(HostDeletionPolicy::DeleteVirtual),
        ))
        .unwrap();
    let mut r = Running::build(mappers, syncers);
    let w: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": { "name": "w1", "namespace": "apps" },
        "spec": { "size": 1 },
    }))
    .unwrap();
    r.virt.apply_external(&widget_kind(), &w).unwrap();
    r.start();

    let id = Identity::new(widget_kind(), Some("apps"), "w1");
    let key = r.physical(&id);
    eventually("create", || r.host.peek(&widget_kind(), &key).is_some()).await;
    // let the create's own watch events drain first
    tokio::time::sleep(Duration::from_millis(100)).await;

    r.host.remove_external(&widget_kind(), &key);
    eventually("virtual delete", || r.virt.peek(&widget_kind(), &id.key()).is_none()).await;
    // and it stays gone on the host
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(r.host.peek(&widget_kind(), &key).is_none());
    r.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_classes_decide_requeue() {
    let r = Running::priority_classes();
    let kind = priority_class_kind();
    let queue = r.driver.queue();

    // transient: requeued after the back-off delay
    r.virt.fail_next(Op::Get, StoreError::Unavailable("flaky".into()));
    r.driver.process(&pc_id("t")).await;
    assert!(queue.is_empty());
    eventually("requeue", || queue.len() == 1).await;

    // programming error (ambiguous identity): reported, not requeued
    let tenant = TenantConfig::new("team-a", "s1");
    let mapper = r.driver.reconciler().mappers().resolve(&kind).unwrap();
    for name in ["dup-one", "dup-two"] {
        let mut o = priority_class(name, 1);
        o.metadata.labels = Some([(MARKER_LABEL.to_string(), marker_value(&tenant))].into());
        o.metadata.annotations = Some([(OBJECT_NAME_ANNOTATION.to_string(), "amb".to_string())].into());
        mapper.index().observe(&o);
    }
    let before = queue.len();
    r.driver.process(&pc_id("amb")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.len(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_lists_respect_the_operation_deadline() {
    let mut cfg = config();
    cfg.op_timeout = Duration::from_millis(200);
    let (mappers, syncers) = builtin(&cfg).unwrap();
    let r = Running::build_with(&cfg, mappers, syncers);
    r.virt.apply_external(&priority_class_kind(), &priority_class("slow", 1)).unwrap();
    r.host.set_latency(Some(Duration::from_secs(5)));

    let started = std::time::Instant::now();
    let err = r.driver.resync().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2), "resync waited {:?}", started.elapsed());
    assert!(matches!(err, Error::Store(StoreError::Timeout(_))), "{err:?}");
    assert_eq!(err.class(), ErrorClass::Transient);
}
