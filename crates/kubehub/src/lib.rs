//! vcsync kubehub: [`ObjectStore`] over a live API server via `kube`.
//!
//! Kinds are resolved through discovery once at startup; each watched kind
//! runs a list+watch loop that feeds the store's broadcast channel.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vcsync_core::{Delta, DeltaKind, ObjectKey, ResourceKind, StoreError};
use vcsync_store::{LabelSelector, ObjectStore, Preconditions, StoreResult};

const EVENT_CAPACITY: usize = 4096;
const FIELD_MANAGER: &str = "vcsync";

/// Object store backed by one cluster's API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    resources: Arc<FxHashMap<ResourceKind, ApiResource>>,
    events: broadcast::Sender<Delta>,
}

impl KubeStore {
    /// Resolves every kind through discovery; unknown kinds fail startup.
    pub async fn connect(client: Client, kinds: &[ResourceKind]) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let mut resources = FxHashMap::default();
        for kind in kinds {
            let (ar, namespaced) = find_api_resource(&discovery, kind)?;
            if namespaced != kind.namespaced {
                return Err(anyhow!("{kind}: scope mismatch (server says namespaced={namespaced})"));
            }
            resources.insert(kind.clone(), ar);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { client, resources: Arc::new(resources), events })
    }

    fn resource(&self, kind: &ResourceKind) -> StoreResult<&ApiResource> {
        self.resources
            .get(kind)
            .ok_or_else(|| StoreError::Unavailable(format!("kind {kind} was not resolved at startup")))
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let ar = self.resource(kind)?;
        Ok(match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        })
    }

    /// Spawns a list+watch loop for every resolved kind. Events for
    /// `namespace` only, when set; cluster-scoped kinds ignore it.
    pub fn start_watchers(&self, namespace: Option<&str>) {
        for kind in self.resources.keys() {
            let store = self.clone();
            let kind = kind.clone();
            let ns = namespace.map(|s| s.to_string());
            tokio::spawn(async move {
                loop {
                    match store.watch_kind(&kind, ns.as_deref()).await {
                        Ok(()) => warn!(kind = %kind, "watch stream ended; restarting"),
                        Err(e) => warn!(kind = %kind, error = %e, "watcher failed; restarting"),
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            });
        }
    }

    async fn watch_kind(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<()> {
        let api = self.api(kind, namespace)?;
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(kind = %kind, ns = ?namespace, "watcher started");
        while let Some(ev) = stream.try_next().await? {
            match ev {
                Event::Applied(o) => self.emit(kind, DeltaKind::Applied, o),
                Event::Deleted(o) => self.emit(kind, DeltaKind::Deleted, o),
                Event::Restarted(list) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    for o in list {
                        self.emit(kind, DeltaKind::Applied, o);
                    }
                }
            }
        }
        Ok(())
    }

    fn emit(&self, kind: &ResourceKind, event: DeltaKind, mut object: DynamicObject) {
        strip_managed_fields(&mut object);
        let _ = self.events.send(Delta { kind: kind.clone(), event, object });
    }
}

fn find_api_resource(discovery: &Discovery, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
    let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;
}

/// Maps API server responses onto the store error taxonomy.
pub fn map_kube_error(name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(name.to_string()),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(name.to_string()),
            409 => StoreError::Conflict(format!("{name}: {}", resp.message)),
            400 | 422 => StoreError::Invalid { name: name.to_string(), reason: resp.message },
            _ => StoreError::Unavailable(format!("{name}: {} ({})", resp.message, resp.code)),
        },
        other => StoreError::Unavailable(format!("{name}: {other}")),
    }
}

fn selector_string(selector: &LabelSelector) -> String {
    selector.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

fn object_name(obj: &DynamicObject) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid { name: String::new(), reason: "metadata.name is required".into() })
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        let api = self.api(kind, key.namespace.as_deref())?;
        let mut obj = api.get_opt(&key.name).await.map_err(|e| map_kube_error(&key.name, e))?;
        if let Some(o) = obj.as_mut() {
            strip_managed_fields(o);
        }
        Ok(obj)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let api = self.api(kind, namespace)?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector_string(selector));
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_error(&kind.gvk_key(), e))?;
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                strip_managed_fields(&mut o);
                o
            })
            .collect())
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_name(obj)?;
        let api = self.api(kind, key.namespace.as_deref())?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.create(&pp, obj).await.map_err(|e| map_kube_error(&key.name, e))
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_name(obj)?;
        let api = self.api(kind, key.namespace.as_deref())?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.replace(&key.name, &pp, obj).await.map_err(|e| map_kube_error(&key.name, e))
    }

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_name(obj)?;
        let api = self.api(kind, key.namespace.as_deref())?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid { name: key.name.clone(), reason: e.to_string() })?;
        api.replace_status(&key.name, &pp, body).await.map_err(|e| map_kube_error(&key.name, e))
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey, preconditions: &Preconditions) -> StoreResult<()> {
        let api = self.api(kind, key.namespace.as_deref())?;
        let dp = DeleteParams {
            preconditions: Some(kube::api::Preconditions {
                uid: preconditions.uid.clone(),
                resource_version: preconditions.resource_version.clone(),
            }),
            ..Default::default()
        };
        api.delete(&key.name, &dp).await.map_err(|e| map_kube_error(&key.name, e))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.events.subscribe()
    }
}
