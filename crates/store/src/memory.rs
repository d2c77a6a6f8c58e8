//! In-RAM object store with resourceVersion optimistic locking and a
//! broadcast watch feed. Records every call and supports injecting failures
//! and latency, which is what the engine's tests run against.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;
use vcsync_core::{Delta, DeltaKind, ObjectKey, ResourceKind, StoreError};

use crate::{selector_matches, LabelSelector, ObjectStore, Preconditions, StoreResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// A call made against the store, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Get(ObjectKey),
    List,
    Create(ObjectKey),
    Update(ObjectKey),
    UpdateStatus(ObjectKey),
    Delete(ObjectKey),
}

impl StoreCall {
    pub fn op(&self) -> Op {
        match self {
            StoreCall::Get(_) => Op::Get,
            StoreCall::List => Op::List,
            StoreCall::Create(_) => Op::Create,
            StoreCall::Update(_) => Op::Update,
            StoreCall::UpdateStatus(_) => Op::UpdateStatus,
            StoreCall::Delete(_) => Op::Delete,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, StoreCall::Get(_) | StoreCall::List)
    }
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<(ResourceKind, ObjectKey), DynamicObject>,
    next_rv: u64,
    calls: Vec<StoreCall>,
    failures: VecDeque<(Op, StoreError)>,
    latency: Option<Duration>,
}

impl MemState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn take_failure(&mut self, op: Op) -> Option<StoreError> {
        let idx = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(idx).map(|(_, e)| e)
    }
}

pub struct MemoryStore {
    state: Mutex<MemState>,
    events: broadcast::Sender<Delta>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state: Mutex::new(MemState::default()), events }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Mutating calls recorded so far.
    pub fn writes(&self) -> Vec<StoreCall> {
        self.lock().calls.iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// The next call of kind `op` fails with `err`.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().failures.push_back((op, err));
    }

    /// Every call sleeps this long before being served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Direct lookup that bypasses the call log.
    pub fn peek(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(&(kind.clone(), key.clone())).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create-or-replace by an outside actor (a human with kubectl, another
    /// controller). Not recorded as a call; emits a watch event.
    pub fn apply_external(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_key(obj)?;
        let mut state = self.lock();
        let mut next = obj.clone();
        let rv = state.bump();
        match state.objects.get(&(kind.clone(), key.clone())) {
            Some(existing) => {
                next.metadata.uid = existing.metadata.uid.clone();
                next.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
            }
            None => {
                next.metadata.uid = Some(Uuid::new_v4().to_string());
                next.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            }
        }
        next.metadata.resource_version = Some(rv);
        state.objects.insert((kind.clone(), key), next.clone());
        drop(state);
        self.emit(kind, DeltaKind::Applied, &next);
        Ok(next)
    }

    /// Removal by an outside actor. Emits a watch event.
    pub fn remove_external(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<DynamicObject> {
        let removed = self.lock().objects.remove(&(kind.clone(), key.clone()));
        if let Some(obj) = &removed {
            self.emit(kind, DeltaKind::Deleted, obj);
        }
        removed
    }

    fn emit(&self, kind: &ResourceKind, event: DeltaKind, obj: &DynamicObject) {
        // no receivers is fine
        let _ = self.events.send(Delta { kind: kind.clone(), event, object: obj.clone() });
    }

    async fn enter(&self, call: StoreCall) -> StoreResult<()> {
        let latency = {
            let mut state = self.lock();
            let op = call.op();
            state.calls.push(call);
            if let Some(err) = state.take_failure(op) {
                return Err(err);
            }
            state.latency
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        Ok(())
    }
}

fn object_key(obj: &DynamicObject) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid { name: String::new(), reason: "metadata.name is required".into() })
}

fn validate_name(name: &str) -> StoreResult<()> {
    vcsync_core::names::validate_name(name)
        .map_err(|e| StoreError::Invalid { name: name.to_string(), reason: e.to_string() })
}

fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.metadata.labels == b.metadata.labels && a.metadata.annotations == b.metadata.annotations && a.data == b.data
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        self.enter(StoreCall::Get(key.clone())).await?;
        Ok(self.peek(kind, key))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>> {
        self.enter(StoreCall::List).await?;
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((k, key), _)| k == kind && (namespace.is_none() || key.namespace.as_deref() == namespace))
            .filter(|(_, obj)| selector_matches(selector, obj.metadata.labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_key(obj)?;
        self.enter(StoreCall::Create(key.clone())).await?;
        validate_name(&key.name)?;
        if obj.metadata.resource_version.is_some() {
            return Err(StoreError::Invalid {
                name: key.name.clone(),
                reason: "resourceVersion should not be set on objects to be created".into(),
            });
        }
        let mut state = self.lock();
        if state.objects.contains_key(&(kind.clone(), key.clone())) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut created = obj.clone();
        created.metadata.uid = Some(Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.bump());
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        created.metadata.generation = Some(1);
        state.objects.insert((kind.clone(), key.clone()), created.clone());
        drop(state);
        trace!(kind = %kind, key = %key, "created");
        self.emit(kind, DeltaKind::Applied, &created);
        Ok(created)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_key(obj)?;
        self.enter(StoreCall::Update(key.clone())).await?;
        self.replace(kind, key, obj, false)
    }

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_key(obj)?;
        self.enter(StoreCall::UpdateStatus(key.clone())).await?;
        self.replace(kind, key, obj, true)
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey, preconditions: &Preconditions) -> StoreResult<()> {
        self.enter(StoreCall::Delete(key.clone())).await?;
        let mut state = self.lock();
        let stored = state.objects.get(&(kind.clone(), key.clone())).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if preconditions.uid.is_some() && preconditions.uid != stored.metadata.uid {
            return Err(StoreError::Conflict(format!("{key}: uid precondition failed")));
        }
        if preconditions.resource_version.is_some() && preconditions.resource_version != stored.metadata.resource_version {
            return Err(StoreError::Conflict(format!("{key}: resourceVersion precondition failed")));
        }
        let removed = state.objects.remove(&(kind.clone(), key.clone()));
        drop(state);
        if let Some(obj) = removed {
            trace!(kind = %kind, key = %key, "deleted");
            self.emit(kind, DeltaKind::Deleted, &obj);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.events.subscribe()
    }
}

impl MemoryStore {
    /// Main-resource updates keep the stored status; status updates keep everything else.
    fn replace(&self, kind: &ResourceKind, key: ObjectKey, obj: &DynamicObject, status_only: bool) -> StoreResult<DynamicObject> {
        let mut state = self.lock();
        let stored = state
            .objects
            .get(&(kind.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != stored.metadata.resource_version {
            return Err(StoreError::Conflict(key.to_string()));
        }
        if obj.metadata.uid.is_some() && obj.metadata.uid != stored.metadata.uid {
            return Err(StoreError::Conflict(format!("{key}: uid mismatch")));
        }

        let mut next = stored.clone();
        if status_only {
            set_status(&mut next.data, obj.data.get("status").cloned());
        } else {
            next.metadata.labels = obj.metadata.labels.clone();
            next.metadata.annotations = obj.metadata.annotations.clone();
            let status = stored.data.get("status").cloned();
            next.data = obj.data.clone();
            set_status(&mut next.data, status);
        }
        if same_content(&next, &stored) {
            return Ok(stored);
        }
        next.metadata.resource_version = Some(state.bump());
        if !status_only {
            next.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
        }
        state.objects.insert((kind.clone(), key), next.clone());
        drop(state);
        self.emit(kind, DeltaKind::Applied, &next);
        Ok(next)
    }
}

fn set_status(data: &mut serde_json::Value, status: Option<serde_json::Value>) {
    if let Some(map) = data.as_object_mut() {
        match status {
            Some(s) => {
                map.insert("status".to_string(), s);
            }
            None => {
                map.remove("status");
            }
        }
    }
}
