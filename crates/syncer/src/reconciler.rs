//! One reconciliation pass per virtual identity.
//!
//! A pass reads both sides fresh, classifies the pair and applies at most one
//! write per direction. Nothing is cached between passes except the reverse
//! index; stale snapshots surface as conflicts and are retried by the driver.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use vcsync_core::{Error, Identity, ObjectKey, ResourceKind, Result, StoreError, TenantConfig};
use vcsync_mappings::labels::is_owned;
use vcsync_mappings::{validate_name, MapperRegistry, ResourceMapper};
use vcsync_store::{ObjectStore, Preconditions, StoreResult};

use crate::diff::{diff_summary, SyncContext};
use crate::plugin::{writes_status, ResourceSyncer, SyncerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Virtual exists, host does not.
    ForwardCreate,
    /// Both exist and the host object is ours.
    Converge,
    /// Only our host object is left.
    ForwardDelete,
    /// Neither exists, or only a host object we do not own.
    Noop,
    /// Virtual exists but the translated name is taken by an object we do not own.
    Foreign,
}

/// Pure classification from presence and ownership.
pub fn classify(
    virtual_obj: Option<&DynamicObject>,
    physical_obj: Option<&DynamicObject>,
    tenant: &TenantConfig,
) -> SyncState {
    let owned = physical_obj.map(|p| is_owned(&p.metadata, tenant));
    match (virtual_obj.is_some(), owned) {
        (true, None) => SyncState::ForwardCreate,
        (true, Some(true)) => SyncState::Converge,
        (true, Some(false)) => SyncState::Foreign,
        (false, Some(true)) => SyncState::ForwardDelete,
        (false, _) => SyncState::Noop,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated { forward: bool, backward: bool },
    /// Both sides already agree.
    Unchanged,
    Deleted,
    Noop,
    /// Mirrored kind, or the syncer declined to create.
    Skipped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "created",
            SyncOutcome::Updated { .. } => "updated",
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Deleted => "deleted",
            SyncOutcome::Noop => "noop",
            SyncOutcome::Skipped => "skipped",
        }
    }

    /// Whether the pass wrote to either store.
    pub fn wrote(&self) -> bool {
        matches!(self, SyncOutcome::Created | SyncOutcome::Updated { .. } | SyncOutcome::Deleted)
    }
}

fn record_write(op: &'static str) {
    counter!("vcsync_store_writes_total", 1u64, "op" => op);
}

fn without_status(data: &Value) -> Value {
    let mut v = data.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub struct Reconciler {
    virtual_store: Arc<dyn ObjectStore>,
    host_store: Arc<dyn ObjectStore>,
    mappers: Arc<MapperRegistry>,
    syncers: Arc<SyncerSet>,
    op_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        virtual_store: Arc<dyn ObjectStore>,
        host_store: Arc<dyn ObjectStore>,
        mappers: Arc<MapperRegistry>,
        syncers: Arc<SyncerSet>,
        op_timeout: Duration,
    ) -> Self {
        Self { virtual_store, host_store, mappers, syncers, op_timeout }
    }

    pub fn virtual_store(&self) -> &Arc<dyn ObjectStore> {
        &self.virtual_store
    }

    pub fn host_store(&self) -> &Arc<dyn ObjectStore> {
        &self.host_store
    }

    pub fn mappers(&self) -> &Arc<MapperRegistry> {
        &self.mappers
    }

    pub fn syncers(&self) -> &Arc<SyncerSet> {
        &self.syncers
    }

    /// Runs one store call under the per-operation deadline; an expired
    /// deadline becomes [`StoreError::Timeout`].
    pub async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout).into()),
        }
    }

    /// Runs one pass for `identity` and records its outcome.
    pub async fn reconcile(&self, identity: &Identity) -> Result<SyncOutcome> {
        let started = Instant::now();
        let res = self.reconcile_inner(identity).await;
        histogram!("vcsync_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        let kind = identity.kind.kind.clone();
        match &res {
            Ok(outcome) => {
                counter!("vcsync_reconcile_total", 1u64, "kind" => kind, "outcome" => outcome.as_str());
            }
            Err(e) => {
                counter!("vcsync_reconcile_total", 1u64, "kind" => kind.clone(), "outcome" => "error");
                counter!("vcsync_reconcile_errors_total", 1u64, "kind" => kind, "class" => e.class().as_str());
            }
        }
        res
    }

    async fn reconcile_inner(&self, identity: &Identity) -> Result<SyncOutcome> {
        let mapper = self.mappers.resolve(&identity.kind)?;
        if mapper.is_mirror() {
            return Ok(SyncOutcome::Skipped);
        }
        let syncer = self.syncers.get(&identity.kind)?;
        let target = mapper.virtual_to_host(identity);
        if let Some(claimed) = mapper.index().claimant(identity)? {
            if claimed != target {
                warn!(identity = %identity, claimed = %claimed, physical = %target, "identity claimed by a host object at another name");
            }
        }

        let kind = &identity.kind;
        let virtual_obj = self.bounded(self.virtual_store.get(kind, &identity.key())).await?;
        let physical_obj = self.bounded(self.host_store.get(kind, &target)).await?;
        let ctx = SyncContext { identity, physical: &target, tenant: mapper.tenant() };

        match classify(virtual_obj.as_ref(), physical_obj.as_ref(), mapper.tenant()) {
            SyncState::ForwardCreate => match virtual_obj {
                Some(v) => self.forward_create(&*syncer, &mapper, &ctx, &v).await,
                None => Ok(SyncOutcome::Noop),
            },
            SyncState::Converge => match (virtual_obj, physical_obj) {
                (Some(v), Some(p)) => self.converge(&*syncer, &mapper, &ctx, &v, &p).await,
                _ => Ok(SyncOutcome::Noop),
            },
            SyncState::ForwardDelete => match physical_obj {
                Some(p) => self.forward_delete(&mapper, &ctx, &p).await,
                None => Ok(SyncOutcome::Noop),
            },
            SyncState::Foreign => {
                error!(identity = %identity, physical = %target, "host name taken by an object this virtual cluster does not own");
                Err(Error::Foreign { physical: target.to_string() })
            }
            SyncState::Noop => {
                debug!(identity = %identity, "nothing to reconcile");
                Ok(SyncOutcome::Noop)
            }
        }
    }

    async fn forward_create(
        &self,
        syncer: &dyn ResourceSyncer,
        mapper: &ResourceMapper,
        ctx: &SyncContext<'_>,
        virtual_obj: &DynamicObject,
    ) -> Result<SyncOutcome> {
        if !syncer.forward_create_needed(virtual_obj) {
            debug!(identity = %ctx.identity, "create not needed");
            return Ok(SyncOutcome::Skipped);
        }
        validate_name(&ctx.physical.name)?;
        let payload = syncer.translate(ctx, virtual_obj)?;
        info!(identity = %ctx.identity, physical = %ctx.physical, "create physical object");
        let created = match self.bounded(self.host_store.create(syncer.kind(), &payload)).await {
            Ok(o) => o,
            Err(e) => {
                warn!(identity = %ctx.identity, physical = %ctx.physical, error = %e, "create physical object failed");
                return Err(e);
            }
        };
        record_write("create");
        mapper.index().observe(&created);
        Ok(SyncOutcome::Created)
    }

    async fn converge(
        &self,
        syncer: &dyn ResourceSyncer,
        mapper: &ResourceMapper,
        ctx: &SyncContext<'_>,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<SyncOutcome> {
        mapper.index().observe(physical_obj);

        let forward = match syncer.forward_update_needed(ctx, virtual_obj, physical_obj) {
            Ok(true) => match syncer.forward_diff(ctx, virtual_obj, physical_obj) {
                Ok(Some(patch)) => self.apply_forward(syncer.kind(), mapper, ctx, physical_obj, patch).await.map(|_| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            },
            Ok(false) => Ok(false),
            Err(e) => Err(e),
        };
        let backward = match syncer.backward_update_needed(ctx, physical_obj, virtual_obj) {
            Ok(true) => match syncer.backward_diff(ctx, physical_obj, virtual_obj) {
                Ok(Some(patch)) => self.apply_backward(syncer, ctx, virtual_obj, patch).await.map(|_| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            },
            Ok(false) => Ok(false),
            Err(e) => Err(e),
        };

        match (forward, backward) {
            (Ok(false), Ok(false)) => {
                debug!(identity = %ctx.identity, "in sync");
                Ok(SyncOutcome::Unchanged)
            }
            (Ok(forward), Ok(backward)) => Ok(SyncOutcome::Updated { forward, backward }),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(f), Err(b)) => Err(Error::Converge { forward: Box::new(f), backward: Box::new(b) }),
        }
    }

    async fn apply_forward(
        &self,
        kind: &ResourceKind,
        mapper: &ResourceMapper,
        ctx: &SyncContext<'_>,
        physical_obj: &DynamicObject,
        patch: DynamicObject,
    ) -> Result<()> {
        let summary = diff_summary(&serde_json::to_value(&patch)?, &serde_json::to_value(physical_obj)?);
        info!(
            identity = %ctx.identity,
            physical = %ctx.physical,
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "update physical object"
        );
        let updated = self.bounded(self.host_store.update(kind, &patch)).await.map_err(|e| {
            warn!(identity = %ctx.identity, physical = %ctx.physical, error = %e, "forward update failed");
            e
        })?;
        record_write("update");
        mapper.index().observe(&updated);
        Ok(())
    }

    /// Status changes go through the status subresource; anything else is a plain update.
    async fn apply_backward(
        &self,
        syncer: &dyn ResourceSyncer,
        ctx: &SyncContext<'_>,
        virtual_obj: &DynamicObject,
        mut patch: DynamicObject,
    ) -> Result<()> {
        let kind = syncer.kind();
        let status_changed = writes_status(syncer) && patch.data.get("status") != virtual_obj.data.get("status");
        let rest_changed = !status_changed || without_status(&patch.data) != without_status(&virtual_obj.data);
        info!(identity = %ctx.identity, status = status_changed, "update virtual object from host");
        if rest_changed {
            let updated = self.bounded(self.virtual_store.update(kind, &patch)).await.map_err(|e| {
                warn!(identity = %ctx.identity, error = %e, "backward update failed");
                e
            })?;
            record_write("update");
            patch.metadata.resource_version = updated.metadata.resource_version;
        }
        if status_changed {
            self.bounded(self.virtual_store.update_status(kind, &patch)).await.map_err(|e| {
                warn!(identity = %ctx.identity, error = %e, "backward status update failed");
                e
            })?;
            record_write("update_status");
        }
        Ok(())
    }

    async fn forward_delete(
        &self,
        mapper: &ResourceMapper,
        ctx: &SyncContext<'_>,
        physical_obj: &DynamicObject,
    ) -> Result<SyncOutcome> {
        if !is_owned(&physical_obj.metadata, mapper.tenant()) {
            error!(identity = %ctx.identity, physical = %ctx.physical, "refusing to delete unowned host object");
            return Err(Error::NotOwned { physical: ctx.physical.to_string() });
        }
        info!(identity = %ctx.identity, physical = %ctx.physical, "delete physical object");
        let pre = Preconditions::of(physical_obj);
        match self.bounded(self.host_store.delete(mapper.kind(), ctx.physical, &pre)).await {
            Ok(()) => record_write("delete"),
            Err(Error::Store(StoreError::NotFound(_))) => debug!(physical = %ctx.physical, "already gone"),
            Err(e) => {
                warn!(identity = %ctx.identity, physical = %ctx.physical, error = %e, "delete physical object failed");
                return Err(e);
            }
        }
        mapper.index().forget(ctx.physical);
        Ok(SyncOutcome::Deleted)
    }

    /// Deletes the virtual object after its owned host counterpart went away.
    /// Does nothing if the host object is back by now.
    pub async fn delete_virtual(&self, identity: &Identity) -> Result<SyncOutcome> {
        let mapper = self.mappers.resolve(&identity.kind)?;
        if mapper.is_mirror() {
            return Ok(SyncOutcome::Skipped);
        }
        let target = mapper.virtual_to_host(identity);
        if let Some(p) = self.bounded(self.host_store.get(&identity.kind, &target)).await? {
            if is_owned(&p.metadata, mapper.tenant()) {
                debug!(identity = %identity, physical = %target, "host object exists again; keeping virtual");
                return Ok(SyncOutcome::Noop);
            }
        }
        let Some(v) = self.bounded(self.virtual_store.get(&identity.kind, &identity.key())).await? else {
            return Ok(SyncOutcome::Noop);
        };
        info!(identity = %identity, physical = %target, "host object deleted; deleting virtual object");
        match self.bounded(self.virtual_store.delete(&identity.kind, &identity.key(), &Preconditions::of(&v))).await {
            Ok(()) => {
                record_write("delete");
                Ok(SyncOutcome::Deleted)
            }
            Err(Error::Store(StoreError::NotFound(_))) => Ok(SyncOutcome::Noop),
            Err(e) => Err(e),
        }
    }

    /// Host key of `identity`, for callers outside a pass.
    pub fn physical_key(&self, identity: &Identity) -> Result<ObjectKey> {
        Ok(self.mappers.resolve(&identity.kind)?.virtual_to_host(identity))
    }
}
