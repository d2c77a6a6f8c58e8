//! Sync driver: turns watch events and resyncs into queued identities and
//! runs reconciliation workers over them.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vcsync_core::{Delta, DeltaKind, Error, ErrorClass, Identity, ObjectKey, Result, SyncConfig};
use vcsync_mappings::labels::marker_selector;
use vcsync_store::{LabelSelector, ObjectStore};
use vcsync_syncer::{HostDeletionPolicy, Reconciler};

use crate::backoff::Backoff;
use crate::queue::{Scheduler, WorkQueue};

/// Which store a watch event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Virtual,
    Host,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Virtual => "virtual",
            Side::Host => "host",
        }
    }
}

pub struct SyncDriver {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<Identity>>,
    backoff: Backoff<Identity>,
    resync_backoff: Backoff<()>,
    /// Identities whose owned host object was deleted under a DeleteVirtual policy.
    host_deleted: Mutex<FxHashSet<Identity>>,
    resync_now: Notify,
    workers: usize,
    persistent_after: u32,
    resync_period: Duration,
}

impl SyncDriver {
    pub fn new(reconciler: Arc<Reconciler>, cfg: &SyncConfig) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            backoff: Backoff::new(cfg.backoff_initial, cfg.backoff_max),
            resync_backoff: Backoff::new(cfg.backoff_initial, cfg.backoff_max),
            host_deleted: Mutex::new(FxHashSet::default()),
            resync_now: Notify::new(),
            workers: cfg.workers.max(1),
            persistent_after: cfg.persistent_after.max(1),
            resync_period: cfg.resync_period,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<Identity>> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Lists both sides of every synced kind, rebuilds the reverse indexes
    /// and enqueues every identity found. Returns the number enqueued. Each
    /// list runs under the per-operation deadline.
    pub async fn resync(&self) -> Result<usize> {
        let mut queued = 0usize;
        let kinds: Vec<_> = self.reconciler.syncers().kinds().cloned().collect();
        for kind in kinds {
            let mapper = self.reconciler.mappers().resolve(&kind)?;
            if mapper.is_mirror() {
                continue;
            }
            let reconciler = &self.reconciler;
            let virtuals =
                reconciler.bounded(reconciler.virtual_store().list(&kind, None, &LabelSelector::new())).await?;
            let host_ns = kind.namespaced.then(|| mapper.tenant().host_namespace.clone());
            let selector = marker_selector(mapper.tenant());
            let owned = reconciler.bounded(reconciler.host_store().list(&kind, host_ns.as_deref(), &selector)).await?;
            mapper.index().rebuild(owned.iter());

            let mut ids: FxHashSet<Identity> = virtuals.iter().filter_map(|o| Identity::of(&kind, o)).collect();
            // orphans: owned host objects whose virtual object is gone
            ids.extend(owned.iter().filter_map(|o| ObjectKey::of(o)).filter_map(|k| mapper.host_to_virtual(&k)));
            debug!(kind = %kind, virtuals = virtuals.len(), owned = owned.len(), "resync listed");
            for id in ids {
                if self.queue.add(id) {
                    queued += 1;
                }
            }
        }
        info!(queued, "resync done");
        Ok(queued)
    }

    /// Maps a watch event onto the identity to reconcile.
    pub fn handle_delta(&self, side: Side, delta: &Delta) {
        let Ok(syncer) = self.reconciler.syncers().get(&delta.kind) else {
            return;
        };
        let identity = match side {
            Side::Virtual => Identity::of(&delta.kind, &delta.object),
            Side::Host => {
                let Ok(mapper) = self.reconciler.mappers().resolve(&delta.kind) else {
                    return;
                };
                match delta.event {
                    DeltaKind::Applied => {
                        // an object that lost its marker still triggers the identity it used to map to
                        let previous = ObjectKey::of(&delta.object).and_then(|k| mapper.host_to_virtual(&k));
                        mapper.index().observe(&delta.object).or(previous)
                    }
                    DeltaKind::Deleted => {
                        let id = ObjectKey::of(&delta.object).and_then(|k| mapper.index().forget(&k));
                        if let Some(id) = &id {
                            if syncer.deletion_policy() == HostDeletionPolicy::DeleteVirtual {
                                self.host_deleted.lock().unwrap_or_else(PoisonError::into_inner).insert(id.clone());
                            }
                        }
                        id
                    }
                }
            }
        };
        if let Some(id) = identity {
            debug!(side = side.as_str(), identity = %id, event = ?delta.event, "enqueue");
            self.queue.add(id);
        }
    }

    fn take_host_deleted(&self, id: &Identity) -> bool {
        self.host_deleted.lock().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    /// Runs one queued identity to completion and schedules any retry.
    pub async fn process(&self, id: &Identity) {
        let res = if self.take_host_deleted(id) {
            self.reconciler.delete_virtual(id).await
        } else {
            self.reconciler.reconcile(id).await
        };
        match res {
            Ok(outcome) => {
                self.backoff.reset(id);
                debug!(identity = %id, outcome = outcome.as_str(), "reconciled");
            }
            Err(e) => self.handle_error(&self.queue, id, &e),
        }
    }

    fn handle_error(&self, scheduler: &dyn Scheduler<Identity>, id: &Identity, e: &Error) {
        match e.class() {
            ErrorClass::Transient => {
                let (delay, failures) = self.backoff.fail(id);
                if failures >= self.persistent_after {
                    error!(identity = %id, failures, error = %e, "reconcile keeps failing");
                    counter!("vcsync_persistent_failures_total", 1u64, "kind" => id.kind.kind.clone());
                } else {
                    warn!(identity = %id, failures, retry_in = ?delay, error = %e, "reconcile failed; retrying");
                }
                counter!("vcsync_queue_requeues_total", 1u64);
                scheduler.schedule_after(id.clone(), delay);
            }
            ErrorClass::Persistent => {
                let (delay, failures) = self.backoff.fail(id);
                error!(identity = %id, failures, retry_in = ?delay, error = %e, "reconcile failed");
                counter!("vcsync_queue_requeues_total", 1u64);
                scheduler.schedule_after(id.clone(), delay);
            }
            ErrorClass::Programming => {
                self.backoff.reset(id);
                error!(identity = %id, error = %e, "reconcile skipped");
            }
            ErrorClass::DataLoss => {
                self.backoff.reset(id);
                error!(identity = %id, error = %e, "refused to delete; needs an operator");
            }
        }
    }

    /// Runs workers, watch consumers and periodic resync until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        // subscribe before the initial list so nothing between list and watch is lost
        let virtual_events = self.reconciler.virtual_store().subscribe();
        let host_events = self.reconciler.host_store().subscribe();

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(self.spawn_feed(Side::Virtual, virtual_events));
        tasks.push(self.spawn_feed(Side::Host, host_events));
        tasks.push(self.spawn_resync_loop());

        let mut workers = Vec::with_capacity(self.workers);
        for n in 0..self.workers {
            let driver = Arc::clone(&self);
            workers.push(tokio::spawn(async move {
                while let Some(id) = driver.queue.get().await {
                    driver.process(&id).await;
                    driver.queue.done(&id);
                }
                debug!(worker = n, "worker stopped");
            }));
        }
        info!(workers = self.workers, "sync driver started");

        shutdown.await;
        info!("sync driver shutting down");
        self.queue.shutdown();
        for t in tasks {
            t.abort();
        }
        for w in workers {
            let _ = w.await;
        }
        Ok(())
    }

    fn spawn_feed(self: &Arc<Self>, side: Side, mut rx: broadcast::Receiver<Delta>) -> JoinHandle<()> {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delta) => driver.handle_delta(side, &delta),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(side = side.as_str(), skipped = n, "watch feed lagged; forcing resync");
                        driver.resync_now.notify_one();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(side = side.as_str(), "watch feed closed");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_resync_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = driver.resync().await {
                    error!(error = %e, "resync failed");
                    let (delay, _) = driver.resync_backoff.fail(&());
                    tokio::time::sleep(delay).await;
                    continue;
                }
                driver.resync_backoff.reset(&());
                if driver.resync_period.is_zero() {
                    driver.resync_now.notified().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(driver.resync_period) => {}
                        _ = driver.resync_now.notified() => {}
                    }
                }
            }
        })
    }
}
