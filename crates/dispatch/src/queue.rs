//! Coalescing work queue keyed by identity, with FIFO order.
//!
//! A key is pending at most once. A key re-added while a worker holds it is
//! parked and only handed out again after `done`, so no two workers ever
//! process the same key concurrently.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::trace;

/// Where failed or delayed work goes back to.
pub trait Scheduler<K>: Send + Sync {
    fn schedule(&self, key: K);
    fn schedule_after(&self, key: K, delay: Duration);
}

struct QueueState<K> {
    order: VecDeque<K>,
    /// Keys waiting to be handed out, including parked ones.
    pending: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `key`. Returns false if it was already pending or the queue is shut down.
    pub fn add(&self, key: K) -> bool {
        let mut state = self.lock();
        if state.shutdown || state.pending.contains(&key) {
            return false;
        }
        state.pending.insert(key.clone());
        if state.processing.contains(&key) {
            trace!("key busy; parked until done");
            return true;
        }
        state.order.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Adds `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Next key to process; `None` once the queue is shut down.
    /// The caller must hand the key back through [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    state.pending.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.order.is_empty() {
                        // more work than this worker can take
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Releases `key`; a parked re-add becomes ready.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.pending.contains(key) && !state.shutdown {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops handing out work; waiting and future `get` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }
}

impl<K> Scheduler<K> for Arc<WorkQueue<K>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn schedule(&self, key: K) {
        self.add(key);
    }

    fn schedule_after(&self, key: K, delay: Duration) {
        self.add_after(key, delay);
    }
}
