//! Fixed-capacity round-robin pool of long-lived connection objects.
//!
//! Members sit on a circular doubly linked list stored in a slab arena. A
//! single producer task walks the ring on behalf of waiting [`Pool::get`]
//! callers, handing out the next member that reports [`Poolable::should_queue`]
//! and unlinking members that report [`Poolable::should_delete`]. Unlinked
//! members are closed, one at a time, by a separate deleter task.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Contract for objects managed by a [`Pool`].
///
/// Both predicates are consulted while the pool's ring lock is held, so they
/// must not block.
pub trait Poolable: Send + Sync + 'static {
    /// Is the object currently eligible to serve work?
    fn should_queue(&self) -> bool;
    /// Is the object permanently unusable?
    fn should_delete(&self) -> bool;
    /// Release the object's resources. Called once, after it left the ring.
    fn close(&self);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: usize,
    pub sweep_interval: Duration,
}

impl PoolConfig {
    pub fn new(max_conns: usize) -> Self {
        Self {
            max_conns,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

struct Node<T> {
    id: u64,
    obj: Arc<T>,
    prev: usize,
    next: usize,
    deleted: AtomicBool,
}

struct Ring<T> {
    nodes: Slab<Node<T>>,
    current: Option<usize>,
    next_id: u64,
    /// Set when the producer parked because nothing was servable.
    waiting: bool,
}

impl<T: Poolable> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            current: None,
            next_id: 0,
            waiting: false,
        }
    }

    /// Links `obj` in just before the cursor so it is visited last.
    fn splice(&mut self, obj: Arc<T>) {
        let id = self.next_id;
        self.next_id += 1;
        let slot = self.nodes.vacant_key();
        match self.current {
            None => {
                self.nodes.insert(Node {
                    id,
                    obj,
                    prev: slot,
                    next: slot,
                    deleted: AtomicBool::new(false),
                });
                self.current = Some(slot);
            }
            Some(current) => {
                let prev = self.nodes[current].prev;
                self.nodes.insert(Node {
                    id,
                    obj,
                    prev,
                    next: current,
                    deleted: AtomicBool::new(false),
                });
                self.nodes[prev].next = slot;
                self.nodes[current].prev = slot;
            }
        }
    }

    /// Unlinks the node at `slot` if it still carries `id`. Repeated requests
    /// for the same node are no-ops.
    fn unlink(&mut self, slot: usize, id: u64) -> Option<Arc<T>> {
        let node = self.nodes.get(slot)?;
        if node.id != id {
            return None;
        }
        if node
            .deleted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let (prev, next) = (node.prev, node.next);
        if next == slot {
            self.current = None;
        } else {
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
            if self.current == Some(slot) {
                self.current = Some(next);
            }
        }
        Some(self.nodes.remove(slot).obj)
    }

    /// Advances the cursor for at most one lap and returns the first
    /// queueable member. Deletable members met on the way are unlinked.
    fn next_queueable(&mut self, condemned: &mut Vec<Arc<T>>) -> Option<Arc<T>> {
        let mut remaining = self.nodes.len();
        while remaining > 0 {
            let current = self.current?;
            remaining -= 1;
            let node = &self.nodes[current];
            let (id, next) = (node.id, node.next);
            let delete = node.obj.should_delete();
            let queue = !delete && node.obj.should_queue();
            if delete {
                condemned.extend(self.unlink(current, id));
                continue;
            }
            self.current = Some(next);
            if queue {
                return Some(Arc::clone(&self.nodes[current].obj));
            }
        }
        None
    }

    fn sweep(&mut self, condemned: &mut Vec<Arc<T>>) {
        let doomed: Vec<(usize, u64)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.obj.should_delete())
            .map(|(slot, node)| (slot, node.id))
            .collect();
        for (slot, id) in doomed {
            condemned.extend(self.unlink(slot, id));
        }
    }

    fn drain(&mut self) -> Vec<Arc<T>> {
        self.current = None;
        std::mem::take(&mut self.nodes)
            .into_iter()
            .map(|(_, node)| node.obj)
            .collect()
    }
}

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    max_conns: usize,
    sweep_interval: Duration,
    changed: Notify,
    closed: AtomicBool,
    delete_tx: mpsc::UnboundedSender<Arc<T>>,
}

impl<T: Poolable> Shared<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn select(&self) -> Option<Arc<T>> {
        let mut condemned = Vec::new();
        let selected = {
            let mut ring = self.ring.lock();
            let selected = ring.next_queueable(&mut condemned);
            if selected.is_none() {
                ring.waiting = true;
            }
            selected
        };
        self.condemn(condemned);
        selected
    }

    fn sweep(&self) {
        let mut condemned = Vec::new();
        self.ring.lock().sweep(&mut condemned);
        self.condemn(condemned);
    }

    fn condemn(&self, condemned: Vec<Arc<T>>) {
        for obj in condemned {
            debug!("pooled object removed from ring");
            if let Err(mpsc::error::SendError(obj)) = self.delete_tx.send(obj) {
                obj.close();
            }
        }
    }

    /// Wakes the producer if it parked for lack of servable members.
    fn wake(&self) {
        let wake = std::mem::take(&mut self.ring.lock().waiting);
        if wake {
            self.changed.notify_one();
        }
    }
}

trait Wake: Send + Sync {
    fn notify_change(&self);
}

impl<T: Poolable> Wake for Shared<T> {
    fn notify_change(&self) {
        self.wake();
    }
}

/// Lets a member tell its pool that it may be queueable again, so a parked
/// `get` does not wait for the next sweep. The default waker is detached.
#[derive(Clone, Default)]
pub struct PoolWaker {
    shared: Option<Weak<dyn Wake>>,
}

impl PoolWaker {
    pub fn wake(&self) {
        if let Some(shared) = self.shared.as_ref().and_then(Weak::upgrade) {
            shared.notify_change();
        }
    }
}

type Waiter<T> = oneshot::Sender<PoolHandle<T>>;

pub struct Pool<T: Poolable> {
    shared: Arc<Shared<T>>,
    requests: mpsc::UnboundedSender<Waiter<T>>,
    producer: JoinHandle<()>,
}

impl<T: Poolable> Pool<T> {
    /// Creates the pool and spawns its producer and deleter tasks on the
    /// current Tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring::new(config.max_conns)),
            max_conns: config.max_conns,
            sweep_interval: config.sweep_interval,
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            delete_tx,
        });
        let producer = tokio::spawn(produce(Arc::clone(&shared), requests_rx));
        tokio::spawn(delete_loop(delete_rx));
        Self {
            shared,
            requests,
            producer,
        }
    }

    /// Adds `obj` to the ring. Returns `Ok(false)` when the pool is full.
    pub fn insert(&self, obj: Arc<T>) -> Result<bool, PoolError> {
        if self.shared.is_closed() {
            return Err(PoolError::Closed);
        }
        {
            let mut ring = self.shared.ring.lock();
            if ring.nodes.len() >= self.shared.max_conns {
                return Ok(false);
            }
            ring.splice(obj);
        }
        self.shared.wake();
        Ok(true)
    }

    /// Waits for the next queueable member in round-robin order.
    pub async fn get(&self) -> Result<PoolHandle<T>, PoolError> {
        if self.shared.is_closed() {
            return Err(PoolError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.requests.send(tx).map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    pub fn waker(&self) -> PoolWaker {
        let shared: Arc<dyn Wake> = self.shared.clone();
        PoolWaker {
            shared: Some(Arc::downgrade(&shared)),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.ring.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_conns
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes every member and fails pending and future `get` calls.
    /// Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let members = self.shared.ring.lock().drain();
        debug!(members = members.len(), "closing pool");
        for obj in members {
            obj.close();
        }
        self.shared.changed.notify_one();
        self.producer.abort();
    }

    #[cfg(test)]
    fn ring_is_closed(&self) -> bool {
        let ring = self.shared.ring.lock();
        let Some(start) = ring.current else {
            return ring.nodes.is_empty();
        };
        let mut forward = 0;
        let mut cursor = start;
        loop {
            cursor = ring.nodes[cursor].next;
            forward += 1;
            if cursor == start || forward > ring.nodes.len() {
                break;
            }
        }
        let mut backward = 0;
        loop {
            cursor = ring.nodes[cursor].prev;
            backward += 1;
            if cursor == start || backward > ring.nodes.len() {
                break;
            }
        }
        forward == ring.nodes.len() && backward == ring.nodes.len()
    }
}

impl<T: Poolable> Drop for Pool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn produce<T: Poolable>(
    shared: Arc<Shared<T>>,
    mut requests: mpsc::UnboundedReceiver<Waiter<T>>,
) {
    let mut sweep = tokio::time::interval(shared.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let mut waiter = tokio::select! {
            request = requests.recv() => match request {
                Some(waiter) => waiter,
                None => return,
            },
            _ = sweep.tick() => {
                if shared.is_closed() {
                    return;
                }
                shared.sweep();
                continue;
            }
        };

        loop {
            if shared.is_closed() {
                return;
            }
            if waiter.is_closed() {
                break;
            }
            if let Some(obj) = shared.select() {
                let handle = PoolHandle {
                    obj,
                    shared: Arc::clone(&shared),
                };
                if waiter.send(handle).is_err() {
                    trace!("pool waiter left before hand-off");
                }
                break;
            }
            tokio::select! {
                _ = shared.changed.notified() => {}
                _ = sweep.tick() => shared.sweep(),
                _ = waiter.closed() => break,
            }
        }
    }
}

async fn delete_loop<T: Poolable>(mut condemned: mpsc::UnboundedReceiver<Arc<T>>) {
    while let Some(obj) = condemned.recv().await {
        obj.close();
    }
}

/// A member handed out by [`Pool::get`]. Dropping it (or calling
/// [`PoolHandle::done`]) lets the producer move on.
pub struct PoolHandle<T: Poolable> {
    obj: Arc<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Poolable> PoolHandle<T> {
    pub fn object(&self) -> &Arc<T> {
        &self.obj
    }

    pub fn done(self) {}
}

impl<T: Poolable> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: Poolable> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        self.shared.wake();
    }
}
