// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use session::{IterationItem, SessionItem};

///
/// A logical serialization point for iterations sharing an execution context. At most one
/// *expensive* iteration runs per lane concurrently, gated by `num_expensive_iter_running`'s
/// compare-exchange; inexpensive iterations bypass the gate and may run alongside it freely.
///
pub struct LaneQueue {
    id: u64,
    queue: Mutex<VecDeque<Arc<IterationItem>>>,
    last_seen: Mutex<Instant>,
    /// Sessions that have ever routed an iteration to this lane, keyed by session id so dead
    /// weak references are easy to prune without scanning a `Vec`.
    sessions: Mutex<HashMap<u64, Weak<SessionItem>>>,
    /// Insertion order of sessions first seen on this lane; the `fifo` policy walks this to find
    /// the oldest still-live session.
    fifo_queue: Mutex<VecDeque<Weak<SessionItem>>>,
    /// 0 or 1: whether an expensive iteration currently holds this lane's single expensive slot.
    num_expensive_iter_running: AtomicUsize,
    /// The session whose iteration was most recently dispatched on this lane, for introspection.
    last_session_item: Mutex<Option<Weak<SessionItem>>>,
}

impl LaneQueue {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            last_seen: Mutex::new(Instant::now()),
            sessions: Mutex::new(HashMap::new()),
            fifo_queue: Mutex::new(VecDeque::new()),
            num_expensive_iter_running: AtomicUsize::new(0),
            last_session_item: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn push(&self, item: Arc<IterationItem>) {
        self.queue.lock().push_back(item);
        self.touch();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Removes and returns every item currently queued, in FIFO order, for the scheduling pass to
    /// stage and re-enqueue whatever it doesn't run this time.
    pub fn drain(&self) -> Vec<Arc<IterationItem>> {
        self.queue.lock().drain(..).collect()
    }

    pub fn requeue(&self, items: Vec<Arc<IterationItem>>) {
        self.queue.lock().extend(items);
    }

    pub fn num_expensive_iter_running(&self) -> usize {
        self.num_expensive_iter_running.load(Ordering::Acquire)
    }

    /// Registers `session` with this lane if it is new here: tracked in `sessions` for pruning
    /// and in `fifo_queue` for the `fifo` policy's oldest-session lookup. Resets the session's
    /// finished-iteration count, matching a session rejoining a lane it had left.
    pub fn note_session(&self, session: &Arc<SessionItem>) {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id()) {
            return;
        }
        sessions.insert(session.id(), Arc::downgrade(session));
        self.fifo_queue.lock().push_back(Arc::downgrade(session));
        session.reset_finished_iters();
    }

    /// Drops weak references whose session has been dropped. Called once per scheduling pass.
    pub fn prune_dead_sessions(&self) {
        self.sessions.lock().retain(|_, weak| weak.upgrade().is_some());
        self.fifo_queue.lock().retain(|weak| weak.upgrade().is_some());
    }

    /// All sessions currently tracked as live on this lane.
    pub fn live_sessions(&self) -> Vec<Arc<SessionItem>> {
        self.sessions.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// The oldest session in insertion order that is still live, if any.
    pub fn oldest_live_session(&self) -> Option<Arc<SessionItem>> {
        self.fifo_queue.lock().iter().find_map(Weak::upgrade)
    }

    pub fn record_dispatch(&self, session: &Arc<SessionItem>) {
        *self.last_session_item.lock() = Some(Arc::downgrade(session));
    }

    pub fn last_session_item(&self) -> Option<Arc<SessionItem>> {
        self.last_session_item.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Attempts to reserve this lane's single expensive-iteration slot. Returns whether the
    /// reservation succeeded; on success the caller must eventually call `release_expensive_slot`.
    pub fn try_reserve_expensive_slot(&self) -> bool {
        self.num_expensive_iter_running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_expensive_slot(&self) {
        self.num_expensive_iter_running.store(0, Ordering::Release);
    }

    /// Whether this lane can be garbage-collected: empty queue, idle past `timeout`, and no
    /// expensive iteration still running.
    pub fn is_collectible(&self, timeout: std::time::Duration) -> bool {
        self.is_empty() && self.idle_for() > timeout && self.num_expensive_iter_running() == 0
    }
}
