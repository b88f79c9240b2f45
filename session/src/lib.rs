// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Per-session state: the task queues, ticket bookkeeping, and iteration-allocation tracking
//! a session carries while it is live on the scheduler, plus the `OperationTask`/`IterationTask`
//! contracts tasks and iterations are expected to implement.

mod context;
mod item;
mod task;
mod tracker;

pub use context::{ExecutionContext, IterationContext, IterationOutcome};
pub use item::{IterationItem, OperationItem};
pub use task::{IterationTask, OperationTask, RunCallbacks};
pub use tracker::IterAllocTracker;

pub use resource_monitor::{AllocationListener, ResourceContext};
pub use resources::{DeviceSpec, DeviceType, ResStats, ResourceTag, ResourceType, Resources, Ticket};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A session's hook for evicting live tensors off a source device onto a target one during
/// paging. Returns the number of bytes actually released on the source device.
pub trait PagingCallback: Send + Sync {
    fn volunteer(&self, ticket: Ticket, target: ResourceContext) -> u64;
}

///
/// Per-session state shared between the producer (RPC/framework) side and the scheduling loop.
/// Held behind an `Arc`; items reference their owning session only weakly (see `OperationItem`,
/// `IterationItem`) so a session can be torn down without waiting on every in-flight item.
///
pub struct SessionItem {
    id: u64,
    /// Producer-facing queue: tasks land here from outside the scheduling thread.
    queue: Mutex<VecDeque<Arc<OperationItem>>>,
    /// Scheduler-owned queue: only the scheduling loop touches this, by convention rather than
    /// by lock, but it is still wrapped for the rare debug/introspection reader.
    bg_queue: Mutex<VecDeque<Arc<OperationItem>>>,
    tickets: Mutex<HashSet<Ticket>>,
    res_usage: Mutex<HashMap<ResourceTag, u64>>,
    paging_cb: Mutex<Option<Arc<dyn PagingCallback>>>,
    interrupt_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    cleanup_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    alloc_trackers: Mutex<HashMap<u64, IterAllocTracker>>,
    hol_waiting: AtomicU64,
    queue_head_hash: AtomicU64,
    protect_oom: AtomicBool,
    force_evicted: AtomicBool,
    last_scheduled: Mutex<Option<Instant>>,
    num_finished_iters: AtomicU64,
    used_running_time_nanos: AtomicU64,
    total_running_time_nanos: AtomicU64,
    priority: AtomicU64,
}

impl SessionItem {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            bg_queue: Mutex::new(VecDeque::new()),
            tickets: Mutex::new(HashSet::new()),
            res_usage: Mutex::new(HashMap::new()),
            paging_cb: Mutex::new(None),
            interrupt_cb: Mutex::new(None),
            cleanup_cb: Mutex::new(None),
            alloc_trackers: Mutex::new(HashMap::new()),
            hol_waiting: AtomicU64::new(0),
            queue_head_hash: AtomicU64::new(0),
            protect_oom: AtomicBool::new(true),
            force_evicted: AtomicBool::new(false),
            last_scheduled: Mutex::new(None),
            num_finished_iters: AtomicU64::new(0),
            used_running_time_nanos: AtomicU64::new(0),
            total_running_time_nanos: AtomicU64::new(0),
            priority: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Install the session's callbacks. Must be done before the session is made observable to
    /// the scheduler (i.e. before `insertSession`).
    pub fn install_callbacks(
        &self,
        paging_cb: Arc<dyn PagingCallback>,
        interrupt_cb: impl FnOnce() + Send + 'static,
        cleanup_cb: impl FnOnce() + Send + 'static,
    ) {
        *self.paging_cb.lock() = Some(paging_cb);
        *self.interrupt_cb.lock() = Some(Box::new(interrupt_cb));
        *self.cleanup_cb.lock() = Some(Box::new(cleanup_cb));
    }

    pub fn paging_cb(&self) -> Option<Arc<dyn PagingCallback>> {
        self.paging_cb.lock().clone()
    }

    /// Enqueues a producer-side task. Thread-safe; callable from any thread.
    pub fn enqueue(&self, item: Arc<OperationItem>) {
        self.queue.lock().push_back(item);
    }

    /// Splices the producer queue into the scheduler queue. Called once per scheduling
    /// iteration by the owning loop.
    pub fn splice_queue(&self) {
        let mut incoming = std::mem::take(&mut *self.queue.lock());
        self.bg_queue.lock().append(&mut incoming);
    }

    pub fn bg_queue_len(&self) -> usize {
        self.bg_queue.lock().len()
    }

    pub fn bg_queue_is_empty(&self) -> bool {
        self.bg_queue.lock().is_empty()
    }

    /// Removes and returns every item currently in the scheduler queue, in FIFO order.
    pub fn drain_bg_queue(&self) -> Vec<Arc<OperationItem>> {
        self.bg_queue.lock().drain(..).collect()
    }

    /// Pushes items back onto the front of the scheduler queue, preserving their relative order.
    pub fn requeue_front(&self, items: Vec<Arc<OperationItem>>) {
        let mut queue = self.bg_queue.lock();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    pub fn push_back(&self, item: Arc<OperationItem>) {
        self.bg_queue.lock().push_back(item);
    }

    pub fn pop_front(&self) -> Option<Arc<OperationItem>> {
        self.bg_queue.lock().pop_front()
    }

    /// Cancels and clears every item in the scheduler queue. Used when a session is
    /// force-evicted: no further task from it may be dispatched.
    pub fn cancel_bg_queue(&self) {
        let items = self.drain_bg_queue();
        for item in items {
            item.cancel();
        }
    }

    pub fn hol_waiting(&self) -> u64 {
        self.hol_waiting.load(Ordering::Acquire)
    }

    /// Updates HOL-waiting bookkeeping for a task that was just submitted from behind the queue
    /// head. `head_hash` is the head's identity hash as observed by the caller at the moment it
    /// staged the submission batch — by the time a later item in the batch clears, the live
    /// queue may already be drained or repopulated, so this must not be re-read from it.
    /// Accumulates while the head is unchanged between calls; resets when it changes. Matches
    /// invariant 6: non-decreasing while the head is unchanged, reset when the head changes.
    pub fn note_submission_past_head(&self, head_hash: u64) {
        if self.queue_head_hash.swap(head_hash, Ordering::AcqRel) == head_hash {
            self.hol_waiting.fetch_add(1, Ordering::AcqRel);
        } else {
            self.hol_waiting.store(0, Ordering::Release);
        }
    }

    pub fn reset_hol_waiting(&self) {
        self.hol_waiting.store(0, Ordering::Release);
    }

    pub fn protect_oom(&self) -> bool {
        self.protect_oom.load(Ordering::Acquire)
    }

    pub fn set_protect_oom(&self, value: bool) {
        self.protect_oom.store(value, Ordering::Release);
    }

    pub fn is_force_evicted(&self) -> bool {
        self.force_evicted.load(Ordering::Acquire)
    }

    /// Marks the session as force-evicted, disabling further OOM protection and releasing the
    /// interrupt callback. Idempotent: a second call is a no-op beyond re-firing, which we avoid
    /// by taking the callback only once.
    pub fn interrupt(&self) {
        log::debug!("session {} interrupted (force-evicted)", self.id);
        self.force_evicted.store(true, Ordering::Release);
        self.protect_oom.store(false, Ordering::Release);
        if let Some(cb) = self.interrupt_cb.lock().take() {
            cb();
        }
    }

    /// Stores a cleanup callback to run once the scheduler drops its last reference, and clears
    /// the paging callback so no further paging attempt targets this session.
    pub fn prepare_delete(&self, cb: impl FnOnce() + Send + 'static) {
        *self.cleanup_cb.lock() = Some(Box::new(cb));
        *self.paging_cb.lock() = None;
    }

    pub fn run_cleanup(&self) {
        if let Some(cb) = self.cleanup_cb.lock().take() {
            cb();
        }
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.tickets.lock().iter().copied().collect()
    }

    /// Records `ticket` against this session ahead of any actual allocate/free traffic on it, so
    /// paging's victim selection can see it even before the task's first `alloc()` call.
    pub fn register_ticket(&self, ticket: Ticket) {
        self.tickets.lock().insert(ticket);
    }

    pub fn usage_of(&self, tag: ResourceTag) -> u64 {
        self.res_usage.lock().get(&tag).copied().unwrap_or(0)
    }

    pub fn last_scheduled(&self) -> Option<Instant> {
        *self.last_scheduled.lock()
    }

    pub fn mark_scheduled(&self, when: Instant) {
        *self.last_scheduled.lock() = Some(when);
    }

    pub fn num_finished_iters(&self) -> u64 {
        self.num_finished_iters.load(Ordering::Acquire)
    }

    pub fn increment_finished_iters(&self) {
        self.num_finished_iters.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reset_finished_iters(&self) {
        self.num_finished_iters.store(0, Ordering::Release);
    }

    pub fn used_running_time(&self) -> Duration {
        Duration::from_nanos(self.used_running_time_nanos.load(Ordering::Acquire))
    }

    pub fn total_running_time(&self) -> Duration {
        Duration::from_nanos(self.total_running_time_nanos.load(Ordering::Acquire))
    }

    pub fn add_used_running_time(&self, elapsed: Duration) {
        self.used_running_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Sets (replaces, does not accumulate) the session's expected total running time, as
    /// declared by the framework adapter outside the scheduling loop. The preempt policy orders
    /// candidates by `total_running_time - used_running_time`; a session that never calls this
    /// keeps a total of zero, so its remaining budget is identically zero too.
    pub fn set_total_running_time(&self, total: Duration) {
        self.total_running_time_nanos
            .store(total.as_nanos() as u64, Ordering::Release);
    }

    /// Monotonically increasing priority stamp assigned once at insertion, used by the preempt
    /// policy. 0 means "never assigned".
    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, value: u64) {
        self.priority.store(value, Ordering::Release);
    }

    /// Gets or creates the per-graph iteration-allocation tracker.
    pub fn tracker_for(&self, graph_id: u64) -> IterAllocTracker {
        self.alloc_trackers
            .lock()
            .entry(graph_id)
            .or_insert_with(IterAllocTracker::new)
            .clone()
    }

    /// Memory admission for a about-to-start iteration of `graph_id`: gates the iteration's
    /// predicted peak against `regulator` through this session's per-graph tracker. When
    /// `admission_control` is false (the `disableAdmissionControl` config option), the gate is
    /// skipped entirely and the iteration is always admitted.
    pub fn begin_iteration(
        &self,
        regulator: &resource_monitor::AllocationRegulator,
        ticket: Ticket,
        graph_id: u64,
        device: DeviceSpec,
        estimation: ResStats,
        admission_control: bool,
    ) -> bool {
        if !admission_control {
            return true;
        }
        self.tracker_for(graph_id)
            .begin_iter(regulator, ticket, device, estimation)
    }

    /// Records a fresh current-allocation sample for `graph_id`'s tracker, letting it release
    /// its regulator hold early once the iteration's peak has passed.
    pub fn update_iteration(&self, regulator: &resource_monitor::AllocationRegulator, graph_id: u64, current_allocated: u64) {
        self.tracker_for(graph_id).update(regulator, current_allocated);
    }

    /// Finalizes `graph_id`'s tracker at iteration completion: releases any still-held
    /// regulator hold and blends the observed peak into the running estimate.
    pub fn end_iteration(
        &self,
        regulator: &resource_monitor::AllocationRegulator,
        graph_id: u64,
        current_peak: u64,
        persist: u64,
        count_seen: u64,
    ) {
        self.tracker_for(graph_id).end_iter(regulator, current_peak, persist, count_seen);
    }
}

impl AllocationListener for SessionItem {
    fn notify_alloc(&self, _graph_id: u64, ticket: Ticket, tag: ResourceTag, amount: u64) {
        self.tickets.lock().insert(ticket);
        *self.res_usage.lock().entry(tag).or_insert(0) += amount;
    }

    fn notify_dealloc(&self, _graph_id: u64, ticket: Ticket, tag: ResourceTag, amount: u64, last: bool) {
        if let Some(usage) = self.res_usage.lock().get_mut(&tag) {
            *usage = usage.saturating_sub(amount);
        }
        if last {
            self.tickets.lock().remove(&ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_submission_past_head_accumulates_while_head_is_unchanged() {
        let session = SessionItem::new(1);
        assert_eq!(session.hol_waiting(), 0);
        session.note_submission_past_head(42);
        // First call establishes the baseline head hash; it's a change from the initial 0, so
        // it resets rather than accumulates.
        assert_eq!(session.hol_waiting(), 0);
        session.note_submission_past_head(42);
        assert_eq!(session.hol_waiting(), 1);
        session.note_submission_past_head(42);
        assert_eq!(session.hol_waiting(), 2);
    }

    #[test]
    fn note_submission_past_head_resets_when_head_hash_changes() {
        let session = SessionItem::new(1);
        session.note_submission_past_head(1);
        session.note_submission_past_head(1);
        assert_eq!(session.hol_waiting(), 1);
        session.note_submission_past_head(2);
        assert_eq!(session.hol_waiting(), 0);
    }

    #[test]
    fn add_used_running_time_does_not_move_total_running_time() {
        let session = SessionItem::new(1);
        session.add_used_running_time(Duration::from_secs(5));
        assert_eq!(session.used_running_time(), Duration::from_secs(5));
        assert_eq!(session.total_running_time(), Duration::ZERO);
    }

    #[test]
    fn set_total_running_time_replaces_rather_than_accumulates() {
        let session = SessionItem::new(1);
        session.set_total_running_time(Duration::from_secs(10));
        session.set_total_running_time(Duration::from_secs(3));
        assert_eq!(session.total_running_time(), Duration::from_secs(3));
    }
}
