// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use resource_monitor::ResourceContext;
use resources::{DeviceSpec, DeviceType, ResourceTag, ResourceType, Resources, Ticket};
use session::{OperationItem, SessionItem};

/// The sessions newly spliced in during this scheduling iteration, in insertion order. Policies
/// that assign priority or ordering state on first sight of a session (fair, preempt) use this.
pub struct ChangeSet {
    pub newly_added: Vec<Arc<SessionItem>>,
}

///
/// Accepts a prepared `OperationItem` for dispatch to the worker pool. Implemented by
/// `TaskExecutor`, which owns the `done`/`memFailure` bookkeeping (live counters, staging
/// release, per-session stats) that happens once the pool actually runs the task.
///
pub trait TaskDispatcher: Send + Sync {
    /// Returns false iff the pool's target queue was full (`PoolQueueFull`); the scheduler then
    /// puts the item back on its session's queue for a later retry.
    fn dispatch(&self, item: Arc<OperationItem>) -> bool;
}

///
/// Shared dependencies and per-iteration scratch state every policy's `maybe_schedule_from` and
/// `insufficient_memory` draw on.
///
pub struct SchedulerEnv {
    pub monitor: Arc<resource_monitor::ResourceMonitor>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    /// When false, `EXEC_SCHED_USE_GPU=false`: tasks are only scheduled on CPU.
    pub use_gpu: bool,
    pub max_hol_waiting: u64,
    /// When false, the fair policy stops trying further candidates after one that scheduled
    /// nothing (§6 `workConservative`).
    pub work_conservative: bool,
    missing: Mutex<HashMap<DeviceSpec, Resources>>,
}

impl SchedulerEnv {
    pub fn new(
        monitor: Arc<resource_monitor::ResourceMonitor>,
        dispatcher: Arc<dyn TaskDispatcher>,
        use_gpu: bool,
        max_hol_waiting: u64,
    ) -> Self {
        Self {
            monitor,
            dispatcher,
            use_gpu,
            max_hol_waiting,
            work_conservative: true,
            missing: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_work_conservative(mut self, value: bool) -> Self {
        self.work_conservative = value;
        self
    }

    /// Clears the per-iteration missing-resource ledger. Called by `TaskExecutor` at the start
    /// of every scheduling iteration.
    pub fn reset_missing(&self) {
        self.missing.lock().clear();
    }

    fn record_missing(&self, device: DeviceSpec, missing: Resources) {
        self.missing.lock().entry(device).or_default().merge(&missing);
    }

    /// Whether this iteration saw a `MEMORY`-specific prealloc failure on `device`.
    pub fn insufficient_memory(&self, device: DeviceSpec) -> bool {
        self.missing
            .lock()
            .get(&device)
            .map(|r| r.get(&ResourceTag::memory(device)) > 0)
            .unwrap_or(false)
    }

    /// A point-in-time snapshot of this iteration's missing-resource ledger, for `sched_cli` and
    /// debug logging. Not used by any scheduling decision; the ledger itself is queried live via
    /// `insufficient_memory`.
    pub fn debug_state(&self) -> DebugState {
        DebugState {
            missing: self.missing.lock().clone(),
        }
    }
}

/// Snapshot returned by `SchedulerEnv::debug_state`.
#[derive(Debug, Clone)]
pub struct DebugState {
    pub missing: HashMap<DeviceSpec, Resources>,
}

/// Estimates `item`'s footprint on `device` (adding one GPU stream slot for GPU devices),
/// preallocates it, and calls the task's `prepare`. Leaves a note in the env's missing-resource
/// ledger on failure. Idempotent across retries: if `item` was already prepared on an earlier
/// pass (e.g. after a `PoolQueueFull` requeue), this is a cheap no-op success.
pub fn maybe_preallocate_for(env: &SchedulerEnv, item: &Arc<OperationItem>, device: DeviceSpec) -> bool {
    if item.is_prepared() {
        return true;
    }
    let Some(session) = item.upgrade_session() else {
        return false;
    };

    let mut req = item.estimated_usage(device);
    if device.device_type == DeviceType::Gpu {
        req.add(ResourceTag::gpu_stream(device), 1);
    }

    match ResourceContext::pre_allocate(env.monitor.clone(), item.graph_id(), device, &req) {
        Ok(ctx) => {
            let ticket: Ticket = ctx.ticket();
            ctx.attach_listener(session.clone() as Arc<dyn resource_monitor::AllocationListener>);
            if item.prepare(ctx) {
                session.register_ticket(ticket);
                item.mark_prepared(device);
                true
            } else {
                false
            }
        }
        Err(missing) => {
            env.record_missing(device, missing);
            false
        }
    }
}

/// Tries every device type `item` accepts (skipping GPU when `env.use_gpu` is false); the first
/// one whose prealloc+prepare succeeds wins and the item is handed to the dispatcher. Returns
/// `None` on success, or `Some(item)` (unchanged) if every device type failed, so the caller can
/// push it back onto the session's queue.
pub fn submit_task(env: &SchedulerEnv, item: Arc<OperationItem>) -> Option<Arc<OperationItem>> {
    for device_type in item.supported_device_types() {
        if device_type == DeviceType::Gpu && !env.use_gpu {
            continue;
        }
        let device = DeviceSpec::new(device_type, 0);
        if maybe_preallocate_for(env, &item, device) {
            if env.dispatcher.dispatch(item.clone()) {
                return None;
            }
            // Pool queue was full; the item stays prepared so a later retry skips straight to
            // re-dispatch instead of re-preallocating.
            return Some(item);
        }
    }
    Some(item)
}

/// Implements head-of-line handling for a session's scheduler queue: while `holWaiting` exceeds
/// `max_hol_waiting`, only the queue head is attempted each pass (so a stuck head can't be
/// starved forever by later items continually jumping it); otherwise the whole queue is staged
/// and every item is tried, with failures pushed back in original order.
///
/// Returns the number of tasks successfully submitted.
pub fn submit_all_tasks_from_queue(env: &SchedulerEnv, session: &Arc<SessionItem>) -> usize {
    if session.hol_waiting() > env.max_hol_waiting {
        log::debug!(
            "session queue head-of-line waiting ({}) past threshold ({}); scheduling head only",
            session.hol_waiting(),
            env.max_hol_waiting
        );
        let Some(head) = session.pop_front() else {
            return 0;
        };
        let head_hash = head.identity_hash();
        match submit_task(env, head) {
            None => {
                session.reset_hol_waiting();
                1
            }
            Some(item) => {
                session.requeue_front(vec![item]);
                session.note_submission_past_head(head_hash);
                0
            }
        }
    } else {
        let staged = session.drain_bg_queue();
        let mut submitted = 0;
        let mut failed = Vec::new();
        let head_hash = staged.first().map(|item| item.identity_hash());
        for item in staged {
            let is_head = Some(item.identity_hash()) == head_hash;
            match submit_task(env, item) {
                None => {
                    submitted += 1;
                    if !is_head {
                        session.note_submission_past_head(head_hash.expect("staged is non-empty while this loop runs"));
                    }
                }
                Some(item) => failed.push(item),
            }
        }
        session.requeue_front(failed);
        if session.bg_queue_is_empty() {
            session.reset_hol_waiting();
        }
        submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_monitor::{AllocationListener, ResourceMonitor};
    use resources::{DeviceType, ResourceType, Resources};
    use session::{OperationTask, RunCallbacks};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct AlwaysOkTask {
        device: DeviceType,
        ran: Arc<AtomicBool>,
    }

    impl OperationTask for AlwaysOkTask {
        fn estimated_usage(&self, device: DeviceSpec) -> Resources {
            Resources::single(ResourceTag::new(ResourceType::Memory, device), 10)
        }
        fn has_exact_estimation(&self, _device: DeviceSpec) -> bool {
            true
        }
        fn supported_device_types(&self) -> Vec<DeviceType> {
            vec![self.device]
        }
        fn prepare(&mut self, _rctx: ResourceContext) -> bool {
            true
        }
        fn run(&mut self, callbacks: Box<dyn RunCallbacks>) {
            self.ran.store(true, Ordering::SeqCst);
            callbacks.done();
        }
        fn cancel(&mut self) {}
        fn is_async(&self) -> bool {
            false
        }
    }

    struct CountingDispatcher {
        accept: bool,
        count: AtomicUsize,
    }

    impl TaskDispatcher for CountingDispatcher {
        fn dispatch(&self, _item: Arc<OperationItem>) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    fn make_env(accept: bool) -> (SchedulerEnv, Arc<CountingDispatcher>) {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let dispatcher = Arc::new(CountingDispatcher {
            accept,
            count: AtomicUsize::new(0),
        });
        (
            SchedulerEnv::new(monitor, dispatcher.clone(), true, 4),
            dispatcher,
        )
    }

    #[test]
    fn submit_task_dispatches_on_success() {
        let (env, dispatcher) = make_env(true);
        let session = SessionItem::new(1);
        let item = OperationItem::new(
            Arc::downgrade(&session),
            1,
            Box::new(AlwaysOkTask {
                device: DeviceType::Gpu,
                ran: Arc::new(AtomicBool::new(false)),
            }),
        );
        let result = submit_task(&env, item);
        assert!(result.is_none());
        assert_eq!(dispatcher.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_task_returns_item_when_pool_is_full() {
        let (env, _dispatcher) = make_env(false);
        let session = SessionItem::new(1);
        let item = OperationItem::new(
            Arc::downgrade(&session),
            1,
            Box::new(AlwaysOkTask {
                device: DeviceType::Gpu,
                ran: Arc::new(AtomicBool::new(false)),
            }),
        );
        let result = submit_task(&env, item);
        assert!(result.is_some());
    }

    #[test]
    fn gpu_tasks_are_skipped_when_gpu_disabled_and_no_other_device_supported() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let dispatcher = Arc::new(CountingDispatcher {
            accept: true,
            count: AtomicUsize::new(0),
        });
        let env = SchedulerEnv::new(monitor, dispatcher.clone(), false, 4);
        let session = SessionItem::new(1);
        let item = OperationItem::new(
            Arc::downgrade(&session),
            1,
            Box::new(AlwaysOkTask {
                device: DeviceType::Gpu,
                ran: Arc::new(AtomicBool::new(false)),
            }),
        );
        let result = submit_task(&env, item);
        assert!(result.is_some());
        assert_eq!(dispatcher.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hol_waiting_resets_when_head_is_consumed() {
        let (env, _dispatcher) = make_env(true);
        let session = SessionItem::new(1);
        for _ in 0..3 {
            let item = OperationItem::new(
                Arc::downgrade(&session),
                1,
                Box::new(AlwaysOkTask {
                    device: DeviceType::Gpu,
                    ran: Arc::new(AtomicBool::new(false)),
                }),
            );
            session.push_back(item);
        }
        let submitted = submit_all_tasks_from_queue(&env, &session);
        assert_eq!(submitted, 3);
        assert_eq!(session.hol_waiting(), 0);
        assert!(session.bg_queue_is_empty());
    }

    /// Rejects the first item it ever sees (the queue head) on every call and accepts anything
    /// else, so the head stays stuck at the front while later items keep clearing past it.
    struct RejectFirstDispatcher {
        reject_identity: Mutex<Option<u64>>,
    }

    impl TaskDispatcher for RejectFirstDispatcher {
        fn dispatch(&self, item: Arc<OperationItem>) -> bool {
            let mut reject_identity = self.reject_identity.lock();
            let hash = item.identity_hash();
            *reject_identity.get_or_insert(hash) != hash
        }
    }

    #[test]
    fn hol_waiting_accumulates_across_a_pass_while_head_is_stuck() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let dispatcher = Arc::new(RejectFirstDispatcher {
            reject_identity: Mutex::new(None),
        });
        let env = SchedulerEnv::new(monitor, dispatcher, true, 4);
        let session = SessionItem::new(1);
        for _ in 0..3 {
            let item = OperationItem::new(
                Arc::downgrade(&session),
                1,
                Box::new(AlwaysOkTask {
                    device: DeviceType::Gpu,
                    ran: Arc::new(AtomicBool::new(false)),
                }),
            );
            session.push_back(item);
        }

        let submitted = submit_all_tasks_from_queue(&env, &session);

        assert_eq!(submitted, 2);
        // The head failed and was requeued; the two items behind it both submitted past an
        // unchanging head, so hol_waiting must accumulate rather than reset every call.
        assert_eq!(session.hol_waiting(), 1);
        assert!(!session.bg_queue_is_empty());
    }

    #[test]
    fn failed_items_are_requeued_in_original_order() {
        let (env, _dispatcher) = make_env(false);
        let session = SessionItem::new(1);
        let markers: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        for marker in &markers {
            let item = OperationItem::new(
                Arc::downgrade(&session),
                1,
                Box::new(AlwaysOkTask {
                    device: DeviceType::Gpu,
                    ran: marker.clone(),
                }),
            );
            session.push_back(item);
        }
        let submitted = submit_all_tasks_from_queue(&env, &session);
        assert_eq!(submitted, 0);
        assert_eq!(session.bg_queue_len(), 3);
        for marker in &markers {
            assert!(!marker.load(Ordering::SeqCst));
        }
    }
}