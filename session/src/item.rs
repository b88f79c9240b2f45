// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use resource_monitor::ResourceContext;
use resources::{DeviceSpec, DeviceType, ResStats, Resources};

use crate::task::{IterationTask, OperationTask, RunCallbacks};
use crate::{ExecutionContext, IterationContext, SessionItem};

///
/// Pairs an `OperationTask` with a weak reference to its owning session. If the session has
/// already been dropped by the time the item is acted on, every method that needs the session
/// treats it as gone (the item is silently discarded by its caller rather than panicking).
///
pub struct OperationItem {
    session: Weak<SessionItem>,
    graph_id: u64,
    task: Mutex<Box<dyn OperationTask>>,
    /// Set once `prepare` has succeeded for some device, so a retry after a full pool queue
    /// re-dispatches instead of re-preallocating (and double-charging resources).
    prepared: AtomicBool,
    /// The device `prepare` succeeded on, recorded so the executor can ask the task about its
    /// estimate for that same device once the task reports back through `RunCallbacks`.
    device: Mutex<Option<DeviceSpec>>,
}

impl OperationItem {
    pub fn new(session: Weak<SessionItem>, graph_id: u64, task: Box<dyn OperationTask>) -> Arc<Self> {
        Arc::new(Self {
            session,
            graph_id,
            task: Mutex::new(task),
            prepared: AtomicBool::new(false),
            device: Mutex::new(None),
        })
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn mark_prepared(&self, device: DeviceSpec) {
        *self.device.lock() = Some(device);
        self.prepared.store(true, Ordering::Release);
    }

    /// Abandons the current preparation (used after a memory failure that isn't reported to the
    /// task's own caller): the next scheduling pass will re-preallocate from scratch rather than
    /// re-dispatching against a reservation the task already consumed.
    pub fn clear_prepared(&self) {
        *self.device.lock() = None;
        self.prepared.store(false, Ordering::Release);
    }

    pub fn prepared_device(&self) -> Option<DeviceSpec> {
        *self.device.lock()
    }

    pub fn upgrade_session(&self) -> Option<Arc<SessionItem>> {
        self.session.upgrade()
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn supported_device_types(&self) -> Vec<DeviceType> {
        self.task.lock().supported_device_types()
    }

    pub fn estimated_usage(&self, device: DeviceSpec) -> Resources {
        self.task.lock().estimated_usage(device)
    }

    pub fn has_exact_estimation(&self, device: DeviceSpec) -> bool {
        self.task.lock().has_exact_estimation(device)
    }

    pub fn prepare(&self, rctx: ResourceContext) -> bool {
        self.task.lock().prepare(rctx)
    }

    pub fn run(&self, callbacks: Box<dyn RunCallbacks>) {
        self.task.lock().run(callbacks);
    }

    pub fn cancel(&self) {
        self.task.lock().cancel();
    }

    pub fn is_async(&self) -> bool {
        self.task.lock().is_async()
    }

    /// A stable-for-this-item's-lifetime identity used for head-of-line bookkeeping: whether the
    /// queue head is "the same item" across scheduling passes.
    pub fn identity_hash(&self) -> u64 {
        self as *const Self as u64
    }
}

///
/// Pairs an `IterationTask` with a weak reference to its owning `ExecutionContext`. Follows the
/// same silent-drop-on-expiry rule as `OperationItem`.
///
pub struct IterationItem {
    execution: Weak<ExecutionContext>,
    task: Mutex<Box<dyn IterationTask>>,
}

impl IterationItem {
    pub fn new(execution: Weak<ExecutionContext>, task: Box<dyn IterationTask>) -> Arc<Self> {
        Arc::new(Self {
            execution,
            task: Mutex::new(task),
        })
    }

    pub fn upgrade_execution(&self) -> Option<Arc<ExecutionContext>> {
        self.execution.upgrade()
    }

    pub fn execution_weak(&self) -> Weak<ExecutionContext> {
        self.execution.clone()
    }

    pub fn graph_id(&self) -> u64 {
        self.task.lock().graph_id()
    }

    pub fn estimated_peak_allocation(&self, device: DeviceSpec) -> ResStats {
        self.task.lock().estimated_peak_allocation(device)
    }

    pub fn is_expensive(&self) -> bool {
        self.task.lock().is_expensive()
    }

    pub fn prepare(&self) -> bool {
        self.task.lock().prepare()
    }

    pub fn run_async(&self, ctx: Arc<IterationContext>) {
        self.task.lock().run_async(ctx);
    }

    pub fn is_canceled(&self) -> bool {
        self.task.lock().is_canceled()
    }

    pub fn cancel(&self) {
        self.task.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RunCallbacks;
    use resources::DeviceType;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopTask {
        canceled: Arc<AtomicBool>,
    }

    impl OperationTask for NoopTask {
        fn estimated_usage(&self, _device: DeviceSpec) -> Resources {
            Resources::new()
        }
        fn has_exact_estimation(&self, _device: DeviceSpec) -> bool {
            false
        }
        fn supported_device_types(&self) -> Vec<DeviceType> {
            vec![DeviceType::Gpu]
        }
        fn prepare(&mut self, _rctx: ResourceContext) -> bool {
            true
        }
        fn run(&mut self, callbacks: Box<dyn RunCallbacks>) {
            callbacks.done();
        }
        fn cancel(&mut self) {
            self.canceled.store(true, Ordering::SeqCst);
        }
        fn is_async(&self) -> bool {
            false
        }
    }

    struct RecordingCallbacks {
        done: Arc<AtomicBool>,
    }

    impl RunCallbacks for RecordingCallbacks {
        fn done(&self) {
            self.done.store(true, Ordering::SeqCst);
        }
        fn mem_failure(&self) -> bool {
            false
        }
    }

    #[test]
    fn dropped_session_is_not_upgradable_from_item() {
        let session = SessionItem::new(1);
        let item = OperationItem::new(Arc::downgrade(&session), 1, Box::new(NoopTask { canceled: Arc::new(AtomicBool::new(false)) }));
        drop(session);
        assert!(item.upgrade_session().is_none());
    }

    #[test]
    fn run_invokes_done_callback() {
        let session = SessionItem::new(1);
        let item = OperationItem::new(Arc::downgrade(&session), 1, Box::new(NoopTask { canceled: Arc::new(AtomicBool::new(false)) }));
        let done = Arc::new(AtomicBool::new(false));
        item.run(Box::new(RecordingCallbacks { done: done.clone() }));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_is_forwarded_to_task() {
        let session = SessionItem::new(1);
        let canceled = Arc::new(AtomicBool::new(false));
        let item = OperationItem::new(Arc::downgrade(&session), 1, Box::new(NoopTask { canceled: canceled.clone() }));
        item.cancel();
        assert!(canceled.load(Ordering::SeqCst));
    }
}