// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use resource_monitor::ResourceMonitor;
use resources::DeviceSpec;
use scheduler::{BaseScheduler, ChangeSet, SchedulerEnv, TaskDispatcher};
use session::{OperationItem, RunCallbacks, SessionItem};
use work_pool::ThreadPool;

use crate::config::SchedulerConfig;
use crate::paging;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const NO_PROGRESS_WARN_AFTER: Duration = Duration::from_secs(10);

/// The source device paging drains and the target it lands onto. Fixed per spec.md's worked
/// examples; a future multi-GPU deployment would make this a per-device sweep instead.
const PAGING_SOURCE: DeviceSpec = DeviceSpec::gpu(0);
const PAGING_TARGET: DeviceSpec = DeviceSpec::cpu(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Interrupting,
}

struct Inner {
    config: SchedulerConfig,
    monitor: Arc<ResourceMonitor>,
    pool: Arc<ThreadPool>,
    policy: Arc<dyn BaseScheduler>,
    env: SchedulerEnv,

    state: Mutex<RunState>,
    sessions: Mutex<Vec<Arc<SessionItem>>>,
    new_sessions: Mutex<Vec<Arc<SessionItem>>>,
    deleted_sessions: Mutex<HashSet<u64>>,
    /// Set once this interrupting pass has called `interrupt()` on every then-live session, so
    /// a later splice of new sessions (admitted right as shutdown starts) still gets caught by
    /// being force-evicted through their own `forceEvicted` path rather than a second fan-out.
    interrupt_fanned_out: AtomicBool,

    work_event: work_pool::WorkEvent,
    in_flight: AtomicUsize,
    /// Per-instance no-progress timer (resolves the §9 open question: this must not be a
    /// process-wide static, or multiple executors in one process would interfere).
    no_progress_since: Mutex<Option<Instant>>,

    thread: Mutex<Option<JoinHandle<()>>>,
}

/// The task-level scheduling engine (§4.8–§4.9). Owns the worker pool, drives one
/// `BaseScheduler` policy, preallocates resources via `ResourceMonitor`, and recovers from GPU
/// memory exhaustion by paging or force-evicting a session.
#[derive(Clone)]
pub struct TaskExecutor(Arc<Inner>);

impl TaskExecutor {
    pub fn new(config: SchedulerConfig, monitor: Arc<ResourceMonitor>) -> Self {
        let pool = Arc::new(ThreadPool::new(config.num_worker_threads, config.worker_queue_capacity));
        let policy = config.scheduler.build_with(config.use_fairness_counter);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(Dispatcher(weak.clone()));
            let env = SchedulerEnv::new(monitor.clone(), dispatcher, config.use_gpu, config.max_hol_waiting)
                .with_work_conservative(config.work_conservative);
            Inner {
                config,
                monitor,
                pool,
                policy,
                env,
                state: Mutex::new(RunState::Stopped),
                sessions: Mutex::new(Vec::new()),
                new_sessions: Mutex::new(Vec::new()),
                deleted_sessions: Mutex::new(HashSet::new()),
                interrupt_fanned_out: AtomicBool::new(false),
                work_event: work_pool::WorkEvent::new(),
                in_flight: AtomicUsize::new(0),
                no_progress_since: Mutex::new(None),
                thread: Mutex::new(None),
            }
        });

        TaskExecutor(inner)
    }

    /// Must be called before the session is observable anywhere else (its callbacks should
    /// already be installed).
    pub fn insert_session(&self, session: Arc<SessionItem>) {
        self.0.new_sessions.lock().push(session);
        self.0.work_event.notify();
    }

    pub fn delete_session(&self, session_id: u64) {
        self.0.deleted_sessions.lock().insert(session_id);
        self.0.work_event.notify();
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.0.monitor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.0.config
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.0.pool
    }

    /// Snapshot of the live session list, for tests and introspection.
    pub fn sessions_snapshot(&self) -> Vec<Arc<SessionItem>> {
        self.0.sessions.lock().clone()
    }

    /// Snapshot of the current iteration's missing-resource ledger, for `sched_cli` and debug
    /// logging.
    pub fn debug_state(&self) -> scheduler::DebugState {
        self.0.env.debug_state()
    }

    /// Spawns the scheduling thread. A no-op if already running.
    pub fn start_execution(&self) {
        let mut state = self.0.state.lock();
        if *state != RunState::Stopped {
            return;
        }
        *state = RunState::Running;
        drop(state);

        let inner = self.0.clone();
        let handle = std::thread::Builder::new()
            .name("gpu-sched-task-exec".to_string())
            .spawn(move || scheduling_loop(inner))
            .expect("failed to spawn task scheduling thread");
        *self.0.thread.lock() = Some(handle);
    }

    /// Requests the loop stop, wakes it, and joins the scheduling thread. Blocks until every
    /// session has been deleted by the caller and the loop has observed an empty session list.
    pub fn stop_execution(&self) {
        {
            let mut state = self.0.state.lock();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Interrupting;
        }
        self.0.work_event.notify();
        if let Some(handle) = self.0.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Dispatcher(Weak<Inner>);

impl TaskDispatcher for Dispatcher {
    fn dispatch(&self, item: Arc<OperationItem>) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        dispatch_task(&inner, item)
    }
}

/// Runs `item` on the pool, wrapping it in the `done`/`memFailure` bookkeeping callbacks
/// (§4.8 `runTask`). Returns false iff the pool's target queue was full.
fn dispatch_task(inner: &Arc<Inner>, item: Arc<OperationItem>) -> bool {
    inner.in_flight.fetch_add(1, Ordering::AcqRel);
    let callback_inner = inner.clone();
    let run_item = item.clone();
    let closure = move || {
        let callbacks: Box<dyn RunCallbacks> = Box::new(ExecCallbacks {
            item: run_item.clone(),
            inner: callback_inner,
        });
        run_item.run(callbacks);
    };
    match inner.pool.try_run(closure) {
        None => true,
        Some(_) => {
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }
}

struct ExecCallbacks {
    item: Arc<OperationItem>,
    inner: Arc<Inner>,
}

impl RunCallbacks for ExecCallbacks {
    fn done(&self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.inner.work_event.notify();
    }

    fn mem_failure(&self) -> bool {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        let Some(session) = self.item.upgrade_session() else {
            // SessionGone: the item is silently dropped by virtue of us not requeueing it.
            return true;
        };
        let exact = self
            .item
            .prepared_device()
            .map(|device| self.item.has_exact_estimation(device))
            .unwrap_or(false);
        if exact && !session.protect_oom() {
            // Reported to the task's own caller; not consumed here.
            return false;
        }
        self.item.clear_prepared();
        session.push_back(self.item.clone());
        self.inner.work_event.notify();
        true
    }
}

fn scheduling_loop(inner: Arc<Inner>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let interrupting = *inner.state.lock() == RunState::Interrupting;

        // 1 & 2: swap out the deleted set, remove dead sessions, run their cleanup.
        let deleted: HashSet<u64> = std::mem::take(&mut *inner.deleted_sessions.lock());
        if !deleted.is_empty() {
            let mut sessions = inner.sessions.lock();
            sessions.retain(|s| {
                if deleted.contains(&s.id()) {
                    s.run_cleanup();
                    false
                } else {
                    true
                }
            });
        }

        // 3: splice in new sessions, recording the change set.
        let newly_added: Vec<Arc<SessionItem>> = std::mem::take(&mut *inner.new_sessions.lock());
        if !newly_added.is_empty() {
            inner.sessions.lock().extend(newly_added.iter().cloned());
        }

        // 4: first-time interrupt fan-out.
        if interrupting && !inner.interrupt_fanned_out.swap(true, Ordering::AcqRel) {
            for session in inner.sessions.lock().iter() {
                session.interrupt();
            }
        }

        // 5: prepare per-session state.
        let sessions: Vec<Arc<SessionItem>> = inner.sessions.lock().clone();
        let mut total_remaining_count = 0usize;
        for session in &sessions {
            session.splice_queue();
            if session.is_force_evicted() {
                session.cancel_bg_queue();
            } else {
                // Iteration-based OOM protection is always on for a session that isn't already
                // force-evicted (§9: the forced-evict `protectOOM = false` persists for that
                // session's lifetime rather than being clobbered back to true here).
                session.set_protect_oom(true);
            }
            total_remaining_count += session.bg_queue_len();
        }

        // 6: interrupt completion check.
        if interrupting && sessions.is_empty() {
            break;
        }

        // 7: policy callback.
        inner.env.reset_missing();
        let change_set = ChangeSet { newly_added };
        let candidates = inner.policy.notify_pre_scheduling_iteration(&sessions, &change_set);

        // 9: dispatch candidates in policy order.
        let mut remaining_count = 0usize;
        let mut scheduled = 0usize;
        for session in &candidates {
            let (count, keep_going) = inner.policy.maybe_schedule_from(&inner.env, session);
            remaining_count += session.bg_queue_len();
            scheduled += count;
            if !keep_going {
                break;
            }
        }

        // 10: no-progress detection.
        let no_paging_running_tasks = inner.in_flight.load(Ordering::Acquire) == 0;
        let no_progress = remaining_count > 0 && scheduled == 0 && no_paging_running_tasks;
        if no_progress {
            let mut since = inner.no_progress_since.lock();
            let first_seen = *since.get_or_insert_with(Instant::now);
            if first_seen.elapsed() > NO_PROGRESS_WARN_AFTER {
                log::error!(
                    "task scheduling loop has made no progress for {:?} ({} sessions, {} queued tasks)",
                    first_seen.elapsed(),
                    sessions.len(),
                    remaining_count
                );
            }
        } else {
            *inner.no_progress_since.lock() = None;
        }

        // 11: paging, at most once per iteration.
        if no_progress && inner.policy.insufficient_memory(&inner.env, PAGING_SOURCE) {
            let made_progress = paging::page_or_evict(&inner.monitor, &sessions, PAGING_SOURCE, PAGING_TARGET);
            if made_progress {
                log::info!("paging or forced eviction made progress on {PAGING_SOURCE}");
                inner.work_event.notify();
            }
        }

        // 12: adaptive sleep.
        if scheduled == 0 {
            inner.work_event.wait_timeout(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        } else {
            backoff = INITIAL_BACKOFF;
        }

        // 13: block on the event counter if nothing remains, unless we're draining for shutdown.
        if total_remaining_count == 0 && !interrupting {
            inner.work_event.wait();
        }

        if interrupting && inner.sessions.lock().is_empty() {
            break;
        }
    }

    *inner.state.lock() = RunState::Stopped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_monitor::ResourceContext;
    use resources::{DeviceType, ResourceTag, ResourceType, Resources};
    use scheduler::Kind;
    use session::{OperationItem, OperationTask};
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::Arc as StdArc;

    struct OnceTask {
        ran: StdArc<StdAtomicBool>,
        device: DeviceType,
    }

    impl OperationTask for OnceTask {
        fn estimated_usage(&self, device: DeviceSpec) -> Resources {
            Resources::single(ResourceTag::new(ResourceType::Memory, device), 100)
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

    fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn scenario_a_single_session_single_task_completes_and_restores_limits() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let before = monitor.debug_limits();

        let executor = TaskExecutor::new(SchedulerConfig::new(Kind::Fair).with_worker_threads(1), monitor.clone());
        executor.start_execution();

        let session = SessionItem::new(1);
        session.install_callbacks(StdArc::new(NoopPaging), || {}, || {});
        executor.insert_session(session.clone());

        let ran = StdArc::new(StdAtomicBool::new(false));
        let item = OperationItem::new(
            Arc::downgrade(&session),
            1,
            Box::new(OnceTask {
                ran: ran.clone(),
                device: DeviceType::Gpu,
            }),
        );
        session.enqueue(item);

        assert!(wait_until(|| ran.load(Ordering::SeqCst), Duration::from_secs(2)));
        assert!(wait_until(|| monitor.debug_limits() == before, Duration::from_secs(2)));

        executor.delete_session(1);
        executor.stop_execution();
    }

    struct NoopPaging;
    impl session::PagingCallback for NoopPaging {
        fn volunteer(&self, _ticket: resources::Ticket, _target: ResourceContext) -> u64 {
            0
        }
    }
}