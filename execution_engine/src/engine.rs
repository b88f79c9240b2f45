// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use resource_monitor::AllocationRegulator;
use resources::{DeviceSpec, ResourceTag};
use session::{IterationContext, IterationItem, SessionItem};
use work_pool::WorkEvent;

use crate::config::EngineConfig;
use crate::lane::LaneQueue;
use crate::policy;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// The device an iteration's peak allocation is tracked against. Fixed, as in
/// `task_executor`'s `PAGING_SOURCE`/`PAGING_TARGET`: a future multi-GPU deployment would make
/// this a per-lane or per-session parameter instead.
const ITER_DEVICE: DeviceSpec = DeviceSpec::gpu(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Interrupting,
}

/// Bookkeeping for one currently-dispatched iteration, kept around only so the scheduling loop
/// can feed fresh allocation samples into its `IterAllocTracker` while it runs.
struct ActiveIter {
    session: Weak<SessionItem>,
    graph_id: u64,
}

struct Inner {
    config: EngineConfig,
    regulator: Arc<AllocationRegulator>,

    lanes: Mutex<HashMap<u64, Arc<LaneQueue>>>,
    incoming: Mutex<Vec<Arc<IterationItem>>>,
    active: Mutex<HashMap<usize, ActiveIter>>,

    state: Mutex<RunState>,
    work_event: WorkEvent,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lane(&self, lane_id: u64) -> Arc<LaneQueue> {
        self.lanes
            .lock()
            .entry(lane_id)
            .or_insert_with(|| Arc::new(LaneQueue::new(lane_id)))
            .clone()
    }
}

///
/// The iteration-level scheduling engine (§4.10). Routes incoming iterations into per-lane
/// queues keyed by `ExecutionContext::lane_id`, runs every inexpensive iteration immediately and
/// independently, and serializes expensive iterations one-per-lane under the configured
/// `BaseScheduler` policy kind. Distinct from `task_executor::TaskExecutor`, which schedules the
/// individual ops (tasks) an iteration dispatches, not the iterations themselves.
///
#[derive(Clone)]
pub struct ExecutionEngine(Arc<Inner>);

impl ExecutionEngine {
    pub fn new(config: EngineConfig, regulator: Arc<AllocationRegulator>) -> Self {
        let inner = Arc::new(Inner {
            config,
            regulator,
            lanes: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            state: Mutex::new(RunState::Stopped),
            work_event: WorkEvent::new(),
            thread: Mutex::new(None),
        });
        ExecutionEngine(inner)
    }

    /// Submits a freshly created iteration. Thread-safe; callable from any thread.
    pub fn schedule_iteration(&self, item: Arc<IterationItem>) {
        self.0.incoming.lock().push(item);
        self.0.work_event.notify();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    /// Number of lanes currently tracked, live or merely pending garbage collection. For tests
    /// and introspection.
    pub fn lane_count(&self) -> usize {
        self.0.lanes.lock().len()
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
            .name("gpu-sched-exec-engine".to_string())
            .spawn(move || scheduling_loop(inner))
            .expect("failed to spawn execution engine thread");
        *self.0.thread.lock() = Some(handle);
    }

    /// Requests the loop stop, wakes it, and joins the scheduling thread. Blocks until every
    /// lane has drained and every in-flight iteration has finished.
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

fn scheduling_loop(inner: Arc<Inner>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let interrupting = *inner.state.lock() == RunState::Interrupting;

        // 1: route newly submitted iterations into their lane, keyed by ExecutionContext::lane_id.
        let incoming: Vec<Arc<IterationItem>> = std::mem::take(&mut *inner.incoming.lock());
        for item in incoming {
            let Some(ctx) = item.upgrade_execution() else {
                // SessionGone: silently dropped.
                continue;
            };
            let lane = inner.lane(ctx.lane_id());
            lane.note_session(ctx.session());
            lane.push(item);
        }

        // 2: prune dead sessions from every lane.
        let lanes: Vec<Arc<LaneQueue>> = inner.lanes.lock().values().cloned().collect();
        for lane in &lanes {
            lane.prune_dead_sessions();
        }

        // 3: feed a fresh allocation sample into every active iteration's tracker, letting it
        // release its regulator hold early once the iteration's peak has passed.
        let tag = ResourceTag::memory(ITER_DEVICE);
        for active in inner.active.lock().values() {
            if let Some(session) = active.session.upgrade() {
                session.update_iteration(&inner.regulator, active.graph_id, session.usage_of(tag));
            }
        }

        // 4: schedule each lane independently.
        let mut scheduled = 0usize;
        let mut remaining = 0usize;
        for lane in &lanes {
            let (count, left) = schedule_on_queue(&inner, lane);
            scheduled += count;
            remaining += left;
        }

        // 5: garbage-collect lanes that have sat idle, empty, with nothing running.
        let idle_timeout = inner.config.lane_idle_timeout;
        inner.lanes.lock().retain(|id, lane| {
            let collectible = lane.is_collectible(idle_timeout);
            if collectible {
                log::debug!("garbage-collecting idle lane {id}");
            }
            !collectible
        });

        // 6: interrupt completion check.
        if interrupting && inner.lanes.lock().is_empty() && inner.active.lock().is_empty() {
            break;
        }

        // 7: adaptive backoff.
        if scheduled == 0 {
            inner.work_event.wait_timeout(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        } else {
            backoff = INITIAL_BACKOFF;
        }

        // 8: block on the event counter if nothing remains, unless draining for shutdown.
        if remaining == 0 && inner.active.lock().is_empty() && !interrupting {
            inner.work_event.wait();
        }

        if interrupting && inner.lanes.lock().is_empty() && inner.active.lock().is_empty() {
            break;
        }
    }

    *inner.state.lock() = RunState::Stopped;
}

/// Drains `lane`'s queue and tries to dispatch as much of it as this pass allows. Inexpensive
/// iterations are always tried, each independently of the others and of the lane's expensive
/// slot. Expensive iterations are ordered (or filtered) by the configured policy and at most one
/// may hold the lane's single expensive slot at a time. Returns `(dispatched, still_queued)`.
fn schedule_on_queue(inner: &Arc<Inner>, lane: &Arc<LaneQueue>) -> (usize, usize) {
    let items = lane.drain();
    let (expensive, inexpensive): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| item.is_expensive());

    let ordered_expensive = policy::order_expensive(inner.config.scheduler, lane, expensive.clone());
    let mut candidates: Vec<Arc<IterationItem>> = inexpensive.into_iter().chain(ordered_expensive).collect();

    // Anything the policy filtered out (fifo/preempt keep only one session's share) goes
    // straight back onto the lane queue, not through the dispatch attempt below.
    let chosen_ids: std::collections::HashSet<usize> =
        candidates.iter().map(|item| Arc::as_ptr(item) as usize).collect();
    let mut deferred: Vec<Arc<IterationItem>> =
        expensive.into_iter().filter(|item| !chosen_ids.contains(&(Arc::as_ptr(item) as usize))).collect();

    let mut dispatched = 0usize;
    let mut candidates = candidates.into_iter();
    for item in &mut candidates {
        if !inner.config.work_conservative && dispatched >= 1 {
            deferred.push(item);
            break;
        }
        if try_dispatch(inner, lane, &item) {
            dispatched += 1;
        } else {
            deferred.push(item);
        }
    }
    // Whatever candidates weren't reached this pass (work-conservative cutoff) still need a home.
    deferred.extend(candidates);

    let remaining = deferred.len();
    lane.requeue(deferred);
    (dispatched, remaining)
}

/// Attempts to start one iteration. Returns true if the item was consumed this pass (either
/// successfully dispatched, or permanently dropped because its session or context is gone);
/// false if the caller should put it back on the lane queue and retry on a later pass.
fn try_dispatch(inner: &Arc<Inner>, lane: &Arc<LaneQueue>, item: &Arc<IterationItem>) -> bool {
    let Some(ctx) = item.upgrade_execution() else {
        return true;
    };
    let session = ctx.session().clone();
    if session.is_force_evicted() {
        item.cancel();
        return true;
    }

    let expensive = item.is_expensive();
    if expensive && !lane.try_reserve_expensive_slot() {
        return false;
    }

    let graph_id = item.graph_id();
    let estimation = item.estimated_peak_allocation(ITER_DEVICE);
    let admission_control = !inner.config.disable_admission_control;
    if !session.begin_iteration(&inner.regulator, ctx.ticket(), graph_id, ITER_DEVICE, estimation, admission_control) {
        if expensive {
            lane.release_expensive_slot();
        }
        return false;
    }

    if !item.prepare() {
        if expensive {
            lane.release_expensive_slot();
        }
        // The iteration never actually started: release exactly what was just reserved without
        // disturbing the tracker's running peak estimate.
        let amount = resources::Resources::single(ResourceTag::memory(ITER_DEVICE), estimation.temporary);
        inner.regulator.end_allocation(ctx.ticket(), &amount);
        item.cancel();
        return true;
    }

    let key = Arc::as_ptr(item) as usize;
    inner.active.lock().insert(
        key,
        ActiveIter {
            session: Arc::downgrade(&session),
            graph_id,
        },
    );

    let inner_done = inner.clone();
    let lane_done = lane.clone();
    let session_done = session.clone();
    let iter_ctx = IterationContext::new(item.execution_weak(), graph_id, expensive, move |outcome| {
        if outcome.expensive {
            lane_done.release_expensive_slot();
        }
        inner_done.active.lock().remove(&key);

        session_done.add_used_running_time(outcome.duration);
        session_done.increment_finished_iters();
        let tag = ResourceTag::memory(ITER_DEVICE);
        let current_peak = session_done.usage_of(tag);
        let count_seen = session_done.num_finished_iters();
        session_done.end_iteration(&inner_done.regulator, outcome.graph_id, current_peak, 0, count_seen);

        lane_done.record_dispatch(&session_done);
        inner_done.work_event.notify();
    });
    item.run_async(iter_ctx);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use resources::ResStats;
    use scheduler::Kind;
    use session::ExecutionContext;
    use std::sync::Arc as StdArc;
    use std::time::Instant;

    struct GatedIter {
        graph_id: u64,
        expensive: bool,
        slot: StdArc<Mutex<Option<StdArc<IterationContext>>>>,
    }

    impl session::IterationTask for GatedIter {
        fn graph_id(&self) -> u64 {
            self.graph_id
        }
        fn estimated_peak_allocation(&self, _device: DeviceSpec) -> ResStats {
            ResStats::new(0, 0, 0)
        }
        fn is_expensive(&self) -> bool {
            self.expensive
        }
        fn prepare(&mut self) -> bool {
            true
        }
        fn run_async(&mut self, ctx: StdArc<IterationContext>) {
            *self.slot.lock() = Some(ctx);
        }
        fn is_canceled(&self) -> bool {
            false
        }
        fn cancel(&mut self) {}
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

    fn big_regulator() -> Arc<AllocationRegulator> {
        Arc::new(AllocationRegulator::new(resources::Resources::single(
            ResourceTag::memory(ITER_DEVICE),
            1_000_000_000,
        )))
    }

    #[test]
    fn inexpensive_iterations_run_without_waiting_on_each_other() {
        let regulator = big_regulator();
        let engine = ExecutionEngine::new(EngineConfig::new(Kind::Fair), regulator.clone());
        engine.start_execution();

        let session = SessionItem::new(1);
        let exec = ExecutionContext::new(regulator.issue_ticket(), session.clone(), 0);

        let slot_a = StdArc::new(Mutex::new(None));
        let slot_b = StdArc::new(Mutex::new(None));
        let item_a = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 1, expensive: false, slot: slot_a.clone() }),
        );
        let item_b = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 2, expensive: false, slot: slot_b.clone() }),
        );
        engine.schedule_iteration(item_a);
        engine.schedule_iteration(item_b);

        assert!(wait_until(|| slot_a.lock().is_some(), Duration::from_secs(2)));
        assert!(wait_until(|| slot_b.lock().is_some(), Duration::from_secs(2)));

        slot_a.lock().take().unwrap().finish();
        slot_b.lock().take().unwrap().finish();
        engine.stop_execution();
    }

    #[test]
    fn at_most_one_expensive_iteration_runs_per_lane() {
        let regulator = big_regulator();
        let engine = ExecutionEngine::new(EngineConfig::new(Kind::Fair), regulator.clone());
        engine.start_execution();

        let session = SessionItem::new(1);
        let exec = ExecutionContext::new(regulator.issue_ticket(), session.clone(), 0);

        let slot_a = StdArc::new(Mutex::new(None));
        let slot_b = StdArc::new(Mutex::new(None));
        let item_a = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 1, expensive: true, slot: slot_a.clone() }),
        );
        let item_b = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 2, expensive: true, slot: slot_b.clone() }),
        );
        engine.schedule_iteration(item_a);
        engine.schedule_iteration(item_b);

        assert!(wait_until(|| slot_a.lock().is_some(), Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(100));
        assert!(slot_b.lock().is_none(), "second expensive iteration must wait for the lane's slot");

        slot_a.lock().take().unwrap().finish();
        assert!(wait_until(|| slot_b.lock().is_some(), Duration::from_secs(2)));

        slot_b.lock().take().unwrap().finish();
        engine.stop_execution();
    }

    #[test]
    fn idle_lane_is_garbage_collected() {
        let regulator = big_regulator();
        let mut config = EngineConfig::new(Kind::Fair);
        config.lane_idle_timeout = Duration::from_millis(20);
        let engine = ExecutionEngine::new(config, regulator.clone());
        engine.start_execution();

        let session = SessionItem::new(1);
        let exec = ExecutionContext::new(regulator.issue_ticket(), session.clone(), 7);
        let slot = StdArc::new(Mutex::new(None));
        let item = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 1, expensive: false, slot: slot.clone() }),
        );
        engine.schedule_iteration(item);
        assert!(wait_until(|| slot.lock().is_some(), Duration::from_secs(2)));
        slot.lock().take().unwrap().finish();

        assert!(wait_until(|| engine.lane_count() == 0, Duration::from_secs(2)));
        engine.stop_execution();
    }

    #[test]
    fn dropped_session_silently_drops_its_queued_iteration() {
        let regulator = big_regulator();
        let engine = ExecutionEngine::new(EngineConfig::new(Kind::Fair), regulator.clone());
        engine.start_execution();

        let session = SessionItem::new(1);
        let exec = ExecutionContext::new(regulator.issue_ticket(), session.clone(), 0);
        let slot = StdArc::new(Mutex::new(None));
        let item = IterationItem::new(
            StdArc::downgrade(&exec),
            Box::new(GatedIter { graph_id: 1, expensive: false, slot: slot.clone() }),
        );
        drop(exec);
        drop(session);
        engine.schedule_iteration(item);

        std::thread::sleep(Duration::from_millis(100));
        assert!(slot.lock().is_none());
        engine.stop_execution();
    }
}