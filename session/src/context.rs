// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use resources::Ticket;

use crate::SessionItem;

///
/// Per-session public facade handed to the framework-adapter layer. Owns one `Ticket` (the
/// session's long-lived registration with the `AllocationRegulator`, distinct from the
/// per-task tickets `ResourceMonitor` hands out) and a strong reference to the shared
/// `SessionItem`. Items reference this only weakly, so the facade and its session can be torn
/// down without waiting on outstanding items to notice.
///
pub struct ExecutionContext {
    ticket: Ticket,
    session: Arc<SessionItem>,
    lane_id: Mutex<u64>,
}

impl ExecutionContext {
    pub fn new(ticket: Ticket, session: Arc<SessionItem>, lane_id: u64) -> Arc<Self> {
        Arc::new(Self {
            ticket,
            session,
            lane_id: Mutex::new(lane_id),
        })
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn session(&self) -> &Arc<SessionItem> {
        &self.session
    }

    pub fn lane_id(&self) -> u64 {
        *self.lane_id.lock()
    }

    pub fn set_lane_id(&self, lane_id: u64) {
        *self.lane_id.lock() = lane_id;
    }

    /// Declares the session's expected total running time, independent of how much of it has
    /// been used so far. Called by the framework adapter, not by the engine's own scheduling
    /// loop; the preempt policy reads the gap between this and `used_running_time` as the
    /// session's remaining budget.
    pub fn set_expected_running_time(&self, time: Duration) {
        self.session.set_total_running_time(time);
    }
}

/// What an `IterationContext` reports to whoever installed its completion hook.
pub struct IterationOutcome {
    pub execution: Option<Arc<ExecutionContext>>,
    pub graph_id: u64,
    pub expensive: bool,
    pub duration: Duration,
}

///
/// Handed to an `IterationTask::run_async` call; tracks the iteration's owning `ExecutionContext`
/// (weakly — see the data-model ownership summary), its expensiveness, and its start time so the
/// lane scheduler can account for `usedRunningTime` and the lane's expensive-slot bookkeeping
/// once the iteration finishes.
///
pub struct IterationContext {
    execution: Weak<ExecutionContext>,
    graph_id: u64,
    expensive: bool,
    started_at: Instant,
    finisher: Mutex<Option<Box<dyn FnOnce(IterationOutcome) + Send>>>,
}

impl IterationContext {
    pub fn new(
        execution: Weak<ExecutionContext>,
        graph_id: u64,
        expensive: bool,
        on_done: impl FnOnce(IterationOutcome) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            execution,
            graph_id,
            expensive,
            started_at: Instant::now(),
            finisher: Mutex::new(Some(Box::new(on_done))),
        })
    }

    pub fn execution(&self) -> Option<Arc<ExecutionContext>> {
        self.execution.upgrade()
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn is_expensive(&self) -> bool {
        self.expensive
    }

    /// Reports completion, invoking the installed hook exactly once. Safe to call from whatever
    /// thread the iteration actually finishes on; later calls are no-ops.
    pub fn finish(&self) {
        let Some(hook) = self.finisher.lock().take() else {
            return;
        };
        hook(IterationOutcome {
            execution: self.execution(),
            graph_id: self.graph_id,
            expensive: self.expensive,
            duration: self.started_at.elapsed(),
        });
    }
}
