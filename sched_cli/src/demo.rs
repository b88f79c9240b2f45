// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A synthetic workload exercising the whole pipeline end to end: a handful of sessions, each
//! submitting a chain of cheap iterations whose iterations in turn submit a couple of
//! `OperationTask`s. Stands in for the RPC/framework layer spec.md places out of scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use execution_engine::ExecutionEngine;
use resource_monitor::{AllocationRegulator, ResourceContext};
use resources::{DeviceSpec, DeviceType, ResStats, ResourceTag, Resources};
use session::{
    ExecutionContext, IterationContext, IterationItem, IterationTask, OperationItem, OperationTask,
    RunCallbacks, SessionItem,
};
use task_executor::TaskExecutor;

const GPU0: DeviceSpec = DeviceSpec::gpu(0);

/// A trivial kernel that "allocates" a fixed amount of GPU memory for the duration of its run
/// and immediately reports done. Stands in for the op-library's real kernels.
struct DemoTask {
    session_id: u64,
    memory_bytes: u64,
}

impl OperationTask for DemoTask {
    fn estimated_usage(&self, _device: DeviceSpec) -> Resources {
        Resources::single(ResourceTag::memory(GPU0), self.memory_bytes)
    }

    fn has_exact_estimation(&self, _device: DeviceSpec) -> bool {
        true
    }

    fn supported_device_types(&self) -> Vec<DeviceType> {
        vec![DeviceType::Gpu]
    }

    fn prepare(&mut self, _rctx: ResourceContext) -> bool {
        true
    }

    fn run(&mut self, callbacks: Box<dyn RunCallbacks>) {
        log::debug!(
            "session {} task running, {} bytes on {GPU0}",
            self.session_id,
            self.memory_bytes
        );
        std::thread::sleep(Duration::from_millis(20));
        callbacks.done();
    }

    fn cancel(&mut self) {}

    fn is_async(&self) -> bool {
        false
    }
}

/// A short-lived iteration that enqueues a couple of `DemoTask`s onto its own session and
/// finishes as soon as they're dispatched (it doesn't wait on their completion; real iterations
/// would gate on a graph-level done signal instead).
struct DemoIteration {
    graph_id: u64,
    session: Arc<SessionItem>,
    memory_bytes: u64,
}

impl IterationTask for DemoIteration {
    fn graph_id(&self) -> u64 {
        self.graph_id
    }

    fn estimated_peak_allocation(&self, _device: DeviceSpec) -> ResStats {
        ResStats::new(self.memory_bytes, 0, 2)
    }

    fn is_expensive(&self) -> bool {
        false
    }

    fn prepare(&mut self) -> bool {
        true
    }

    fn run_async(&mut self, ctx: Arc<IterationContext>) {
        let session_id = self.session.id();
        for _ in 0..2 {
            let item = OperationItem::new(
                Arc::downgrade(&self.session),
                self.graph_id,
                Box::new(DemoTask {
                    session_id,
                    memory_bytes: self.memory_bytes / 2,
                }),
            );
            self.session.enqueue(item);
        }
        ctx.finish();
    }

    fn is_canceled(&self) -> bool {
        false
    }

    fn cancel(&mut self) {}
}

struct LoggingPaging(u64);

impl session::PagingCallback for LoggingPaging {
    fn volunteer(&self, ticket: resources::Ticket, _target: ResourceContext) -> u64 {
        log::info!("session {} volunteering {ticket} for paging", self.0);
        0
    }
}

/// Admits `num_sessions` synthetic sessions onto `executor`/`engine` and keeps feeding each a
/// fresh iteration every tick until the caller tears the demo down. Returns the admitted
/// sessions so the caller can `delete_session` them at shutdown.
pub fn spawn_demo_sessions(
    executor: &TaskExecutor,
    engine: &ExecutionEngine,
    regulator: &Arc<AllocationRegulator>,
    num_sessions: u64,
) -> Vec<Arc<SessionItem>> {
    let mut sessions = Vec::with_capacity(num_sessions as usize);
    for i in 1..=num_sessions {
        let session = SessionItem::new(i);
        session.install_callbacks(
            Arc::new(LoggingPaging(i)),
            move || log::info!("session {i} interrupted"),
            move || log::info!("session {i} cleaned up"),
        );
        executor.insert_session(session.clone());

        let ticket = regulator.issue_ticket();
        let lane_id = i % 2;
        let execution = ExecutionContext::new(ticket, session.clone(), lane_id);
        execution.set_expected_running_time(Duration::from_secs(i));
        let graph_counter = Arc::new(AtomicU64::new(0));
        spawn_iteration_feeder(engine.clone(), execution, session.clone(), graph_counter);

        sessions.push(session);
    }
    sessions
}

/// How many iterations a demo session's feeder submits before retiring. Bounds the demo thread's
/// lifetime without needing a cross-thread shutdown signal.
const FEEDER_ITERATIONS: u64 = 40;

/// Spawns a background thread owning `execution` for its lifetime and submitting one
/// inexpensive iteration per tick. The strong reference keeps `execution` (and therefore the
/// lane routing it carries) alive for exactly as long as the feeder runs.
fn spawn_iteration_feeder(
    engine: ExecutionEngine,
    execution: Arc<ExecutionContext>,
    session: Arc<SessionItem>,
    graph_counter: Arc<AtomicU64>,
) {
    std::thread::spawn(move || {
        let weak_execution = Arc::downgrade(&execution);
        for _ in 0..FEEDER_ITERATIONS {
            let graph_id = graph_counter.fetch_add(1, Ordering::Relaxed);
            let iteration = IterationItem::new(
                weak_execution.clone(),
                Box::new(DemoIteration {
                    graph_id,
                    session: session.clone(),
                    memory_bytes: 64 * 1024 * 1024,
                }),
            );
            engine.schedule_iteration(iteration);
            std::thread::sleep(Duration::from_millis(250));
        }
    });
}
