// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use resources::DeviceSpec;
use session::SessionItem;

use crate::env::{submit_all_tasks_from_queue, ChangeSet, SchedulerEnv};
use crate::BaseScheduler;

///
/// Orders candidates by monotonically increasing insertion-order priority, newest session first.
/// Backs the `preempt`, `rr`, and `fifo` policy names: all three share this task-level ordering,
/// and only diverge in how `ExecutionEngine` orders lane iterations.
///
pub struct PreemptScheduler {
    next_priority: AtomicU64,
}

impl PreemptScheduler {
    pub fn new() -> Self {
        Self {
            next_priority: AtomicU64::new(1),
        }
    }
}

impl Default for PreemptScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseScheduler for PreemptScheduler {
    fn notify_pre_scheduling_iteration(
        &self,
        sessions: &[Arc<SessionItem>],
        change_set: &ChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        for session in &change_set.newly_added {
            // Integer priorities assigned once, on first sight: no two sessions ever tie.
            let priority = self.next_priority.fetch_add(1, Ordering::Relaxed);
            session.set_priority(priority);
        }

        let mut candidates: Vec<Arc<SessionItem>> = sessions.to_vec();
        // Descending: the most recently admitted session is tried first.
        candidates.sort_by(|a, b| b.priority().cmp(&a.priority()));
        candidates
    }

    fn maybe_schedule_from(&self, env: &SchedulerEnv, session: &Arc<SessionItem>) -> (usize, bool) {
        let count = submit_all_tasks_from_queue(env, session);
        (count, env.work_conservative || count > 0)
    }

    fn insufficient_memory(&self, env: &SchedulerEnv, device: DeviceSpec) -> bool {
        env.insufficient_memory(device)
    }
}
