// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use resources::DeviceSpec;
use session::SessionItem;

use crate::env::{submit_all_tasks_from_queue, ChangeSet, SchedulerEnv};
use crate::BaseScheduler;

/// Every session is a candidate, tried in original order, and scheduling always continues to the
/// next one regardless of how much the current one scheduled.
pub struct PackScheduler;

impl PackScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseScheduler for PackScheduler {
    fn notify_pre_scheduling_iteration(
        &self,
        sessions: &[Arc<SessionItem>],
        _change_set: &ChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        sessions.to_vec()
    }

    fn maybe_schedule_from(&self, env: &SchedulerEnv, session: &Arc<SessionItem>) -> (usize, bool) {
        let count = submit_all_tasks_from_queue(env, session);
        (count, true)
    }

    fn insufficient_memory(&self, env: &SchedulerEnv, device: DeviceSpec) -> bool {
        env.insufficient_memory(device)
    }
}