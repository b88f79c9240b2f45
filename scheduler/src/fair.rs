// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use resources::{DeviceSpec, ResourceTag};
use session::SessionItem;

use crate::env::{submit_all_tasks_from_queue, ChangeSet, SchedulerEnv};
use crate::BaseScheduler;

struct State {
    /// Running GPU:0 memory-time product per session id, accumulated across calls.
    counters: HashMap<u64, f64>,
    last_call: Option<Instant>,
}

///
/// Orders candidates ascending by each session's accumulated GPU:0 memory-time product since
/// scheduling began, so a session that has used little memory for little time is tried first.
///
pub struct FairScheduler {
    state: Mutex<State>,
    /// `useFairnessCounter`: when false, the counter is still accumulated (cheap) but ordering
    /// is skipped and candidates are tried in original order, same as `pack`.
    use_fairness_counter: bool,
}

impl FairScheduler {
    pub fn new() -> Self {
        Self::with_ordering(true)
    }

    pub fn with_ordering(use_fairness_counter: bool) -> Self {
        Self {
            state: Mutex::new(State {
                counters: HashMap::new(),
                last_call: None,
            }),
            use_fairness_counter,
        }
    }
}

impl Default for FairScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseScheduler for FairScheduler {
    fn notify_pre_scheduling_iteration(
        &self,
        sessions: &[Arc<SessionItem>],
        _change_set: &ChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let dt = state
            .last_call
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        state.last_call = Some(now);

        let tag = ResourceTag::memory(DeviceSpec::gpu(0));
        for session in sessions {
            let usage = session.usage_of(tag) as f64;
            *state.counters.entry(session.id()).or_insert(0.0) += usage * dt;
        }

        let mut candidates: Vec<Arc<SessionItem>> = sessions.to_vec();
        if !self.use_fairness_counter {
            return candidates;
        }
        candidates.sort_by(|a, b| {
            let ca = state.counters.get(&a.id()).copied().unwrap_or(0.0);
            let cb = state.counters.get(&b.id()).copied().unwrap_or(0.0);
            // Within floating-point tolerance, treat as tied: `sort_by` is stable, so ties keep
            // their original relative order (iteration of the session list).
            if (ca - cb).abs() < 1e-9 {
                std::cmp::Ordering::Equal
            } else {
                ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
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
