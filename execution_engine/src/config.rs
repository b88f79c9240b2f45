// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use scheduler::Kind;

/// Process-wide iteration-scheduling configuration (§6). Built once at startup; `ExecutionEngine`
/// treats it as immutable for its lifetime. Distinct from `task_executor::SchedulerConfig`: this
/// one governs which *iteration* runs next per lane, not which *task* within a running iteration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: Kind,
    /// When false, a lane dispatches at most one iteration per outer-loop pass instead of
    /// draining everything it can admit this pass.
    pub work_conservative: bool,
    /// `disableAdmissionControl`: when true, iterations skip the `AllocationRegulator` gate in
    /// `SessionItem::begin_iteration` entirely.
    pub disable_admission_control: bool,
    /// How long a lane may sit idle (empty queue, no expensive iteration running) before it is
    /// garbage-collected.
    pub lane_idle_timeout: std::time::Duration,
}

impl EngineConfig {
    pub fn new(scheduler: Kind) -> Self {
        Self {
            scheduler,
            work_conservative: true,
            disable_admission_control: false,
            lane_idle_timeout: std::time::Duration::from_secs(10),
        }
    }

    pub fn with_work_conservative(mut self, value: bool) -> Self {
        self.work_conservative = value;
        self
    }

    pub fn with_disable_admission_control(mut self, value: bool) -> Self {
        self.disable_admission_control = value;
        self
    }

    pub fn with_lane_idle_timeout(mut self, value: std::time::Duration) -> Self {
        self.lane_idle_timeout = value;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Kind::Fair)
    }
}