// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use scheduler::Kind;

/// Process-wide task-scheduling configuration (§6). Built once at startup; `TaskExecutor`
/// treats it as immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scheduler: Kind,
    /// When false, iteration-level scheduling dispatches at most one iteration per outer-loop
    /// pass. Also threaded into `fair`/`preempt`'s `maybe_schedule_from` continuation behavior.
    pub work_conservative: bool,
    /// `useFairnessCounter`: enables the fair-scheduler's counter-based ordering. Ignored by
    /// every policy except `fair`.
    pub use_fairness_counter: bool,
    /// Head-of-line threshold before a session's queue is scheduled head-only.
    pub max_hol_waiting: u64,
    /// `EXEC_SCHED_USE_GPU`: false means tasks are only ever scheduled on CPU.
    pub use_gpu: bool,
    pub num_worker_threads: usize,
    pub worker_queue_capacity: usize,
}

impl SchedulerConfig {
    pub fn new(scheduler: Kind) -> Self {
        Self {
            scheduler,
            work_conservative: true,
            use_fairness_counter: true,
            max_hol_waiting: 8,
            use_gpu: Self::use_gpu_from_env(),
            num_worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().max(2) / 2)
                .unwrap_or(1)
                .max(1),
            worker_queue_capacity: 4096,
        }
    }

    /// `EXEC_SCHED_USE_GPU`: absent or unparseable defaults to true (GPUs are scheduled).
    fn use_gpu_from_env() -> bool {
        std::env::var("EXEC_SCHED_USE_GPU")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true)
    }

    pub fn with_work_conservative(mut self, value: bool) -> Self {
        self.work_conservative = value;
        self
    }

    pub fn with_use_fairness_counter(mut self, value: bool) -> Self {
        self.use_fairness_counter = value;
        self
    }

    pub fn with_max_hol_waiting(mut self, value: u64) -> Self {
        self.max_hol_waiting = value;
        self
    }

    pub fn with_use_gpu(mut self, value: bool) -> Self {
        self.use_gpu = value;
        self
    }

    pub fn with_worker_threads(mut self, value: usize) -> Self {
        self.num_worker_threads = value.max(1);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(Kind::Fair)
    }
}