// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Pluggable task-scheduling policies (`fair`, `pack`, `preempt`/`rr`/`fifo`) built on a shared
//! set of helpers for preallocation, dispatch, and head-of-line queue handling.

mod env;
mod fair;
mod pack;
mod preempt;

pub use env::{
    maybe_preallocate_for, submit_all_tasks_from_queue, submit_task, ChangeSet, DebugState, SchedulerEnv,
    TaskDispatcher,
};
pub use fair::FairScheduler;
pub use pack::PackScheduler;
pub use preempt::PreemptScheduler;

use std::sync::Arc;

use resources::DeviceSpec;
use session::SessionItem;

///
/// A scheduling policy. `TaskExecutor` drives one implementation for the lifetime of the
/// process; `Kind` below names the closed set an operator can select via configuration.
///
pub trait BaseScheduler: Send + Sync {
    /// Called once per scheduling iteration. Returns the sessions to consider, in the order
    /// they should be tried.
    fn notify_pre_scheduling_iteration(
        &self,
        sessions: &[Arc<SessionItem>],
        change_set: &ChangeSet,
    ) -> Vec<Arc<SessionItem>>;

    /// Attempts to submit tasks from `session`'s scheduler queue. Returns the number of tasks
    /// successfully submitted and whether the caller should continue to the next candidate.
    fn maybe_schedule_from(&self, env: &SchedulerEnv, session: &Arc<SessionItem>) -> (usize, bool);

    /// Aggregated, from this iteration's prealloc failures, whether `device` is short on memory.
    fn insufficient_memory(&self, env: &SchedulerEnv, device: DeviceSpec) -> bool;
}

/// The closed set of policy names a deployment can select (§6 `scheduler` option).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Fair,
    Pack,
    Preempt,
    Rr,
    Fifo,
}

impl Kind {
    pub fn parse(name: &str) -> Option<Kind> {
        match name {
            "fair" => Some(Kind::Fair),
            "pack" => Some(Kind::Pack),
            "preempt" => Some(Kind::Preempt),
            "rr" => Some(Kind::Rr),
            "fifo" => Some(Kind::Fifo),
            _ => None,
        }
    }

    /// Builds the task-level policy for this kind. `rr` and `fifo` share the preempt-style
    /// insertion-order priority scheme at the task-scheduling level; they only diverge from
    /// `preempt` in how `ExecutionEngine` orders lane iterations (see the `execution_engine`
    /// crate).
    pub fn build(self) -> Arc<dyn BaseScheduler> {
        self.build_with(true)
    }

    /// Like `build`, but threads through `useFairnessCounter` (§6): when false, `fair`
    /// degrades to trying candidates in original order instead of counter-sorted order. Other
    /// policies ignore the flag.
    pub fn build_with(self, use_fairness_counter: bool) -> Arc<dyn BaseScheduler> {
        match self {
            Kind::Fair => Arc::new(FairScheduler::with_ordering(use_fairness_counter)),
            Kind::Pack => Arc::new(PackScheduler::new()),
            Kind::Preempt | Kind::Rr | Kind::Fifo => Arc::new(PreemptScheduler::new()),
        }
    }
}
