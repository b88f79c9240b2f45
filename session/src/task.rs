// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use resource_monitor::ResourceContext;
use resources::{DeviceSpec, DeviceType, ResStats, Resources};

use crate::IterationContext;

/// Callbacks an `OperationTask::run` invokes to report its outcome back to the executor.
pub trait RunCallbacks: Send {
    /// The task completed (successfully or with an ordinary, non-memory error).
    fn done(&self);

    /// The task failed to allocate memory mid-run. Returns whether the failure was consumed
    /// (the item will be requeued) or must be reported to the task's own caller (the task has an
    /// exact estimate and the session's OOM protection is currently disabled).
    fn mem_failure(&self) -> bool;
}

///
/// The contract an operation ("kernel") supplied by the external op-library must satisfy.
/// Instances are owned exclusively by their `OperationItem`.
///
pub trait OperationTask: Send {
    fn estimated_usage(&self, device: DeviceSpec) -> Resources;

    fn has_exact_estimation(&self, device: DeviceSpec) -> bool;

    fn supported_device_types(&self) -> Vec<DeviceType>;

    /// Called once a `ResourceContext` has been preallocated for this task. Returning false
    /// aborts the dispatch; the context's staging is released by its own `Drop`.
    fn prepare(&mut self, rctx: ResourceContext) -> bool;

    fn run(&mut self, callbacks: Box<dyn RunCallbacks>);

    fn cancel(&mut self);

    fn is_async(&self) -> bool;
}

///
/// The contract an iteration (a self-contained computational sub-graph) must satisfy. Instances
/// are owned exclusively by their `IterationItem`.
///
pub trait IterationTask: Send {
    fn graph_id(&self) -> u64;

    fn estimated_peak_allocation(&self, device: DeviceSpec) -> ResStats;

    /// Marks this iteration as one that must be serialized against other expensive iterations on
    /// its lane (at most one runs concurrently per lane). Inexpensive iterations bypass that gate
    /// entirely and are always tried immediately.
    fn is_expensive(&self) -> bool;

    /// Called by the lane scheduler only after the owning session's memory admission (the
    /// `AllocationRegulator` gate) has already succeeded for this pass. Returning false aborts
    /// this dispatch attempt (the caller should retry a later pass); a true return means the
    /// iteration is actually starting and `run_async` will be called next.
    fn prepare(&mut self) -> bool;

    fn run_async(&mut self, ctx: Arc<IterationContext>);

    fn is_canceled(&self) -> bool;

    fn cancel(&mut self);
}