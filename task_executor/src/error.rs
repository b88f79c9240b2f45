// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use resources::DeviceSpec;

/// Errors `TaskExecutor` surfaces to a caller. Every other error kind in spec.md §7
/// (`RejectedAdmission`, `OutOfMemory`, `SessionGone`, `PoolQueueFull`) is handled locally by
/// the scheduling loop and never escapes as a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// An iteration's estimate was missing required fields; treated the same as a rejected
    /// admission but reported to the submitter rather than silently retried.
    #[error("malformed iteration estimate for graph {graph_id} on {device}")]
    ProtocolMismatch { graph_id: u64, device: DeviceSpec },

    /// The task or iteration was cancelled before it could run to completion.
    #[error("cancelled")]
    Cancelled,

    /// The executor was asked to do something that requires it to be running.
    #[error("task executor is not running")]
    NotRunning,
}