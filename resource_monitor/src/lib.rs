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

//! Process-wide accounting for per-device resource capacity: the `ResourceMonitor` that charges
//! and releases amounts against live `Ticket`s, the `AllocationRegulator` that gates iteration
//! admission against a session's predicted ceiling, and the `ResourceContext`/`OperationScope`
//! RAII types a task uses to make a single allocation visible to listeners.

mod context;
mod monitor;
mod regulator;

pub use context::{AllocationListener, OperationScope, ResourceContext};
pub use monitor::{LockedProxy, ResourceMonitor};
pub use regulator::AllocationRegulator;

pub use resources::{DeviceSpec, DeviceType, ResStats, ResourceTag, ResourceType, Resources, Ticket};
