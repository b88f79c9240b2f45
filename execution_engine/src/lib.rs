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

//! The iteration-level scheduler: routes iterations into per-lane queues keyed by execution
//! context, runs inexpensive iterations immediately and independently, and serializes expensive
//! iterations one at a time per lane under a pluggable `scheduler::Kind` ordering policy. Sits
//! one level above `task_executor`, which schedules the individual ops an iteration dispatches.

mod config;
mod engine;
mod lane;
mod policy;

pub use config::EngineConfig;
pub use engine::ExecutionEngine;
