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

//! Task-level scheduling (the outer loop of the two-level scheduler): drives one pluggable
//! `BaseScheduler` policy over a set of live sessions, preallocates resources for each prepared
//! task through `resource_monitor`, dispatches onto a `work_pool::ThreadPool`, and recovers from
//! memory exhaustion by paging tensors off the busiest device or force-evicting a session.

mod config;
mod error;
mod executor;
mod paging;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use executor::TaskExecutor;
