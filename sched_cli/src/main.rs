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

//! A small in-process demo driver: wires a `ResourceMonitor`, `AllocationRegulator`,
//! `TaskExecutor` and `ExecutionEngine` together under a chosen `scheduler::Kind`, admits a
//! handful of synthetic sessions, and runs them for a fixed duration while logging progress.

mod demo;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use resource_monitor::{AllocationRegulator, ResourceMonitor};
use resources::{DeviceSpec, ResourceTag, Resources};
use scheduler::Kind;
use task_executor::SchedulerConfig;

use execution_engine::{EngineConfig, ExecutionEngine};
use task_executor::TaskExecutor;

/// Demo command line for the GPU-sharing scheduler.
#[derive(Parser, Debug)]
#[command(name = "sched_cli", about = "Runs a synthetic multi-tenant workload against the scheduler")]
struct Args {
    /// One of fair, pack, preempt, rr, fifo.
    #[arg(long, default_value = "fair")]
    scheduler: String,

    /// Number of task-executor worker threads. Defaults to the executor's own heuristic.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of synthetic sessions to admit.
    #[arg(long, default_value_t = 3)]
    sessions: u64,

    /// How long to run the demo workload before shutting down.
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,
}

fn main() {
    logging::init_from_env();
    let args = Args::parse();

    let kind = Kind::parse(&args.scheduler).unwrap_or_else(|| {
        log::warn!("unrecognized --scheduler {:?}, falling back to fair", args.scheduler);
        Kind::Fair
    });

    let monitor = Arc::new(ResourceMonitor::new());
    monitor.initialize_default_limits();

    let regulator_limits = Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), 14 * 1024 * 1024 * 1024);
    let regulator = Arc::new(AllocationRegulator::new(regulator_limits));

    let mut task_config = SchedulerConfig::new(kind);
    if let Some(workers) = args.workers {
        task_config = task_config.with_worker_threads(workers);
    }
    let task_executor = TaskExecutor::new(task_config, monitor.clone());
    task_executor.start_execution();

    let engine = ExecutionEngine::new(EngineConfig::new(kind), regulator.clone());
    engine.start_execution();

    let sessions = demo::spawn_demo_sessions(&task_executor, &engine, &regulator, args.sessions);

    let rt = runtime::Executor::new_owned(2).expect("failed to start demo runtime");
    rt.block_on(async {
        let mut remaining = Duration::from_secs(args.duration_secs);
        let tick = Duration::from_secs(1);
        while !remaining.is_zero() {
            tokio::time::sleep(tick.min(remaining)).await;
            remaining = remaining.saturating_sub(tick);
            log::info!(
                "t-{}s: gpu memory remaining = {}",
                remaining.as_secs(),
                monitor.debug_limits().get(&ResourceTag::memory(DeviceSpec::gpu(0)))
            );
            log::debug!("scheduler debug state: {:?}", task_executor.debug_state().missing);
        }
    });

    for session in &sessions {
        task_executor.delete_session(session.id());
    }
    task_executor.stop_execution();
    engine.stop_execution();
    rt.shutdown(Duration::from_secs(2));

    log::info!("demo workload complete");
}
