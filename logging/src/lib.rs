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

///
/// Thin wrapper over `env_logger` that gives the scheduler a single, idempotent place to
/// configure process-wide logging. Scheduling-loop no-progress warnings, paging decisions, and
/// OOM/eviction events are all logged through the standard `log` macros; this module only
/// controls how they are formatted and filtered.
///
use std::io::Write;
use std::sync::Once;

use chrono::Local;
use colored::Colorize;
use log::Level;

static INIT: Once = Once::new();

/// Initialize the global logger at the given level filter. Safe to call more than once; only
/// the first call takes effect, matching `env_logger`'s own idempotency contract.
pub fn init(level: log::LevelFilter) {
    INIT.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                let level_str = colorize_level(record.level());
                writeln!(
                    buf,
                    "{} {} {}: {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    level_str,
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from the `RUST_LOG`-style `SCHED_LOG` environment variable, defaulting to
/// `info` when unset or unparseable.
pub fn init_from_env() {
    let level = std::env::var("SCHED_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    init(level);
}

fn colorize_level(level: Level) -> colored::ColoredString {
    match level {
        Level::Error => "ERROR".red().bold(),
        Level::Warn => "WARN ".yellow().bold(),
        Level::Info => "INFO ".green(),
        Level::Debug => "DEBUG".blue(),
        Level::Trace => "TRACE".dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(log::LevelFilter::Debug);
        init(log::LevelFilter::Trace);
        log::info!("logging is initialized");
    }
}
