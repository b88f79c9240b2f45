// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::num::NonZeroU64;

///
/// Opaque, monotonically increasing identifier for one session's resource accounting. `0` is
/// never issued: a `Ticket` is always backed by a live allocation account in `ResourceMonitor`.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(NonZeroU64);

impl Ticket {
    /// Normally only constructed by `ResourceMonitor`'s internal counter; exposed so test
    /// fixtures elsewhere in the workspace can build tickets without a monitor instance.
    pub fn from_counter(value: u64) -> Self {
        Self(NonZeroU64::new(value).expect("ticket counter must never issue 0"))
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}