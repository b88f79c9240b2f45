// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use parking_lot::Mutex;
use resources::{Resources, Ticket};

struct State {
    limits: Resources,
    in_use: HashMap<Ticket, Resources>,
    total_in_use: Resources,
    next_ticket: u64,
}

///
/// A thin registry of "live job" admission, distinct from `ResourceMonitor`: the monitor
/// accounts *live* kernel allocations, while the regulator gates *iteration starts* against a
/// session's predicted peak. A session's `IterAllocTracker` asks the regulator to admit an
/// iteration's estimated temporary footprint before the iteration is allowed to run, and
/// releases the admission once the tracker observes that the iteration's peak has passed.
///
pub struct AllocationRegulator {
    state: Mutex<State>,
}

impl AllocationRegulator {
    pub fn new(limits: Resources) -> Self {
        Self {
            state: Mutex::new(State {
                limits,
                in_use: HashMap::new(),
                total_in_use: Resources::new(),
                next_ticket: 1,
            }),
        }
    }

    /// Issues a fresh ticket identifying one session's long-lived registration with the
    /// regulator, independent of the per-task tickets handed out by `ResourceMonitor`.
    pub fn issue_ticket(&self) -> Ticket {
        let mut state = self.state.lock();
        let ticket = Ticket::from_counter(state.next_ticket);
        state.next_ticket += 1;
        ticket
    }

    /// Attempts to admit `amount` of in-flight predicted usage for `ticket`. Returns true and
    /// records the amount as in-use iff doing so keeps the regulator's aggregate in-use total
    /// within its configured limits.
    pub fn begin_allocation(&self, ticket: Ticket, amount: &Resources) -> bool {
        let mut state = self.state.lock();
        let mut projected = state.total_in_use.clone();
        projected.merge(amount);
        if !state.limits.covers(&projected) {
            return false;
        }
        state.total_in_use = projected;
        state.in_use.entry(ticket).or_default().merge(amount);
        true
    }

    /// Releases a specific amount of previously admitted usage for `ticket`.
    pub fn end_allocation(&self, ticket: Ticket, amount: &Resources) {
        let mut state = self.state.lock();
        let Some(entry) = state.in_use.get_mut(&ticket) else {
            return;
        };
        for (tag, value) in amount.iter() {
            let removed = entry.subtract_bounded(*tag, *value);
            state.total_in_use.subtract_bounded(*tag, removed);
        }
        if entry.is_empty() {
            state.in_use.remove(&ticket);
        }
    }

    /// Releases every remaining admitted amount for `ticket`, e.g. when a session's job ends.
    pub fn finish_job(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        let Some(entry) = state.in_use.remove(&ticket) else {
            return;
        };
        for (tag, value) in entry.iter() {
            state.total_in_use.subtract_bounded(*tag, *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resources::{DeviceSpec, ResourceTag};

    fn mem(amount: u64) -> Resources {
        Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), amount)
    }

    #[test]
    fn admits_while_under_the_aggregate_limit() {
        let regulator = AllocationRegulator::new(mem(100));
        let t1 = Ticket::from_counter(1);
        let t2 = Ticket::from_counter(2);
        assert!(regulator.begin_allocation(t1, &mem(60)));
        assert!(!regulator.begin_allocation(t2, &mem(60)));
        regulator.end_allocation(t1, &mem(60));
        assert!(regulator.begin_allocation(t2, &mem(60)));
    }

    #[test]
    fn issue_ticket_is_monotonic() {
        let regulator = AllocationRegulator::new(mem(100));
        let first = regulator.issue_ticket();
        let second = regulator.issue_ticket();
        assert!(second.get() > first.get());
    }

    #[test]
    fn finish_job_releases_any_remainder() {
        let regulator = AllocationRegulator::new(mem(100));
        let t1 = Ticket::from_counter(1);
        assert!(regulator.begin_allocation(t1, &mem(90)));
        regulator.finish_job(t1);
        let t2 = Ticket::from_counter(2);
        assert!(regulator.begin_allocation(t2, &mem(90)));
    }
}