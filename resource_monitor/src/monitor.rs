// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use resources::{DeviceSpec, ResourceTag, Resources, Ticket};

const DEFAULT_GPU0_MEMORY_BYTES: u64 = 14 * 1024 * 1024 * 1024;
const DEFAULT_CPU0_MEMORY_BYTES: u64 = 100 * 1024 * 1024 * 1024;

struct State {
    /// Remaining capacity of each pool.
    limits: Resources,
    /// Reservations held by a ticket but not yet charged.
    staging: HashMap<Ticket, Resources>,
    /// Amounts currently charged to a ticket.
    using: HashMap<Ticket, Resources>,
    next_ticket: u64,
}

impl State {
    fn new() -> Self {
        Self {
            limits: Resources::new(),
            staging: HashMap::new(),
            using: HashMap::new(),
            next_ticket: 1,
        }
    }

    fn issue_ticket(&mut self) -> Ticket {
        let ticket = Ticket::from_counter(self.next_ticket);
        self.next_ticket += 1;
        ticket
    }

    fn pre_allocate(&mut self, req: &Resources) -> Result<Ticket, Resources> {
        let missing = self.limits.deficit(req);
        if !missing.is_empty() {
            return Err(missing);
        }
        let ticket = self.issue_ticket();
        self.limits = std::mem::take(&mut self.limits) - req.clone();
        self.staging.insert(ticket, req.clone());
        Ok(ticket)
    }

    fn allocate(&mut self, ticket: Ticket, res: &Resources) -> bool {
        let staged = self.staging.entry(ticket).or_default();
        if staged.covers(res) {
            for (tag, amount) in res.iter() {
                staged.subtract_bounded(*tag, *amount);
            }
            self.using.entry(ticket).or_default().merge(res);
            return true;
        }

        // Staging alone can't cover the request: see whether topping up from `limits` can.
        let shortfall = staged.deficit(res);
        if !self.limits.covers(&shortfall) {
            return false;
        }
        for (tag, amount) in res.iter() {
            let from_staging = staged.get(tag).min(*amount);
            staged.subtract_bounded(*tag, from_staging);
            let from_limits = amount - from_staging;
            if from_limits > 0 {
                self.limits.subtract_bounded(*tag, from_limits);
            }
        }
        self.using.entry(ticket).or_default().merge(res);
        true
    }

    fn free(&mut self, ticket: Ticket, res: &Resources) -> bool {
        let Some(charged) = self.using.get_mut(&ticket) else {
            return true;
        };
        for (tag, amount) in res.iter() {
            let removed = charged.subtract_bounded(*tag, *amount);
            self.limits.add(*tag, removed);
        }
        let now_empty = charged.is_empty();
        if now_empty {
            self.using.remove(&ticket);
        }
        now_empty
    }

    fn free_staging(&mut self, ticket: Ticket) {
        if let Some(staged) = self.staging.remove(&ticket) {
            self.limits.merge(&staged);
        }
    }

    fn query_usage(&self, ticket: Ticket) -> Resources {
        self.using.get(&ticket).cloned().unwrap_or_default()
    }

    fn query_usages(&self, tickets: &[Ticket]) -> Resources {
        let mut total = Resources::new();
        for ticket in tickets {
            total.merge(&self.query_usage(*ticket));
        }
        total
    }

    fn sort_victim(&self, tickets: &[Ticket], device: DeviceSpec) -> Vec<(u64, Ticket)> {
        let tag = ResourceTag::memory(device);
        let mut by_usage: Vec<(u64, Ticket)> = tickets
            .iter()
            .map(|t| (self.query_usage(*t).get(&tag), *t))
            .collect();
        by_usage.sort_by(|a, b| b.0.cmp(&a.0));
        by_usage
    }
}

///
/// Process-wide bookkeeper of per-device capacities. All operations are thread-safe under a
/// single internal mutex; `lock()` returns a `LockedProxy` that exposes the same operations
/// without re-acquiring it, for call sites that must compose several operations atomically
/// (e.g. `ResourceContext::alloc`).
///
pub struct ResourceMonitor {
    state: Mutex<State>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }

    /// Seeds default per-device capacities: 14 GiB memory on GPU:0, 100 GiB on CPU:0.
    pub fn initialize_default_limits(&self) {
        let mut state = self.state.lock();
        state
            .limits
            .set(ResourceTag::memory(DeviceSpec::gpu(0)), DEFAULT_GPU0_MEMORY_BYTES);
        state
            .limits
            .set(ResourceTag::memory(DeviceSpec::cpu(0)), DEFAULT_CPU0_MEMORY_BYTES);
    }

    /// Seeds capacities from an externally provided cap, clamping each tag to the minimum of its
    /// requested and currently-set value.
    pub fn initialize_limits_capped(&self, cap: &Resources) {
        let mut state = self.state.lock();
        for (tag, amount) in cap.iter() {
            let current = state.limits.get(tag);
            state.limits.set(*tag, current.min(*amount));
        }
    }

    pub fn lock(&self) -> LockedProxy<'_> {
        LockedProxy {
            state: self.state.lock(),
        }
    }

    pub fn pre_allocate(&self, req: &Resources) -> Result<Ticket, Resources> {
        let result = self.lock().pre_allocate(req);
        if let Err(missing) = &result {
            log::debug!("preallocate rejected, missing={missing:?}");
        }
        result
    }

    pub fn allocate(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().allocate(ticket, res)
    }

    pub fn free(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().free(ticket, res)
    }

    pub fn free_staging(&self, ticket: Ticket) {
        self.lock().free_staging(ticket)
    }

    pub fn query_usage(&self, ticket: Ticket) -> Resources {
        self.lock().query_usage(ticket)
    }

    pub fn query_usages(&self, tickets: &[Ticket]) -> Resources {
        self.lock().query_usages(tickets)
    }

    pub fn sort_victim(&self, tickets: &[Ticket], device: DeviceSpec) -> Vec<(u64, Ticket)> {
        self.lock().sort_victim(tickets, device)
    }

    /// Snapshot of remaining capacity, for logging and tests. Never call from inside a log
    /// statement that itself holds another lock: formatting this briefly re-acquires the
    /// monitor mutex.
    pub fn debug_limits(&self) -> Resources {
        self.lock().state.limits.clone()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// A composite-transaction handle over the monitor's internal mutex. Exists so call sites that
/// need to perform several operations (e.g. "take from staging, or else top up from limits, and
/// only then tell the caller which ticket it got") can do so without releasing the lock between
/// steps.
pub struct LockedProxy<'a> {
    state: MutexGuard<'a, State>,
}

impl LockedProxy<'_> {
    pub fn pre_allocate(&mut self, req: &Resources) -> Result<Ticket, Resources> {
        self.state.pre_allocate(req)
    }

    pub fn allocate(&mut self, ticket: Ticket, res: &Resources) -> bool {
        self.state.allocate(ticket, res)
    }

    pub fn free(&mut self, ticket: Ticket, res: &Resources) -> bool {
        self.state.free(ticket, res)
    }

    pub fn free_staging(&mut self, ticket: Ticket) {
        self.state.free_staging(ticket)
    }

    pub fn query_usage(&self, ticket: Ticket) -> Resources {
        self.state.query_usage(ticket)
    }

    pub fn query_usages(&self, tickets: &[Ticket]) -> Resources {
        self.state.query_usages(tickets)
    }

    pub fn sort_victim(&self, tickets: &[Ticket], device: DeviceSpec) -> Vec<(u64, Ticket)> {
        self.state.sort_victim(tickets, device)
    }

    pub fn staging_amount(&self, ticket: Ticket, tag: ResourceTag) -> u64 {
        self.state
            .staging
            .get(&ticket)
            .map(|r| r.get(&tag))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resources::ResourceType;

    fn req_mem(device: DeviceSpec, amount: u64) -> Resources {
        Resources::single(ResourceTag::memory(device), amount)
    }

    #[test]
    fn preallocate_charges_limits_into_staging() {
        let monitor = ResourceMonitor::new();
        monitor.initialize_default_limits();
        let before = monitor.debug_limits();
        let ticket = monitor.pre_allocate(&req_mem(DeviceSpec::gpu(0), 100)).unwrap();
        let after = monitor.debug_limits();
        assert_eq!(
            before.get(&ResourceTag::memory(DeviceSpec::gpu(0)))
                - after.get(&ResourceTag::memory(DeviceSpec::gpu(0))),
            100
        );
        monitor.free_staging(ticket);
    }

    #[test]
    fn preallocate_failure_leaves_state_untouched_and_reports_deficit() {
        let monitor = ResourceMonitor::new();
        monitor.initialize_default_limits();
        let huge = req_mem(DeviceSpec::gpu(0), 1_000 * 1024 * 1024 * 1024);
        let before = monitor.debug_limits();
        let err = monitor.pre_allocate(&huge).unwrap_err();
        let after = monitor.debug_limits();
        assert_eq!(before, after);
        assert!(err.get(&ResourceTag::memory(DeviceSpec::gpu(0))) > 0);
    }

    #[test]
    fn free_reports_whether_ticket_is_now_idle() {
        let monitor = ResourceMonitor::new();
        monitor.initialize_default_limits();
        let req = req_mem(DeviceSpec::gpu(0), 100);
        let ticket = monitor.pre_allocate(&req).unwrap();
        assert!(monitor.allocate(ticket, &req));
        assert!(monitor.free(ticket, &req));
        assert_eq!(monitor.query_usage(ticket).get(&ResourceTag::memory(DeviceSpec::gpu(0))), 0);
    }

    #[test]
    fn sort_victim_orders_by_descending_memory_usage() {
        let monitor = ResourceMonitor::new();
        monitor.initialize_default_limits();
        let gpu0 = DeviceSpec::gpu(0);
        let t1 = monitor.pre_allocate(&req_mem(gpu0, 1000)).unwrap();
        monitor.allocate(t1, &req_mem(gpu0, 1000));
        let t2 = monitor.pre_allocate(&req_mem(gpu0, 3000)).unwrap();
        monitor.allocate(t2, &req_mem(gpu0, 3000));
        let ordered = monitor.sort_victim(&[t1, t2], gpu0);
        assert_eq!(ordered[0].1, t2);
        assert_eq!(ordered[1].1, t1);
    }

    #[test]
    fn allocate_tops_up_shortfall_from_limits() {
        let monitor = ResourceMonitor::new();
        monitor.initialize_default_limits();
        let gpu0 = DeviceSpec::gpu(0);
        let ticket = monitor.pre_allocate(&req_mem(gpu0, 100)).unwrap();
        // Ask to charge more than was staged; the monitor should dip into `limits`.
        assert!(monitor.allocate(ticket, &req_mem(gpu0, 150)));
        assert_eq!(
            monitor.query_usage(ticket).get(&ResourceTag::memory(gpu0)),
            150
        );
    }

    #[test]
    fn resource_type_roundtrips_through_tag() {
        let tag = ResourceTag::new(ResourceType::Compute, DeviceSpec::cpu(0));
        assert_eq!(tag.kind, ResourceType::Compute);
    }
}