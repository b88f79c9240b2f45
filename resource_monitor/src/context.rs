// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use resources::{DeviceSpec, ResourceTag, ResourceType, Resources, Ticket};

use crate::monitor::ResourceMonitor;

///
/// Observer notified of allocate/free activity against a `ResourceContext`'s ticket. `SessionItem`
/// implements this to keep its per-session usage counters current; the context itself does not
/// know or care what kind of listener it has.
///
pub trait AllocationListener: Send + Sync {
    fn notify_alloc(&self, graph_id: u64, ticket: Ticket, tag: ResourceTag, amount: u64);
    fn notify_dealloc(&self, graph_id: u64, ticket: Ticket, tag: ResourceTag, amount: u64, last: bool);
}

///
/// An owned handle representing one task's reservation against the `ResourceMonitor`. Created by
/// pre-allocating a requirement (which stages the ticket's resources), a `ResourceContext` then
/// mediates the task's actual allocate/free calls through `alloc`/`dealloc`, notifying every
/// attached listener as it goes.
///
pub struct ResourceContext {
    monitor: Arc<ResourceMonitor>,
    ticket: Ticket,
    device: DeviceSpec,
    graph_id: u64,
    staging_released: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn AllocationListener>>>,
}

impl ResourceContext {
    /// Pre-allocates `req` against `monitor` and wraps the resulting ticket in a context. Fails
    /// with the deficit reported by the monitor when capacity is insufficient.
    pub fn pre_allocate(
        monitor: Arc<ResourceMonitor>,
        graph_id: u64,
        device: DeviceSpec,
        req: &Resources,
    ) -> Result<ResourceContext, Resources> {
        let ticket = monitor.pre_allocate(req)?;
        Ok(ResourceContext {
            monitor,
            ticket,
            device,
            graph_id,
            staging_released: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn attach_listener(&self, listener: Arc<dyn AllocationListener>) {
        self.listeners.lock().push(listener);
    }

    /// Charges `num` units of `kind` on this context's device, drawing first from the ticket's
    /// staged reservation and, if that is insufficient, from the monitor's live capacity. When
    /// `num` is `None`, the entire currently staged amount of `kind` is consumed. Returns a
    /// scope whose `Drop` commits the allocation (notifying listeners) unless `rollback` is
    /// called first.
    pub fn alloc(&self, kind: ResourceType, num: Option<u64>) -> Option<OperationScope<'_>> {
        let tag = ResourceTag::new(kind, self.device);
        let mut locked = self.monitor.lock();
        let amount = match num {
            Some(n) => n,
            None => locked.staging_amount(self.ticket, tag),
        };
        if amount == 0 {
            return None;
        }
        let req = Resources::single(tag, amount);
        if !locked.allocate(self.ticket, &req) {
            return None;
        }
        Some(OperationScope {
            ctx: self,
            tag,
            amount,
            rolled_back: false,
        })
    }

    /// Frees `num` units of `kind` back to the monitor, notifying every attached listener. The
    /// `last` flag on the notification reflects whether this call drained the ticket's charged
    /// usage entirely.
    pub fn dealloc(&self, kind: ResourceType, num: u64) {
        let tag = ResourceTag::new(kind, self.device);
        let req = Resources::single(tag, num);
        let last = self.monitor.free(self.ticket, &req);
        self.notify_dealloc(tag, num, last);
    }

    fn notify_dealloc(&self, tag: ResourceTag, amount: u64, last: bool) {
        for listener in self.listeners.lock().iter() {
            listener.notify_dealloc(self.graph_id, self.ticket, tag, amount, last);
        }
    }

    fn notify_alloc(&self, tag: ResourceTag, amount: u64) {
        for listener in self.listeners.lock().iter() {
            listener.notify_alloc(self.graph_id, self.ticket, tag, amount);
        }
    }

    /// Returns any remaining staged (not yet charged) reservation to the monitor. Idempotent:
    /// called both explicitly at task completion and from `Drop`.
    pub fn release_staging(&self) {
        if self.staging_released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.monitor.free_staging(self.ticket);
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        self.release_staging();
    }
}

///
/// A per-call allocation sub-transaction returned by `ResourceContext::alloc`. On drop, commits
/// the allocation by notifying attached listeners unless `rollback()` was called, in which case
/// the amount is returned to the monitor immediately and no commit notification fires.
///
pub struct OperationScope<'ctx> {
    ctx: &'ctx ResourceContext,
    tag: ResourceTag,
    amount: u64,
    rolled_back: bool,
}

impl OperationScope<'_> {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn tag(&self) -> ResourceTag {
        self.tag
    }

    /// Immediately returns this scope's amount to the monitor and suppresses the commit
    /// notification that would otherwise fire on drop.
    pub fn rollback(mut self) {
        self.ctx.monitor.free(self.ctx.ticket, &Resources::single(self.tag, self.amount));
        self.rolled_back = true;
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        if self.rolled_back {
            return;
        }
        self.ctx.notify_alloc(self.tag, self.amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resources::DeviceSpec;
    use std::sync::atomic::AtomicU64;

    struct CountingListener {
        allocs: AtomicU64,
        deallocs: AtomicU64,
        last_seen: AtomicBool,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                allocs: AtomicU64::new(0),
                deallocs: AtomicU64::new(0),
                last_seen: AtomicBool::new(false),
            })
        }
    }

    impl AllocationListener for CountingListener {
        fn notify_alloc(&self, _graph_id: u64, _ticket: Ticket, _tag: ResourceTag, _amount: u64) {
            self.allocs.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_dealloc(
            &self,
            _graph_id: u64,
            _ticket: Ticket,
            _tag: ResourceTag,
            _amount: u64,
            last: bool,
        ) {
            self.deallocs.fetch_add(1, Ordering::SeqCst);
            self.last_seen.store(last, Ordering::SeqCst);
        }
    }

    fn monitor_with_capacity(_amount: u64) -> Arc<ResourceMonitor> {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        monitor
    }

    #[test]
    fn scope_commits_alloc_notification_on_drop() {
        let monitor = monitor_with_capacity(1000);
        let req = Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), 100);
        let ctx = ResourceContext::pre_allocate(monitor, 1, DeviceSpec::gpu(0), &req).unwrap();
        let listener = CountingListener::new();
        ctx.attach_listener(listener.clone());

        {
            let scope = ctx.alloc(ResourceType::Memory, None).unwrap();
            assert_eq!(scope.amount(), 100);
        }
        assert_eq!(listener.allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rollback_suppresses_commit_and_returns_resource() {
        let monitor = monitor_with_capacity(1000);
        let req = Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), 100);
        let ctx = ResourceContext::pre_allocate(monitor.clone(), 1, DeviceSpec::gpu(0), &req).unwrap();
        let listener = CountingListener::new();
        ctx.attach_listener(listener.clone());

        let scope = ctx.alloc(ResourceType::Memory, None).unwrap();
        scope.rollback();
        assert_eq!(listener.allocs.load(Ordering::SeqCst), 0);
        assert_eq!(
            monitor.query_usage(ctx.ticket()).get(&ResourceTag::memory(DeviceSpec::gpu(0))),
            0
        );
    }

    #[test]
    fn dealloc_reports_last_when_usage_drained() {
        let monitor = monitor_with_capacity(1000);
        let req = Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), 100);
        let ctx = ResourceContext::pre_allocate(monitor, 1, DeviceSpec::gpu(0), &req).unwrap();
        let listener = CountingListener::new();
        ctx.attach_listener(listener.clone());

        let scope = ctx.alloc(ResourceType::Memory, None).unwrap();
        drop(scope);
        ctx.dealloc(ResourceType::Memory, 100);
        assert_eq!(listener.deallocs.load(Ordering::SeqCst), 1);
        assert!(listener.last_seen.load(Ordering::SeqCst));
    }

    #[test]
    fn release_staging_is_idempotent() {
        let monitor = monitor_with_capacity(1000);
        let req = Resources::single(ResourceTag::memory(DeviceSpec::gpu(0)), 100);
        let ctx = ResourceContext::pre_allocate(monitor, 1, DeviceSpec::gpu(0), &req).unwrap();
        ctx.release_staging();
        ctx.release_staging();
    }
}