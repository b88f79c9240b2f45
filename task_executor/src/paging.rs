// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use resource_monitor::{ResourceContext, ResourceMonitor};
use resources::{DeviceSpec, ResourceTag, Resources};
use session::SessionItem;

/// A graph id reserved for scheduler-internal bookkeeping allocations (paging contexts are not
/// attributable to any one iteration).
const PAGING_GRAPH_ID: u64 = 0;

///
/// Recovers from memory exhaustion on `source` (§4.9). Enumerates `sessions` by descending
/// memory usage on `source`, keeps the single top consumer untouched, and asks each remaining
/// donor's `pagingCb` to volunteer tensors onto `target`, largest ticket first. If no donor
/// volunteers anything, force-evicts the largest donor instead. Triggered at most once per
/// scheduling iteration; returns whether any progress — paging or eviction — was made.
///
pub fn page_or_evict(
    monitor: &Arc<ResourceMonitor>,
    sessions: &[Arc<SessionItem>],
    source: DeviceSpec,
    target: DeviceSpec,
) -> bool {
    if sessions.len() < 2 {
        // Nothing to page from: with zero or one session there's no donor to spare.
        return false;
    }

    let mem_tag = ResourceTag::memory(source);
    let mut by_usage: Vec<(u64, Arc<SessionItem>)> = sessions.iter().map(|s| (s.usage_of(mem_tag), s.clone())).collect();
    by_usage.sort_by(|a, b| b.0.cmp(&a.0));
    let donors = &by_usage[1..];

    for (_, donor) in donors {
        let Some(paging_cb) = donor.paging_cb() else {
            continue;
        };
        let tickets = donor.tickets();
        let ordered = monitor.sort_victim(&tickets, source);
        for (usage, ticket) in ordered {
            if usage == 0 {
                continue;
            }
            let req = Resources::single(ResourceTag::memory(target), usage);
            let rctx = match ResourceContext::pre_allocate(monitor.clone(), PAGING_GRAPH_ID, target, &req) {
                Ok(ctx) => ctx,
                // No room on the target device either: abort this paging attempt entirely, the
                // next loop iteration will retry.
                Err(_) => return false,
            };
            let released = paging_cb.volunteer(ticket, rctx);
            if released > 0 {
                return true;
            }
        }
    }

    if let Some((_, top_donor)) = donors.first() {
        top_donor.interrupt();
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_monitor::AllocationListener;
    use resources::{ResourceTag, Ticket};
    use session::PagingCallback;

    struct Volunteer {
        released: u64,
    }

    impl PagingCallback for Volunteer {
        fn volunteer(&self, _ticket: Ticket, target: ResourceContext) -> u64 {
            target.release_staging();
            self.released
        }
    }

    fn make_session(id: u64, gpu_usage: u64) -> Arc<SessionItem> {
        let session = SessionItem::new(id);
        if gpu_usage > 0 {
            session.notify_alloc(0, Ticket::from_counter(id), ResourceTag::memory(DeviceSpec::gpu(0)), gpu_usage);
        }
        session
    }

    #[test]
    fn paging_succeeds_when_a_donor_volunteers() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let top = make_session(1, 13 * 1024 * 1024 * 1024);
        let donor = make_session(2, 2 * 1024 * 1024 * 1024);
        donor.install_callbacks(
            Arc::new(Volunteer {
                released: 2 * 1024 * 1024 * 1024,
            }),
            || {},
            || {},
        );
        let sessions = vec![top, donor];
        assert!(page_or_evict(&monitor, &sessions, DeviceSpec::gpu(0), DeviceSpec::cpu(0)));
    }

    #[test]
    fn falls_back_to_forced_eviction_when_no_donor_volunteers() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let top = make_session(1, 13 * 1024 * 1024 * 1024);
        let donor = make_session(2, 1 * 1024 * 1024 * 1024);
        donor.install_callbacks(Arc::new(Volunteer { released: 0 }), || {}, || {});
        let sessions = vec![top, donor.clone()];
        assert!(page_or_evict(&monitor, &sessions, DeviceSpec::gpu(0), DeviceSpec::cpu(0)));
        assert!(donor.is_force_evicted());
    }

    #[test]
    fn no_progress_when_only_one_session_exists() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let only = make_session(1, 13 * 1024 * 1024 * 1024);
        let sessions = vec![only];
        assert!(!page_or_evict(&monitor, &sessions, DeviceSpec::gpu(0), DeviceSpec::cpu(0)));
    }

    #[test]
    fn donor_without_paging_callback_is_skipped_and_eviction_falls_through() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.initialize_default_limits();
        let top = make_session(1, 13 * 1024 * 1024 * 1024);
        // No paging callback installed: this donor can't volunteer, only be force-evicted.
        let donor = make_session(2, 1 * 1024 * 1024 * 1024);
        let sessions = vec![top, donor.clone()];
        assert!(page_or_evict(&monitor, &sessions, DeviceSpec::gpu(0), DeviceSpec::cpu(0)));
        assert!(donor.is_force_evicted());
    }
}