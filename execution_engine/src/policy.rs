// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use scheduler::Kind;
use session::{IterationItem, SessionItem};

use crate::lane::LaneQueue;

fn owning_session(item: &Arc<IterationItem>) -> Option<Arc<SessionItem>> {
    item.upgrade_execution().map(|ctx| ctx.session().clone())
}

///
/// Orders (or filters) a lane's expensive iterations per §4.10's `scheduleOnQueue` comparator
/// table. Inexpensive iterations never reach this function — they are always tried immediately
/// by the caller, each independently, without taking the lane's expensive slot.
///
pub fn order_expensive(kind: Kind, lane: &LaneQueue, items: Vec<Arc<IterationItem>>) -> Vec<Arc<IterationItem>> {
    match kind {
        Kind::Fair => {
            let mut items = items;
            items.sort_by(|a, b| {
                let ta = owning_session(a).map(|s| s.used_running_time()).unwrap_or_default();
                let tb = owning_session(b).map(|s| s.used_running_time()).unwrap_or_default();
                ta.cmp(&tb)
            });
            items
        }
        Kind::Rr => {
            let mut items = items;
            items.sort_by(|a, b| {
                let na = owning_session(a).map(|s| s.num_finished_iters()).unwrap_or(0);
                let nb = owning_session(b).map(|s| s.num_finished_iters()).unwrap_or(0);
                na.cmp(&nb)
            });
            items
        }
        Kind::Pack => items,
        Kind::Fifo => {
            let Some(chosen) = lane.oldest_live_session() else {
                return Vec::new();
            };
            items
                .into_iter()
                .filter(|item| owning_session(item).map(|s| s.id()) == Some(chosen.id()))
                .collect()
        }
        Kind::Preempt => {
            let chosen_id = items
                .iter()
                .filter_map(owning_session)
                .min_by_key(|s| s.total_running_time().saturating_sub(s.used_running_time()))
                .map(|s| s.id());
            let Some(chosen_id) = chosen_id else {
                return Vec::new();
            };
            items
                .into_iter()
                .filter(|item| owning_session(item).map(|s| s.id()) == Some(chosen_id))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{ExecutionContext, IterationContext, IterationTask};
    use resources::{DeviceSpec, ResStats, Ticket};
    use std::sync::Arc as StdArc;

    struct StubIter {
        expensive: bool,
    }

    impl IterationTask for StubIter {
        fn graph_id(&self) -> u64 {
            1
        }
        fn estimated_peak_allocation(&self, _device: DeviceSpec) -> ResStats {
            ResStats::new(0, 0, 0)
        }
        fn is_expensive(&self) -> bool {
            self.expensive
        }
        fn prepare(&mut self) -> bool {
            true
        }
        fn run_async(&mut self, ctx: StdArc<IterationContext>) {
            ctx.finish();
        }
        fn is_canceled(&self) -> bool {
            false
        }
        fn cancel(&mut self) {}
    }

    fn make_item(session: &Arc<SessionItem>, lane_id: u64) -> Arc<IterationItem> {
        let ctx = ExecutionContext::new(Ticket::from_counter(session.id()), session.clone(), lane_id);
        IterationItem::new(Arc::downgrade(&ctx), Box::new(StubIter { expensive: true }))
    }

    #[test]
    fn fair_orders_ascending_by_used_running_time() {
        let lane = LaneQueue::new(0);
        let s1 = SessionItem::new(1);
        let s2 = SessionItem::new(2);
        s1.add_used_running_time(std::time::Duration::from_secs(5));
        s2.add_used_running_time(std::time::Duration::from_secs(1));
        let items = vec![make_item(&s1, 0), make_item(&s2, 0)];
        let ordered = order_expensive(Kind::Fair, &lane, items);
        let first_session = owning_session(&ordered[0]).unwrap();
        assert_eq!(first_session.id(), 2);
    }

    #[test]
    fn fifo_keeps_only_oldest_live_sessions_iterations() {
        let lane = LaneQueue::new(0);
        let s1 = SessionItem::new(1);
        let s2 = SessionItem::new(2);
        lane.note_session(&s1);
        lane.note_session(&s2);
        let items = vec![make_item(&s2, 0), make_item(&s1, 0)];
        let ordered = order_expensive(Kind::Fifo, &lane, items);
        assert_eq!(ordered.len(), 1);
        assert_eq!(owning_session(&ordered[0]).unwrap().id(), 1);
    }

    #[test]
    fn preempt_keeps_only_the_least_saturated_session() {
        let lane = LaneQueue::new(0);
        let s1 = SessionItem::new(1);
        let s2 = SessionItem::new(2);
        s1.add_used_running_time(std::time::Duration::from_secs(9));
        s2.add_used_running_time(std::time::Duration::from_secs(1));
        let items = vec![make_item(&s1, 0), make_item(&s2, 0)];
        let ordered = order_expensive(Kind::Preempt, &lane, items);
        assert_eq!(ordered.len(), 1);
        assert_eq!(owning_session(&ordered[0]).unwrap().id(), 2);
    }

    #[test]
    fn preempt_orders_by_remaining_budget_not_used_time_alone() {
        let lane = LaneQueue::new(0);
        let s1 = SessionItem::new(1);
        let s2 = SessionItem::new(2);
        // s1 has used less wall-clock time overall, but has a much larger remaining budget
        // (total - used) than s2, so preempt must still prefer s2.
        s1.set_total_running_time(std::time::Duration::from_secs(10));
        s1.add_used_running_time(std::time::Duration::from_secs(1));
        s2.set_total_running_time(std::time::Duration::from_secs(3));
        s2.add_used_running_time(std::time::Duration::from_secs(2));
        let items = vec![make_item(&s1, 0), make_item(&s2, 0)];
        let ordered = order_expensive(Kind::Preempt, &lane, items);
        assert_eq!(ordered.len(), 1);
        assert_eq!(owning_session(&ordered[0]).unwrap().id(), 2);
    }

    #[test]
    fn pack_preserves_original_order() {
        let lane = LaneQueue::new(0);
        let s1 = SessionItem::new(1);
        let s2 = SessionItem::new(2);
        let items = vec![make_item(&s1, 0), make_item(&s2, 0)];
        let ordered = order_expensive(Kind::Pack, &lane, items);
        assert_eq!(owning_session(&ordered[0]).unwrap().id(), 1);
        assert_eq!(owning_session(&ordered[1]).unwrap().id(), 2);
    }
}