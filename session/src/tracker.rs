// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use resource_monitor::AllocationRegulator;
use resources::{DeviceSpec, ResStats, ResourceTag, Resources, Ticket};

const MIN_WINDOW: usize = 50;
const PEAK_THRESHOLD: f64 = 0.9;

struct State {
    estimation: Option<ResStats>,
    window: VecDeque<(Instant, u64)>,
    window_cap: usize,
    holding: bool,
    device: Option<DeviceSpec>,
    ticket: Option<Ticket>,
}

///
/// Per-graph predictor that decides when an iteration's peak memory has passed and its
/// regulator reservation can be released early, freeing headroom for the next iteration to be
/// admitted while this one is still running down. Cheap to clone: backed by a shared `Arc`, as
/// `SessionItem::tracker_for` hands out a tracker per graph id on demand.
///
#[derive(Clone)]
pub struct IterAllocTracker(Arc<Mutex<State>>);

impl IterAllocTracker {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(State {
            estimation: None,
            window: VecDeque::new(),
            window_cap: MIN_WINDOW,
            holding: false,
            device: None,
            ticket: None,
        })))
    }

    /// Attempts to admit `estimation` (saved on the first call for this graph) against the
    /// regulator. Returns false if the regulator can't admit it right now; the caller should
    /// delay the iteration and retry later.
    pub fn begin_iter(
        &self,
        regulator: &AllocationRegulator,
        ticket: Ticket,
        device: DeviceSpec,
        estimation: ResStats,
    ) -> bool {
        let mut state = self.0.lock();
        let est = *state.estimation.get_or_insert(estimation);
        state.window_cap = ((est.count as usize) / 50).max(MIN_WINDOW);
        let req = Resources::single(ResourceTag::memory(device), est.temporary);
        if !regulator.begin_allocation(ticket, &req) {
            return false;
        }
        state.holding = true;
        state.device = Some(device);
        state.ticket = Some(ticket);
        state.window.clear();
        true
    }

    /// Records a fresh sample of currently-allocated bytes. Once the trend across the window
    /// turns negative and the sample has crossed `peak_threshold * estimation.temporary`, the
    /// regulator hold is released even though the iteration is still running.
    pub fn update(&self, regulator: &AllocationRegulator, current_allocated: u64) {
        let mut state = self.0.lock();
        if !state.holding {
            return;
        }
        let cap = state.window_cap;
        state.window.push_back((Instant::now(), current_allocated));
        while state.window.len() > cap {
            state.window.pop_front();
        }
        if state.window.len() < 2 {
            return;
        }
        let past_peak = slope(&state.window) < 0.0
            && state
                .estimation
                .map(|e| current_allocated as f64 >= PEAK_THRESHOLD * e.temporary as f64)
                .unwrap_or(false);
        if past_peak {
            release_hold(&mut state, regulator);
        }
    }

    /// Always releases the hold if still held, then blends this iteration's observed peak into
    /// the running-average estimation for next time.
    pub fn end_iter(&self, regulator: &AllocationRegulator, current_peak: u64, persist: u64, count_seen: u64) {
        let mut state = self.0.lock();
        if state.holding {
            release_hold(&mut state, regulator);
        }
        if let Some(est) = state.estimation {
            let observed_temporary = current_peak.saturating_sub(persist);
            state.estimation = Some(est.averaged_with(observed_temporary, count_seen));
        }
    }

    pub fn is_holding(&self) -> bool {
        self.0.lock().holding
    }

    pub fn estimation(&self) -> Option<ResStats> {
        self.0.lock().estimation
    }
}

impl Default for IterAllocTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn release_hold(state: &mut State, regulator: &AllocationRegulator) {
    if let (Some(ticket), Some(device), Some(est)) = (state.ticket, state.device, state.estimation) {
        regulator.end_allocation(ticket, &Resources::single(ResourceTag::memory(device), est.temporary));
    }
    state.holding = false;
}

/// Sign of the least-squares slope of `(seconds_since_first_sample, value)` pairs.
fn slope(window: &VecDeque<(Instant, u64)>) -> f64 {
    let origin = window[0].0;
    let points: Vec<(f64, f64)> = window
        .iter()
        .map(|(t, v)| (t.duration_since(origin).as_secs_f64(), *v as f64))
        .collect();
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in &points {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x) * (x - mean_x);
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
