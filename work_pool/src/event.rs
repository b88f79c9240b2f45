// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};

///
/// A repeatable "work arrived" signal for a single consumer thread. Any number of producers may
/// call `notify`; a notification that arrives before the consumer calls `wait` is not lost, but
/// a burst of several notifications before the next `wait` still only wakes it once (the signal
/// coalesces, it does not count).
///
pub struct WorkEvent {
    parker: Parker,
    unparker: Unparker,
    pending: AtomicBool,
}

impl WorkEvent {
    pub fn new() -> Self {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        WorkEvent {
            parker,
            unparker,
            pending: AtomicBool::new(false),
        }
    }

    /// Records a pending notification and wakes the waiting thread, if any.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    /// Blocks the calling thread until `notify` has fired at least once since the last `wait`
    /// (or `wait_timeout`) returned. Must only ever be called from one thread at a time.
    pub fn wait(&self) {
        loop {
            if self.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            self.parker.park();
        }
    }

    /// Like `wait`, but gives up after `timeout` and returns `false` if no notification arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            return true;
        }
        self.parker.park_timeout(timeout);
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for WorkEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let event = WorkEvent::new();
        event.notify();
        event.wait();
    }

    #[test]
    fn wait_timeout_reports_no_notification() {
        let event = WorkEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn notify_wakes_a_blocked_waiter() {
        let event = Arc::new(WorkEvent::new());
        let waiter = event.clone();
        let handle = thread::spawn(move || {
            waiter.wait();
        });
        thread::sleep(Duration::from_millis(20));
        event.notify();
        handle.join().unwrap();
    }
}