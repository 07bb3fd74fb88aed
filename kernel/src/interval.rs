// SPDX-License-Identifier: MPL-2.0

//! The interval clock.
//!
//! Sleepers are kept on a single unsorted stall queue. Whenever the clock
//! crosses the earliest recorded wake target, every sleeper is woken and
//! the herd thunders: each re-executes its sleep invocation, and whoever is
//! not yet due simply parks again with a new target. Crude, bounded, and
//! exactly as specified.

use spin::Mutex;

use crate::types::Interval;

pub struct IntervalClock {
    now: Mutex<Interval>,
    /// Earliest wake target among the sleepers.
    wakeup: Mutex<Option<Interval>>,
}

impl IntervalClock {
    pub fn new() -> Self {
        IntervalClock {
            now: Mutex::new(Interval::default()),
            wakeup: Mutex::new(None),
        }
    }

    pub fn now(&self) -> Interval {
        *self.now.lock()
    }

    pub fn set_now(&self, iv: Interval) {
        *self.now.lock() = iv;
    }

    /// Record a sleeper's target; keeps the minimum.
    pub fn note_wake_target(&self, target: Interval) {
        let mut wakeup = self.wakeup.lock();
        match *wakeup {
            Some(cur) if !target.is_after(cur) => *wakeup = Some(target),
            None => *wakeup = Some(target),
            _ => {}
        }
    }

    /// True if the earliest wake target has been reached; clears it, since
    /// the survivors re-register when they re-park.
    pub fn take_due_wakeup(&self) -> bool {
        let now = self.now();
        let mut wakeup = self.wakeup.lock();
        match *wakeup {
            Some(target) if !target.is_after(now) => {
                *wakeup = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for IntervalClock {
    fn default() -> Self {
        Self::new()
    }
}
