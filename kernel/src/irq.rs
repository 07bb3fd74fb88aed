// SPDX-License-Identifier: MPL-2.0

//! Interrupt vector management.
//!
//! The machine-independent view of an interrupt source: a pending bit, a
//! mask state at the controller, an application disable count, and a stall
//! queue of processes blocked in `IrqWait.wait`. The HAL owns the actual
//! controller; this module owns the bookkeeping and wake policy. Wakeups
//! are deliberately thundering-herd: every waiter on a vector races to
//! claim the pending bit, and losers re-park.

use alloc::vec::Vec;

use spin::Mutex;

use crate::sched::queue::StallQueue;

pub const NUM_IRQ: usize = 64;

/// Per-vector information.
#[derive(Clone, Copy, Debug, Default)]
pub struct VectorInfo {
    /// Number of occurrences.
    pub count: u64,
    /// Vector unmasked at the controller chip.
    pub unmasked: bool,
    /// Interrupt accepted and not yet consumed by a waiter.
    pub pending: bool,
    /// Number of application disable requests.
    pub disable_count: u32,
}

pub struct VectorTable {
    vecs: Vec<Mutex<VectorInfo>>,
    stalls: Vec<StallQueue>,
}

impl VectorTable {
    pub fn new() -> Self {
        VectorTable {
            vecs: (0..NUM_IRQ).map(|_| Mutex::new(VectorInfo::default())).collect(),
            stalls: (0..NUM_IRQ).map(|_| StallQueue::new()).collect(),
        }
    }

    pub fn vector(&self, irq: u32) -> &Mutex<VectorInfo> {
        &self.vecs[irq as usize]
    }

    pub fn stall_queue(&self, irq: u32) -> &StallQueue {
        &self.stalls[irq as usize]
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}
