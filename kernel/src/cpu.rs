// SPDX-License-Identifier: MPL-2.0

//! Per-CPU state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::sched::mutex::{lock_value, LockKind};

pub const MAX_NCPU: usize = 8;

/// State private to one CPU.
///
/// The `lock_gen` value is the heart of the transient-lock scheme: every
/// transaction lock taken by this CPU is stamped with the CPU's current
/// `(generation, kind, cpu)` word. Bumping the generation logically releases
/// every lock so stamped without touching any of them.
pub struct Cpu {
    pub id: u32,

    /// Generation component of this CPU's transaction-lock stamp.
    lock_gen: AtomicU32,

    /// Set by remote CPUs to ask the next lock acquisition on this CPU to
    /// abandon its transaction instead of spinning.
    pub should_defer: AtomicBool,

    /// The interval timer already preempted once during this transaction.
    pub has_preempted: AtomicBool,
}

impl Cpu {
    pub fn new(id: u32) -> Self {
        Cpu {
            id,
            lock_gen: AtomicU32::new(1),
            should_defer: AtomicBool::new(false),
            has_preempted: AtomicBool::new(false),
        }
    }

    /// The stamp word this CPU writes into transaction locks it acquires.
    pub fn proc_mutex_value(&self) -> u32 {
        lock_value(self.lock_gen.load(Ordering::Relaxed), LockKind::Transient, self.id)
    }

    /// Gang-release every transient lock held by this CPU.
    pub fn bump_lock_generation(&self) {
        self.lock_gen.fetch_add(1, Ordering::Release);
    }
}
