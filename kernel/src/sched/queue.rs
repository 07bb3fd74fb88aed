// SPDX-License-Identifier: MPL-2.0

//! Stall queues and the ready queue.
//!
//! A stall queue is a FIFO of blocked processes behind a spinlock. The ready
//! queue is just a stall queue that the dispatcher drains. Processes record
//! which queue they are on so that a targeted wake can find and unlink them.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::obj::ObRef;

/// Identity of a queue a process can sleep on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueId {
    Ready,
    /// One of the shared object stall buckets, hashed by OID.
    ObStall(u8),
    /// The receive-wait queue of a process (senders blocked on it).
    RcvWait(u32),
    /// An interrupt vector's stall queue.
    Vector(u8),
    /// The sleepers queue of the interval clock.
    Sleepers,
}

/// A spinlock-guarded FIFO of blocked processes.
pub struct StallQueue {
    q: Mutex<VecDeque<ObRef>>,
}

impl Default for StallQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StallQueue {
    pub const fn new() -> Self {
        StallQueue {
            q: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    pub fn push_back(&self, p: ObRef) {
        self.q.lock().push_back(p);
    }

    pub fn push_front(&self, p: ObRef) {
        self.q.lock().push_front(p);
    }

    pub fn pop_front(&self) -> Option<ObRef> {
        self.q.lock().pop_front()
    }

    /// Remove a specific process; true if it was present.
    pub fn unlink(&self, p: ObRef) -> bool {
        let mut q = self.q.lock();
        if let Some(pos) = q.iter().position(|&e| e == p) {
            q.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drain every waiter. The caller moves them to the ready queue.
    pub fn drain(&self) -> VecDeque<ObRef> {
        core::mem::take(&mut *self.q.lock())
    }
}
