// SPDX-License-Identifier: MPL-2.0

//! Transaction discipline and scheduling.
//!
//! Every kernel entry runs as a transaction against the object cache. A
//! transaction either runs to completion, restarts (same process retries
//! immediately), or is abandoned with the process parked on some stall
//! queue. Handlers signal the latter two by returning [`Abandon`] through
//! `Result`, and the dispatch driver reacts by gang-releasing every
//! transaction lock the CPU acquired and picking something else to run.
//!
//! The commit point divides a handler into a speculative prefix, which may
//! still abandon, and a completion suffix, which must not. This is a design
//! rule enforced by construction; [`Tx::commit_point`] only records that the
//! line was crossed so that debug builds can catch violations.

pub mod mutex;
pub mod queue;

use crate::{
    kernel::Kernel,
    obj::{ObRef, ObType},
    sched::mutex::HoldInfo,
};

/// Why a transaction gave up the CPU.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Abandon {
    /// The process parked itself on a stall queue (or entered receiving
    /// state) before yielding. It runs again when woken.
    Park,
    /// Retry the same operation immediately with fresh locks.
    Restart,
}

/// Result type threaded through every yielding kernel path.
pub type Txr<T> = core::result::Result<T, Abandon>;

/// Per-entry transaction context.
///
/// Holds the identity of the executing CPU and the current process, and the
/// committed flag that backs the commit-point discipline.
pub struct Tx<'k> {
    pub k: &'k Kernel,
    pub cpu: u32,
    pub current: Option<ObRef>,
    committed: bool,
}

impl<'k> Tx<'k> {
    pub fn new(k: &'k Kernel, cpu: u32, current: Option<ObRef>) -> Self {
        debug_assert!(current.map_or(true, |p| p.ty == ObType::Process));
        Tx {
            k,
            cpu,
            current,
            committed: false,
        }
    }

    pub fn current(&self) -> ObRef {
        self.current.expect("transaction has no current process")
    }

    /// Enter the commit point. Idempotent; after the first call the
    /// transaction must complete.
    pub fn commit_point(&mut self) {
        self.committed = true;
    }

    pub fn has_committed(&self) -> bool {
        self.committed
    }

    /// Assert that a yielding operation is still allowed.
    pub fn assert_uncommitted(&self) {
        debug_assert!(!self.committed, "yield attempted after commit point");
    }

    /// Grab the transaction lock of an object header.
    pub fn grab(&self, obref: ObRef) -> Txr<HoldInfo> {
        self.k.grab_header_lock(self.cpu, obref)
    }

    /// Release a transaction lock early. Most locks are instead dropped by
    /// the end-of-transaction gang release.
    pub fn release(&self, hi: HoldInfo) {
        self.k.release_header_lock(hi);
    }

    /// Gang-release all transaction locks taken on this CPU.
    pub fn release_all_locks(&self) {
        self.k.cpu(self.cpu).bump_lock_generation();
    }
}
