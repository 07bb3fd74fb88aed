// SPDX-License-Identifier: MPL-2.0

//! The kernel nucleus: a capability machine over versioned object frames.
//!
//! The crate implements the machine-neutral core of a capability-based
//! microkernel: typed capabilities that swizzle between OID form and
//! in-memory form, a fixed-size object cache with second-chance aging, a
//! guarded-page-table address translation walker with a depend table and
//! reverse map for targeted shootdown, and the synchronous cross-domain
//! invocation path.
//!
//! Hardware enters through two narrow seams: the [`hal::Hal`] trait (TLB and
//! PTE invalidation, the interrupt controller, the transient page window,
//! the console, power control) and the [`hal::ObjectStore`] trait
//! (persistent load/store of typed frames by OID). Everything else is
//! portable, which is also what makes the nucleus testable on a hosted
//! target with both seams replaced by test doubles.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![allow(dead_code)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod arch;
pub mod boot;
pub mod cache;
pub mod cap;
pub mod caps;
pub mod cpu;
mod error;
pub mod hal;
pub mod interval;
pub mod ipc;
pub mod irq;
mod kernel;
pub mod mm;
pub mod obj;
pub mod prelude;
pub mod sched;
pub mod types;

pub use self::{
    error::{Errno, Error},
    kernel::{BootSpec, DispatchOutcome, Kernel},
};
