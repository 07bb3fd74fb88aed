// SPDX-License-Identifier: MPL-2.0

//! The hardware seams of the nucleus.
//!
//! [`Hal`] is everything the portable kernel asks of the machine: page
//! access through a transient window, invalidation of hardware translation
//! state, the interrupt controller, the console, and power control. A real
//! port backs this with MMU and chipset code; the test suite backs it with
//! an in-memory machine.
//!
//! [`ObjectStore`] is the persistence seam: typed frames travel across it
//! by `(type, OID)` in externalized form.

use crate::{
    obj::{ext::FrameImage, ObType},
    prelude::*,
    types::{Oid, Paddr, PAGE_SIZE},
};

/// Machine services used by the nucleus.
pub trait Hal: Send + Sync {
    /// Run `f` over the content of the physical page at `pa` through the
    /// transient mapping window.
    fn with_page(&self, pa: Paddr, f: &mut dyn FnMut(&mut [u8; PAGE_SIZE]));

    /// Drop the hardware PTE at `(table_pa, slot)` and perform whatever TLB
    /// shootdown the architecture requires for it.
    fn invalidate_pte(&self, table_pa: Paddr, slot: usize);

    /// Flush all cached translations on every CPU.
    fn tlb_flush_all(&self);

    /// Interrupt controller operations, by global interrupt pin number.
    fn irq_unmask(&self, irq: u32);
    fn irq_mask(&self, irq: u32);
    fn irq_ack(&self, irq: u32);

    /// Emit raw bytes on the console.
    fn console_write(&self, bytes: &[u8]);

    /// Power control. On real hardware these do not return; the hosted
    /// model records the request and returns so the caller can unwind.
    fn halt(&self);
    fn powerdown(&self);
    fn reboot(&self);
}

/// Persistent object store.
pub trait ObjectStore: Send + Sync {
    /// Load the current version of `(ty, oid)` with its allocation count,
    /// or `Ok(None)` if the store has no record of it (the object is then
    /// materialized zeroed with allocation count zero).
    fn load(&self, ty: ObType, oid: Oid) -> Result<Option<(u32, FrameImage)>>;

    /// Write a dirty frame back, allocation count included.
    fn store(&self, ty: ObType, oid: Oid, alloc_count: u32, img: FrameImage) -> Result<()>;
}

/// A store with no backing: everything materializes zeroed, write-back is
/// discarded.
pub struct NullStore;

impl ObjectStore for NullStore {
    fn load(&self, _ty: ObType, _oid: Oid) -> Result<Option<(u32, FrameImage)>> {
        Ok(None)
    }

    fn store(&self, _ty: ObType, _oid: Oid, _alloc_count: u32, _img: FrameImage) -> Result<()> {
        Ok(())
    }
}
