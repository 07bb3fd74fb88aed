// SPDX-License-Identifier: MPL-2.0

//! Address translation machinery.

pub mod depend;
pub mod fault;
pub mod mapping;
pub mod revmap;
pub mod walk;

use crate::{
    kernel::Kernel,
    mm::{
        mapping::{MapRef, Mapping, Pte, PTES_PER_TABLE},
        revmap::{RmTarget, RmWhackee},
    },
    obj::{ObRef, ObType},
    prelude::*,
    sched::{Abandon, Tx, Txr},
};

impl Kernel {
    // ------------------------------------------------------------------
    // PTE surgery
    // ------------------------------------------------------------------

    /// Drop the PTE at `(tbl, slot)`, informing the HAL and forgetting the
    /// reverse-map record of it.
    pub(crate) fn whack_pte(&self, tbl: MapRef, slot: usize) {
        let (pa, old) = self.mappings.with(tbl, |m| {
            let old = m.slots[slot];
            m.slots[slot] = Pte::Invalid;
            (m.pa, old)
        });
        let whackee = RmWhackee::Pte {
            tbl,
            slot: slot as u16,
        };
        match old {
            Pte::Invalid => return,
            Pte::Page { pg, .. } => self.revmap.forget(RmTarget::Page(pg), whackee),
            Pte::Table(child) => self.revmap.forget(RmTarget::Map(child), whackee),
        }
        self.hal.invalidate_pte(pa, slot);
    }

    /// Drop a process's top-level mapping pointer.
    pub(crate) fn whack_process_mapping(&self, proc: ObRef) {
        debug_assert_eq!(proc.ty, ObType::Process);
        let old = self.cache.procs.with_body(proc.slot, |b| b.mapping_tab.take());
        if let Some(mr) = old {
            self.revmap.forget(RmTarget::Map(mr), RmWhackee::ProcTop(proc));
            self.hal.tlb_flush_all();
        }
    }

    fn whack_referent(&self, w: RmWhackee) {
        match w {
            RmWhackee::Pte { tbl, slot } => self.whack_pte(tbl, slot as usize),
            RmWhackee::ProcTop(proc) => {
                self.cache.procs.with_body(proc.slot, |b| b.mapping_tab = None);
                self.hal.tlb_flush_all();
            }
        }
    }

    /// Invalidate every referent of a mapping table. Afterwards no PTE or
    /// process slot names it.
    pub(crate) fn rm_whack_mapping(&self, mr: MapRef) {
        for w in self.revmap.take(RmTarget::Map(mr)) {
            self.whack_referent(w);
        }
    }

    /// Invalidate every referent of a page frame. Afterwards no hardware
    /// PTE refers to it.
    pub(crate) fn rm_whack_page(&self, pg: ObRef) {
        debug_assert_eq!(pg.ty, ObType::Page);
        for w in self.revmap.take(RmTarget::Page(pg)) {
            self.whack_referent(w);
        }
    }

    // ------------------------------------------------------------------
    // Depend invalidation
    // ------------------------------------------------------------------

    /// Invalidate every PTE produced through `gpt`.
    pub(crate) fn depend_invalidate(&self, gpt: ObRef) {
        for e in self.depend.take_all(gpt) {
            let mut mask = e.slot_mask;
            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                for pte in e.ptes_for_slot(slot) {
                    self.whack_pte(e.map, pte);
                }
            }
        }
    }

    /// Invalidate the PTEs produced through slot `slot` of `gpt`.
    pub(crate) fn depend_invalidate_slot(&self, gpt: ObRef, slot: usize) {
        for (map, range) in self.depend.take_slot(gpt, slot) {
            for pte in range {
                self.whack_pte(map, pte);
            }
        }
    }

    // ------------------------------------------------------------------
    // Product chains
    // ------------------------------------------------------------------

    pub(crate) fn products_head(&self, mem: ObRef) -> Option<MapRef> {
        match mem.ty {
            ObType::Page => self.cache.pages.with_body(mem.slot, |b| b.products),
            ObType::CapPage => self.cache.cap_pages.with_body(mem.slot, |b| b.products),
            ObType::Gpt => self.cache.gpts.with_body(mem.slot, |b| b.products),
            _ => None,
        }
    }

    fn set_products_head(&self, mem: ObRef, head: Option<MapRef>) {
        match mem.ty {
            ObType::Page => self.cache.pages.with_body(mem.slot, |b| b.products = head),
            ObType::CapPage => self.cache.cap_pages.with_body(mem.slot, |b| b.products = head),
            ObType::Gpt => self.cache.gpts.with_body(mem.slot, |b| b.products = head),
            _ => {}
        }
    }

    /// Invalidate and destroy every mapping table this object produced.
    pub(crate) fn destroy_products(&self, mem: ObRef) {
        let mut cur = self.products_head(mem);
        self.set_products_head(mem, None);
        while let Some(mr) = cur {
            // Nothing may keep pointing at the dying table.
            self.rm_whack_mapping(mr);
            // Nor may its own entries survive.
            for slot in 0..PTES_PER_TABLE {
                self.whack_pte(mr, slot);
            }
            cur = self.mappings.with(mr, |m| m.next_product);
            self.mappings.release(mr);
        }
    }

    /// Invalidate all cached translation state derived from a memory
    /// object.
    pub(crate) fn invalidate_cached_memory_state(&self, mem: ObRef) {
        if mem.ty == ObType::Gpt {
            self.depend_invalidate(mem);
        }
        self.destroy_products(mem);
        if mem.ty == ObType::Page {
            self.rm_whack_page(mem);
        }
    }

    /// Find a product of `producer` that satisfies the walk criteria, or
    /// make one and thread it on the product chain.
    pub(crate) fn find_or_make_product(
        &self,
        tx: &Tx<'_>,
        producer: ObRef,
        match_bits: u64,
        mask: u64,
        restr: crate::cap::Restr,
        level: u8,
    ) -> Txr<MapRef> {
        let mut cur = self.products_head(producer);
        while let Some(mr) = cur {
            let (ok, next) = self.mappings.with(mr, |m: &mut Mapping| {
                (m.satisfies(match_bits, mask, restr, level), m.next_product)
            });
            if ok {
                return Ok(mr);
            }
            cur = next;
        }

        let Some(mr) = self.mappings.alloc() else {
            warn!("mapping table pool exhausted; restarting");
            return Err(Abandon::Restart);
        };
        let head = self.products_head(producer);
        self.mappings.with(mr, |m| {
            m.match_bits = match_bits;
            m.mask = mask;
            m.restr = restr;
            m.level = level;
            m.producer = Some(producer);
            m.next_product = head;
        });
        self.set_products_head(producer, Some(mr));
        Ok(mr)
    }
}
