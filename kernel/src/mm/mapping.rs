// SPDX-License-Identifier: MPL-2.0

//! Mapping tables.
//!
//! A `Mapping` abstracts one hardware translation table. Tables are drawn
//! from a fixed arena and are the *products* of memory objects: each GPT
//! (or page, for leaf products) threads the tables it has produced on a
//! product chain so that invalidation can find them. A table is reusable
//! for a translation only when its match/mask/restriction criteria agree
//! with the walk that wants it.

use spin::Mutex;

use crate::{
    cap::Restr,
    obj::ObRef,
    prelude::*,
    types::{CoyAddr, Paddr, PAGE_SIZE},
};

/// Synthetic physical base of the mapping-table space, disjoint from page
/// space. Only used to give each table a stable address for the HAL.
pub const MAPPING_SPACE_BASE: Paddr = 0x8000_0000;

/// Number of PTE slots per mapping table. The portable model mirrors the
/// GPT fanout.
pub const PTES_PER_TABLE: usize = crate::obj::frames::NUM_GPT_SLOTS;

/// Index of a mapping table in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MapRef(pub u32);

/// A hardware page-table entry, as the portable model sees it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Pte {
    #[default]
    Invalid,
    /// Points to a lower-level mapping table.
    Table(MapRef),
    /// Leaf entry pointing at a page frame.
    Page { pg: ObRef, writable: bool },
}

/// One translation table.
pub struct Mapping {
    pub pa: Paddr,
    pub level: u8,
    /// Address bits that must match for this table to apply.
    pub match_bits: CoyAddr,
    pub mask: CoyAddr,
    /// Restrictions folded into every entry of this table.
    pub restr: Restr,
    /// The memory object that produced this table.
    pub producer: Option<ObRef>,
    /// Next table on the producer's product chain.
    pub next_product: Option<MapRef>,
    pub slots: [Pte; PTES_PER_TABLE],
    pub in_use: bool,
}

impl Mapping {
    fn new(pa: Paddr) -> Self {
        Mapping {
            pa,
            level: 0,
            match_bits: 0,
            mask: 0,
            restr: Restr::empty(),
            producer: None,
            next_product: None,
            slots: [Pte::Invalid; PTES_PER_TABLE],
            in_use: false,
        }
    }

    /// Whether this product satisfies the given walk criteria.
    pub fn satisfies(&self, match_bits: CoyAddr, mask: CoyAddr, restr: Restr, level: u8) -> bool {
        self.match_bits == match_bits
            && self.mask == mask
            && self.restr == restr
            && self.level == level
    }

    pub fn reset(&mut self) {
        let pa = self.pa;
        *self = Mapping::new(pa);
    }
}

/// The mapping-table arena.
pub struct MappingPool {
    maps: Vec<Mutex<Mapping>>,
    free: Mutex<Vec<u32>>,
}

impl MappingPool {
    pub fn new(count: usize) -> Self {
        let maps = (0..count)
            .map(|i| Mutex::new(Mapping::new(MAPPING_SPACE_BASE + i as u64 * PAGE_SIZE as u64)))
            .collect();
        MappingPool {
            maps,
            free: Mutex::new((0..count as u32).rev().collect()),
        }
    }

    pub fn count(&self) -> usize {
        self.maps.len()
    }

    pub fn get(&self, mr: MapRef) -> &Mutex<Mapping> {
        &self.maps[mr.0 as usize]
    }

    pub fn with<R>(&self, mr: MapRef, f: impl FnOnce(&mut Mapping) -> R) -> R {
        f(&mut self.maps[mr.0 as usize].lock())
    }

    pub fn alloc(&self) -> Option<MapRef> {
        let idx = self.free.lock().pop()?;
        let mr = MapRef(idx);
        self.with(mr, |m| {
            m.reset();
            m.in_use = true;
        });
        Some(mr)
    }

    pub fn release(&self, mr: MapRef) {
        self.with(mr, |m| {
            m.reset();
        });
        self.free.lock().push(mr.0);
    }

    /// Find a table by its synthetic physical address.
    pub fn by_pa(&self, pa: Paddr) -> Option<MapRef> {
        if pa < MAPPING_SPACE_BASE || pa % PAGE_SIZE as u64 != 0 {
            return None;
        }
        let idx = (pa - MAPPING_SPACE_BASE) / PAGE_SIZE as u64;
        if (idx as usize) < self.maps.len() {
            Some(MapRef(idx as u32))
        } else {
            None
        }
    }
}
