// SPDX-License-Identifier: MPL-2.0

//! The depend table.
//!
//! Records, for every GPT that participated in a translation, which
//! hardware PTEs were produced under which of its slots. Overwriting a GPT
//! slot consults this table to find exactly the PTEs that must die.
//!
//! An entry describes a whole family of PTEs: for each set bit `N` of
//! `slot_mask`, the `2^l2_slot_span` PTEs starting at
//! `base_pte + ((N - slot_bias) << l2_slot_span)` are implicated. Entries
//! that target the same table with the same span and a consistent base are
//! merged; `slot_bias` and `base_pte` are lowered in lockstep when a merge
//! brings in a smaller slot.

use hashbrown::HashMap;
use smallvec::SmallVec;
use spin::Mutex;

use crate::{mm::mapping::MapRef, obj::ObRef, prelude::*};

pub const ENTRIES_PER_DEPEND: usize = 15;

#[derive(Clone, Copy, Debug)]
pub struct DependEntry {
    pub gpt: ObRef,
    pub map: MapRef,
    /// Which GPT slots have been traversed into `map`.
    pub slot_mask: u16,
    /// Least slot ever set in `slot_mask`.
    pub slot_bias: u8,
    /// Each GPT slot spans `2^l2_slot_span` PTEs.
    pub l2_slot_span: u8,
    /// PTE index corresponding to `slot_bias`.
    pub base_pte: u16,
}

impl DependEntry {
    /// PTE indices implicated by slot `slot` of this entry.
    pub fn ptes_for_slot(&self, slot: usize) -> core::ops::Range<usize> {
        let start = self.base_pte as usize
            + ((slot - self.slot_bias as usize) << self.l2_slot_span as usize);
        start..start + (1 << self.l2_slot_span as usize)
    }

    fn normalized_base(&self) -> i64 {
        self.base_pte as i64 - ((self.slot_bias as i64) << self.l2_slot_span as i64)
    }

    /// Merge `n` into `self` if the two describe the same producer, table
    /// and geometry. Returns false, leaving `self` unchanged, otherwise.
    fn merge(&mut self, n: &DependEntry) -> bool {
        if self.gpt != n.gpt || self.map != n.map {
            return false;
        }
        if self.l2_slot_span != n.l2_slot_span || self.normalized_base() != n.normalized_base() {
            return false;
        }
        if n.slot_bias < self.slot_bias {
            self.slot_bias = n.slot_bias;
        }
        if n.base_pte < self.base_pte {
            self.base_pte = n.base_pte;
        }
        self.slot_mask |= n.slot_mask;
        true
    }
}

/// The depend table proper: entries bucketed by producing GPT.
pub struct DependTable {
    buckets: Mutex<HashMap<ObRef, SmallVec<[DependEntry; ENTRIES_PER_DEPEND]>>>,
    capacity: usize,
}

impl DependTable {
    pub fn new(capacity: usize) -> Self {
        DependTable {
            buckets: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Install a depend entry, merging where possible.
    pub fn install(&self, arg: DependEntry) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let total: usize = buckets.values().map(|v| v.len()).sum();
        let list = buckets.entry(arg.gpt).or_default();
        for e in list.iter_mut() {
            if e.merge(&arg) {
                return Ok(());
            }
        }
        if total >= self.capacity {
            return_errno_with_msg!(NoMemory, "depend table exhausted");
        }
        list.push(arg);
        Ok(())
    }

    /// Remove and return every entry produced by `gpt`.
    pub fn take_all(&self, gpt: ObRef) -> SmallVec<[DependEntry; ENTRIES_PER_DEPEND]> {
        self.buckets.lock().remove(&gpt).unwrap_or_default()
    }

    /// Remove slot `slot` from every entry produced by `gpt`, returning the
    /// affected `(table, pte_range)` pairs. Entries whose mask drains to
    /// zero are dropped.
    pub fn take_slot(&self, gpt: ObRef, slot: usize) -> Vec<(MapRef, core::ops::Range<usize>)> {
        let mut out = Vec::new();
        let mut buckets = self.buckets.lock();
        let Some(list) = buckets.get_mut(&gpt) else {
            return out;
        };
        let mask = 1u16 << slot;
        list.retain(|e| {
            if e.slot_mask & mask == 0 {
                return true;
            }
            out.push((e.map, e.ptes_for_slot(slot)));
            e.slot_mask &= !mask;
            e.slot_mask != 0
        });
        if list.is_empty() {
            buckets.remove(&gpt);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObType;

    fn gpt(slot: u32) -> ObRef {
        ObRef {
            ty: ObType::Gpt,
            slot,
        }
    }

    fn entry(g: ObRef, map: MapRef, slot: u8) -> DependEntry {
        DependEntry {
            gpt: g,
            map,
            slot_mask: 1 << slot,
            slot_bias: slot,
            l2_slot_span: 0,
            base_pte: slot as u16,
        }
    }

    #[test]
    fn merge_shares_one_entry() {
        let t = DependTable::new(16);
        let g = gpt(1);
        t.install(entry(g, MapRef(0), 5)).unwrap();
        t.install(entry(g, MapRef(0), 2)).unwrap();
        let all = t.take_all(g);
        assert_eq!(all.len(), 1);
        let e = all[0];
        assert_eq!(e.slot_mask, (1 << 5) | (1 << 2));
        // Bias and base were lowered in lockstep.
        assert_eq!(e.slot_bias, 2);
        assert_eq!(e.base_pte, 2);
        assert_eq!(e.ptes_for_slot(5), 5..6);
    }

    #[test]
    fn slot_invalidation_drains_entries() {
        let t = DependTable::new(16);
        let g = gpt(3);
        t.install(entry(g, MapRef(1), 4)).unwrap();
        let whack = t.take_slot(g, 4);
        assert_eq!(whack.len(), 1);
        assert_eq!(whack[0].0, MapRef(1));
        assert_eq!(whack[0].1, 4..5);
        assert!(t.take_all(g).is_empty());
    }

    #[test]
    fn different_tables_do_not_merge() {
        let t = DependTable::new(16);
        let g = gpt(0);
        t.install(entry(g, MapRef(0), 1)).unwrap();
        t.install(entry(g, MapRef(1), 1)).unwrap();
        assert_eq!(t.take_all(g).len(), 2);
    }
}
