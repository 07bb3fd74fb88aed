// SPDX-License-Identifier: MPL-2.0

//! The reverse map.
//!
//! For every page frame and every mapping table, the reverse map records
//! the set of referents pointing at it: hardware PTEs, or the top-level
//! mapping slot of a process. Whacking an object walks its reverse-map
//! entries and invalidates each referent, which is what makes the
//! invariant hold that no PTE anywhere outlives the thing it names.

use hashbrown::HashMap;
use smallvec::SmallVec;
use spin::Mutex;

use crate::{mm::mapping::MapRef, obj::ObRef, prelude::*};

pub const ENTRIES_PER_REVMAP: usize = 15;

/// What a reverse-map bucket is keyed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RmTarget {
    Page(ObRef),
    Map(MapRef),
}

/// The referent to invalidate when the target dies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RmWhackee {
    /// A PTE at `(table, slot)`.
    Pte { tbl: MapRef, slot: u16 },
    /// The top-level mapping pointer of a process.
    ProcTop(ObRef),
}

pub struct RevMap {
    buckets: Mutex<HashMap<RmTarget, SmallVec<[RmWhackee; ENTRIES_PER_REVMAP]>>>,
    capacity: usize,
}

impl RevMap {
    pub fn new(capacity: usize) -> Self {
        RevMap {
            buckets: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn install(&self, target: RmTarget, whackee: RmWhackee) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let total: usize = buckets.values().map(|v| v.len()).sum();
        let list = buckets.entry(target).or_default();
        if list.iter().any(|w| *w == whackee) {
            return Ok(());
        }
        if total >= self.capacity {
            return_errno_with_msg!(NoMemory, "reverse map exhausted");
        }
        list.push(whackee);
        Ok(())
    }

    /// Record a PTE pointing at a page.
    pub fn install_pte_page(&self, pg: ObRef, tbl: MapRef, slot: usize) -> Result<()> {
        self.install(
            RmTarget::Page(pg),
            RmWhackee::Pte {
                tbl,
                slot: slot as u16,
            },
        )
    }

    /// Record a PTE pointing at a lower-level mapping table.
    pub fn install_pte_mapping(&self, map: MapRef, tbl: MapRef, slot: usize) -> Result<()> {
        self.install(
            RmTarget::Map(map),
            RmWhackee::Pte {
                tbl,
                slot: slot as u16,
            },
        )
    }

    /// Record a process's top-level mapping pointer.
    pub fn install_process_mapping(&self, map: MapRef, proc: ObRef) -> Result<()> {
        self.install(RmTarget::Map(map), RmWhackee::ProcTop(proc))
    }

    /// Remove and return every referent of `target`.
    pub fn take(&self, target: RmTarget) -> SmallVec<[RmWhackee; ENTRIES_PER_REVMAP]> {
        self.buckets.lock().remove(&target).unwrap_or_default()
    }

    /// Whether any referent of `target` is recorded.
    pub fn has_referents(&self, target: RmTarget) -> bool {
        self.buckets.lock().get(&target).is_some_and(|l| !l.is_empty())
    }

    /// Drop a single recorded referent (used when a PTE is recycled for a
    /// different target).
    pub fn forget(&self, target: RmTarget, whackee: RmWhackee) {
        let mut buckets = self.buckets.lock();
        if let Some(list) = buckets.get_mut(&target) {
            list.retain(|w| *w != whackee);
            if list.is_empty() {
                buckets.remove(&target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObType;

    #[test]
    fn duplicate_installs_coalesce() {
        let rm = RevMap::new(16);
        let pg = ObRef {
            ty: ObType::Page,
            slot: 1,
        };
        rm.install_pte_page(pg, MapRef(0), 3).unwrap();
        rm.install_pte_page(pg, MapRef(0), 3).unwrap();
        assert_eq!(rm.take(RmTarget::Page(pg)).len(), 1);
        assert!(rm.take(RmTarget::Page(pg)).is_empty());
    }

    #[test]
    fn process_top_entries() {
        let rm = RevMap::new(16);
        let proc = ObRef {
            ty: ObType::Process,
            slot: 0,
        };
        rm.install_process_mapping(MapRef(2), proc).unwrap();
        let ws = rm.take(RmTarget::Map(MapRef(2)));
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0], RmWhackee::ProcTop(proc));
    }
}
