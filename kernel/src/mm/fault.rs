// SPDX-License-Identifier: MPL-2.0

//! The memory fault path: walk, publish translations, record dependencies.

use crate::{
    cap::Capability,
    ipc::syscall::FaultCode,
    kernel::Kernel,
    mm::{
        depend::DependEntry,
        mapping::{MapRef, Pte},
        walk::{self, MemWalkResults},
    },
    obj::{
        frames::{RunState, GPT_BACKGROUND_SLOT, GPT_SLOT_INDEX_BITS, MEMWALK_SLOT_BACKGROUND},
        ObRef, ObType,
    },
    prelude::*,
    sched::{Abandon, Tx, Txr},
    types::{ca_bitmask, CoyAddr, Uva, CAPABILITY_SIZE, PAGE_ADDR_BITS, PAGE_SIZE, SOFTADDR_BITS},
};

/// Outcome of a user-memory operation: either the value, or the fault the
/// process would take.
pub type UserResult<T> = core::result::Result<T, FaultCode>;

impl Kernel {
    fn addr_space_of(&self, proc: ObRef) -> Capability {
        self.cache.procs.with_body(proc.slot, |b| b.state.addr_space)
    }

    fn set_addr_space_of(&self, proc: ObRef, cap: Capability) {
        self.cache.procs.with_body(proc.slot, |b| b.state.addr_space = cap);
    }
}

/// Record a memory fault against a process and leave it in the faulted
/// state. It runs again only when something resumes it.
pub fn take_memory_fault(tx: &Tx<'_>, proc: ObRef, fc: FaultCode, addr: CoyAddr) -> Abandon {
    debug_assert_eq!(proc.ty, ObType::Process);
    warn!("process {:?} faulted: {:?} at {:#x}", proc, fc, addr);
    tx.k.cache.procs.with_body(proc.slot, |b| {
        b.state.fault_code = fc as u32;
        b.state.fault_info = addr;
        b.state.run_state = RunState::Faulted;
    });
    Abandon::Park
}

/// Resolve a data fault: walk the process address space for `addr`,
/// publish the translation, and return the leaf page.
pub fn do_page_fault(
    tx: &mut Tx<'_>,
    proc: ObRef,
    addr: CoyAddr,
    for_write: bool,
) -> Txr<UserResult<ObRef>> {
    let mut root = tx.k.addr_space_of(proc);
    let mut results = MemWalkResults::default();
    let fc = walk::memwalk(tx, &mut root, addr, for_write, &mut results)?;
    tx.k.set_addr_space_of(proc, root);

    if fc != FaultCode::NoFault {
        return Ok(Err(fc));
    }

    let leaf = *results.ents.last().expect("successful walk has entries");
    let Some(pg) = leaf.entry else {
        return Ok(Err(FaultCode::MalformedSpace));
    };
    if pg.ty != ObType::Page {
        // Capability pages are not data-mappable.
        return Ok(Err(FaultCode::InvalidDataReference));
    }

    install_translation(tx, proc, addr, &results)?;
    Ok(Ok(pg))
}

/// Turn a successful walk transcript into mapping-table state, and record
/// the depend and reverse-map entries that will take it down again.
fn install_translation(
    tx: &mut Tx<'_>,
    proc: ObRef,
    addr: CoyAddr,
    results: &MemWalkResults,
) -> Txr<()> {
    let k = tx.k;
    let writable = !results.cum_restr.read_only();

    // Window steps whose dependency must be recorded against the next
    // PTE that gets filled.
    let mut pending_windows: Vec<(ObRef, u8)> = Vec::new();
    // Where the next table or page gets linked; None is the top level.
    let mut parent: Option<(MapRef, usize)> = None;
    let mut restr_so_far = crate::cap::Restr::empty();

    for (depth, e) in results.ents.iter().enumerate() {
        let Some(node) = e.entry else { continue };
        restr_so_far |= e.restr;

        if e.window {
            let slot = if e.slot == MEMWALK_SLOT_BACKGROUND {
                GPT_BACKGROUND_SLOT as u8
            } else {
                e.slot
            };
            pending_windows.push((node, slot));
            continue;
        }

        match node.ty {
            ObType::Gpt => {
                let span = (e.l2v as u32 + GPT_SLOT_INDEX_BITS).min(SOFTADDR_BITS);
                let mask = !ca_bitmask(span);
                let tbl =
                    k.find_or_make_product(tx, node, addr & mask, mask, restr_so_far, depth as u8)?;

                if let Some((ptab, pslot)) = parent {
                    set_pte(tx, ptab, pslot, Pte::Table(tbl))?;
                    for (g, s) in pending_windows.drain(..) {
                        install_depend(tx, g, s, ptab, pslot as u16)?;
                    }
                } else {
                    publish_top(tx, proc, tbl)?;
                    pending_windows.clear();
                }

                // This GPT's own slot dependency: the PTE it defines lives
                // in its own product table at the traversed slot.
                install_depend(tx, node, e.slot, tbl, e.slot as u16)?;

                parent = Some((tbl, e.slot as usize));
            }
            ObType::Page => {
                if parent.is_none() {
                    // A single-page address space: a degenerate top-level
                    // table produced by the page itself.
                    let mask = !ca_bitmask(PAGE_ADDR_BITS);
                    let tbl =
                        k.find_or_make_product(tx, node, addr & mask, mask, restr_so_far, 0)?;
                    publish_top(tx, proc, tbl)?;
                    parent = Some((tbl, 0));
                }
                let (ptab, pslot) = parent.unwrap();
                for (g, s) in pending_windows.drain(..) {
                    install_depend(tx, g, s, ptab, pslot as u16)?;
                }
                set_pte(tx, ptab, pslot, Pte::Page { pg: node, writable })?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Publish a table as the process's top-level mapping.
fn publish_top(tx: &Tx<'_>, proc: ObRef, tbl: MapRef) -> Txr<()> {
    let k = tx.k;
    let old = k.cache.procs.with_body(proc.slot, |b| {
        let old = b.mapping_tab;
        b.mapping_tab = Some(tbl);
        old
    });
    if old == Some(tbl) {
        return Ok(());
    }
    if let Some(o) = old {
        k.revmap.forget(
            crate::mm::revmap::RmTarget::Map(o),
            crate::mm::revmap::RmWhackee::ProcTop(proc),
        );
    }
    if let Err(e) = k.revmap.install_process_mapping(tbl, proc) {
        warn!("reverse map full installing process top: {}", e);
        return Err(Abandon::Restart);
    }
    Ok(())
}

/// Write a PTE, whacking whatever was there and recording the reverse
/// mapping of the new target.
fn set_pte(tx: &Tx<'_>, tbl: MapRef, slot: usize, pte: Pte) -> Txr<()> {
    let k = tx.k;
    let old = k.mappings.with(tbl, |m| m.slots[slot]);
    if old == pte {
        return Ok(());
    }
    if old != Pte::Invalid {
        k.whack_pte(tbl, slot);
    }
    let r = match pte {
        Pte::Page { pg, .. } => k.revmap.install_pte_page(pg, tbl, slot),
        Pte::Table(child) => k.revmap.install_pte_mapping(child, tbl, slot),
        Pte::Invalid => Ok(()),
    };
    if let Err(e) = r {
        warn!("reverse map full installing pte: {}", e);
        return Err(Abandon::Restart);
    }
    k.mappings.with(tbl, |m| m.slots[slot] = pte);
    Ok(())
}

fn install_depend(tx: &Tx<'_>, gpt: ObRef, slot: u8, map: MapRef, base_pte: u16) -> Txr<()> {
    if let Err(e) = tx.k.depend.install(DependEntry {
        gpt,
        map,
        slot_mask: 1u16 << slot,
        slot_bias: slot,
        l2_slot_span: 0,
        base_pte,
    }) {
        warn!("depend table full: {}", e);
        return Err(Abandon::Restart);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// User memory access
// ----------------------------------------------------------------------

/// Copy bytes out of a process's address space.
pub fn read_user(tx: &mut Tx<'_>, proc: ObRef, va: Uva, buf: &mut [u8]) -> Txr<UserResult<()>> {
    let len = buf.len();
    let mut pos = 0usize;
    let mut cur = va;
    while pos < len {
        let page_va = cur & !(PAGE_SIZE as u64 - 1);
        let pg = match do_page_fault(tx, proc, page_va, false)? {
            Ok(pg) => pg,
            Err(fc) => return Ok(Err(fc)),
        };
        let pa = tx.k.cache.pages.with_body(pg.slot, |b| b.pa);
        let off = (cur - page_va) as usize;
        let chunk = (PAGE_SIZE - off).min(len - pos);
        tx.k.hal.with_page(pa, &mut |page| {
            buf[pos..pos + chunk].copy_from_slice(&page[off..off + chunk]);
        });
        pos += chunk;
        cur += chunk as u64;
    }
    Ok(Ok(()))
}

/// Copy bytes into a process's address space.
pub fn write_user(tx: &mut Tx<'_>, proc: ObRef, va: Uva, bytes: &[u8]) -> Txr<UserResult<()>> {
    let len = bytes.len();
    let mut pos = 0usize;
    let mut cur = va;
    while pos < len {
        let page_va = cur & !(PAGE_SIZE as u64 - 1);
        let pg = match do_page_fault(tx, proc, page_va, true)? {
            Ok(pg) => pg,
            Err(fc) => return Ok(Err(fc)),
        };
        tx.k.cache.hdr(pg).set_dirty();
        let pa = tx.k.cache.pages.with_body(pg.slot, |b| b.pa);
        let off = (cur - page_va) as usize;
        let chunk = (PAGE_SIZE - off).min(len - pos);
        tx.k.hal.with_page(pa, &mut |page| {
            page[off..off + chunk].copy_from_slice(&bytes[pos..pos + chunk]);
        });
        pos += chunk;
        cur += chunk as u64;
    }
    Ok(Ok(()))
}

/// Resolve a user VA to a capability-page slot. The VA must be 16-aligned
/// and must land in a CapPage the process can reach (writably, when
/// `for_write`).
pub fn find_cap_page_slot(
    tx: &mut Tx<'_>,
    proc: ObRef,
    va: Uva,
    for_write: bool,
) -> Txr<UserResult<(ObRef, usize, crate::cap::Restr)>> {
    if va % CAPABILITY_SIZE as u64 != 0 {
        return Ok(Err(FaultCode::InvalidDataReference));
    }
    let mut root = tx.k.addr_space_of(proc);
    let mut results = MemWalkResults::default();
    let fc = walk::memwalk(tx, &mut root, va, for_write, &mut results)?;
    tx.k.set_addr_space_of(proc, root);
    if fc != FaultCode::NoFault {
        return Ok(Err(fc));
    }
    let leaf = *results.ents.last().expect("successful walk has entries");
    let Some(node) = leaf.entry else {
        return Ok(Err(FaultCode::MalformedSpace));
    };
    if node.ty != ObType::CapPage {
        return Ok(Err(FaultCode::InvalidDataReference));
    }
    let slot = (leaf.rem_addr as usize % PAGE_SIZE) / CAPABILITY_SIZE;
    Ok(Ok((node, slot, results.cum_restr)))
}
