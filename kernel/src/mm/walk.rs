// SPDX-License-Identifier: MPL-2.0

//! The memory tree walker.
//!
//! Given a root memory capability and a 64-bit offset, produce an ordered
//! transcript of the traversal: one entry per capability traversed, with
//! the guard stripped at that step, the remaining offset, the node
//! reached, and the restrictions in force. The transcript is what the
//! fault path turns into hardware translations and depend records, and
//! what the extended fetch/store operations project prefixes of.

use smallvec::SmallVec;

use crate::{
    cap::{prepare, CapType, Capability, Restr},
    ipc::syscall::FaultCode,
    obj::{
        frames::{GptFrame, MEMWALK_SLOT_BACKGROUND, NUM_GPT_SLOTS},
        ObRef, ObType,
    },
    sched::{Tx, Txr},
    types::{ca_highbits, CoyAddr},
};

/// Maximum number of memory capabilities in a walk.
pub const MEMWALK_MAX: usize = 32;

/// One traversal step.
#[derive(Clone, Copy, Debug)]
pub struct MemWalkEntry {
    /// Guard of the capability (after left shift by l2g).
    pub guard: CoyAddr,
    /// Remaining address after the guard has been removed.
    pub rem_addr: CoyAddr,
    /// The memory frame traversed. For a window step, the GPT containing
    /// the slot the walk was redirected through.
    pub entry: Option<ObRef>,
    /// l2g from the capability; for GPTs, clamped to the node's effective
    /// span.
    pub l2g: u8,
    /// Restrictions contributed by this capability.
    pub restr: Restr,
    /// Slot traversed within the node; [`MEMWALK_SLOT_BACKGROUND`] for a
    /// background window.
    pub slot: u8,
    /// l2v of the GPT traversed; 0 for pages; equal to l2g otherwise.
    pub l2v: u8,
    /// This step was a window or local-window traversal.
    pub window: bool,
}

/// The transcript of a walk.
#[derive(Default)]
pub struct MemWalkResults {
    pub ents: SmallVec<[MemWalkEntry; MEMWALK_MAX]>,
    /// OR of the restrictions of every traversed capability.
    pub cum_restr: Restr,
}

impl MemWalkResults {
    pub fn count(&self) -> usize {
        self.ents.len()
    }
}

/// Where the working capability came from, so preparation effects land
/// back in the slot they belong to.
#[derive(Clone, Copy)]
enum Home {
    Root,
    Gpt(ObRef, usize),
}

fn write_home(tx: &Tx<'_>, home: Home, root: &mut Capability, cap: Capability) {
    match home {
        Home::Root => *root = cap,
        Home::Gpt(g, slot) => {
            tx.k.cache.gpts.with_body(g.slot, |b: &mut GptFrame| b.caps[slot] = cap);
        }
    }
}

fn read_gpt_slot(tx: &Tx<'_>, g: ObRef, slot: usize) -> Capability {
    tx.k.cache.gpts.with_body(g.slot, |b: &mut GptFrame| b.caps[slot])
}

/// Walk the memory tree rooted at `root` for offset `addr`.
///
/// The transcript and a fault code are returned together; the transcript
/// is valid (and useful for fault delivery) even when the walk faults.
/// If `for_write` is set and the cumulative restrictions forbid writing,
/// the outcome is overridden to `AccessViolation`.
///
/// May abandon the transaction to page in tree nodes.
pub fn memwalk(
    tx: &Tx<'_>,
    root: &mut Capability,
    mut addr: CoyAddr,
    for_write: bool,
    results: &mut MemWalkResults,
) -> Txr<FaultCode> {
    let mut cum_restr = Restr::empty();
    let mut cap = *root;
    let mut home = Home::Root;

    // Last GPT traversed, and last GPT with a background slot.
    let mut gpt: Option<ObRef> = None;
    let mut bggpt: Option<ObRef> = None;

    let fault = 'walk: loop {
        prepare::prepare(tx, &mut cap)?;
        write_home(tx, home, root, cap);

        // Most of the walk is GPTs; loop on those explicitly.
        while cap.ty == CapType::Gpt {
            let l2g = cap.l2g();
            let guard = cap.guard().match_value();

            if ca_highbits(addr, l2g) != guard {
                break 'walk FaultCode::InvalidDataReference;
            }
            addr ^= guard;

            let frame = cap.prep_target().expect("prepared GPT without frame");
            let (l2v, bg, addressable, eff_l2g) =
                tx.k.cache.gpts.with_body(frame.slot, |b: &mut GptFrame| {
                    (b.l2v, b.bg, b.addressable_slots(), b.effective_l2g())
                });
            gpt = Some(frame);
            if bg {
                bggpt = Some(frame);
            }

            let slot = (addr >> l2v) as usize;
            if slot >= addressable {
                break 'walk FaultCode::InvalidDataReference;
            }

            let rem_addr = addr;
            addr -= (slot as CoyAddr) << l2v;

            if results.ents.len() >= MEMWALK_MAX {
                break 'walk FaultCode::MalformedSpace;
            }
            cum_restr |= cap.restr;
            results.ents.push(MemWalkEntry {
                guard,
                rem_addr,
                entry: Some(frame),
                l2g: l2g.min(eff_l2g) as u8,
                restr: cap.restr,
                slot: slot as u8,
                l2v,
                window: false,
            });

            cap = read_gpt_slot(tx, frame, slot);
            home = Home::Gpt(frame, slot);
            prepare::prepare(tx, &mut cap)?;
            write_home(tx, home, root, cap);
        }

        // The capability may not actually be a memory object, but reading
        // the guard fields here keeps the cases below uniform.
        let l2g = cap.l2g();
        let guard = cap.guard().match_value();
        if ca_highbits(addr, l2g) != guard {
            break 'walk match cap.ty {
                CapType::Gpt
                | CapType::Page
                | CapType::CapPage
                | CapType::Window
                | CapType::LocalWindow
                | CapType::Background
                | CapType::Null => FaultCode::InvalidDataReference,
                _ => FaultCode::MalformedSpace,
            };
        }
        addr ^= guard;

        if results.ents.len() >= MEMWALK_MAX {
            break 'walk FaultCode::MalformedSpace;
        }

        match cap.ty {
            CapType::Page | CapType::CapPage => {
                cum_restr |= cap.restr;
                results.ents.push(MemWalkEntry {
                    guard,
                    rem_addr: addr,
                    entry: cap.prep_target(),
                    l2g: l2g as u8,
                    restr: cap.restr,
                    slot: 0,
                    l2v: 0,
                    window: false,
                });
                break 'walk FaultCode::NoFault;
            }

            CapType::LocalWindow => {
                // The allocation-count field names the slot to go through
                // in the GPT we are sitting in.
                let slot = cap.alloc_count as usize;
                addr |= cap.offset();

                if slot >= NUM_GPT_SLOTS {
                    break 'walk FaultCode::MalformedSpace;
                }
                let Some(g) = gpt else {
                    break 'walk FaultCode::MalformedSpace;
                };
                let ncap = read_gpt_slot(tx, g, slot);
                if matches!(
                    ncap.ty,
                    CapType::Window | CapType::LocalWindow | CapType::Background
                ) {
                    break 'walk FaultCode::MalformedSpace;
                }

                cum_restr |= cap.restr;
                results.ents.push(MemWalkEntry {
                    guard,
                    rem_addr: addr,
                    entry: Some(g),
                    l2g: l2g as u8,
                    restr: cap.restr,
                    slot: slot as u8,
                    l2v: l2g as u8,
                    window: true,
                });

                cap = ncap;
                home = Home::Gpt(g, slot);
                continue 'walk;
            }

            CapType::Window | CapType::Background => {
                addr |= cap.offset();
                let Some(bg) = bggpt else {
                    break 'walk FaultCode::MalformedSpace;
                };
                let ncap = read_gpt_slot(tx, bg, crate::obj::frames::GPT_BACKGROUND_SLOT);
                if matches!(
                    ncap.ty,
                    CapType::Window | CapType::LocalWindow | CapType::Background
                ) {
                    break 'walk FaultCode::MalformedSpace;
                }

                // The walk resumes under the background GPT.
                gpt = Some(bg);

                cum_restr |= cap.restr;
                results.ents.push(MemWalkEntry {
                    guard,
                    rem_addr: addr,
                    entry: Some(bg),
                    l2g: l2g as u8,
                    restr: cap.restr,
                    slot: MEMWALK_SLOT_BACKGROUND,
                    l2v: l2g as u8,
                    window: true,
                });

                cap = ncap;
                home = Home::Gpt(bg, crate::obj::frames::GPT_BACKGROUND_SLOT);
                continue 'walk;
            }

            CapType::Null => break 'walk FaultCode::InvalidDataReference,

            _ => break 'walk FaultCode::MalformedSpace,
        }
    };

    results.cum_restr = cum_restr;

    if for_write && cum_restr.read_only() {
        return Ok(FaultCode::AccessViolation);
    }
    Ok(fault)
}

/// Walk, then back the transcript out to the shallowest GPT whose span
/// equals `l2stop`. Used by the extended fetch/store operations.
pub fn extended_memwalk(
    tx: &Tx<'_>,
    root: &mut Capability,
    addr: CoyAddr,
    l2stop: u8,
    for_write: bool,
    results: &mut MemWalkResults,
) -> Txr<FaultCode> {
    let mut fc = memwalk(tx, root, addr, false, results)?;

    let mut cur_end = 0;
    let mut i = 0;
    while i < results.count() {
        let e = &results.ents[i];
        if e.l2g < l2stop {
            break;
        }
        if e.window {
            i += 1;
            continue;
        }
        if e.entry.map_or(false, |o| o.ty == ObType::Gpt) {
            if e.l2v < l2stop {
                break;
            }
            // A GPT we may want to return; extend the projection.
            cur_end = i + 1;
            if e.l2v == l2stop {
                break;
            }
        }
        i += 1;
    }

    // Breaking out early means no fault to report.
    if i < results.count() {
        fc = FaultCode::NoFault;
    }

    let mut cum_restr = Restr::empty();
    for e in &results.ents[..cur_end] {
        cum_restr |= e.restr;
    }
    if for_write && cum_restr.read_only() {
        fc = FaultCode::AccessViolation;
    }

    results.ents.truncate(cur_end);
    results.cum_restr = cum_restr;
    Ok(fc)
}
