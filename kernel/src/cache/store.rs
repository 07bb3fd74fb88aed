// SPDX-License-Identifier: MPL-2.0

//! Frame allocation, aging, eviction, and the object-store interface.

use crate::{
    cache::{age::AgeListKind, with_pool, PHYS_OID_START},
    cap::{CapBlob, Capability},
    kernel::Kernel,
    obj::{
        ext::{ExEndpoint, ExGpt, ExProcess, FrameImage},
        frames::RunState,
        FrameFlags, ObRef, ObType, OteIndex,
    },
    prelude::*,
    sched::{Abandon, Tx, Txr},
    types::{Oid, Paddr, PAGE_SIZE},
};

impl Kernel {
    // ------------------------------------------------------------------
    // Allocation and aging
    // ------------------------------------------------------------------

    /// Allocate a frame of the requested type.
    ///
    /// Draws from the reclaim list; when that is empty, runs check/reclaim
    /// transitions to make room. Never blocks past the commit point: if no
    /// frame can be produced, the transaction restarts under soft
    /// back-pressure.
    pub(crate) fn alloc_frame(&self, tx: &Tx<'_>, ty: ObType) -> Txr<ObRef> {
        tx.assert_uncommitted();

        let count = self.cache.count(ty);
        for _ in 0..count * 2 + 2 {
            let taken = with_pool!(self.cache, ty, p => p.aging.lock().take_reclaim());
            if let Some(slot) = taken {
                let obref = ObRef { ty, slot };
                let hdr = self.cache.hdr(obref);
                let mut meta = hdr.meta.lock();
                meta.ot = None;
                meta.check_ref = false;
                meta.flags = FrameFlags::empty();
                return Ok(obref);
            }
            self.age_one_step(tx, ty)?;
        }

        warn!("no reclaimable {:?} frame; restarting transaction", ty);
        Err(Abandon::Restart)
    }

    /// One step of the second-chance scan: either evict the oldest check
    /// frame or demote the oldest active frame into check.
    fn age_one_step(&self, tx: &Tx<'_>, ty: ObType) -> Txr<()> {
        let victim = with_pool!(self.cache, ty, p => {
            let aging = p.aging.lock();
            aging.oldest(AgeListKind::Check)
        });

        if let Some(slot) = victim {
            let obref = ObRef { ty, slot };
            // A frame whose lock is held or which is pinned gets its second
            // chance the hard way.
            let pinned = self.cache.hdr(obref).meta().flags.contains(FrameFlags::PINNED);
            let held = self.grab_try(tx, obref).is_none();
            if pinned || held {
                with_pool!(self.cache, ty, p => p.aging.lock().move_to(slot, AgeListKind::Active));
                return Ok(());
            }
            self.evict_frame(obref);
            return Ok(());
        }

        // Check list is empty: demote the oldest active frame. The HAL is
        // implicitly asked to observe further touches; a prepare against
        // the frame upgrades it back to active.
        let demote = with_pool!(self.cache, ty, p => {
            let aging = p.aging.lock();
            aging.oldest(AgeListKind::Active)
        });
        if let Some(slot) = demote {
            let obref = ObRef { ty, slot };
            if self.cache.hdr(obref).meta().flags.contains(FrameFlags::PINNED) {
                with_pool!(self.cache, ty, p => p.aging.lock().move_to(slot, AgeListKind::Active));
                return Ok(());
            }
            self.cache.hdr(obref).meta.lock().check_ref = true;
            with_pool!(self.cache, ty, p => p.aging.lock().move_to(slot, AgeListKind::Check));
        }
        Ok(())
    }

    fn grab_try(&self, tx: &Tx<'_>, obref: ObRef) -> Option<crate::sched::mutex::HoldInfo> {
        self.cache.hdr(obref).lock.try_grab(self.cpu(tx.cpu), obref, |c| {
            self.cpus[c as usize].proc_mutex_value()
        })
    }

    /// Installs a newly materialized object into the aging system.
    pub(crate) fn install_new_object(&self, obref: ObRef) {
        with_pool!(self.cache, obref.ty, p => {
            p.aging.lock().move_to(obref.slot, AgeListKind::Active)
        });
    }

    /// Upgrade the age of an object that was found on the check list, or
    /// re-register one coming off the reclaim list with a fresh OTE.
    pub(crate) fn upgrade_age(&self, obref: ObRef, new_ote: Option<OteIndex>) {
        let hdr = self.cache.hdr(obref);
        {
            let mut meta = hdr.meta.lock();
            if meta.check_ref {
                meta.check_ref = false;
            } else if meta.ot.is_none() {
                debug_assert!(new_ote.is_some());
                meta.ot = new_ote;
            }
        }
        with_pool!(self.cache, obref.ty, p => {
            p.aging.lock().move_to(obref.slot, AgeListKind::Active)
        });
    }

    /// Evict a resident frame: invalidate every piece of derived state,
    /// write it back if dirty, and return it to the reclaim list.
    pub(crate) fn evict_frame(&self, obref: ObRef) {
        let meta = self.cache.hdr(obref).meta();
        self.invalidate_header(obref);
        if meta.flags.contains(FrameFlags::DIRTY) {
            self.write_back(obref);
        }
        self.obhash.remove(obref, meta.oid);
        self.clear_frame(obref);
        with_pool!(self.cache, obref.ty, p => {
            p.aging.lock().move_to(obref.slot, AgeListKind::Reclaim)
        });
    }

    /// Invalidate all cached state derived from this object, then cut the
    /// object loose from its OTE so outstanding swizzled capabilities are
    /// recognized as stale.
    pub(crate) fn invalidate_header(&self, obref: ObRef) {
        let ot = self.cache.hdr(obref).meta().ot;
        if ot.is_none() {
            return;
        }

        match obref.ty {
            ObType::Page | ObType::CapPage | ObType::Gpt => {
                self.invalidate_cached_memory_state(obref);
            }
            ObType::Process => {
                self.whack_process_mapping(obref);
            }
            ObType::Endpoint => {}
        }

        let mut meta = self.cache.hdr(obref).meta.lock();
        if let Some(idx) = meta.ot.take() {
            // GC may still be in its mark pass; keep the entry visible.
            self.ot.set_mark(idx);
        }
        meta.check_ref = false;
    }

    /// Wipe the object content without altering identity.
    pub(crate) fn clear_frame(&self, obref: ObRef) {
        match obref.ty {
            ObType::Page => {
                let pa = self.cache.pages.with_body(obref.slot, |b| {
                    use crate::obj::frames::FrameBody;
                    b.clear();
                    b.pa
                });
                self.zero_page(pa);
            }
            ObType::CapPage => self.cache.cap_pages.with_body(obref.slot, |b| {
                use crate::obj::frames::FrameBody;
                b.clear();
            }),
            ObType::Gpt => self.cache.gpts.with_body(obref.slot, |b| {
                use crate::obj::frames::FrameBody;
                b.clear();
            }),
            ObType::Process => self.cache.procs.with_body(obref.slot, |b| {
                use crate::obj::frames::FrameBody;
                b.clear();
            }),
            ObType::Endpoint => self.cache.endpoints.with_body(obref.slot, |b| {
                use crate::obj::frames::FrameBody;
                b.clear();
            }),
        }
    }

    pub(crate) fn zero_page(&self, pa: Paddr) {
        self.hal.with_page(pa, &mut |bytes| bytes.fill(0));
    }

    // ------------------------------------------------------------------
    // The object store interface
    // ------------------------------------------------------------------

    /// Find the current version of `(ty, oid)`, materializing it from the
    /// object store if necessary.
    pub(crate) fn require_object(
        &self,
        tx: &Tx<'_>,
        ty: ObType,
        oid: Oid,
        wait_for_range: bool,
    ) -> Txr<Option<ObRef>> {
        if let Some(obref) = self.obhash.lookup(&self.cache, ty, oid, false) {
            return Ok(Some(obref));
        }

        // Physical-range OIDs resolve through frame placement, never
        // through the store.
        if oid >= PHYS_OID_START {
            if ty != ObType::Page {
                return Ok(None);
            }
            let pa = (oid - PHYS_OID_START) * PAGE_SIZE as u64;
            return Ok(self.get_phys_page(pa));
        }

        if oid >= self.cache.max_oid(ty) {
            if wait_for_range {
                self.enqueue_current_on(tx, self.ob_stall_queue(oid));
                return Err(Abandon::Park);
            }
            return Ok(None);
        }

        let obref = self.alloc_frame(tx, ty)?;

        let loaded = match self.store.load(ty, oid) {
            Ok(l) => l,
            Err(e) => {
                error!("object store load failed for {:?}:{}: {}", ty, oid, e);
                None
            }
        };

        let alloc_count = loaded.as_ref().map_or(0, |(ac, _)| *ac);
        {
            let mut meta = self.cache.hdr(obref).meta.lock();
            meta.oid = oid;
            meta.alloc_count = alloc_count;
            meta.flags = FrameFlags::CURRENT;
        }
        if let Some((_, img)) = loaded {
            self.fill_frame(obref, img);
        } else {
            self.clear_frame(obref);
        }

        self.install_new_object(obref);
        self.obhash.insert(obref, oid);
        Ok(Some(obref))
    }

    /// Write dirty object state back to the store.
    pub(crate) fn write_back(&self, obref: ObRef) {
        let meta = self.cache.hdr(obref).meta();
        if !meta.flags.contains(FrameFlags::DIRTY) || !meta.flags.contains(FrameFlags::CURRENT) {
            return;
        }
        let img = self.externalize_frame(obref);
        if let Err(e) = self.store.store(obref.ty, meta.oid, meta.alloc_count, img) {
            error!("object store write-back failed for {:?}:{}: {}", obref.ty, meta.oid, e);
        }
        self.cache.hdr(obref).meta.lock().flags.remove(FrameFlags::DIRTY);
    }

    // ------------------------------------------------------------------
    // Externalization
    // ------------------------------------------------------------------

    /// The store form of a capability: deprepared, with destroyed targets
    /// collapsed to Null. Marks the target as having disk capabilities.
    pub(crate) fn store_form(&self, cap: &Capability) -> CapBlob {
        let mut c = *cap;
        if c.is_swizzled() {
            if let crate::cap::Target::Prepared { ote, frame } = c.target {
                let ent = self.ot.get(ote);
                if ent.destroyed {
                    c.init();
                } else {
                    self.cache.hdr(frame).meta.lock().flags.insert(FrameFlags::HAS_DISK_CAPS);
                    c.target = crate::cap::Target::Oid(ent.oid);
                }
            }
        }
        c.to_blob()
    }

    fn externalize_frame(&self, obref: ObRef) -> FrameImage {
        match obref.ty {
            ObType::Page => {
                let pa = self.cache.pages.with_body(obref.slot, |b| b.pa);
                let mut bytes = Box::new([0u8; PAGE_SIZE]);
                self.hal.with_page(pa, &mut |p| bytes.copy_from_slice(p));
                FrameImage::Page(bytes)
            }
            ObType::CapPage => {
                let caps = self.cache.cap_pages.with_body(obref.slot, |b| *b.caps);
                let mut blobs = Box::new([CapBlob::default(); crate::types::CAPS_PER_PAGE]);
                for (blob, cap) in blobs.iter_mut().zip(caps.iter()) {
                    *blob = self.store_form(cap);
                }
                FrameImage::CapPage(blobs)
            }
            ObType::Gpt => {
                let (l2v, ha, bg, caps) = self
                    .cache
                    .gpts
                    .with_body(obref.slot, |b| (b.l2v, b.ha, b.bg, b.caps));
                let mut ex = Box::new(ExGpt {
                    config: ExGpt::pack_config(l2v, ha, bg),
                    ..ExGpt::default()
                });
                for (blob, cap) in ex.cap.iter_mut().zip(caps.iter()) {
                    *blob = self.store_form(cap);
                }
                FrameImage::Gpt(ex)
            }
            ObType::Process => {
                let ex = self.cache.procs.with_body(obref.slot, |b| {
                    let mut ex = Box::new(ExProcess {
                        run_state: b.state.run_state as u8,
                        flags: b.state.flags,
                        soft_ints: b.state.soft_ints,
                        notices: b.state.notices,
                        fault_code: b.state.fault_code,
                        fault_info: b.state.fault_info,
                        pw: b.regs.pw,
                        pb_va: b.regs.pb_va,
                        pc: b.regs.pc,
                        ..ExProcess::default()
                    });
                    ex.schedule = self.store_form(&b.state.schedule);
                    ex.addr_space = self.store_form(&b.state.addr_space);
                    ex.brand = self.store_form(&b.state.brand);
                    ex.cohort = self.store_form(&b.state.cohort);
                    ex.io_space = self.store_form(&b.state.io_space);
                    ex.handler = self.store_form(&b.state.handler);
                    for (blob, cap) in ex.cap_reg.iter_mut().zip(b.state.cap_regs.iter()) {
                        *blob = self.store_form(cap);
                    }
                    ex
                });
                FrameImage::Process(ex)
            }
            ObType::Endpoint => {
                let ex = self.cache.endpoints.with_body(obref.slot, |b| ExEndpoint {
                    pm: b.pm as u32,
                    prot_payload: b.prot_payload,
                    endpoint_id: b.endpoint_id,
                    recipient: self.store_form(&b.recipient),
                });
                FrameImage::Endpoint(ex)
            }
        }
    }

    /// Fill a frame body from a loaded image.
    pub(crate) fn fill_frame(&self, obref: ObRef, img: FrameImage) {
        match (obref.ty, img) {
            (ObType::Page, FrameImage::Page(bytes)) => {
                let pa = self.cache.pages.with_body(obref.slot, |b| b.pa);
                self.hal.with_page(pa, &mut |p| p.copy_from_slice(&*bytes));
            }
            (ObType::CapPage, FrameImage::CapPage(blobs)) => {
                self.cache.cap_pages.with_body(obref.slot, |b| {
                    for (cap, blob) in b.caps.iter_mut().zip(blobs.iter()) {
                        *cap = Capability::from_blob(blob);
                    }
                });
            }
            (ObType::Gpt, FrameImage::Gpt(ex)) => {
                self.cache.gpts.with_body(obref.slot, |b| {
                    b.l2v = ex.l2v();
                    b.ha = ex.ha();
                    b.bg = ex.bg();
                    for (cap, blob) in b.caps.iter_mut().zip(ex.cap.iter()) {
                        *cap = Capability::from_blob(blob);
                    }
                });
            }
            (ObType::Process, FrameImage::Process(ex)) => {
                self.cache.procs.with_body(obref.slot, |b| {
                    b.state.run_state = match ex.run_state {
                        1 => RunState::Receiving,
                        2 => RunState::Faulted,
                        _ => RunState::Running,
                    };
                    b.state.flags = ex.flags;
                    b.state.soft_ints = ex.soft_ints;
                    b.state.notices = ex.notices;
                    b.state.fault_code = ex.fault_code;
                    b.state.fault_info = ex.fault_info;
                    b.state.schedule = Capability::from_blob(&ex.schedule);
                    b.state.addr_space = Capability::from_blob(&ex.addr_space);
                    b.state.brand = Capability::from_blob(&ex.brand);
                    b.state.cohort = Capability::from_blob(&ex.cohort);
                    b.state.io_space = Capability::from_blob(&ex.io_space);
                    b.state.handler = Capability::from_blob(&ex.handler);
                    for (cap, blob) in b.state.cap_regs.iter_mut().zip(ex.cap_reg.iter()) {
                        *cap = Capability::from_blob(blob);
                    }
                    b.regs.pw = ex.pw;
                    b.regs.pb_va = ex.pb_va;
                    b.regs.pc = ex.pc;
                });
            }
            (ObType::Endpoint, FrameImage::Endpoint(ex)) => {
                self.cache.endpoints.with_body(obref.slot, |b| {
                    b.pm = ex.pm != 0;
                    b.prot_payload = ex.prot_payload;
                    b.endpoint_id = ex.endpoint_id;
                    b.recipient = Capability::from_blob(&ex.recipient);
                });
            }
            _ => {
                error!("object store returned a mistyped image for {:?}", obref);
                self.clear_frame(obref);
            }
        }
    }

    // ------------------------------------------------------------------
    // Physical page capabilities
    // ------------------------------------------------------------------

    /// Get the page frame at physical address `pa` for a physical-range
    /// capability. The frame is pinned until released.
    pub(crate) fn get_phys_page(&self, pa: Paddr) -> Option<ObRef> {
        let obref = self.cache.page_by_pa(pa)?;
        let phys_oid = PHYS_OID_START + pa / PAGE_SIZE as u64;

        let meta = self.cache.hdr(obref).meta();
        if meta.flags.contains(FrameFlags::CURRENT) {
            // Already materialized; only usable if it already is this
            // physical OID.
            if meta.oid != phys_oid {
                return None;
            }
        } else {
            let reclaimable = with_pool!(self.cache, ObType::Page, p => {
                p.aging.lock().kind_of(obref.slot) == AgeListKind::Reclaim
            });
            if !reclaimable {
                return None;
            }
            with_pool!(self.cache, ObType::Page, p => {
                let mut aging = p.aging.lock();
                // Claim it out of the reclaim list.
                aging.move_to(obref.slot, AgeListKind::Active);
            });
            let mut meta = self.cache.hdr(obref).meta.lock();
            meta.oid = phys_oid;
            meta.alloc_count = 0;
            meta.ot = None;
            meta.flags = FrameFlags::CURRENT;
            drop(meta);
            self.obhash.insert(obref, phys_oid);
        }

        self.cache.hdr(obref).meta.lock().flags.insert(FrameFlags::PINNED);
        Some(obref)
    }

    /// Release the pin on a physical page frame.
    pub(crate) fn release_phys_page(&self, obref: ObRef) {
        self.cache.hdr(obref).meta.lock().flags.remove(FrameFlags::PINNED);
    }
}
