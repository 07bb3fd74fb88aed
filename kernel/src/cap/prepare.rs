// SPDX-License-Identifier: MPL-2.0

//! Capability preparation: swizzling between store form and in-memory form.
//!
//! Preparing a capability resolves its OID to a resident frame, verifies
//! the allocation count, and rewrites the capability to point at the frame
//! together with the object-table entry that witnesses the frame's current
//! identity. The preparation stays valid exactly as long as the frame's
//! OTE pointer matches; when the object is evicted or destroyed the match
//! breaks and the next use either unswizzles the capability back to OID
//! form or nulls it out.

use crate::{
    cap::{Capability, Target},
    kernel::Kernel,
    obj::ObRef,
    prelude::*,
    sched::{mutex::HoldInfo, Abandon, Tx, Txr},
};

/// True if the capability is swizzled but its witness no longer matches
/// the frame's identity.
pub fn is_stale(k: &Kernel, cap: &Capability) -> bool {
    match cap.target {
        Target::Prepared { ote, frame } => k.cache.hdr(frame).meta().ot != Some(ote),
        _ => false,
    }
}

/// Rewrite a stale prepared capability to its deprepared form: Null if the
/// target was destroyed, store form otherwise. Returns true if the
/// capability remains valid.
pub fn rewrite_deprepared(k: &Kernel, cap: &mut Capability) -> bool {
    let Target::Prepared { ote, .. } = cap.target else {
        return true;
    };
    let ent = k.ot.get(ote);
    if ent.destroyed {
        cap.init();
        return false;
    }
    cap.target = Target::Oid(ent.oid);
    true
}

/// In-place GC action: deprepare the capability if its preparation has
/// gone stale, without dereferencing the possibly-destroyed target.
pub fn gc(k: &Kernel, cap: &mut Capability) {
    if is_stale(k, cap) {
        rewrite_deprepared(k, cap);
    }
}

/// Copy `src` over `dest`, giving the copy a GC scrub on the way.
pub fn cap_set(k: &Kernel, dest: &mut Capability, src: &Capability) {
    let mut c = *src;
    gc(k, &mut c);
    *dest = c;
}

/// Deprepare a capability ahead of pageout, recording on the target that a
/// store-form capability to it exists.
pub fn deprepare(k: &Kernel, cap: &mut Capability) {
    if let Target::Prepared { ote, frame } = cap.target {
        if k.cache.hdr(frame).meta().ot == Some(ote) {
            k.cache
                .hdr(frame)
                .meta
                .lock()
                .flags
                .insert(crate::obj::FrameFlags::HAS_DISK_CAPS);
        }
        rewrite_deprepared(k, cap);
    }
}

/// Attempt to lock a prepared capability's target. Fails (returning
/// `None`) if the capability is not swizzled or the preparation is out of
/// date.
fn preplock(tx: &Tx<'_>, cap: &Capability) -> Txr<Option<(ObRef, HoldInfo)>> {
    let Target::Prepared { ote, frame } = cap.target else {
        return Ok(None);
    };

    let hi = tx.grab(frame)?;
    let meta = tx.k.cache.hdr(frame).meta();
    if meta.ot != Some(ote) {
        tx.release(hi);
        return Ok(None);
    }
    if meta.check_ref {
        // The frame sits on the check aging list; a touch upgrades it.
        tx.k.upgrade_age(frame, None);
    }
    Ok(Some((frame, hi)))
}

/// Prepare `cap` and lock its target object.
///
/// Non-object capabilities succeed trivially with `None`. An object
/// capability whose target is gone is nulled out and also reports `None`.
/// May abandon the transaction to page the target in.
pub fn prep_and_lock(tx: &Tx<'_>, cap: &mut Capability) -> Txr<Option<(ObRef, HoldInfo)>> {
    if !cap.can_prepare() {
        return Ok(None);
    }

    if cap.is_swizzled() {
        if let Some(found) = preplock(tx, cap)? {
            return Ok(Some(found));
        }
        // Stale preparation: deprepare, nulling on destruction.
        if !rewrite_deprepared(tx.k, cap) {
            return Ok(None);
        }
    }

    let ob_ty = cap.ty.ob_type().expect("object capability without frame type");
    let Target::Oid(oid) = cap.target else {
        unreachable!("deprepared capability without an OID");
    };

    // An OID outside every backed range cannot come back; the capability
    // is dead rather than waitable.
    let Some(frame) = tx.k.require_object(tx, ob_ty, oid, false)? else {
        cap.init();
        return Ok(None);
    };

    let hi = tx.grab(frame)?;
    let meta = tx.k.cache.hdr(frame).meta();

    if meta.alloc_count != cap.alloc_count {
        cap.init();
        tx.release(hi);
        return Ok(None);
    }

    let ote = match meta.ot {
        Some(idx) => {
            if meta.check_ref {
                tx.k.upgrade_age(frame, None);
            }
            idx
        }
        None => match tx.k.ot.alloc(meta.oid) {
            Ok(idx) => {
                tx.k.upgrade_age(frame, Some(idx));
                idx
            }
            Err(e) => {
                warn!("object table allocation failed: {}; restarting", e);
                return Err(Abandon::Restart);
            }
        },
    };

    cap.target = Target::Prepared { ote, frame };
    Ok(Some((frame, hi)))
}

/// Prepare `cap`, leaving the target locked for the remainder of the
/// transaction (the gang release is the only unlock).
pub fn prepare(tx: &Tx<'_>, cap: &mut Capability) -> Txr<Option<ObRef>> {
    Ok(prep_and_lock(tx, cap)?.map(|(frame, _)| frame))
}
