// SPDX-License-Identifier: MPL-2.0

//! Range capability operations: object enumeration, identification,
//! rescind, and the minting of fresh capabilities by `(type, OID)`.

use crate::{
    cache::PHYS_OID_START,
    cap::{prepare, CapType, Capability},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, range_ob_type, Ikt, Rc},
    },
    obj::{FrameFlags, ObRef, ObType},
    prelude::*,
    sched::{queue::QueueId, Tx},
    types::PAGE_SIZE,
};

fn ob_type_of(code: u32) -> Option<(ObType, CapType)> {
    Some(match code {
        range_ob_type::PAGE => (ObType::Page, CapType::Page),
        range_ob_type::CAP_PAGE => (ObType::CapPage, CapType::CapPage),
        range_ob_type::GPT => (ObType::Gpt, CapType::Gpt),
        range_ob_type::PROCESS => (ObType::Process, CapType::Process),
        range_ob_type::ENDPOINT => (ObType::Endpoint, CapType::Endpoint),
        _ => return None,
    })
}

fn range_code_of(ty: CapType) -> (u32, bool) {
    match ty {
        CapType::Page => (range_ob_type::PAGE, true),
        CapType::CapPage => (range_ob_type::CAP_PAGE, true),
        CapType::Gpt => (range_ob_type::GPT, true),
        CapType::Process => (range_ob_type::PROCESS, true),
        CapType::Endpoint => (range_ob_type::ENDPOINT, true),
        _ => (range_ob_type::INVALID, false),
    }
}

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Range);
            Ok(())
        }

        oc::RANGE_NEXT_BACKED_SUBRANGE => {
            let _start_offset = ip.get_iparam64(k);
            let ob_type = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            let Some((oty, _)) = ob_type_of(ob_type) else {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            };

            tx.commit_point();

            ip.put_oparam64(0);
            ip.put_oparam64(k.cache.max_oid(oty));
            ip.complete(0);
            Ok(())
        }

        oc::RANGE_IDENTIFY => {
            ip.require_args(k, 1)?;

            ip.prepare_src(tx, 1)?;

            tx.commit_point();

            let c = &ip.src[1].cap;
            let (ot, is_object) = range_code_of(c.ty);
            let oid = if is_object {
                c.prep_target()
                    .map(|t| k.cache.hdr(t).meta().oid)
                    .unwrap_or(0)
            } else {
                0
            };

            ip.put_oparam32(ot);
            ip.put_oparam64(oid);
            ip.complete(0);
            Ok(())
        }

        oc::RANGE_RESCIND => {
            ip.require_args(k, 1)?;

            // Bring the object in so the allocation count can move; if the
            // capability is already prepared this is harmless.
            ip.prepare_src(tx, 1)?;

            let Some(target) = ip.src[1].cap.prep_target() else {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            };

            let old_ote = k.cache.hdr(target).meta().ot;

            k.cache.hdr(target).set_dirty();
            k.invalidate_header(target);

            // Destruction, not mere eviction: outstanding swizzled
            // capabilities must collapse to Null rather than unswizzle.
            if let Some(idx) = old_ote {
                k.ot.set_destroyed(idx);
            }

            if target.ty == ObType::Process {
                // Senders parked on the dying process re-evaluate; the
                // corpse itself leaves whatever queue it was on.
                k.wake_all(QueueId::RcvWait(target.slot));
                k.unlink_from_queue(target);
            }

            tx.commit_point();

            // A rescinded physical page gives up its pin; everything else
            // just drops the pinned bit with the rest of its state.
            if k.cache.hdr(target).meta().oid >= PHYS_OID_START {
                k.release_phys_page(target);
            } else {
                k.cache.hdr(target).meta.lock().flags.remove(FrameFlags::PINNED);
            }
            k.clear_frame(target);

            // Every outstanding capability to the object becomes stale:
            // swizzled ones through the destroyed OTE, store-form ones
            // through the generation bump.
            {
                let mut m = k.cache.hdr(target).meta.lock();
                m.alloc_count = (m.alloc_count + 1) & 0xf_ffff;
            }

            // We may just have destroyed the invoker, the invokee, or the
            // reply endpoint. No replies to the dead.
            if ip.invokee_ep == Some(target) {
                ip.invokee = None;
            }
            if ip.invokee == Some(target) {
                ip.invokee = None;
            }

            ip.complete(0);
            Ok(())
        }

        oc::RANGE_GET_CAP | oc::RANGE_WAIT_CAP | oc::RANGE_GET_PROCESS
        | oc::RANGE_WAIT_PROCESS => {
            let oid = ip.get_iparam64(k);

            let for_process = matches!(
                ip.op_code,
                oc::RANGE_GET_PROCESS | oc::RANGE_WAIT_PROCESS
            );
            let wait_for_range = matches!(
                ip.op_code,
                oc::RANGE_WAIT_CAP | oc::RANGE_WAIT_PROCESS
            );

            let (oty, cap_ty, n_cap_arg) = if for_process {
                (ObType::Process, CapType::Process, 1)
            } else {
                let code = ip.get_iparam32(k);
                let Some((oty, cap_ty)) = ob_type_of(code) else {
                    ip.require_args(k, 0)?;
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                };
                (oty, cap_ty, 0)
            };

            ip.require_args(k, n_cap_arg)?;

            // Physical ranges are a special case.
            if oid >= PHYS_OID_START {
                let pa = (oid - PHYS_OID_START).wrapping_mul(PAGE_SIZE as u64);
                if oty != ObType::Page || pa / PAGE_SIZE as u64 + PHYS_OID_START != oid {
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                }
                let Some(pg) = k.get_phys_page(pa) else {
                    tx.commit_point();
                    ip.error_reply(Rc::RangeErr);
                    return Ok(());
                };

                let alloc_count = k.cache.hdr(pg).meta().alloc_count;
                let phys_oid = k.cache.hdr(pg).meta().oid;
                let mut out = Capability::object(CapType::Page, phys_oid, alloc_count);
                prepare::prepare(tx, &mut out)?;

                tx.commit_point();

                ip.src[0].cap = out;
                ip.complete(1);
                return Ok(());
            }

            // Hunt the object down so that the allocation count is known,
            // bringing it in from the store if need be.
            let Some(target) = k.require_object(tx, oty, oid, wait_for_range)? else {
                tx.commit_point();
                ip.error_reply(Rc::RangeErr);
                return Ok(());
            };

            let alloc_count = k.cache.hdr(target).meta().alloc_count;
            let mut out = Capability::object(cap_ty, oid, alloc_count);
            prepare::prepare(tx, &mut out)?;

            let brand = if for_process { Some(ip.src[1].cap) } else { None };
            if brand.is_some() {
                k.cache.hdr(target).set_dirty();
            }

            tx.commit_point();

            if let Some(brand) = brand {
                k.cache.procs.with_body(target.slot, |b| {
                    prepare::cap_set(k, &mut b.state.brand, &brand);
                });
            }

            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
