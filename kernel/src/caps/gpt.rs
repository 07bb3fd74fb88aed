// SPDX-License-Identifier: MPL-2.0

//! GPT capability operations: slot access, the l2v value, and the handler
//! and background flags. Every mutation that can change what the GPT
//! translates runs the depend machinery so stale PTEs die with it.

use crate::{
    cap::{prepare, CapType, Restr},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    mm::walk::{self, MemWalkResults},
    obj::frames::NUM_GPT_SLOTS,
    sched::Tx,
    types::{Guard, SOFTADDR_BITS},
};

fn accepts_guard(ty: CapType) -> bool {
    matches!(
        ty,
        CapType::Window
            | CapType::LocalWindow
            | CapType::Background
            | CapType::CapPage
            | CapType::Page
            | CapType::Gpt
    )
}

/// Opaque GPT capabilities admit only the abstract Memory surface.
fn opaque_refuses(ip: &InvParam) -> bool {
    ip.icap.cap.restr.contains(Restr::OPAQUE)
}

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Gpt);
            Ok(())
        }

        oc::ADDR_SPACE_GET_SLOT | oc::ADDR_SPACE_FETCH => {
            let slot = if ip.op_code == oc::ADDR_SPACE_FETCH {
                let addr = ip.get_iparam64(k);
                ip.require_args(k, 0)?;
                let gpt = ip.icap_target();
                let l2v = k.cache.gpts.with_body(gpt.slot, |b| b.l2v);
                (addr >> l2v) as usize
            } else {
                let slot = ip.get_iparam32(k) as usize;
                ip.require_args(k, 0)?;
                slot
            };

            if slot >= NUM_GPT_SLOTS || opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(if slot >= NUM_GPT_SLOTS {
                    Rc::RequestError
                } else {
                    Rc::NoAccess
                });
                return Ok(());
            }

            let gpt = ip.icap_target();

            tx.commit_point();

            let mut out = k.cache.gpts.with_body(gpt.slot, |b| b.caps[slot]);
            prepare::gc(k, &mut out);
            if ip.icap.cap.restr.contains(Restr::WEAK) {
                out.weaken();
            }
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_SET_SLOT | oc::ADDR_SPACE_STORE | oc::ADDR_SPACE_GUARDED_SET_SLOT => {
            let mut guard = None;
            let slot = if ip.op_code == oc::ADDR_SPACE_STORE {
                let addr = ip.get_iparam64(k);
                ip.require_args(k, 1)?;
                let gpt = ip.icap_target();
                let l2v = k.cache.gpts.with_body(gpt.slot, |b| b.l2v);
                (addr >> l2v) as usize
            } else {
                let slot = ip.get_iparam32(k) as usize;
                if ip.op_code == oc::ADDR_SPACE_GUARDED_SET_SLOT {
                    let g = Guard::from_raw(ip.get_iparam32(k));
                    if !g.is_valid() {
                        ip.require_args(k, 1)?;
                        tx.commit_point();
                        ip.error_reply(Rc::RequestError);
                        return Ok(());
                    }
                    guard = Some(g);
                }
                ip.require_args(k, 1)?;
                slot
            };

            if slot >= NUM_GPT_SLOTS {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            if ip.icap.cap.restr.read_only() || opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            if guard.is_some() {
                ip.prepare_src(tx, 1)?;
                if !accepts_guard(ip.src[1].cap.ty) {
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                }
            }

            let gpt = ip.icap_target();
            k.cache.hdr(gpt).set_dirty();

            tx.commit_point();

            // Translations produced through this slot are now lies.
            k.depend_invalidate_slot(gpt, slot);

            let mut stored = ip.src[1].cap;
            prepare::gc(k, &mut stored);
            if let Some(g) = guard {
                stored.set_guard(g);
            }
            k.cache.gpts.with_body(gpt.slot, |b| b.caps[slot] = stored);

            ip.complete(0);
            Ok(())
        }

        oc::GPT_GET_L2V => {
            ip.require_args(k, 0)?;

            if opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }
            let gpt = ip.icap_target();

            tx.commit_point();

            let l2v = k.cache.gpts.with_body(gpt.slot, |b| b.l2v);
            ip.put_oparam32(l2v as u32);
            ip.complete(0);
            Ok(())
        }

        oc::GPT_SET_L2V => {
            let l2v = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            if ip.icap.cap.restr.read_only() || opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }
            if l2v == 0 || l2v >= SOFTADDR_BITS {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            let gpt = ip.icap_target();
            k.cache.hdr(gpt).set_dirty();

            tx.commit_point();

            // Changing the span invalidates everything this node produced.
            k.invalidate_cached_memory_state(gpt);
            k.cache.gpts.with_body(gpt.slot, |b| b.l2v = l2v as u8);
            ip.complete(0);
            Ok(())
        }

        oc::GPT_GET_HANDLER | oc::GPT_GET_BACKGROUND => {
            ip.require_args(k, 0)?;

            if opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }
            let gpt = ip.icap_target();

            tx.commit_point();

            let (ha, bg) = k.cache.gpts.with_body(gpt.slot, |b| (b.ha, b.bg));
            let v = if ip.op_code == oc::GPT_GET_HANDLER { ha } else { bg };
            ip.put_oparam32(v as u32);
            ip.complete(0);
            Ok(())
        }

        oc::GPT_SET_HANDLER | oc::GPT_SET_BACKGROUND => {
            let value = ip.get_iparam32(k) != 0;

            ip.require_args(k, 0)?;

            if ip.icap.cap.restr.read_only() || opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let gpt = ip.icap_target();
            k.cache.hdr(gpt).set_dirty();

            tx.commit_point();

            // The background flag halves the addressable slots, so cached
            // translations cannot be trusted either way.
            k.invalidate_cached_memory_state(gpt);
            k.cache.gpts.with_body(gpt.slot, |b| {
                if ip.op_code == oc::GPT_SET_HANDLER {
                    b.ha = value;
                } else {
                    b.bg = value;
                }
            });
            ip.complete(0);
            Ok(())
        }

        oc::ADDR_SPACE_EXTENDED_FETCH => {
            let offset = ip.get_iparam64(k);
            let l2stop = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            if opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let mut root = ip.icap.cap;
            let mut results = MemWalkResults::default();
            let fc =
                walk::extended_memwalk(tx, &mut root, offset, l2stop as u8, false, &mut results)?;
            ip.icap.cap = root;

            tx.commit_point();

            if fc != crate::ipc::syscall::FaultCode::NoFault {
                ip.error_reply(fc.to_rc());
                return Ok(());
            }
            let Some(e) = results.ents.last().copied() else {
                ip.error_reply(Rc::NoSuchSlot);
                return Ok(());
            };
            let node = e.entry.expect("projected walk ends at a GPT");

            let mut out = k.cache.gpts.with_body(node.slot, |b| b.caps[e.slot as usize]);
            prepare::gc(k, &mut out);
            if results.cum_restr.contains(Restr::WEAK) {
                out.weaken();
            }
            ip.put_oparam32(e.l2v as u32);
            ip.put_oparam32(results.cum_restr.bits() as u32);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_EXTENDED_STORE => {
            let offset = ip.get_iparam64(k);
            let l2stop = ip.get_iparam32(k);
            let guard = Guard::from_raw(ip.get_iparam32(k));

            ip.require_args(k, 1)?;

            if ip.icap.cap.restr.read_only() || opaque_refuses(ip) {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }
            if !guard.is_valid() {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            let mut root = ip.icap.cap;
            let mut results = MemWalkResults::default();
            let fc =
                walk::extended_memwalk(tx, &mut root, offset, l2stop as u8, true, &mut results)?;
            ip.icap.cap = root;

            if fc != crate::ipc::syscall::FaultCode::NoFault {
                tx.commit_point();
                ip.error_reply(fc.to_rc());
                return Ok(());
            }
            let Some(e) = results.ents.last().copied() else {
                tx.commit_point();
                ip.error_reply(Rc::NoSuchSlot);
                return Ok(());
            };
            let node = e.entry.expect("projected walk ends at a GPT");
            k.cache.hdr(node).set_dirty();

            tx.commit_point();

            k.depend_invalidate_slot(node, e.slot as usize);

            let mut stored = ip.src[1].cap;
            prepare::gc(k, &mut stored);
            stored.set_guard(guard);
            k.cache.gpts.with_body(node.slot, |b| b.caps[e.slot as usize] = stored);

            ip.complete(0);
            Ok(())
        }

        _ => super::addr_space::handle(tx, ip),
    }
}
