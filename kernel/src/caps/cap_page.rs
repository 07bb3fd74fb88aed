// SPDX-License-Identifier: MPL-2.0

//! CapPage capability operations: slot-indexed capability storage with
//! weak-fetch propagation.

use crate::{
    cap::{prepare, CapType, Restr},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    sched::Tx,
    types::{Guard, CAPABILITY_SIZE, CAPS_PER_PAGE, PAGE_ADDR_BITS, PAGE_SIZE},
};

/// Types that may carry a guard imposed by `guardedSetSlot`.
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

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    let n_slot = CAPS_PER_PAGE;

    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::CapPage);
            Ok(())
        }

        oc::ADDR_SPACE_ERASE => {
            ip.require_args(k, 0)?;

            if ip.icap.cap.restr.read_only() {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let cp = ip.icap_target();
            k.cache.hdr(cp).set_dirty();

            tx.commit_point();

            k.cache.cap_pages.with_body(cp.slot, |b| {
                for c in b.caps.iter_mut() {
                    c.init();
                }
            });
            ip.complete(0);
            Ok(())
        }

        oc::ADDR_SPACE_COPY_FROM => {
            ip.require_args(k, 1)?;

            ip.prepare_src(tx, 1)?;

            if ip.src[1].cap.ty != CapType::CapPage {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            if ip.icap.cap.restr.read_only() {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let from = ip.src[1].cap.prep_target().expect("prepared cappage");
            let to = ip.icap_target();
            let weaken = ip.src[1].cap.restr.contains(Restr::WEAK);

            k.cache.hdr(to).set_dirty();

            tx.commit_point();

            // Exclusive access to both frames is ours by the object locks,
            // so weakening after the copy is safe.
            let src_caps = k.cache.cap_pages.with_body(from.slot, |b| *b.caps);
            k.cache.cap_pages.with_body(to.slot, |b| {
                for (d, s) in b.caps.iter_mut().zip(src_caps.iter()) {
                    prepare::cap_set(k, d, s);
                    if weaken {
                        d.weaken();
                    }
                }
            });

            let from_guard = ip.src[1].cap.guard();
            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            out.set_guard(from_guard);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_FETCH | oc::ADDR_SPACE_GET_SLOT => {
            let slot = if ip.op_code == oc::ADDR_SPACE_FETCH {
                let addr = ip.get_iparam64(k);
                ip.require_args(k, 0)?;

                if addr >= PAGE_SIZE as u64 || addr % CAPABILITY_SIZE as u64 != 0 {
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                }
                (addr as usize) / CAPABILITY_SIZE
            } else {
                let slot = ip.get_iparam32(k) as usize;
                ip.require_args(k, 0)?;
                slot
            };

            if slot >= n_slot {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            let cp = ip.icap_target();

            tx.commit_point();

            let mut out = k.cache.cap_pages.with_body(cp.slot, |b| b.caps[slot]);
            prepare::gc(k, &mut out);
            if ip.icap.cap.restr.contains(Restr::WEAK) {
                out.weaken();
            }
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_STORE | oc::ADDR_SPACE_SET_SLOT | oc::ADDR_SPACE_GUARDED_SET_SLOT => {
            let mut guard = None;
            let slot = if ip.op_code == oc::ADDR_SPACE_STORE {
                let addr = ip.get_iparam64(k);
                ip.require_args(k, 1)?;

                if addr >= PAGE_SIZE as u64 || addr % CAPABILITY_SIZE as u64 != 0 {
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                }
                (addr as usize) / CAPABILITY_SIZE
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

            if slot >= n_slot {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            if ip.icap.cap.restr.read_only() {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            if guard.is_some() {
                // The stored capability must be of a type that can carry a
                // guard; preparing it first resolves its real type.
                ip.prepare_src(tx, 1)?;
                if !accepts_guard(ip.src[1].cap.ty) {
                    tx.commit_point();
                    ip.error_reply(Rc::RequestError);
                    return Ok(());
                }
            }

            let cp = ip.icap_target();
            k.cache.hdr(cp).set_dirty();

            tx.commit_point();

            let mut stored = ip.src[1].cap;
            prepare::gc(k, &mut stored);
            if let Some(g) = guard {
                stored.set_guard(g);
            }
            k.cache.cap_pages.with_body(cp.slot, |b| b.caps[slot] = stored);

            ip.complete(0);
            Ok(())
        }

        oc::ADDR_SPACE_EXTENDED_FETCH => {
            let _offset = ip.get_iparam64(k);
            let l2arg = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            if l2arg < PAGE_ADDR_BITS {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            tx.commit_point();

            ip.put_oparam32(0); // l2slot
            ip.put_oparam32(0); // perms
            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_EXTENDED_STORE => {
            let _offset = ip.get_iparam64(k);
            let l2arg = ip.get_iparam32(k);
            let _guard = ip.get_iparam32(k);

            ip.require_args(k, 1)?;

            tx.commit_point();

            if l2arg < PAGE_ADDR_BITS {
                ip.error_reply(Rc::RequestError);
            } else {
                ip.error_reply(Rc::NoSuchSlot);
            }
            Ok(())
        }

        _ => super::addr_space::handle(tx, ip),
    }
}
