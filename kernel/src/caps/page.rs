// SPDX-License-Identifier: MPL-2.0

//! Page capability operations.

use crate::{
    cap::{prepare, CapType},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    sched::Tx,
    types::{PAGE_ADDR_BITS, PAGE_SIZE},
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Page);
            Ok(())
        }

        oc::ADDR_SPACE_ERASE => {
            ip.require_args(k, 0)?;

            if ip.icap.cap.restr.read_only() {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let pg = ip.icap_target();
            k.cache.hdr(pg).set_dirty();
            let pa = k.cache.pages.with_body(pg.slot, |b| b.pa);

            tx.commit_point();

            k.zero_page(pa);
            ip.complete(0);
            Ok(())
        }

        oc::ADDR_SPACE_COPY_FROM => {
            ip.require_args(k, 1)?;

            ip.prepare_src(tx, 1)?;

            if ip.src[1].cap.ty != CapType::Page {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            if ip.icap.cap.restr.read_only() {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let from = ip.src[1].cap.prep_target().expect("prepared page");
            let to = ip.icap_target();

            k.cache.hdr(to).set_dirty();
            let from_pa = k.cache.pages.with_body(from.slot, |b| b.pa);
            let to_pa = k.cache.pages.with_body(to.slot, |b| b.pa);

            tx.commit_point();

            let mut buf = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
            k.hal().with_page(from_pa, &mut |p| buf.copy_from_slice(p));
            k.hal().with_page(to_pa, &mut |p| p.copy_from_slice(&*buf));

            // The returned capability carries the source guard.
            let from_guard = ip.src[1].cap.guard();
            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            out.set_guard(from_guard);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::ADDR_SPACE_EXTENDED_FETCH => {
            let _offset = ip.get_iparam64(k);
            let l2arg = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            // Degenerate: a page capability has no containing slot.
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

        oc::ADDR_SPACE_SET_SLOT
        | oc::ADDR_SPACE_GET_SLOT
        | oc::ADDR_SPACE_GUARDED_SET_SLOT
        | oc::ADDR_SPACE_STORE
        | oc::ADDR_SPACE_FETCH => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            ip.error_reply(Rc::CapAccessTypeError);
            Ok(())
        }

        _ => super::addr_space::handle(tx, ip),
    }
}
