// SPDX-License-Identifier: MPL-2.0

//! The abstract Memory interface: restriction and guard management.

use crate::{
    cap::{prepare, CapType, Restr},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Rc},
    },
    sched::Tx,
    types::Guard,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::MEMORY_REDUCE => {
            let restr = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            if restr & !(Restr::all().bits() as u32) != 0 {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            let mut restr = Restr::from_bits_truncate(restr as u8);

            tx.commit_point();

            if restr.contains(Restr::OPAQUE) && ip.icap.cap.ty != CapType::Gpt {
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            if restr.contains(Restr::WEAK) {
                restr |= Restr::RO;
            }

            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            out.restr |= restr;
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::MEMORY_GET_RESTRICTIONS => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            ip.put_oparam32(ip.icap.cap.restr.bits() as u32);
            ip.complete(0);
            Ok(())
        }

        oc::MEMORY_GET_GUARD => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            ip.put_oparam32(ip.icap.cap.guard().raw());
            ip.complete(0);
            Ok(())
        }

        oc::MEMORY_SET_GUARD => {
            let guard = Guard::from_raw(ip.get_iparam32(k));

            ip.require_args(k, 0)?;

            tx.commit_point();

            if !guard.is_valid() {
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            out.set_guard(guard);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
