// SPDX-License-Identifier: MPL-2.0

//! AppNotice: one-way notice posting.

use crate::{
    cap::{prepare, CapType},
    ipc::{
        param::{CapSlotPtr, HandlerResult, InvParam},
        syscall::{ipw0, oc, Ikt},
    },
    obj::frames::RunState,
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::AppNotice);
            Ok(())
        }

        oc::APPNOTICE_POST_NOTICE => {
            let notices = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            // The method is oneway; nobody hears about failures either.
            ip.invokee = None;

            let notices = notices & ip.icap.cap.payload;

            let ep = ip.icap_target();
            let mut pcap = k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
            prepare::prepare(tx, &mut pcap)?;
            k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &pcap);

            debug_assert!(matches!(pcap.ty, CapType::Null | CapType::Process));

            // Destroyed recipient: drop the notice on the floor.
            if pcap.ty != CapType::Process {
                tx.commit_point();
                return Ok(());
            }

            let p = pcap.prep_target().expect("prepared process capability");
            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            k.cache.procs.with_body(p.slot, |b| b.state.notices |= notices);

            let kick = k.cache.procs.with_body(p.slot, |b| {
                b.state.run_state == RunState::Receiving && b.regs.pw[0] & ipw0::CW == 0
            });
            if kick {
                k.resume_process(p);
            }

            ip.complete(0);
            Ok(())
        }

        oc::APPNOTICE_GET_NOTICES => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            ip.put_oparam32(ip.icap.cap.payload);
            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
