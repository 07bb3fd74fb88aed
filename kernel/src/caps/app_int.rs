// SPDX-License-Identifier: MPL-2.0

//! AppInt: posting software interrupts to a process through an endpoint.

use crate::{
    cap::{prepare, CapType},
    ipc::{
        param::{CapSlotPtr, HandlerResult, InvParam},
        syscall::{ipw0, oc, Ikt, Rc},
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
            ip.type_reply(Ikt::AppInt);
            Ok(())
        }

        oc::APPINT_POST_INTERRUPT => {
            let which_ints = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            // Only the authorized interrupts may be posted.
            if which_ints & ip.icap.cap.payload != which_ints {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let ep = ip.icap_target();
            let mut pcap = k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
            prepare::prepare(tx, &mut pcap)?;
            k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &pcap);

            debug_assert!(matches!(pcap.ty, CapType::Null | CapType::Process));

            // The recipient may be Null if the target was destroyed.
            if pcap.ty != CapType::Process {
                tx.commit_point();
                ip.error_reply(Rc::NoAccess);
                return Ok(());
            }

            let p = pcap.prep_target().expect("prepared process capability");

            tx.commit_point();

            k.cache.procs.with_body(p.slot, |b| b.state.soft_ints |= which_ints);

            // A recipient in open wait gets kicked awake.
            let kick = k.cache.procs.with_body(p.slot, |b| {
                b.state.run_state == RunState::Receiving && b.regs.pw[0] & ipw0::CW == 0
            });
            if kick {
                k.resume_process(p);
            }

            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
