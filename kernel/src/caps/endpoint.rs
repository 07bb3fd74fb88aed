// SPDX-License-Identifier: MPL-2.0

//! Endpoint capability operations.

use crate::{
    cap::{prepare, CapType},
    ipc::{
        param::{CapSlotPtr, HandlerResult, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    obj::ObRef,
    sched::{queue::QueueId, Tx},
};

/// Wake everyone parked on the current recipient's receive-wait queue:
/// they must redirect to the new recipient or re-evaluate under the new
/// prevailing conditions. We hold the endpoint lock, so we cannot race
/// their wakeups.
fn wake_recipient_senders(tx: &Tx<'_>, ep: ObRef) {
    let rcap = tx.k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
    if rcap.ty == CapType::Process {
        if let Some(p) = rcap.prep_target() {
            tx.k.wake_all(QueueId::RcvWait(p.slot));
        }
    }
}

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Endpoint);
            Ok(())
        }

        oc::ENDPOINT_SET_RECIPIENT => {
            ip.require_args(k, 1)?;

            let ep = ip.icap_target();

            ip.prepare_src(tx, 1)?;
            {
                let mut rcap = k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
                prepare::prepare(tx, &mut rcap)?;
                k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &rcap);
            }

            k.cache.hdr(ep).set_dirty();

            tx.commit_point();

            if ip.src[1].cap.ty != CapType::Process {
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            // Senders blocked on the old recipient may have been using us.
            wake_recipient_senders(tx, ep);
            // And anyone waiting for the endpoint itself to be repaired.
            let oid = k.cache.hdr(ep).meta().oid;
            k.wake_all(k.ob_stall_queue(oid));

            k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &ip.src[1].cap);

            ip.complete(0);
            Ok(())
        }

        oc::ENDPOINT_SET_PAYLOAD_MATCH => {
            ip.require_args(k, 0)?;

            let ep = ip.icap_target();
            let pm = k.cache.endpoints.with_body(ep.slot, |b| b.pm);
            if !pm {
                k.cache.hdr(ep).set_dirty();
            }
            {
                let mut rcap = k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
                prepare::prepare(tx, &mut rcap)?;
                k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &rcap);
            }

            tx.commit_point();

            // Waiting senders will mostly fail the payload gauntlet once
            // pm is set; waking them now lets them learn that sooner. No
            // point if they already ran it.
            if !pm {
                wake_recipient_senders(tx, ep);
                k.cache.endpoints.with_body(ep.slot, |b| b.pm = true);
            }

            ip.complete(0);
            Ok(())
        }

        oc::ENDPOINT_SET_EPID => {
            let ep_id = ip.get_iparam64(k);

            ip.require_args(k, 0)?;

            let ep = ip.icap_target();
            let cur = k.cache.endpoints.with_body(ep.slot, |b| b.endpoint_id);
            if ep_id != cur {
                k.cache.hdr(ep).set_dirty();
            }

            tx.commit_point();

            // Senders re-acquire the endpoint ID when they actually make
            // it through; no wakeups needed.
            if ep_id != cur {
                k.cache.endpoints.with_body(ep.slot, |b| b.endpoint_id = ep_id);
            }

            ip.complete(0);
            Ok(())
        }

        oc::ENDPOINT_GET_EPID => {
            ip.require_args(k, 0)?;

            let ep = ip.icap_target();

            tx.commit_point();

            let ep_id = k.cache.endpoints.with_body(ep.slot, |b| b.endpoint_id);
            ip.put_oparam64(ep_id);
            ip.complete(0);
            Ok(())
        }

        oc::ENDPOINT_MAKE_ENTRY_CAP | oc::ENDPOINT_MAKE_APP_NOTIFIER => {
            let pp = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            tx.commit_point();

            let mut out = ip.icap.cap;
            prepare::gc(k, &mut out);
            out.ty = if ip.op_code == oc::ENDPOINT_MAKE_ENTRY_CAP {
                CapType::Entry
            } else {
                CapType::AppInt
            };
            out.payload = pp;
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
