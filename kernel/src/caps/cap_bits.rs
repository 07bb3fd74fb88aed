// SPDX-License-Identifier: MPL-2.0

//! CapBits: expose the raw store-form representation of a capability.

use crate::{
    cap::Target,
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt},
    },
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAPBITS_GET => {
            ip.require_args(k, 1)?;

            // Deprepare a copy without disturbing the source or its target.
            let mut c = ip.src[1].cap;
            if let Target::Prepared { ote, .. } = c.target {
                let ent = k.ot.get(ote);
                if ent.destroyed {
                    c.init();
                } else {
                    c.target = Target::Oid(ent.oid);
                }
            }

            tx.commit_point();

            let blob = c.to_blob();
            ip.put_oparam64((blob.w0 as u64) | ((blob.payload as u64) << 32));
            ip.put_oparam64(blob.target);
            ip.complete(0);
            Ok(())
        }

        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::CapBits);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
