// SPDX-License-Identifier: MPL-2.0

//! The root of the handler chain: operations every capability implements.

use crate::{
    ipc::{
        param::{HandlerResult, InvError, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::of(ip.icap.cap.ty));
            Ok(())
        }

        oc::CAP_DESTROY => {
            ip.require_args(k, 0)?;

            // Destruction is a space-bank protocol; the kernel refuses to
            // destroy objects it does not account for.
            Err(InvError::Ex(Rc::NoAccess))
        }

        _ => Err(InvError::Ex(Rc::UnknownRequest)),
    }
}
