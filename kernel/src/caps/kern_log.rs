// SPDX-License-Identifier: MPL-2.0

//! KernLog: bounded string emission to the console.

use crate::{
    arch::IPW_SNDPTR,
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    mm::fault,
    prelude::*,
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::KernLog);
            Ok(())
        }

        oc::KERNLOG_LOG => {
            let len = ip.get_iparam32(k);

            ip.require_args_s_m(k, 0, len, 256)?;

            if len > 255 {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            let snd_ptr = k.get_pw(ip.invoker, IPW_SNDPTR);
            let mut buf = vec![0u8; len as usize];
            match fault::read_user(tx, ip.invoker, snd_ptr, &mut buf)? {
                Ok(()) => {}
                Err(_) => {
                    tx.commit_point();
                    ip.error_reply(Rc::NoAccess);
                    return Ok(());
                }
            }

            tx.commit_point();

            if buf.last() != Some(&b'\n') {
                buf.push(b'\n');
            }
            k.hal().console_write(&buf);

            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
