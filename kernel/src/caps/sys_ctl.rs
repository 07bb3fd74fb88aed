// SPDX-License-Identifier: MPL-2.0

//! SysCtl: machine power control.

use crate::{
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{oc, Ikt},
    },
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::SysCtl);
            Ok(())
        }

        oc::SYSCTL_HALT => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            k.hal().halt();
            ip.complete(0);
            Ok(())
        }

        oc::SYSCTL_POWERDOWN => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            k.hal().powerdown();
            ip.complete(0);
            Ok(())
        }

        oc::SYSCTL_REBOOT => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            k.hal().reboot();
            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
