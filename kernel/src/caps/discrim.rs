// SPDX-License-Identifier: MPL-2.0

//! Discrim capability operations: classification without authority.

use crate::{
    cap::{CapType, Restr},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{cap_class, oc, Ikt},
    },
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Discrim);
            Ok(())
        }

        oc::DISCRIM_CLASSIFY => {
            ip.require_args(k, 1)?;

            ip.prepare_src(tx, 1)?;

            tx.commit_point();

            let class = match ip.src[1].cap.ty {
                CapType::Null => cap_class::NULL,
                CapType::Window | CapType::LocalWindow | CapType::Background => cap_class::WINDOW,
                CapType::Page | CapType::CapPage | CapType::Gpt => cap_class::MEMORY,
                CapType::Schedule => cap_class::SCHED,
                CapType::Endpoint => cap_class::ENDPOINT,
                CapType::Entry => cap_class::ENTRY,
                CapType::Process => cap_class::PROCESS,
                CapType::AppNotice => cap_class::APP_NOTICE,
                _ => cap_class::OTHER,
            };

            ip.put_oparam32(class);
            ip.complete(0);
            Ok(())
        }

        oc::DISCRIM_IS_DISCREET => {
            ip.require_args(k, 1)?;

            ip.prepare_src(tx, 1)?;

            tx.commit_point();

            // A capability is discreet if it conveys no mutate authority
            // and cannot be used as a covert storage channel.
            let c = &ip.src[1].cap;
            let discreet = match c.ty {
                CapType::Null
                | CapType::Window
                | CapType::LocalWindow
                | CapType::Background
                | CapType::CapBits
                | CapType::Discrim => true,
                CapType::Page | CapType::CapPage | CapType::Gpt => {
                    c.restr.contains(Restr::WEAK)
                }
                _ => false,
            };

            ip.put_oparam32(discreet as u32);
            ip.complete(0);
            Ok(())
        }

        oc::DISCRIM_COMPARE => {
            ip.require_args(k, 2)?;

            ip.prepare_src(tx, 1)?;
            ip.prepare_src(tx, 2)?;

            tx.commit_point();

            let c1 = &ip.src[1].cap;
            let c2 = &ip.src[2].cap;
            let same = c1.ty == c2.ty
                && c1.restr == c2.restr
                && c1.alloc_count == c2.alloc_count
                && c1.payload == c2.payload
                && c1.target == c2.target;

            ip.put_oparam32(same as u32);
            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
