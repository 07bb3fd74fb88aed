// SPDX-License-Identifier: MPL-2.0

//! Process capability operations.
//!
//! A Restart-restricted process capability conveys resumption authority
//! only; anything beyond `getType` is refused before dispatch.

use crate::{
    arch::{IPW_RCVBOUND, IPW_RCVPTR, IPW_SNDPTR, OPW_SNDLEN},
    cap::{prepare, Restr},
    ipc::{
        param::{HandlerResult, InvParam},
        syscall::{ipw0, oc, Ikt, Rc},
    },
    mm::fault,
    obj::frames::{ProcSlot, RunState, NUM_CAP_REGS},
    prelude::*,
    sched::Tx,
};

/// Serialized size of the fixed register block.
const FIX_REGS_BYTES: u32 = 6 * 8;
/// Serialized size of the floating-point register block.
const FLOAT_REGS_BYTES: u32 = 8 * 8;

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    let p = ip.icap_target();

    if ip.op_code != oc::CAP_GET_TYPE && ip.icap.cap.restr.contains(Restr::RESTART) {
        tx.commit_point();
        ip.error_reply(Rc::NoAccess);
        return Ok(());
    }

    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Process);
            Ok(())
        }

        oc::PROCESS_GET_CAP_REG => {
            let idx = ip.get_iparam32(k) as usize;

            ip.require_args(k, 0)?;

            if idx >= NUM_CAP_REGS {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            tx.commit_point();

            let mut out = k.cache.procs.with_body(p.slot, |b| b.state.cap_regs[idx]);
            prepare::gc(k, &mut out);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::PROCESS_SET_CAP_REG => {
            let idx = ip.get_iparam32(k) as usize;

            ip.require_args(k, 1)?;

            if idx >= NUM_CAP_REGS {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }
            // Register 0 is architecturally the Null capability.
            if idx == 0 {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            }

            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            let mut c = ip.src[1].cap;
            prepare::gc(k, &mut c);
            k.cache.procs.with_body(p.slot, |b| b.state.cap_regs[idx] = c);
            ip.complete(0);
            Ok(())
        }

        oc::PROCESS_GET_STATE => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            let (rs, fc, fi) = k.cache.procs.with_body(p.slot, |b| {
                (b.state.run_state as u32, b.state.fault_code, b.state.fault_info)
            });
            ip.put_oparam32(rs);
            ip.put_oparam32(fc);
            ip.put_oparam64(fi);
            ip.complete(0);
            Ok(())
        }

        oc::PROCESS_RESUME => {
            let cancel_fault = ip.get_iparam32(k) != 0;

            ip.require_args(k, 0)?;

            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            let was_faulted = k.cache.procs.with_body(p.slot, |b| {
                let was = b.state.run_state == RunState::Faulted;
                b.state.run_state = RunState::Running;
                if cancel_fault {
                    b.state.fault_code = 0;
                    b.state.fault_info = 0;
                }
                was
            });
            if was_faulted && p != ip.invoker {
                k.ready_add(p, false);
            }
            ip.complete(0);
            Ok(())
        }

        oc::PROCESS_SET_FAULT => {
            let code = ip.get_iparam32(k);
            let info = ip.get_iparam64(k);

            ip.require_args(k, 0)?;

            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            k.cache.procs.with_body(p.slot, |b| {
                b.state.fault_code = code;
                b.state.fault_info = info;
                b.state.run_state = RunState::Faulted;
            });
            ip.complete(0);
            Ok(())
        }

        oc::PROCESS_GET_SLOT => {
            let slot = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            let Some(slot) = ProcSlot::from_u32(slot) else {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            };

            tx.commit_point();

            let mut out = k.cache.procs.with_body(p.slot, |b| *b.cap_slot(slot));
            prepare::gc(k, &mut out);
            ip.src[0].cap = out;
            ip.complete(1);
            Ok(())
        }

        oc::PROCESS_SET_SLOT => {
            let slot = ip.get_iparam32(k);

            ip.require_args(k, 1)?;

            let Some(slot) = ProcSlot::from_u32(slot) else {
                tx.commit_point();
                ip.error_reply(Rc::RequestError);
                return Ok(());
            };

            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            if slot == ProcSlot::AddrSpace {
                // The old space's translations die with the slot.
                k.whack_process_mapping(p);
            }

            let mut c = ip.src[1].cap;
            prepare::gc(k, &mut c);
            k.cache.procs.with_body(p.slot, |b| *b.cap_slot_mut(slot) = c);
            ip.complete(0);
            Ok(())
        }

        oc::PROCESS_GET_REGS | oc::PROCESS_GET_FLOAT_REGS => {
            ip.require_args(k, 0)?;

            let invokee = ip.invokee.unwrap_or(ip.invoker);
            let rbound = k.get_pw(invokee, IPW_RCVBOUND) as u32;
            let out_va = k.get_pw(invokee, IPW_RCVPTR);

            let bytes: Vec<u8> = k.cache.procs.with_body(p.slot, |b| {
                if ip.op_code == oc::PROCESS_GET_REGS {
                    let mut v = Vec::with_capacity(FIX_REGS_BYTES as usize);
                    for w in b.regs.pw.iter() {
                        v.extend_from_slice(&w.to_le_bytes());
                    }
                    v.extend_from_slice(&b.regs.pb_va.to_le_bytes());
                    v.extend_from_slice(&b.regs.pc.to_le_bytes());
                    v
                } else {
                    let mut v = Vec::with_capacity(FLOAT_REGS_BYTES as usize);
                    for w in b.regs.float_regs.iter() {
                        v.extend_from_slice(&w.to_le_bytes());
                    }
                    v
                }
            });

            let n_bytes = (bytes.len() as u32).min(rbound) as usize;
            let mut truncated = false;
            if n_bytes > 0 {
                match fault::write_user(tx, invokee, out_va, &bytes[..n_bytes])? {
                    Ok(()) => {}
                    Err(_) => truncated = true,
                }
            }

            tx.commit_point();

            let sent = if truncated { 0 } else { n_bytes };
            k.set_pw(invokee, OPW_SNDLEN, sent as u64);
            ip.complete(0);
            if truncated {
                ip.opw[0] |= ipw0::NB;
            }
            Ok(())
        }

        oc::PROCESS_SET_REGS | oc::PROCESS_SET_FLOAT_REGS => {
            let expect = if ip.op_code == oc::PROCESS_SET_REGS {
                FIX_REGS_BYTES
            } else {
                FLOAT_REGS_BYTES
            };
            ip.require_args_s(k, 0, expect)?;

            // Copy in before the commit point so a fault mid-transfer
            // cannot leave a half-written register set.
            let in_va = k.get_pw(ip.invoker, IPW_SNDPTR);
            let mut buf = vec![0u8; expect as usize];
            match fault::read_user(tx, ip.invoker, in_va, &mut buf)? {
                Ok(()) => {}
                Err(fc) => {
                    tx.commit_point();
                    ip.error_reply(fc.to_rc());
                    return Ok(());
                }
            }

            k.cache.hdr(p).set_dirty();

            tx.commit_point();

            k.cache.procs.with_body(p.slot, |b| {
                let mut words = buf.chunks_exact(8).map(|c| {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(c);
                    u64::from_le_bytes(a)
                });
                if ip.op_code == oc::PROCESS_SET_REGS {
                    for w in b.regs.pw.iter_mut() {
                        *w = words.next().unwrap_or(0);
                    }
                    b.regs.pb_va = words.next().unwrap_or(0);
                    b.regs.pc = words.next().unwrap_or(0);
                } else {
                    for w in b.regs.float_regs.iter_mut() {
                        *w = words.next().unwrap_or(0);
                    }
                }
            });
            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
