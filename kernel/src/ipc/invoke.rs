// SPDX-License-Identifier: MPL-2.0

//! The invocation engine: system-call entry, capability resolution,
//! endpoint rendezvous, and reply delivery.

use zerocopy::FromBytes;

use crate::{
    arch::{InvParameterBlock, OPW_EPID, OPW_PP, OPW_SNDLEN, PARAM_BLOCK_SIZE},
    cap::{prepare, CapType, Capability, Restr},
    ipc::{
        param::{CapSlotPtr, InvError, InvParam, SrcCap},
        syscall::{ipw0, Rc, COYOTOS_MAX_SNDLEN, SC_COPY_CAP, SC_INVOKE_CAP, SC_YIELD},
    },
    mm::fault,
    obj::{frames::RunState, ObRef},
    prelude::*,
    sched::{queue::QueueId, Abandon, Tx, Txr},
    types::{CapLoc, Word},
};

/// Where an invocation goes after the invoked capability is resolved.
enum InvTarget {
    /// A kernel-implemented capability (or a nulled-out one): dispatch to
    /// the per-type handler.
    Kernel,
    /// A ready process-to-process rendezvous.
    Rendezvous,
    /// The receiver is not ready and the invoker is unwilling to block.
    WouldBlock,
}

/// The system-call entry: decode the operation and run it as the current
/// transaction.
pub fn do_syscall(tx: &mut Tx<'_>) -> Txr<()> {
    let invoker = tx.current();
    let pw0 = tx.k.get_pw(invoker, 0);
    match ipw0::nr(pw0) {
        SC_INVOKE_CAP => invoke_cap(tx),
        SC_COPY_CAP => copy_cap(tx),
        SC_YIELD => do_yield(tx),
        nr => {
            debug!("unrecognized system call {} from {:?}", nr, invoker);
            tx.commit_point();
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------
// Parameter capture
// ----------------------------------------------------------------------

/// Snapshot the user-memory parameter block into the soft register save
/// area, validating its address by the act of reading it.
fn capture_soft_parameters(tx: &mut Tx<'_>, p: ObRef) -> Txr<()> {
    let pb_va = tx.k.cache.procs.with_body(p.slot, |b| b.regs.pb_va);
    let mut bytes = [0u8; PARAM_BLOCK_SIZE];
    match fault::read_user(tx, p, pb_va, &mut bytes)? {
        Ok(()) => {}
        Err(fc) => return Err(fault::take_memory_fault(tx, p, fc, pb_va)),
    }
    let pb = InvParameterBlock::read_from_bytes(&bytes[..]).expect("sized parameter block");
    tx.k.cache.procs.with_body(p.slot, |b| b.soft.capture(&pb));
    Ok(())
}

/// Read the capability named by a location in `p`'s frame of reference.
///
/// Register sources come back with a home slot so preparation effects can
/// be written through; memory sources are copies, weakened when the path
/// to them was weak.
fn resolve_src_loc(tx: &mut Tx<'_>, p: ObRef, loc: CapLoc) -> Txr<SrcCap> {
    match loc {
        CapLoc::Reg(n) => {
            let n = super::param::reg_index(n);
            let home = CapSlotPtr::Reg(p, n);
            Ok(SrcCap {
                home: Some(home),
                cap: tx.k.read_cap_slot(home),
            })
        }
        CapLoc::Mem(va) => match fault::find_cap_page_slot(tx, p, va, false)? {
            Ok((cp, slot, restr)) => {
                let mut cap = tx.k.read_cap_slot(CapSlotPtr::CapPage(cp, slot as u16));
                if restr.contains(Restr::WEAK) {
                    cap.weaken();
                }
                Ok(SrcCap { home: None, cap })
            }
            Err(fc) => Err(fault::take_memory_fault(tx, p, fc, va)),
        },
    }
}

/// Resolve a receive-capability destination in `p`'s frame of reference.
/// An unreachable or unwritable destination is dropped rather than
/// faulting the receiver on the sender's time.
fn resolve_dest_loc(tx: &mut Tx<'_>, p: ObRef, loc: CapLoc) -> Txr<Option<CapSlotPtr>> {
    match loc {
        CapLoc::Reg(n) => Ok(Some(CapSlotPtr::Reg(p, super::param::reg_index(n)))),
        CapLoc::Mem(va) => match fault::find_cap_page_slot(tx, p, va, true)? {
            Ok((cp, slot, _)) => {
                tx.k.cache.hdr(cp).set_dirty();
                Ok(Some(CapSlotPtr::CapPage(cp, slot as u16)))
            }
            Err(fc) => {
                debug!("dropping unreachable cap destination {:#x}: {:?}", va, fc);
                Ok(None)
            }
        },
    }
}

/// Resolve the invokee's receive-capability destinations, honoring its AC
/// and last-receive-cap settings.
fn resolve_dests(tx: &mut Tx<'_>, ip: &mut InvParam) -> Txr<()> {
    let Some(r) = ip.invokee else { return Ok(()) };
    let ricw = tx.k.get_pw(r, 0);
    if ricw & ipw0::AC == 0 {
        return Ok(());
    }
    let lrc = ipw0::lrc(ricw);
    for j in 0..=lrc {
        let raw = tx.k.cache.procs.with_body(r.slot, |b| b.soft.rcv_cap[j]);
        ip.dest[j] = resolve_dest_loc(tx, r, CapLoc::from_raw(raw))?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// InvokeCap
// ----------------------------------------------------------------------

fn invoke_cap(tx: &mut Tx<'_>) -> Txr<()> {
    let invoker = tx.current();
    let icw = tx.k.get_pw(invoker, 0);

    capture_soft_parameters(tx, invoker)?;

    let mut ip = InvParam::new(invoker, icw);
    ip.snd_len = tx.k.cache.procs.with_body(invoker.slot, |b| b.soft.snd_len);

    if icw & ipw0::SP == 0 {
        // No send phase: a pure receive, or a no-op.
        tx.commit_point();
        if icw & ipw0::RP != 0 {
            return enter_receiving(tx, invoker);
        }
        return Ok(());
    }

    // Resolve the invoked capability and the sent capabilities.
    let inv_loc = tx.k.cache.procs.with_body(invoker.slot, |b| b.soft.invoke_cap);
    ip.icap = resolve_src_loc(tx, invoker, CapLoc::from_raw(inv_loc))?;
    ip.op_code = tx.k.get_pw(invoker, 1);

    if icw & ipw0::SC != 0 {
        let lsc = ipw0::lsc(icw);
        for j in 0..=lsc {
            let raw = tx.k.cache.procs.with_body(invoker.slot, |b| b.soft.snd_cap[j]);
            ip.src[j] = resolve_src_loc(tx, invoker, CapLoc::from_raw(raw))?;
        }
    }

    let willing = icw & ipw0::NB == 0;
    let self_ok = icw & ipw0::RP != 0;

    match prepare_for_invocation(tx, &mut ip, willing, self_ok)? {
        InvTarget::Rendezvous => {
            do_ipc_send(tx, &mut ip)?;
            if ip.invokee == Some(invoker) {
                // A self-directed call: the results are already latched.
                return Ok(());
            }
            if icw & ipw0::RP != 0 {
                return enter_receiving(tx, invoker);
            }
            Ok(())
        }
        InvTarget::WouldBlock => {
            if icw & ipw0::RP != 0 {
                ip.invokee = Some(invoker);
                resolve_dests(tx, &mut ip)?;
            }
            tx.commit_point();
            ip.error_reply(Rc::RequestWouldBlock);
            deliver_result(tx, &mut ip);
            Ok(())
        }
        InvTarget::Kernel => {
            if icw & ipw0::RP != 0 {
                ip.invokee = Some(invoker);
                resolve_dests(tx, &mut ip)?;
            }
            let handler = crate::caps::handler_for(ip.icap.cap.ty);
            match handler(tx, &mut ip) {
                Ok(()) => {}
                Err(InvError::Ex(rc)) => {
                    tx.commit_point();
                    ip.error_reply(rc);
                }
                Err(InvError::Yield(a)) => return Err(a),
            }
            tx.commit_point();
            deliver_result(tx, &mut ip);
            Ok(())
        }
    }
}

/// Transition the current process into receiving state and give up the
/// CPU. Senders blocked on us get another chance.
fn enter_receiving(tx: &mut Tx<'_>, p: ObRef) -> Txr<()> {
    tx.k.cache.procs.with_body(p.slot, |b| {
        b.state.run_state = RunState::Receiving;
        b.pending_syscall = false;
    });
    tx.k.wake_all(QueueId::RcvWait(p.slot));
    Err(Abandon::Park)
}

/// Resolve the invoked capability for invocation.
///
/// For Entry capabilities this verifies the protected payload, prepares
/// the endpoint's recipient, and checks receiver readiness, either parking
/// the invoker (blocking) or reporting would-block. Everything else is a
/// kernel capability.
fn prepare_for_invocation(
    tx: &mut Tx<'_>,
    ip: &mut InvParam,
    willing: bool,
    self_ok: bool,
) -> Txr<InvTarget> {
    let k = tx.k;

    let mut cap = ip.icap.cap;
    let res = prepare::prep_and_lock(tx, &mut cap);
    ip.icap.cap = cap;
    if let Some(home) = ip.icap.home {
        k.write_cap_slot(home, &cap);
    }
    let Some((frame, hi)) = res? else {
        return Ok(InvTarget::Kernel);
    };

    if cap.ty != CapType::Entry {
        return Ok(InvTarget::Kernel);
    }

    let ep = frame;
    let (pm, pp, ep_id) =
        k.cache.endpoints.with_body(ep.slot, |b| (b.pm, b.prot_payload, b.endpoint_id));

    if pm && pp != cap.payload {
        // Protected payload failed to match: the capability is dead.
        // Back out carefully, releasing the lock on the target.
        k.release_header_lock(hi);
        ip.icap.cap.init();
        if let Some(home) = ip.icap.home {
            k.write_cap_slot(home, &ip.icap.cap);
        }
        return Ok(InvTarget::Kernel);
    }

    // Prepare the recipient process capability in place.
    let mut pcap = k.read_cap_slot(CapSlotPtr::EndptRecipient(ep));
    prepare::prepare(tx, &mut pcap)?;
    k.write_cap_slot(CapSlotPtr::EndptRecipient(ep), &pcap);

    debug_assert!(matches!(pcap.ty, CapType::Null | CapType::Process));

    // The endpoint may hold a Null recipient if the target process was
    // destroyed. Wait for fixup, if we are willing.
    if pcap.ty != CapType::Process {
        if willing {
            let oid = k.cache.hdr(ep).meta().oid;
            let qid = k.ob_stall_queue(oid);
            k.enqueue_current_on(tx, qid);
            return Err(Abandon::Park);
        }
        return Ok(InvTarget::WouldBlock);
    }

    let p = pcap.prep_target().expect("prepared process capability");
    let receiving =
        k.cache.procs.with_body(p.slot, |b| b.state.run_state == RunState::Receiving);

    if !((self_ok && p == ip.invoker) || receiving) {
        if willing {
            k.enqueue_current_on(tx, QueueId::RcvWait(p.slot));
            return Err(Abandon::Park);
        }
        return Ok(InvTarget::WouldBlock);
    }

    // A receiver in a closed wait only accepts its chosen endpoint ID.
    if p != ip.invoker {
        let picw = k.get_pw(p, 0);
        let p_ep_id = k.cache.procs.with_body(p.slot, |b| b.soft.ep_id);
        if picw & ipw0::CW != 0 && p_ep_id != ep_id {
            // Policy: the capability has not been successfully invoked,
            // so the protected payload is not bumped.
            if willing {
                k.enqueue_current_on(tx, QueueId::RcvWait(p.slot));
                return Err(Abandon::Park);
            }
            return Ok(InvTarget::WouldBlock);
        }
    }

    ip.invokee = Some(p);
    ip.invokee_ep = Some(ep);
    Ok(InvTarget::Rendezvous)
}

// ----------------------------------------------------------------------
// The rendezvous
// ----------------------------------------------------------------------

/// Consummate a ready process-to-process send: transfer data words,
/// capabilities, and the byte string; deliver the protected payload and
/// endpoint ID; resume the receiver.
fn do_ipc_send(tx: &mut Tx<'_>, ip: &mut InvParam) -> Txr<()> {
    let s = ip.invoker;
    let r = ip.invokee.expect("rendezvous without invokee");
    let ep = ip.invokee_ep.expect("rendezvous without endpoint");
    let icw = ip.ipw0;
    let k = tx.k;

    resolve_dests(tx, ip)?;

    // Mint the reply capability, if requested: an Entry capability to the
    // endpoint the sender designated in sent-cap slot 0.
    let mut reply_cap: Option<Capability> = None;
    if icw & ipw0::RC != 0 {
        let mut c = ip.src[0].cap;
        prepare::prepare(tx, &mut c)?;
        ip.src[0].cap = c;
        reply_cap = Some(if c.ty == CapType::Endpoint {
            let frame = c.prep_target().expect("prepared endpoint capability");
            let pp = k.cache.endpoints.with_body(frame.slot, |b| b.prot_payload);
            let mut e = c;
            e.ty = CapType::Entry;
            e.payload = pp;
            e.restr = Restr::empty();
            e
        } else {
            Capability::null()
        });
    }

    // The byte string, bounded by the receiver.
    let rcv_bound = k.cache.procs.with_body(r.slot, |b| b.soft.rcv_bound);
    let snd_len = ip.snd_len.min(rcv_bound).min(COYOTOS_MAX_SNDLEN);
    let mut string = vec![0u8; snd_len as usize];
    let mut actual_len = snd_len;
    if snd_len > 0 {
        let snd_ptr = k.cache.procs.with_body(s.slot, |b| b.soft.snd_ptr);
        match fault::read_user(tx, s, snd_ptr, &mut string)? {
            Ok(()) => {}
            Err(fc) => return Err(fault::take_memory_fault(tx, s, fc, snd_ptr)),
        }
        // Land it in the receiver before the commit point: the receiver is
        // locked in receiving state, so nothing observes a partial write,
        // and an abandoned transaction simply redoes it.
        let rcv_ptr = k.cache.procs.with_body(r.slot, |b| b.soft.rcv_ptr);
        match fault::write_user(tx, r, rcv_ptr, &string)? {
            Ok(()) => {}
            Err(_) => actual_len = 0,
        }
    }

    tx.commit_point();

    // Data words.
    let ldw = ipw0::ldw(icw);
    for i in 1..=ldw {
        let v = k.get_pw(s, i);
        k.set_pw(r, i, v);
    }

    // Capabilities.
    let mut ncaps = 0usize;
    if icw & ipw0::SC != 0 {
        ncaps = ipw0::lsc(icw) + 1;
    }
    if reply_cap.is_some() {
        ncaps = ncaps.max(1);
    }
    for j in 0..ncaps {
        let cap = if j == 0 {
            reply_cap.unwrap_or(ip.src[0].cap)
        } else {
            ip.src[j].cap
        };
        if let Some(d) = ip.dest[j] {
            k.write_cap_slot(d, &cap);
        }
    }

    // Soft outputs: protected payload, endpoint ID, transferred length.
    let ep_id = k.cache.endpoints.with_body(ep.slot, |b| b.endpoint_id);
    k.set_pw(r, OPW_PP, ip.icap.cap.payload as Word);
    k.set_pw(r, OPW_EPID, ep_id);
    k.set_pw(r, OPW_SNDLEN, actual_len as Word);

    // Receiver's result control word: transfer shape plus its own
    // preserved receive-side bits. A truncated string shows up as NB.
    let ricw = k.get_pw(r, 0);
    let mut ropw0 = ipw0::make_ldw(ldw) | (ricw & ipw0::PRESERVE & !ipw0::EX);
    if ncaps > 0 {
        ropw0 |= ipw0::SC | ipw0::make_lsc(ncaps - 1);
    }
    if actual_len != snd_len {
        ropw0 |= ipw0::NB;
    }
    k.set_pw(r, 0, ropw0);

    // A payload-matched endpoint is consumed by a successful receive: the
    // protected payload advances, retiring outstanding entry capabilities
    // minted against the old value.
    let pm = k.cache.endpoints.with_body(ep.slot, |b| b.pm);
    if pm {
        k.cache.hdr(ep).set_dirty();
        k.cache.endpoints.with_body(ep.slot, |b| b.prot_payload = b.prot_payload.wrapping_add(1));
    }

    copy_out_soft(tx, r);

    if r == s {
        k.cache.procs.with_body(r.slot, |b| {
            b.state.run_state = RunState::Running;
            b.pending_syscall = false;
        });
    } else {
        k.resume_process(r);
    }
    Ok(())
}

/// Copy received soft parameters back into the receiver's user parameter
/// block, when it asked for that with CO.
fn copy_out_soft(tx: &mut Tx<'_>, r: ObRef) {
    let k = tx.k;
    let ricw = k.get_pw(r, 0);
    if ricw & ipw0::CO == 0 {
        return;
    }
    let (pb_va, mut pb) = k.cache.procs.with_body(r.slot, |b| {
        let mut pb = InvParameterBlock::default();
        b.soft.copy_out(&mut pb);
        (b.regs.pb_va, pb)
    });
    pb.pw[0] = ricw;
    let bytes = zerocopy::IntoBytes::as_bytes(&pb);
    match fault::write_user(tx, r, pb_va, bytes) {
        Ok(Ok(())) => {}
        Ok(Err(fc)) => debug!("soft copy-out to {:?} faulted: {:?}", r, fc),
        Err(_) => debug!("soft copy-out to {:?} abandoned", r),
    }
}

/// Deliver a kernel handler's outputs to the invokee.
fn deliver_result(tx: &mut Tx<'_>, ip: &mut InvParam) {
    let Some(r) = ip.invokee else { return };
    let k = tx.k;

    let ldw = ipw0::ldw(ip.opw[0]);
    for i in 0..=ldw {
        k.set_pw(r, i, ip.opw[i]);
    }

    if ip.out_caps > 0 {
        let ricw = ip.ipw0;
        if ricw & ipw0::AC != 0 {
            let lrc = ipw0::lrc(ricw);
            for j in 0..ip.out_caps.min(lrc + 1) {
                if let Some(d) = ip.dest[j] {
                    k.write_cap_slot(d, &ip.src[j].cap);
                }
            }
        }
    }

    let receiving =
        k.cache.procs.with_body(r.slot, |b| b.state.run_state == RunState::Receiving);
    if receiving {
        k.resume_process(r);
    }
}

// ----------------------------------------------------------------------
// CopyCap and Yield
// ----------------------------------------------------------------------

fn copy_cap(tx: &mut Tx<'_>) -> Txr<()> {
    let p = tx.current();
    let src_loc = CapLoc::from_raw(tx.k.get_pw(p, 1));
    let dest_loc = CapLoc::from_raw(tx.k.get_pw(p, 2));

    let src = resolve_src_loc(tx, p, src_loc)?;

    let dest = match dest_loc {
        CapLoc::Reg(n) => CapSlotPtr::Reg(p, super::param::reg_index(n)),
        CapLoc::Mem(va) => match fault::find_cap_page_slot(tx, p, va, true)? {
            Ok((cp, slot, _)) => {
                tx.k.cache.hdr(cp).set_dirty();
                CapSlotPtr::CapPage(cp, slot as u16)
            }
            Err(fc) => return Err(fault::take_memory_fault(tx, p, fc, va)),
        },
    };

    tx.commit_point();
    tx.k.write_cap_slot(dest, &src.cap);
    Ok(())
}

fn do_yield(tx: &mut Tx<'_>) -> Txr<()> {
    let p = tx.current();
    tx.commit_point();
    tx.k.cache.procs.with_body(p.slot, |b| b.pending_syscall = false);
    tx.k.ready_add(p, false);
    Err(Abandon::Park)
}
