// SPDX-License-Identifier: MPL-2.0

//! Invocation-engine scenarios: kernel capabilities, endpoint rendezvous,
//! blocking behavior, sleep, and interrupt waits.

mod common;

use common::*;
use coyotos_kernel::{
    cap::{CapType, Capability},
    ipc::syscall::{ipw0, oc, Ikt, Rc, SC_COPY_CAP},
    obj::{ObRef, ObType},
    types::{CapLoc, Interval, Word},
    DispatchOutcome,
};

/// A receive-only invocation, optionally in closed wait.
fn receive_only(closed_ep_id: Option<u64>) -> Invocation {
    let mut inv = Invocation::call(0, CapLoc::Reg(0));
    inv.send_phase = false;
    inv.last_data_word = 0;
    if let Some(ep_id) = closed_ep_id {
        inv.closed_wait = true;
        inv.ep_id = ep_id;
    }
    inv
}

/// An endpoint whose recipient is `b`, with the given ID.
fn endpoint_to(env: &TestEnv, b: ObRef, ep_id: u64) -> ObRef {
    let ep = env.new_object(ObType::Endpoint);
    let rcap = env.cap_to(CapType::Process, b);
    env.k.with_endpoint(ep, |e| {
        e.endpoint_id = ep_id;
        e.recipient = rcap;
    });
    ep
}

fn entry_cap_to(env: &TestEnv, ep: ObRef, payload: u32) -> Capability {
    let mut c = env.cap_to(CapType::Endpoint, ep);
    c.ty = CapType::Entry;
    c.payload = payload;
    c
}

#[test]
fn rendezvous_with_open_waiting_receiver() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 77);
    env.k.with_endpoint(ep, |e| {
        e.pm = true;
        e.prot_payload = 42;
    });

    // B parks in open wait.
    assert_eq!(env.invoke(b, &receive_only(None)), DispatchOutcome::Parked);

    // A sends payload-matched data through the entry capability.
    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 42));
    let mut inv = Invocation::call(0x9999, CapLoc::Reg(1)).arg32(0xfeed);
    inv.receive_phase = false;
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);

    // B is runnable again and observes the message: the sent words, the
    // capability payload, and the endpoint ID.
    env.k.run_until_idle(0);
    assert!(env.result_is_ok(b));
    assert_eq!(env.result_w1(b), 0x9999);
    assert_eq!(env.k.reg_pw(b, 2), 0xfeed);
    let (pp, ep_id) = env.k.with_process(b, |p| (p.soft.pp, p.soft.ep_id));
    assert_eq!(pp, 42);
    assert_eq!(ep_id, 77);

    // The payload-matched endpoint was consumed: its protected payload
    // advanced, so the old entry capability is dead.
    let pp_now = env.k.with_endpoint(ep, |e| e.prot_payload);
    assert_eq!(pp_now, 43);
}

#[test]
fn stale_payload_entry_cap_is_refused() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 1);
    env.k.with_endpoint(ep, |e| {
        e.pm = true;
        e.prot_payload = 7;
    });

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 6));
    let out = env.invoke(a, &Invocation::call(1, CapLoc::Reg(1)));
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_exception(a, Rc::NoAccess));
    assert!(env.k.cap_reg(a, 1).is_null());
}

#[test]
fn sender_blocks_until_receiver_ready() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);

    // B is running, not receiving: a blocking send parks A.
    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    let mut inv = Invocation::call(0x11, CapLoc::Reg(1));
    inv.receive_phase = false;
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Parked);

    // When B enters receiving state, A gets another shot and delivers.
    assert_eq!(env.invoke(b, &receive_only(None)), DispatchOutcome::Parked);
    env.k.run_until_idle(0);

    assert!(env.result_is_ok(b));
    assert_eq!(env.result_w1(b), 0x11);
}

#[test]
fn non_blocking_send_reports_would_block() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    let inv = Invocation::call(0x11, CapLoc::Reg(1)).non_blocking();
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);
    assert!(env.result_is_exception(a, Rc::RequestWouldBlock));
}

#[test]
fn closed_wait_rejects_other_endpoints() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);

    // B commits to endpoint ID 99; the send targets ID 5.
    assert_eq!(env.invoke(b, &receive_only(Some(99))), DispatchOutcome::Parked);

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    let inv = Invocation::call(0x22, CapLoc::Reg(1)).non_blocking();
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);
    assert!(env.result_is_exception(a, Rc::RequestWouldBlock));

    // B never received anything.
    let receiving = env.k.with_process(b, |p| {
        p.state.run_state == coyotos_kernel::obj::frames::RunState::Receiving
    });
    assert!(receiving);
}

#[test]
fn string_transfer_lands_in_receiver_memory() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);

    let msg = b"capability machines say hello";
    let a_data = env.page_at(a, DATA_VA);
    env.k.write_page(a_data, 0, msg);

    let mut rcv = receive_only(None);
    rcv = rcv.with_rcv_buffer(DATA_VA, 4096);
    assert_eq!(env.invoke(b, &rcv), DispatchOutcome::Parked);

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    let mut inv = Invocation::call(0x33, CapLoc::Reg(1)).with_string(DATA_VA, msg.len() as u32);
    inv.receive_phase = false;
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);
    env.k.run_until_idle(0);

    let b_data = env.page_at(b, DATA_VA);
    let mut got = vec![0u8; msg.len()];
    env.k.read_page(b_data, 0, &mut got);
    assert_eq!(&got, msg);

    // The receiver learned the transferred length.
    assert_eq!(
        env.k.with_process(b, |p| p.soft.snd_len),
        msg.len() as u32
    );
}

#[test]
fn cap_transfer_through_rendezvous() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);
    let pg = env.new_object(ObType::Page);

    assert_eq!(env.invoke(b, &receive_only(None)), DispatchOutcome::Parked);

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    env.set_cap_reg(a, 2, env.cap_to(CapType::Page, pg));
    let mut inv = Invocation::call(0x44, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2));
    inv.receive_phase = false;
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);
    env.k.run_until_idle(0);

    // Receiver's receive-cap slot 1 holds the page capability.
    let got = env.k.cap_reg(b, 29);
    assert_eq!(got.ty, CapType::Page);

    let icw = env.result_icw(b);
    assert!(icw & ipw0::SC != 0);
    assert_eq!(ipw0::lsc(icw), 1);
}

#[test]
fn reply_cap_is_minted_and_works() {
    let env = env();
    let a = env.spawn_process();
    let b = env.spawn_process();
    let ep = endpoint_to(&env, b, 5);
    // A's reply endpoint: recipient A, payload-matched for one-shot use.
    let reply_ep = endpoint_to(&env, a, 1234);
    env.k.with_endpoint(reply_ep, |e| {
        e.pm = true;
        e.prot_payload = 9;
    });

    assert_eq!(env.invoke(b, &receive_only(None)), DispatchOutcome::Parked);

    // A calls: send to B, then wait for the reply in closed wait.
    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    env.set_cap_reg(a, 2, env.cap_to(CapType::Endpoint, reply_ep));
    let inv = Invocation::call(0x55, CapLoc::Reg(1))
        .with_reply_cap(CapLoc::Reg(2))
        .closed_wait(1234);
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Parked);

    // B woke with a reply capability in its receive slot 0.
    env.k.run_until_idle(0);
    let reply = env.k.cap_reg(b, 30);
    assert_eq!(reply.ty, CapType::Entry);
    assert_eq!(reply.payload, 9);

    // B replies through it; A wakes from its closed wait.
    env.set_cap_reg(b, 1, reply);
    let mut binv = Invocation::call(0xa5a5, CapLoc::Reg(1));
    binv.receive_phase = false;
    assert_eq!(env.invoke(b, &binv), DispatchOutcome::Completed);

    env.k.run_until_idle(0);
    assert!(env.result_is_ok(a));
    assert_eq!(env.result_w1(a), 0xa5a5);
    assert_eq!(env.k.with_process(a, |p| p.soft.ep_id), 1234);
}

#[test]
fn self_call_delivers_immediately() {
    let env = env();
    let a = env.spawn_process();
    let ep = endpoint_to(&env, a, 3);

    env.set_cap_reg(a, 1, entry_cap_to(&env, ep, 0));
    let inv = Invocation::call(0x77, CapLoc::Reg(1)).arg32(5);
    assert_eq!(env.invoke(a, &inv), DispatchOutcome::Completed);

    assert!(env.result_is_ok(a));
    assert_eq!(env.result_w1(a), 0x77);
    assert_eq!(env.k.with_process(a, |p| p.soft.ep_id), 3);
}

// ----------------------------------------------------------------------
// Sleep
// ----------------------------------------------------------------------

#[test]
fn sleep_for_rewrites_and_parks_until_the_tick() {
    let env = env();
    let p = env.spawn_process();
    env.k.timer_tick(Interval::new(10, 0));
    env.set_cap_reg(p, 1, Capability { ty: CapType::Sleep, ..Capability::null() });

    let inv = Invocation::call(oc::SLEEP_FOR, CapLoc::Reg(1)).arg32(0).arg32(500_000);
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Parked);

    // The latched invocation became an absolute-time sleep.
    assert_eq!(env.k.reg_pw(p, 1), oc::SLEEP_TILL);
    assert_eq!(env.k.reg_pw(p, 2), 10);
    assert_eq!(env.k.reg_pw(p, 3), 500_000);

    // A tick short of the target re-parks the herd.
    env.k.timer_tick(Interval::new(10, 400_000));
    env.k.run_until_idle(0);
    let on_q = env.k.with_process(p, |b| b.on_q);
    assert!(on_q.is_some());

    // Crossing the target completes the sleep.
    env.k.timer_tick(Interval::new(10, 600_000));
    env.k.run_until_idle(0);
    assert!(env.result_is_ok(p));
}

#[test]
fn bad_usec_is_a_request_error() {
    let env = env();
    let p = env.spawn_process();
    env.set_cap_reg(p, 1, Capability { ty: CapType::Sleep, ..Capability::null() });

    let inv = Invocation::call(oc::SLEEP_TILL, CapLoc::Reg(1)).arg32(0).arg32(2_000_000);
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Completed);
    assert!(env.result_is_exception(p, Rc::RequestError));
}

// ----------------------------------------------------------------------
// Interrupt waits
// ----------------------------------------------------------------------

#[test]
fn irq_wait_unmasks_parks_and_wakes() {
    let env = env();
    let p = env.spawn_process();
    env.set_cap_reg(
        p,
        1,
        Capability {
            ty: CapType::IrqWait,
            payload: 5,
            ..Capability::null()
        },
    );

    let inv = Invocation::call(oc::IRQ_WAIT, CapLoc::Reg(1));
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Parked);
    assert_eq!(*env.machine.unmasked.lock().unwrap(), vec![5]);

    env.k.deliver_irq(5);
    env.k.run_until_idle(0);
    assert!(env.result_is_ok(p));
    assert_eq!(*env.machine.acked.lock().unwrap(), vec![5]);
}

#[test]
fn pending_irq_completes_without_blocking() {
    let env = env();
    let p = env.spawn_process();
    env.k.deliver_irq(9);
    env.set_cap_reg(
        p,
        1,
        Capability {
            ty: CapType::IrqWait,
            payload: 9,
            ..Capability::null()
        },
    );

    let inv = Invocation::call(oc::IRQ_WAIT, CapLoc::Reg(1));
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));
}

// ----------------------------------------------------------------------
// Console, power, and copy
// ----------------------------------------------------------------------

#[test]
fn kern_log_emits_bounded_strings() {
    let env = env();
    let p = env.spawn_process();
    let data = env.page_at(p, DATA_VA);
    env.k.write_page(data, 0, b"hello, nucleus");

    env.set_cap_reg(p, 1, Capability { ty: CapType::KernLog, ..Capability::null() });
    let inv = Invocation::call(oc::KERNLOG_LOG, CapLoc::Reg(1))
        .arg32(14)
        .with_string(DATA_VA, 14);
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));
    assert_eq!(env.machine.console_string(), "hello, nucleus\n");
}

#[test]
fn sys_ctl_reaches_the_machine() {
    let env = env();
    let p = env.spawn_process();
    env.set_cap_reg(p, 1, Capability { ty: CapType::SysCtl, ..Capability::null() });

    let inv = Invocation::call(oc::SYSCTL_REBOOT, CapLoc::Reg(1));
    assert_eq!(env.invoke(p, &inv), DispatchOutcome::Completed);
    assert_eq!(*env.machine.power_events.lock().unwrap(), vec!["reboot"]);
}

#[test]
fn copy_cap_moves_between_registers_and_memory() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Page, pg));

    // Register to capability-page memory.
    let dest_va = CAP_PAGE_VA + 3 * 16;
    let pw = [
        SC_COPY_CAP,
        CapLoc::Reg(1).to_raw(),
        CapLoc::Mem(dest_va).to_raw(),
        0 as Word,
    ];
    env.k.post_syscall(p, pw, PB_VA);
    assert_eq!(env.k.run_process(0, p), DispatchOutcome::Completed);

    let cp = env.cap_page_of(p);
    let stored = env.k.with_cap_page(cp, |b| b.caps[3]);
    assert_eq!(stored.ty, CapType::Page);

    // And back into a register.
    let pw = [
        SC_COPY_CAP,
        CapLoc::Mem(dest_va).to_raw(),
        CapLoc::Reg(7).to_raw(),
        0 as Word,
    ];
    env.k.post_syscall(p, pw, PB_VA);
    assert_eq!(env.k.run_process(0, p), DispatchOutcome::Completed);
    assert_eq!(env.k.cap_reg(p, 7).ty, CapType::Page);
}

#[test]
fn mem_sourced_caps_through_weak_paths_are_weakened() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);

    // Put a full-strength page capability in the cap page, then weaken
    // the path to the cap page itself.
    let cp = env.cap_page_of(p);
    let full = env.cap_to(CapType::Page, pg);
    env.k.with_cap_page(cp, |b| b.caps[0] = full);
    let root = env.seeded_root(p);
    env.k.with_gpt(root, |g| {
        g.caps[1].restr |= coyotos_kernel::cap::Restr::WEAK | coyotos_kernel::cap::Restr::RO;
    });

    // Copying through the weak path demotes the fetched capability.
    let pw = [
        SC_COPY_CAP,
        CapLoc::Mem(CAP_PAGE_VA).to_raw(),
        CapLoc::Reg(7).to_raw(),
        0 as Word,
    ];
    env.k.post_syscall(p, pw, PB_VA);
    assert_eq!(env.k.run_process(0, p), DispatchOutcome::Completed);

    let fetched = env.k.cap_reg(p, 7);
    assert_eq!(fetched.ty, CapType::Page);
    assert!(fetched.restr.contains(coyotos_kernel::cap::Restr::RO));
}

// ----------------------------------------------------------------------
// Process and endpoint surgery
// ----------------------------------------------------------------------

#[test]
fn process_cap_registers_read_and_write() {
    let env = env();
    let p = env.spawn_process();
    let target = env.spawn_process();
    let pg = env.new_object(ObType::Page);

    env.set_cap_reg(p, 1, env.cap_to(CapType::Process, target));
    env.set_cap_reg(p, 2, env.cap_to(CapType::Page, pg));

    let out = env.invoke(
        p,
        &Invocation::call(oc::PROCESS_SET_CAP_REG, CapLoc::Reg(1))
            .arg32(9)
            .cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));
    assert_eq!(env.k.cap_reg(target, 9).ty, CapType::Page);

    let out = env.invoke(
        p,
        &Invocation::call(oc::PROCESS_GET_CAP_REG, CapLoc::Reg(1)).arg32(9),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.k.cap_reg(p, 30).ty, CapType::Page);
}

#[test]
fn restart_restricted_process_cap_only_gets_type() {
    let env = env();
    let p = env.spawn_process();
    let target = env.spawn_process();

    let mut c = env.cap_to(CapType::Process, target);
    c.restr |= coyotos_kernel::cap::Restr::RESTART;
    env.set_cap_reg(p, 1, c);

    let out = env.invoke(p, &get_type(1));
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p), Ikt::Process as u64);

    let out = env.invoke(
        p,
        &Invocation::call(oc::PROCESS_GET_STATE, CapLoc::Reg(1)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_exception(p, Rc::NoAccess));
}

#[test]
fn endpoint_configuration_ops() {
    let env = env();
    let p = env.spawn_process();
    let b = env.spawn_process();
    let ep = env.new_object(ObType::Endpoint);

    env.set_cap_reg(p, 1, env.cap_to(CapType::Endpoint, ep));
    env.set_cap_reg(p, 2, env.cap_to(CapType::Process, b));

    let out = env.invoke(
        p,
        &Invocation::call(oc::ENDPOINT_SET_RECIPIENT, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    let out = env.invoke(
        p,
        &Invocation::call(oc::ENDPOINT_SET_EPID, CapLoc::Reg(1)).arg64(4242),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    let out = env.invoke(p, &Invocation::call(oc::ENDPOINT_GET_EPID, CapLoc::Reg(1)));
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p), 4242);

    // Mint an entry capability with a chosen payload.
    let out = env.invoke(
        p,
        &Invocation::call(oc::ENDPOINT_MAKE_ENTRY_CAP, CapLoc::Reg(1)).arg32(0x5150),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    let entry = env.k.cap_reg(p, 30);
    assert_eq!(entry.ty, CapType::Entry);
    assert_eq!(entry.payload, 0x5150);
}

#[test]
fn yield_requeues_the_caller() {
    let env = env();
    let p = env.spawn_process();
    let pw = [coyotos_kernel::ipc::syscall::SC_YIELD, 0, 0, 0];
    env.k.post_syscall(p, pw, PB_VA);
    assert_eq!(env.k.run_process(0, p), DispatchOutcome::Parked);

    // The process went to the back of the ready queue, runnable.
    let on_q = env.k.with_process(p, |b| b.on_q);
    assert_eq!(on_q, Some(coyotos_kernel::sched::queue::QueueId::Ready));
    env.k.run_until_idle(0);
}
