// SPDX-License-Identifier: MPL-2.0

//! Capability model invariants, driven through the public surface.

mod common;

use common::*;
use coyotos_kernel::{
    cap::{prepare, CapType, Capability},
    ipc::syscall::{oc, Ikt, Rc},
    obj::ObType,
    sched::Tx,
    types::CapLoc,
    DispatchOutcome,
};

#[test]
fn swizzle_round_trip_is_canonical() {
    let env = env();
    let pg = env.new_object(ObType::Page);
    let mut cap = env.cap_to(CapType::Page, pg);

    let tx = Tx::new(&env.k, 0, None);
    prepare::prepare(&tx, &mut cap).unwrap();
    assert!(cap.is_swizzled());
    let prepared = cap;

    prepare::deprepare(&env.k, &mut cap);
    assert!(!cap.is_swizzled());

    prepare::prepare(&tx, &mut cap).unwrap();
    assert_eq!(cap, prepared);
}

#[test]
fn deprepared_form_restores_the_oid() {
    let env = env();
    let pg = env.new_object(ObType::Page);
    let oid = env.oid_of(pg);
    let mut cap = env.cap_to(CapType::Page, pg);

    let tx = Tx::new(&env.k, 0, None);
    prepare::prepare(&tx, &mut cap).unwrap();
    prepare::deprepare(&env.k, &mut cap);

    assert_eq!(cap.target, coyotos_kernel::cap::Target::Oid(oid));
}

#[test]
fn alloc_count_mismatch_nulls_on_prepare() {
    let env = env();
    let pg = env.new_object(ObType::Page);
    let mut cap = env.cap_to(CapType::Page, pg);
    cap.alloc_count = cap.alloc_count.wrapping_add(1);

    let tx = Tx::new(&env.k, 0, None);
    prepare::prepare(&tx, &mut cap).unwrap();
    assert!(cap.is_null());
}

#[test]
fn minimal_ping_get_type_on_page_cap() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Page, pg));

    let out = env.invoke(p, &get_type(1));
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));
    assert_eq!(env.result_w1(p), Ikt::Page as u64);
}

#[test]
fn rescind_makes_outstanding_caps_stale() {
    let env = env();
    let p = env.spawn_process();
    let victim = env.new_object(ObType::CapPage);
    let victim_cap = env.cap_to(CapType::CapPage, victim);

    env.set_cap_reg(p, 1, Capability { ty: CapType::Range, ..Capability::null() });
    env.set_cap_reg(p, 2, victim_cap);
    // An independent copy that goes stale with the rescind.
    env.set_cap_reg(p, 3, victim_cap);

    let out = env.invoke(
        p,
        &Invocation::call(oc::RANGE_RESCIND, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    // Using the stale copy now yields NoAccess, and its in-memory form is
    // overwritten to Null.
    let out = env.invoke(p, &get_type(3));
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_exception(p, Rc::NoAccess));
    assert!(env.k.cap_reg(p, 3).is_null());
}

#[test]
fn unknown_opcode_is_refused() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Page, pg));

    let out = env.invoke(p, &Invocation::call(0xdead, CapLoc::Reg(1)));
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_exception(p, Rc::UnknownRequest));
}

#[test]
fn memory_reduce_weakens_through_the_output_cap() {
    let env = env();
    let p = env.spawn_process();
    let gpt = env.new_object(ObType::Gpt);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Gpt, gpt));

    let out = env.invoke(
        p,
        &Invocation::call(oc::MEMORY_REDUCE, CapLoc::Reg(1)).arg32(0x01 /* weak */),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    let reduced = env.k.cap_reg(p, 30);
    assert_eq!(reduced.ty, CapType::Gpt);
    assert!(reduced.restr.contains(coyotos_kernel::cap::Restr::WEAK));
    assert!(reduced.restr.contains(coyotos_kernel::cap::Restr::RO));
}

#[test]
fn guard_ops_round_trip() {
    let env = env();
    let p = env.spawn_process();
    let gpt = env.new_object(ObType::Gpt);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Gpt, gpt));

    let g = coyotos_kernel::types::Guard::new(0x42, 20);
    let out = env.invoke(
        p,
        &Invocation::call(oc::MEMORY_SET_GUARD, CapLoc::Reg(1)).arg32(g.raw()),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));
    let guarded = env.k.cap_reg(p, 30);
    assert_eq!(guarded.guard(), g);

    env.set_cap_reg(p, 1, guarded);
    let out = env.invoke(p, &Invocation::call(oc::MEMORY_GET_GUARD, CapLoc::Reg(1)));
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p) as u32, g.raw());
}

#[test]
fn cap_bits_exposes_store_form() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    let pg_cap = env.cap_to(CapType::Page, pg);

    env.set_cap_reg(p, 1, Capability { ty: CapType::CapBits, ..Capability::null() });
    env.set_cap_reg(p, 2, pg_cap);

    let out = env.invoke(
        p,
        &Invocation::call(oc::CAPBITS_GET, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    let blob = pg_cap.to_blob();
    assert_eq!(
        env.result_w1(p),
        (blob.w0 as u64) | ((blob.payload as u64) << 32)
    );
    assert_eq!(env.k.reg_pw(p, 2), blob.target);
}

#[test]
fn discrim_classifies_and_compares() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);

    env.set_cap_reg(p, 1, Capability { ty: CapType::Discrim, ..Capability::null() });
    env.set_cap_reg(p, 2, env.cap_to(CapType::Page, pg));
    env.set_cap_reg(p, 3, env.cap_to(CapType::Page, pg));

    let out = env.invoke(
        p,
        &Invocation::call(oc::DISCRIM_CLASSIFY, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(
        env.result_w1(p) as u32,
        coyotos_kernel::ipc::syscall::cap_class::MEMORY
    );

    let out = env.invoke(
        p,
        &Invocation::call(oc::DISCRIM_COMPARE, CapLoc::Reg(1))
            .cap_arg(CapLoc::Reg(2))
            .cap_arg(CapLoc::Reg(3)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p), 1);

    // A weak discrim stays a discreet judge of weakness.
    let out = env.invoke(
        p,
        &Invocation::call(oc::DISCRIM_IS_DISCREET, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p), 0);
}

#[test]
fn range_mints_fresh_caps_by_oid() {
    let env = env();
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    let oid = env.oid_of(pg);

    env.set_cap_reg(p, 1, Capability { ty: CapType::Range, ..Capability::null() });

    let out = env.invoke(
        p,
        &Invocation::call(oc::RANGE_GET_CAP, CapLoc::Reg(1))
            .arg64(oid)
            .arg32(coyotos_kernel::ipc::syscall::range_ob_type::PAGE),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(p));

    let minted = env.k.cap_reg(p, 30);
    assert_eq!(minted.ty, CapType::Page);
    assert_eq!(minted.prep_target(), Some(pg));
}

#[test]
fn cmdline_overrides_cache_sizing() {
    let env = env_with_cmdline("nproc=6 ngpt=24 depend=256");
    let p = env.spawn_process();
    let pg = env.new_object(ObType::Page);
    env.set_cap_reg(p, 1, env.cap_to(CapType::Page, pg));

    let out = env.invoke(p, &get_type(1));
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(env.result_w1(p), Ikt::Page as u64);
}

#[test]
fn aging_evicts_and_preparation_recovers() {
    let env = env();

    let first = env.new_object(ObType::Endpoint);
    let first_oid = env.oid_of(first);
    let mut cap = env.cap_to(CapType::Endpoint, first);
    {
        let tx = Tx::new(&env.k, 0, None);
        prepare::prepare(&tx, &mut cap).unwrap();
        assert!(cap.is_swizzled());
    }
    env.k.cpu(0).bump_lock_generation();

    // Flood the endpoint pool past its capacity; the oldest frame ages
    // through check into reclaim.
    for _ in 0..12 {
        env.new_object(ObType::Endpoint);
    }

    // The old preparation is stale, but the object is recoverable by OID:
    // preparing again brings it back in at the same generation.
    let tx = Tx::new(&env.k, 0, None);
    prepare::prepare(&tx, &mut cap).unwrap();
    assert!(!cap.is_null());
    assert_eq!(env.k.oid_of(cap.prep_target().unwrap()), first_oid);
}

#[test]
fn range_identify_reports_type_and_oid() {
    let env = env();
    let p = env.spawn_process();
    let gpt = env.new_object(ObType::Gpt);
    let oid = env.oid_of(gpt);

    env.set_cap_reg(p, 1, Capability { ty: CapType::Range, ..Capability::null() });
    env.set_cap_reg(p, 2, env.cap_to(CapType::Gpt, gpt));

    let out = env.invoke(
        p,
        &Invocation::call(oc::RANGE_IDENTIFY, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert_eq!(
        env.result_w1(p) as u32,
        coyotos_kernel::ipc::syscall::range_ob_type::GPT
    );
    assert_eq!(env.k.reg_pw(p, 2), oid);
}
