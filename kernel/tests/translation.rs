// SPDX-License-Identifier: MPL-2.0

//! Translation-cache behavior: PTE production, depend recording, and
//! targeted shootdown.

mod common;

use common::*;
use coyotos_kernel::{
    cap::{CapType, Capability},
    ipc::syscall::oc,
    mm::fault::do_page_fault,
    obj::{ObRef, ObType},
    sched::Tx,
    types::{CapLoc, Guard},
    DispatchOutcome,
};

/// A process whose address space is the three-level scenario space.
fn deep_space_process(env: &TestEnv) -> (ObRef, [ObRef; 3], ObRef) {
    let p = env.spawn_process();

    let g1 = env.new_object(ObType::Gpt);
    let g2 = env.new_object(ObType::Gpt);
    let g3 = env.new_object(ObType::Gpt);
    let pg = env.new_object(ObType::Page);

    env.k.with_gpt(g1, |g| g.l2v = 30);
    env.k.with_gpt(g2, |g| g.l2v = 20);
    env.k.with_gpt(g3, |g| g.l2v = 12);

    let mut to_g2 = env.cap_to(CapType::Gpt, g2);
    to_g2.set_guard(Guard::new(0, 30));
    env.k.with_gpt(g1, |g| g.caps[1] = to_g2);

    let mut to_g3 = env.cap_to(CapType::Gpt, g3);
    to_g3.set_guard(Guard::new(0, 20));
    env.k.with_gpt(g2, |g| g.caps[2] = to_g3);

    let mut to_pg = env.cap_to(CapType::Page, pg);
    to_pg.set_guard(Guard::new(0, 12));
    env.k.with_gpt(g3, |g| g.caps[1] = to_pg);

    let mut root = env.cap_to(CapType::Gpt, g1);
    root.set_guard(Guard::new(0, 34));
    env.k.with_process(p, |b| b.state.addr_space = root);

    (p, [g1, g2, g3], pg)
}

const ADDR: u64 = 0x4020_1000;

#[test]
fn data_fault_publishes_a_translation() {
    let env = env();
    let (p, _gpts, pg) = deep_space_process(&env);

    let mut tx = Tx::new(&env.k, 0, Some(p));
    let got = do_page_fault(&mut tx, p, ADDR, false).unwrap().unwrap();
    assert_eq!(got, pg);

    // The leaf page is now reachable from hardware state.
    assert!(env.k.page_is_mapped(pg));
    // And the process acquired a top-level mapping.
    let top = env.k.with_process(p, |b| b.mapping_tab);
    assert!(top.is_some());
}

#[test]
fn overwriting_a_traversed_slot_invalidates_the_pte() {
    let env = env();
    let (victim, gpts, _pg) = deep_space_process(&env);

    let mut tx = Tx::new(&env.k, 0, Some(victim));
    do_page_fault(&mut tx, victim, ADDR, false).unwrap().unwrap();
    drop(tx);

    let before = env.machine.pte_invalidations();

    // A second process holding the middle GPT capability overwrites the
    // traversed slot.
    let admin = env.spawn_process();
    env.set_cap_reg(admin, 1, env.cap_to(CapType::Gpt, gpts[1]));
    env.set_cap_reg(admin, 2, Capability::null());

    let out = env.invoke(
        admin,
        &Invocation::call(oc::ADDR_SPACE_SET_SLOT, CapLoc::Reg(1))
            .arg32(2)
            .cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(admin));

    // The PTE produced under that slot was shot down through the HAL.
    assert!(env.machine.pte_invalidations() > before);
}

#[test]
fn whacking_a_page_unmaps_every_referent() {
    let env = env();
    let (p, _gpts, pg) = deep_space_process(&env);

    let mut tx = Tx::new(&env.k, 0, Some(p));
    do_page_fault(&mut tx, p, ADDR, false).unwrap().unwrap();
    drop(tx);
    assert!(env.k.page_is_mapped(pg));

    // Rescinding the page destroys it; afterwards no hardware PTE may
    // refer to the frame.
    let admin = env.spawn_process();
    env.set_cap_reg(admin, 1, Capability { ty: CapType::Range, ..Capability::null() });
    env.set_cap_reg(admin, 2, env.cap_to(CapType::Page, pg));

    let out = env.invoke(
        admin,
        &Invocation::call(oc::RANGE_RESCIND, CapLoc::Reg(1)).cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(admin));

    assert!(!env.k.page_is_mapped(pg));
}

#[test]
fn refault_after_shootdown_reinstalls() {
    let env = env();
    let (p, gpts, pg) = deep_space_process(&env);

    let mut tx = Tx::new(&env.k, 0, Some(p));
    do_page_fault(&mut tx, p, ADDR, false).unwrap().unwrap();
    drop(tx);

    // Direct kernel-side slot rewrite path: drop and re-add the leaf.
    let admin = env.spawn_process();
    env.set_cap_reg(admin, 1, env.cap_to(CapType::Gpt, gpts[2]));
    let mut to_pg = env.cap_to(CapType::Page, pg);
    to_pg.set_guard(Guard::new(0, 12));
    env.set_cap_reg(admin, 2, to_pg);

    let out = env.invoke(
        admin,
        &Invocation::call(oc::ADDR_SPACE_SET_SLOT, CapLoc::Reg(1))
            .arg32(1)
            .cap_arg(CapLoc::Reg(2)),
    );
    assert_eq!(out, DispatchOutcome::Completed);
    assert!(env.result_is_ok(admin));
    assert!(!env.k.page_is_mapped(pg));

    let mut tx = Tx::new(&env.k, 0, Some(p));
    let got = do_page_fault(&mut tx, p, ADDR, false).unwrap().unwrap();
    assert_eq!(got, pg);
    assert!(env.k.page_is_mapped(pg));
}
