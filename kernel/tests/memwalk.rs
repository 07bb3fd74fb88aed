// SPDX-License-Identifier: MPL-2.0

//! Memory walker invariants.

mod common;

use common::*;
use coyotos_kernel::{
    cap::{CapType, Capability, Restr, Target},
    ipc::syscall::FaultCode,
    mm::walk::{memwalk, MemWalkResults, MEMWALK_MAX},
    obj::{frames::MEMWALK_SLOT_BACKGROUND, ObRef, ObType},
    sched::Tx,
    types::Guard,
};

/// Build the three-level space of the address-translation scenario:
/// GPTs with l2v = 30, 20, 12 terminating in a page.
fn three_level_space(env: &TestEnv) -> (Capability, [ObRef; 3], ObRef) {
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
    (root, [g1, g2, g3], pg)
}

/// The address whose walk crosses slots 1, 2, 1 of the three levels.
const ADDR: u64 = 0x4020_1000;

#[test]
fn three_level_walk_produces_the_expected_transcript() {
    let env = env();
    let (mut root, gpts, pg) = three_level_space(&env);

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, ADDR, false, &mut results).unwrap();

    assert_eq!(fc, FaultCode::NoFault);
    assert_eq!(results.count(), 4);

    let slots: Vec<u8> = results.ents.iter().map(|e| e.slot).collect();
    assert_eq!(slots, vec![1, 2, 1, 0]);

    assert_eq!(results.ents[0].entry, Some(gpts[0]));
    assert_eq!(results.ents[1].entry, Some(gpts[1]));
    assert_eq!(results.ents[2].entry, Some(gpts[2]));
    assert_eq!(results.ents[3].entry, Some(pg));

    // Stripped guards plus per-step slot contributions reassemble the
    // address.
    let mut sum = 0u64;
    for e in results.ents.iter() {
        sum += e.guard;
        if !e.window && e.entry.map_or(false, |o| o.ty == ObType::Gpt) {
            sum += (e.slot as u64) << e.l2v;
        }
    }
    sum += results.ents.last().unwrap().rem_addr;
    assert_eq!(sum, ADDR);
}

#[test]
fn guard_mismatch_is_an_invalid_data_reference() {
    let env = env();
    let (mut root, _, _) = three_level_space(&env);

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    // Offset 2^35 violates the root guard.
    let fc = memwalk(&tx, &mut root, 1 << 35, false, &mut results).unwrap();
    assert_eq!(fc, FaultCode::InvalidDataReference);
}

#[test]
fn null_interior_slot_is_an_invalid_data_reference() {
    let env = env();
    let (mut root, _, _) = three_level_space(&env);

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    // Slot 3 of the root was never populated.
    let fc = memwalk(&tx, &mut root, 3 << 30, false, &mut results).unwrap();
    assert_eq!(fc, FaultCode::InvalidDataReference);
}

#[test]
fn cyclic_space_exhausts_the_walk_bound() {
    let env = env();
    let g = env.new_object(ObType::Gpt);
    let mut self_cap = env.cap_to(CapType::Gpt, g);
    self_cap.set_guard(Guard::new(0, 12));
    env.k.with_gpt(g, |b| {
        b.l2v = 12;
        b.caps[0] = self_cap;
    });

    let mut root = self_cap;
    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, 0, false, &mut results).unwrap();

    assert_eq!(fc, FaultCode::MalformedSpace);
    assert_eq!(results.count(), MEMWALK_MAX);
}

#[test]
fn write_through_read_only_is_an_access_violation() {
    let env = env();
    let (mut root, _, _) = three_level_space(&env);
    root.restr |= Restr::RO;

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, ADDR, true, &mut results).unwrap();
    assert_eq!(fc, FaultCode::AccessViolation);

    // Reading stays fine.
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, ADDR, false, &mut results).unwrap();
    assert_eq!(fc, FaultCode::NoFault);
    assert!(results.cum_restr.contains(Restr::RO));
}

#[test]
fn local_window_redirects_through_a_sibling_slot() {
    let env = env();
    let g = env.new_object(ObType::Gpt);
    let pg = env.new_object(ObType::Page);

    let mut pg_cap = env.cap_to(CapType::Page, pg);
    pg_cap.set_guard(Guard::new(0, 12));

    // Slot 1 windows through slot 0.
    let lw = Capability {
        ty: CapType::LocalWindow,
        restr: Restr::empty(),
        alloc_count: 0, // target slot
        payload: Guard::new(0, 12).raw(),
        target: Target::Offset(0),
    };

    env.k.with_gpt(g, |b| {
        b.l2v = 12;
        b.caps[0] = pg_cap;
        b.caps[1] = lw;
    });

    let mut root = env.cap_to(CapType::Gpt, g);
    root.set_guard(Guard::new(0, 16));

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, 0x1000, false, &mut results).unwrap();

    assert_eq!(fc, FaultCode::NoFault);
    let kinds: Vec<bool> = results.ents.iter().map(|e| e.window).collect();
    assert_eq!(kinds, vec![false, true, false]);
    assert_eq!(results.ents[1].slot, 0);
    assert_eq!(results.ents.last().unwrap().entry, Some(pg));
}

#[test]
fn background_window_reroutes_to_the_background_slot() {
    let env = env();
    let outer = env.new_object(ObType::Gpt);
    let inner = env.new_object(ObType::Gpt);
    let bg_pg = env.new_object(ObType::Page);

    let mut bg_cap = env.cap_to(CapType::Page, bg_pg);
    bg_cap.set_guard(Guard::new(0, 12));

    // The outer GPT has a background; only its lower 8 slots address.
    let mut inner_cap = env.cap_to(CapType::Gpt, inner);
    inner_cap.set_guard(Guard::new(0, 16));
    env.k.with_gpt(outer, |b| {
        b.l2v = 16;
        b.bg = true;
        b.caps[0] = inner_cap;
        b.caps[coyotos_kernel::obj::frames::GPT_BACKGROUND_SLOT] = bg_cap;
    });

    let w = Capability {
        ty: CapType::Window,
        restr: Restr::empty(),
        alloc_count: 0,
        payload: Guard::new(0, 12).raw(),
        target: Target::Offset(0),
    };
    env.k.with_gpt(inner, |b| {
        b.l2v = 12;
        b.caps[0] = w;
    });

    let mut root = env.cap_to(CapType::Gpt, outer);
    root.set_guard(Guard::new(0, 19));

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, 0, false, &mut results).unwrap();

    assert_eq!(fc, FaultCode::NoFault);
    let bg_step = results.ents.iter().find(|e| e.window).unwrap();
    assert_eq!(bg_step.slot, MEMWALK_SLOT_BACKGROUND);
    assert_eq!(results.ents.last().unwrap().entry, Some(bg_pg));
}

#[test]
fn background_window_without_bg_root_is_malformed() {
    let env = env();
    let g = env.new_object(ObType::Gpt);
    let w = Capability {
        ty: CapType::Window,
        restr: Restr::empty(),
        alloc_count: 0,
        payload: Guard::new(0, 12).raw(),
        target: Target::Offset(0),
    };
    env.k.with_gpt(g, |b| {
        b.l2v = 12;
        b.caps[0] = w;
    });

    let mut root = env.cap_to(CapType::Gpt, g);
    root.set_guard(Guard::new(0, 16));

    let tx = Tx::new(&env.k, 0, None);
    let mut results = MemWalkResults::default();
    let fc = memwalk(&tx, &mut root, 0, false, &mut results).unwrap();
    assert_eq!(fc, FaultCode::MalformedSpace);
}
