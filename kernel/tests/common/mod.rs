// SPDX-License-Identifier: MPL-2.0

//! Shared scaffolding for the scenario tests: an in-memory machine behind
//! the HAL trait, and a canned address-space layout for test processes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use coyotos_kernel::{
    arch::InvParameterBlock,
    cache::CacheSizes,
    cap::{CapType, Capability},
    hal::{Hal, NullStore},
    ipc::syscall::{ipw0, oc, SC_INVOKE_CAP},
    obj::{frames::GPT_SLOT_INDEX_BITS, ObRef, ObType},
    types::{CapLoc, Guard, Oid, Paddr, Word, PAGE_ADDR_BITS, PAGE_SIZE},
    BootSpec, DispatchOutcome, Kernel,
};
use zerocopy::IntoBytes;

/// The in-memory machine.
pub struct MockMachine {
    pages: Mutex<HashMap<Paddr, Box<[u8; PAGE_SIZE]>>>,
    pub invalidated_ptes: Mutex<Vec<(Paddr, usize)>>,
    pub tlb_flushes: Mutex<usize>,
    pub console: Mutex<Vec<u8>>,
    pub unmasked: Mutex<Vec<u32>>,
    pub acked: Mutex<Vec<u32>>,
    pub power_events: Mutex<Vec<&'static str>>,
}

impl MockMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockMachine {
            pages: Mutex::new(HashMap::new()),
            invalidated_ptes: Mutex::new(Vec::new()),
            tlb_flushes: Mutex::new(0),
            console: Mutex::new(Vec::new()),
            unmasked: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            power_events: Mutex::new(Vec::new()),
        })
    }

    pub fn console_string(&self) -> String {
        String::from_utf8_lossy(&self.console.lock().unwrap()).into_owned()
    }

    pub fn pte_invalidations(&self) -> usize {
        self.invalidated_ptes.lock().unwrap().len()
    }
}

/// Delegating handle so tests can keep the machine after the kernel takes
/// its HAL box.
pub struct MachineHandle(pub Arc<MockMachine>);

impl Hal for MachineHandle {
    fn with_page(&self, pa: Paddr, f: &mut dyn FnMut(&mut [u8; PAGE_SIZE])) {
        let mut pages = self.0.pages.lock().unwrap();
        let page = pages.entry(pa).or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        f(page);
    }

    fn invalidate_pte(&self, table_pa: Paddr, slot: usize) {
        self.0.invalidated_ptes.lock().unwrap().push((table_pa, slot));
    }

    fn tlb_flush_all(&self) {
        *self.0.tlb_flushes.lock().unwrap() += 1;
    }

    fn irq_unmask(&self, irq: u32) {
        self.0.unmasked.lock().unwrap().push(irq);
    }

    fn irq_mask(&self, _irq: u32) {}

    fn irq_ack(&self, irq: u32) {
        self.0.acked.lock().unwrap().push(irq);
    }

    fn console_write(&self, bytes: &[u8]) {
        self.0.console.lock().unwrap().extend_from_slice(bytes);
    }

    fn halt(&self) {
        self.0.power_events.lock().unwrap().push("halt");
    }

    fn powerdown(&self) {
        self.0.power_events.lock().unwrap().push("powerdown");
    }

    fn reboot(&self) {
        self.0.power_events.lock().unwrap().push("reboot");
    }
}

pub struct TestEnv {
    pub k: Kernel,
    pub machine: Arc<MockMachine>,
    next_oid: Mutex<Oid>,
}

pub fn env() -> TestEnv {
    env_with_cmdline("")
}

pub fn env_with_cmdline(cmdline: &str) -> TestEnv {
    let machine = MockMachine::new();
    let k = Kernel::new(BootSpec {
        hal: Box::new(MachineHandle(machine.clone())),
        store: Box::new(NullStore),
        ncpu: 1,
        cmdline: cmdline.to_string(),
        sizes: CacheSizes::from_pages(64),
        max_oids: [256, 64, 64, 32, 64],
    });
    TestEnv {
        k,
        machine,
        next_oid: Mutex::new(1),
    }
}

/// Span of the canned root GPT: 16 page slots under a 16-bit guard.
pub const TEST_SPACE_L2G: u32 = PAGE_ADDR_BITS + GPT_SLOT_INDEX_BITS;

/// User VA of the parameter block page in the canned layout.
pub const PB_VA: u64 = 0;
/// User VA of the capability page in the canned layout.
pub const CAP_PAGE_VA: u64 = 0x1000;
/// User VA of a general data page in the canned layout.
pub const DATA_VA: u64 = 0x2000;

impl TestEnv {
    pub fn fresh_oid(&self) -> Oid {
        let mut g = self.next_oid.lock().unwrap();
        let oid = *g;
        *g += 1;
        oid
    }

    pub fn new_object(&self, ty: ObType) -> ObRef {
        let oid = self.fresh_oid();
        self.k
            .materialize(ty, oid)
            .unwrap_or_else(|| panic!("cannot materialize {:?}:{}", ty, oid))
    }

    /// An object capability to a materialized frame, minted at its current
    /// generation.
    pub fn cap_to(&self, ty: CapType, obref: ObRef) -> Capability {
        let oid = self.oid_of(obref);
        Capability::object(ty, oid, self.k.alloc_count_of(obref))
    }

    pub fn oid_of(&self, obref: ObRef) -> Oid {
        self.k.oid_of(obref)
    }

    /// Build the canned address space: a root GPT (l2v = page bits) whose
    /// slot 0 is the parameter-block page, slot 1 a capability page, and
    /// slot 2 a data page.
    pub fn spawn_process(&self) -> ObRef {
        let p = self.new_object(ObType::Process);
        let root = self.new_object(ObType::Gpt);
        let pb_page = self.new_object(ObType::Page);
        let cap_page = self.new_object(ObType::CapPage);
        let data_page = self.new_object(ObType::Page);

        self.k.with_gpt(root, |g| {
            g.l2v = PAGE_ADDR_BITS as u8;
        });
        let page_guard = Guard::new(0, PAGE_ADDR_BITS);
        let mut pb_cap = self.cap_to(CapType::Page, pb_page);
        pb_cap.set_guard(page_guard);
        let mut cp_cap = self.cap_to(CapType::CapPage, cap_page);
        cp_cap.set_guard(page_guard);
        let mut data_cap = self.cap_to(CapType::Page, data_page);
        data_cap.set_guard(page_guard);
        self.k.with_gpt(root, |g| {
            g.caps[0] = pb_cap;
            g.caps[1] = cp_cap;
            g.caps[2] = data_cap;
        });

        let mut space = self.cap_to(CapType::Gpt, root);
        space.set_guard(Guard::new(0, TEST_SPACE_L2G));
        self.k.with_process(p, |b| {
            b.state.addr_space = space;
            b.regs.pb_va = PB_VA;
        });
        p
    }

    /// Put a capability in a register of a process.
    pub fn set_cap_reg(&self, p: ObRef, idx: usize, cap: Capability) {
        self.k.with_process(p, |b| b.state.cap_regs[idx] = cap);
    }

    /// Latch and run an invocation, returning the dispatch outcome.
    pub fn invoke(&self, p: ObRef, inv: &Invocation) -> DispatchOutcome {
        let mut pb = InvParameterBlock {
            inv_cap: inv.inv_cap.to_raw(),
            ..InvParameterBlock::default()
        };
        for (i, w) in inv.args.iter().enumerate() {
            pb.pw[4 + i] = *w;
        }
        for (i, loc) in inv.snd_caps.iter().enumerate() {
            pb.snd_cap[i] = loc.to_raw();
        }
        for (i, loc) in inv.rcv_caps.iter().enumerate() {
            pb.rcv_cap[i] = loc.to_raw();
        }
        pb.snd_len = inv.snd_len;
        pb.rcv_bound = inv.rcv_bound;
        pb.snd_ptr = inv.snd_ptr;
        pb.rcv_ptr = inv.rcv_ptr;
        pb.ep_id = inv.ep_id;

        // The parameter block lives at the start of the pb page.
        let pb_page = self.page_at(p, PB_VA);
        self.k.write_page(pb_page, 0, pb.as_bytes());

        let mut pw = [0 as Word; 4];
        pw[0] = inv.icw();
        pw[1] = inv.op_code;
        pw[2] = *inv.reg_args.first().unwrap_or(&0);
        pw[3] = *inv.reg_args.get(1).unwrap_or(&0);
        self.k.post_syscall(p, pw, PB_VA);
        self.k.run_process(0, p)
    }

    /// The page frame behind a VA of the canned layout.
    pub fn page_at(&self, p: ObRef, va: u64) -> ObRef {
        let slot = (va >> PAGE_ADDR_BITS) as usize;
        let root = self.seeded_root(p);
        let slot_cap = self.k.with_gpt(root, |g| g.caps[slot]);
        if let Some(pg) = slot_cap.prep_target() {
            return pg;
        }
        let coyotos_kernel::cap::Target::Oid(oid) = slot_cap.target else {
            panic!("slot {} holds no page", slot);
        };
        assert_eq!(slot_cap.ty, CapType::Page);
        self.k.materialize(ObType::Page, oid).expect("page frame")
    }

    /// The capability page of the canned layout.
    pub fn cap_page_of(&self, p: ObRef) -> ObRef {
        let root = self.seeded_root(p);
        let slot_cap = self.k.with_gpt(root, |g| g.caps[1]);
        if let Some(cp) = slot_cap.prep_target() {
            return cp;
        }
        let coyotos_kernel::cap::Target::Oid(oid) = slot_cap.target else {
            panic!("slot 1 holds no cap page");
        };
        self.k.materialize(ObType::CapPage, oid).expect("cap page frame")
    }

    pub fn seeded_root(&self, p: ObRef) -> ObRef {
        let space = self.k.with_process(p, |b| b.state.addr_space);
        if let Some(root) = space.prep_target() {
            return root;
        }
        let coyotos_kernel::cap::Target::Oid(oid) = space.target else {
            panic!("process has no address space");
        };
        self.k.materialize(ObType::Gpt, oid).expect("root GPT")
    }

    /// Result control word of the last invocation.
    pub fn result_icw(&self, p: ObRef) -> Word {
        self.k.reg_pw(p, 0)
    }

    /// First result data word of the last invocation.
    pub fn result_w1(&self, p: ObRef) -> Word {
        self.k.reg_pw(p, 1)
    }

    pub fn result_is_exception(&self, p: ObRef, rc: coyotos_kernel::ipc::syscall::Rc) -> bool {
        self.result_icw(p) & ipw0::EX != 0 && self.result_w1(p) == rc as u64
    }

    pub fn result_is_ok(&self, p: ObRef) -> bool {
        self.result_icw(p) & ipw0::EX == 0
    }
}

/// A canned invocation.
pub struct Invocation {
    pub op_code: Word,
    pub inv_cap: CapLoc,
    /// Arguments carried in registers (pw2, pw3).
    pub reg_args: Vec<Word>,
    /// Arguments spilled to the parameter block (pw4..).
    pub args: Vec<Word>,
    pub snd_caps: Vec<CapLoc>,
    pub rcv_caps: Vec<CapLoc>,
    pub last_snd_cap: usize,
    pub send_phase: bool,
    pub receive_phase: bool,
    pub non_blocking: bool,
    pub closed_wait: bool,
    pub reply_cap: bool,
    pub last_data_word: usize,
    pub snd_len: u32,
    pub rcv_bound: u32,
    pub snd_ptr: u64,
    pub rcv_ptr: u64,
    pub ep_id: u64,
}

impl Invocation {
    /// A kernel-capability call: send and receive phase, opcode in pw1.
    pub fn call(op_code: Word, inv_cap: CapLoc) -> Self {
        Invocation {
            op_code,
            inv_cap,
            reg_args: Vec::new(),
            args: Vec::new(),
            snd_caps: vec![CapLoc::Reg(0)],
            rcv_caps: vec![CapLoc::Reg(30), CapLoc::Reg(29), CapLoc::Reg(28), CapLoc::Reg(27)],
            last_snd_cap: 0,
            send_phase: true,
            receive_phase: true,
            non_blocking: false,
            closed_wait: false,
            reply_cap: false,
            last_data_word: 1,
            snd_len: 0,
            rcv_bound: 0,
            snd_ptr: 0,
            rcv_ptr: 0,
            ep_id: 0,
        }
    }

    pub fn arg32(mut self, v: u32) -> Self {
        self.push_arg(v as Word);
        self
    }

    pub fn arg64(mut self, v: u64) -> Self {
        self.push_arg(v);
        self
    }

    fn push_arg(&mut self, v: Word) {
        self.last_data_word += 1;
        if self.last_data_word <= 3 {
            self.reg_args.push(v);
        } else {
            self.args.push(v);
        }
    }

    /// Pass a capability argument (sent caps start at slot 1).
    pub fn cap_arg(mut self, loc: CapLoc) -> Self {
        self.snd_caps.push(loc);
        self.last_snd_cap += 1;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    pub fn closed_wait(mut self, ep_id: u64) -> Self {
        self.closed_wait = true;
        self.ep_id = ep_id;
        self
    }

    pub fn with_reply_cap(mut self, reply_ep: CapLoc) -> Self {
        self.reply_cap = true;
        self.snd_caps[0] = reply_ep;
        self
    }

    pub fn with_string(mut self, ptr: u64, len: u32) -> Self {
        self.snd_ptr = ptr;
        self.snd_len = len;
        self
    }

    pub fn with_rcv_buffer(mut self, ptr: u64, bound: u32) -> Self {
        self.rcv_ptr = ptr;
        self.rcv_bound = bound;
        self
    }

    pub fn icw(&self) -> Word {
        let mut icw = SC_INVOKE_CAP
            | ipw0::make_ldw(self.last_data_word)
            | ipw0::SC
            | ipw0::make_lsc(self.last_snd_cap)
            | ipw0::AC
            | ipw0::make_lrc(self.rcv_caps.len().saturating_sub(1));
        if self.send_phase {
            icw |= ipw0::SP;
        }
        if self.receive_phase {
            icw |= ipw0::RP;
        }
        if self.non_blocking {
            icw |= ipw0::NB;
        }
        if self.closed_wait {
            icw |= ipw0::CW;
        }
        if self.reply_cap {
            icw |= ipw0::RC;
        }
        icw
    }
}

/// Shorthand: a `getType` invocation on a register capability.
pub fn get_type(reg: u8) -> Invocation {
    Invocation::call(oc::CAP_GET_TYPE, CapLoc::Reg(reg))
}
