// SPDX-License-Identifier: MPL-2.0

//! The expanded invocation parameter block.
//!
//! `InvParam` is the kernel-side view of one invocation: the invoker, the
//! resolved invokee (if any), the invoked and argument capabilities with
//! the locations they came from, and the cursors used to consume input
//! parameter words and produce output words.

use crate::{
    cap::{prepare, Capability},
    kernel::Kernel,
    obj::{
        frames::{ProcSlot, NUM_CAP_REGS},
        ObRef, ObType,
    },
    sched::{Tx, Txr},
    types::Word,
};

use super::syscall::{ipw0, Rc};

/// A capability slot somewhere in kernel-managed state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CapSlotPtr {
    /// Capability register `n` of a process.
    Reg(ObRef, u8),
    /// Slot of a capability page.
    CapPage(ObRef, u16),
    /// A numbered per-process capability slot.
    Proc(ObRef, ProcSlot),
    /// A GPT slot.
    Gpt(ObRef, u8),
    /// The recipient slot of an endpoint.
    EndptRecipient(ObRef),
}

impl Kernel {
    /// Read the capability at a slot.
    pub(crate) fn read_cap_slot(&self, ptr: CapSlotPtr) -> Capability {
        match ptr {
            CapSlotPtr::Reg(p, n) => {
                self.cache.procs.with_body(p.slot, |b| b.state.cap_regs[n as usize])
            }
            CapSlotPtr::CapPage(cp, n) => {
                self.cache.cap_pages.with_body(cp.slot, |b| b.caps[n as usize])
            }
            CapSlotPtr::Proc(p, s) => self.cache.procs.with_body(p.slot, |b| *b.cap_slot(s)),
            CapSlotPtr::Gpt(g, n) => self.cache.gpts.with_body(g.slot, |b| b.caps[n as usize]),
            CapSlotPtr::EndptRecipient(ep) => {
                self.cache.endpoints.with_body(ep.slot, |b| b.recipient)
            }
        }
    }

    /// Overwrite the capability at a slot, GC-scrubbing the value copied.
    pub(crate) fn write_cap_slot(&self, ptr: CapSlotPtr, cap: &Capability) {
        let mut c = *cap;
        prepare::gc(self, &mut c);
        match ptr {
            CapSlotPtr::Reg(p, n) => self
                .cache
                .procs
                .with_body(p.slot, |b| b.state.cap_regs[n as usize] = c),
            CapSlotPtr::CapPage(cp, n) => {
                self.cache.cap_pages.with_body(cp.slot, |b| b.caps[n as usize] = c)
            }
            CapSlotPtr::Proc(p, s) => {
                self.cache.procs.with_body(p.slot, |b| *b.cap_slot_mut(s) = c)
            }
            CapSlotPtr::Gpt(g, n) => {
                self.cache.gpts.with_body(g.slot, |b| b.caps[n as usize] = c)
            }
            CapSlotPtr::EndptRecipient(ep) => {
                self.cache.endpoints.with_body(ep.slot, |b| b.recipient = c)
            }
        }
    }

    /// Fetch parameter word `i` of a process: registers for the low words,
    /// the latched soft snapshot for the rest.
    pub(crate) fn get_pw(&self, p: ObRef, i: usize) -> Word {
        debug_assert_eq!(p.ty, ObType::Process);
        self.cache.procs.with_body(p.slot, |b| match i {
            0..=3 => b.regs.pw[i],
            4..=7 => b.soft.pw4_7[i - 4],
            crate::arch::IPW_SNDLEN => b.soft.snd_len as Word,
            crate::arch::IPW_RCVBOUND => b.soft.rcv_bound as Word,
            crate::arch::IPW_SNDPTR => b.soft.snd_ptr,
            crate::arch::IPW_RCVPTR => b.soft.rcv_ptr,
            crate::arch::IPW_EPID => b.soft.ep_id,
            _ => 0,
        })
    }

    /// Store parameter word `i` of a process.
    pub(crate) fn set_pw(&self, p: ObRef, i: usize, v: Word) {
        debug_assert_eq!(p.ty, ObType::Process);
        self.cache.procs.with_body(p.slot, |b| match i {
            0..=3 => b.regs.pw[i] = v,
            4..=7 => b.soft.pw4_7[i - 4] = v,
            crate::arch::OPW_PP => b.soft.pp = v as u32,
            crate::arch::OPW_SNDLEN => b.soft.snd_len = v as u32,
            crate::arch::OPW_EPID => b.soft.ep_id = v,
            _ => {}
        });
    }
}

/// Error channel of a handler: either an exception reply to the invoker,
/// or a transaction yield.
#[derive(Clone, Copy, Debug)]
pub enum InvError {
    Ex(Rc),
    Yield(crate::sched::Abandon),
}

impl From<crate::sched::Abandon> for InvError {
    fn from(a: crate::sched::Abandon) -> Self {
        InvError::Yield(a)
    }
}

pub type HandlerResult<T> = core::result::Result<T, InvError>;

/// An incoming argument capability: the effective copy plus the slot it
/// was sourced from (None for kernel-fabricated values).
#[derive(Clone, Copy, Debug)]
pub struct SrcCap {
    pub home: Option<CapSlotPtr>,
    pub cap: Capability,
}

impl SrcCap {
    pub fn empty() -> Self {
        SrcCap {
            home: None,
            cap: Capability::null(),
        }
    }
}

/// The expanded parameter block of one invocation.
pub struct InvParam {
    pub invoker: ObRef,
    pub invokee: Option<ObRef>,
    pub invokee_ep: Option<ObRef>,

    /// The invoked capability.
    pub icap: SrcCap,
    /// Sent capabilities. Slot 0 doubles as the landing zone for a kernel
    /// handler's output capability.
    pub src: [SrcCap; 4],
    /// Resolved receive-cap destinations of the invokee.
    pub dest: [Option<CapSlotPtr>; 4],

    pub snd_len: u32,
    pub ipw0: Word,
    pub op_code: Word,

    next_idw: usize,
    next_odw: usize,
    /// Output parameter words; `opw[0]` is the result control word.
    pub opw: [Word; 8],
    /// Number of output capabilities (kernel handlers).
    pub out_caps: usize,
}

impl InvParam {
    pub fn new(invoker: ObRef, ipw0: Word) -> Self {
        InvParam {
            invoker,
            invokee: None,
            invokee_ep: None,
            icap: SrcCap::empty(),
            src: [SrcCap::empty(); 4],
            dest: [None; 4],
            snd_len: 0,
            ipw0,
            op_code: 0,
            next_idw: 2,
            next_odw: 1,
            opw: [0; 8],
            out_caps: 0,
        }
    }

    // --------------------------------------------------------------
    // Input parameter words
    // --------------------------------------------------------------

    fn next_input(&mut self, k: &Kernel) -> Word {
        if ipw0::ldw(self.ipw0) < self.next_idw {
            return 0;
        }
        self.next_idw += 1;
        k.get_pw(self.invoker, self.next_idw - 1)
    }

    pub fn get_iparam32(&mut self, k: &Kernel) -> u32 {
        self.next_input(k) as u32
    }

    pub fn get_iparam64(&mut self, k: &Kernel) -> u64 {
        self.next_input(k)
    }

    // --------------------------------------------------------------
    // Output parameter words
    // --------------------------------------------------------------

    pub fn put_oparam32(&mut self, v: u32) {
        self.opw[self.next_odw] = v as Word;
        self.next_odw += 1;
    }

    pub fn put_oparam64(&mut self, v: u64) {
        self.opw[self.next_odw] = v;
        self.next_odw += 1;
    }

    /// The result control word for a normal reply carrying `n_cap` output
    /// capabilities.
    pub fn result_icw(&self, n_cap: usize) -> Word {
        let mut w = ipw0::make_ldw(self.next_odw - 1);
        if n_cap > 0 {
            w |= ipw0::SC | ipw0::make_lsc(n_cap - 1);
        }
        w
    }

    /// Finish with a normal reply carrying `n_cap` output capabilities.
    pub fn complete(&mut self, n_cap: usize) {
        self.opw[0] = self.result_icw(n_cap);
        self.out_caps = n_cap;
    }

    /// Finish with an exception reply.
    pub fn error_reply(&mut self, rc: Rc) {
        self.next_odw = 1;
        self.put_oparam64(rc as u64);
        self.opw[0] = ipw0::make_ldw(self.next_odw - 1) | ipw0::EX;
        self.out_caps = 0;
    }

    /// Finish with a `getType`-style reply.
    pub fn type_reply(&mut self, kt: super::syscall::Ikt) {
        self.put_oparam64(kt as u64);
        self.opw[0] = self.result_icw(0);
        self.out_caps = 0;
    }

    // --------------------------------------------------------------
    // Argument validation
    // --------------------------------------------------------------

    fn test_arguments(&self, k: &Kernel, last_cap: usize, min: u32, max: u32) -> bool {
        if self.snd_len < min || self.snd_len > max {
            return false;
        }
        let icw = k.get_pw(self.invoker, 0);
        let icw_args =
            ipw0::make_ldw(self.next_idw - 1) | ipw0::SC | ipw0::make_lsc(last_cap);
        (icw & (ipw0::LDW_MASK | ipw0::LSC_MASK | ipw0::SC | ipw0::EX)) == icw_args
    }

    /// Validate the argument shape: every declared input word consumed,
    /// exactly `last_cap + 1` sent capabilities, and a sent-string length
    /// within `[min, max]`.
    pub fn require_args_s_m(
        &self,
        k: &Kernel,
        last_cap: usize,
        min: u32,
        max: u32,
    ) -> HandlerResult<()> {
        if self.test_arguments(k, last_cap, min, max) {
            Ok(())
        } else {
            Err(InvError::Ex(Rc::RequestError))
        }
    }

    pub fn require_args_s(&self, k: &Kernel, last_cap: usize, sz: u32) -> HandlerResult<()> {
        self.require_args_s_m(k, last_cap, sz, sz)
    }

    pub fn require_args(&self, k: &Kernel, last_cap: usize) -> HandlerResult<()> {
        self.require_args_s(k, last_cap, 0)
    }

    // --------------------------------------------------------------
    // Argument capabilities
    // --------------------------------------------------------------

    /// Prepare argument capability `j`, writing preparation effects back to
    /// its home slot.
    pub fn prepare_src(&mut self, tx: &Tx<'_>, j: usize) -> Txr<()> {
        let mut cap = self.src[j].cap;
        prepare::prepare(tx, &mut cap)?;
        self.src[j].cap = cap;
        if let Some(home) = self.src[j].home {
            tx.k.write_cap_slot(home, &cap);
        }
        Ok(())
    }

    /// Prepare the invoked capability in place.
    pub fn prepare_icap(&mut self, tx: &Tx<'_>) -> Txr<()> {
        let mut cap = self.icap.cap;
        prepare::prepare(tx, &mut cap)?;
        self.icap.cap = cap;
        if let Some(home) = self.icap.home {
            tx.k.write_cap_slot(home, &cap);
        }
        Ok(())
    }

    /// The frame the prepared invoked capability points at.
    pub fn icap_target(&self) -> ObRef {
        self.icap.cap.prep_target().expect("invoked capability not prepared")
    }
}

/// Clamp a capability register index to the register bank.
pub fn reg_index(n: u8) -> u8 {
    n % NUM_CAP_REGS as u8
}
