// SPDX-License-Identifier: MPL-2.0

//! Portable model of the per-process register save area.
//!
//! The machine-dependent layer of a real port decides which parameter words
//! travel in registers and which live in the user-memory parameter block.
//! This model fixes a 64-bit convention: `pw0..pw3` are register-carried,
//! everything else is fetched from the [`InvParameterBlock`] that the
//! invoker addresses through a dedicated register. The receive-side words
//! (receive bound, receive pointer, receive cap locations, endpoint ID) are
//! snapshotted at system-call entry so they survive until the matching send
//! arrives, possibly long after the invoker lost the CPU.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::types::{Uva, Word};

/// Number of register-carried parameter words.
pub const NUM_REG_PW: usize = 4;

/// Layout of the user-memory invocation parameter block.
///
/// The block always starts with the full parameter-word array; words that
/// travel in registers are ignored on read.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InvParameterBlock {
    pub pw: [u64; 8],
    /// Invoked capability location on entry, protected payload on exit.
    pub inv_cap: u64,
    pub snd_cap: [u64; 4],
    pub rcv_cap: [u64; 4],
    pub snd_len: u32,
    pub rcv_bound: u32,
    pub snd_ptr: u64,
    pub rcv_ptr: u64,
    pub ep_id: u64,
}

pub const PARAM_BLOCK_SIZE: usize = core::mem::size_of::<InvParameterBlock>();
const_assert_eq!(PARAM_BLOCK_SIZE, 168);

/// Indices of the soft parameter words, following the system-call layout.
pub const IPW_INVCAP: usize = 8;
pub const OPW_PP: usize = 8;
pub const IPW_SNDCAP: usize = 9;
pub const IPW_RCVCAP: usize = 13;
pub const IPW_SNDLEN: usize = 17;
pub const OPW_SNDLEN: usize = 17;
pub const IPW_RCVBOUND: usize = 18;
pub const IPW_SNDPTR: usize = 19;
pub const IPW_RCVPTR: usize = 20;
pub const IPW_EPID: usize = 21;
pub const OPW_EPID: usize = 21;

/// The architecture-neutral register save area of a process.
#[derive(Clone, Debug, Default)]
pub struct RegSave {
    /// Register-carried parameter words (`pw0` doubles as the ICW).
    pub pw: [Word; NUM_REG_PW],
    /// User VA of the invocation parameter block.
    pub pb_va: Uva,
    /// User program counter; only carried, never interpreted.
    pub pc: Uva,
    /// Floating-point state; only carried, never interpreted.
    pub float_regs: [u64; 8],
}

/// Snapshot of the soft (non-register) parameters, taken at system call
/// entry, plus the landing zone for soft output words.
#[derive(Clone, Debug, Default)]
pub struct SoftRegs {
    /// Latched input/output parameter words `pw4..pw7`.
    pub pw4_7: [Word; 4],
    pub invoke_cap: Word,
    pub snd_cap: [Word; 4],
    pub rcv_cap: [Word; 4],
    pub snd_len: u32,
    pub rcv_bound: u32,
    pub snd_ptr: Uva,
    pub rcv_ptr: Uva,
    pub ep_id: u64,
    /// Received protected payload (output only).
    pub pp: u32,
}

impl SoftRegs {
    /// Latch the soft parameters from a freshly read parameter block.
    pub fn capture(&mut self, pb: &InvParameterBlock) {
        self.pw4_7.copy_from_slice(&pb.pw[4..8]);
        self.invoke_cap = pb.inv_cap;
        self.snd_cap = pb.snd_cap;
        self.rcv_cap = pb.rcv_cap;
        self.snd_len = pb.snd_len;
        self.rcv_bound = pb.rcv_bound;
        self.snd_ptr = pb.snd_ptr;
        self.rcv_ptr = pb.rcv_ptr;
        self.ep_id = pb.ep_id;
    }

    /// Fill the output fields of a parameter block image for copy-out.
    pub fn copy_out(&self, pb: &mut InvParameterBlock) {
        pb.pw[4..8].copy_from_slice(&self.pw4_7);
        pb.inv_cap = self.pp as u64;
        pb.snd_len = self.snd_len;
        pb.ep_id = self.ep_id;
    }
}
