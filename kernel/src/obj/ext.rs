// SPDX-License-Identifier: MPL-2.0

//! Externalized frame layouts.
//!
//! These are the representations that cross the object-store boundary and
//! appear in boot images. Capabilities on storage are always in store form
//! with the OID populated; swizzled state never leaves the cache.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    cap::CapBlob,
    obj::frames::{NUM_CAP_REGS, NUM_GPT_SLOTS},
    types::CAPS_PER_PAGE,
};

/// Externalized GPT state.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExGpt {
    /// l2v:6 ha:1 bg:1
    pub config: u8,
    pub _pad: [u8; 7],
    pub cap: [CapBlob; NUM_GPT_SLOTS],
}

impl ExGpt {
    pub fn l2v(&self) -> u8 {
        self.config & 0x3f
    }

    pub fn ha(&self) -> bool {
        self.config & 0x40 != 0
    }

    pub fn bg(&self) -> bool {
        self.config & 0x80 != 0
    }

    pub fn pack_config(l2v: u8, ha: bool, bg: bool) -> u8 {
        (l2v & 0x3f) | ((ha as u8) << 6) | ((bg as u8) << 7)
    }
}

/// Externalized endpoint state.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExEndpoint {
    /// pm:1
    pub pm: u32,
    pub prot_payload: u32,
    pub endpoint_id: u64,
    pub recipient: CapBlob,
}

/// Externalized process state, including the portable register save area.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExProcess {
    pub run_state: u8,
    pub _pad0: u8,
    pub flags: u16,
    pub soft_ints: u32,
    pub notices: u32,
    pub fault_code: u32,
    pub fault_info: u64,

    pub schedule: CapBlob,
    pub addr_space: CapBlob,
    pub brand: CapBlob,
    pub cohort: CapBlob,
    pub io_space: CapBlob,
    pub handler: CapBlob,
    pub cap_reg: [CapBlob; NUM_CAP_REGS],

    pub pw: [u64; 4],
    pub pb_va: u64,
    pub pc: u64,
}

impl Default for ExProcess {
    fn default() -> Self {
        ExProcess {
            run_state: 0,
            _pad0: 0,
            flags: 0,
            soft_ints: 0,
            notices: 0,
            fault_code: 0,
            fault_info: 0,
            schedule: CapBlob::default(),
            addr_space: CapBlob::default(),
            brand: CapBlob::default(),
            cohort: CapBlob::default(),
            io_space: CapBlob::default(),
            handler: CapBlob::default(),
            cap_reg: [CapBlob::default(); NUM_CAP_REGS],
            pw: [0; 4],
            pb_va: 0,
            pc: 0,
        }
    }
}

/// In-transit content of a frame, as produced by the object store.
pub enum FrameImage {
    Page(alloc::boxed::Box<[u8; crate::types::PAGE_SIZE]>),
    CapPage(alloc::boxed::Box<[CapBlob; CAPS_PER_PAGE]>),
    Gpt(alloc::boxed::Box<ExGpt>),
    Process(alloc::boxed::Box<ExProcess>),
    Endpoint(ExEndpoint),
}
