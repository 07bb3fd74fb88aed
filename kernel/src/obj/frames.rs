// SPDX-License-Identifier: MPL-2.0

//! Concrete frame bodies.

use crate::{
    arch::{RegSave, SoftRegs},
    cap::Capability,
    mm::mapping::MapRef,
    obj::ObType,
    prelude::*,
    sched::queue::QueueId,
    types::{CoyAddr, Interval, Paddr, CAPS_PER_PAGE},
};

pub const GPT_SLOT_INDEX_BITS: u32 = 4;
pub const NUM_GPT_SLOTS: usize = 1 << GPT_SLOT_INDEX_BITS;
pub const GPT_HANDLER_SLOT: usize = NUM_GPT_SLOTS - 1;
pub const GPT_BACKGROUND_SLOT: usize = NUM_GPT_SLOTS - 2;

pub const CAP_REG_INDEX_BITS: u32 = 5;
pub const NUM_CAP_REGS: usize = 1 << CAP_REG_INDEX_BITS;

/// Marker slot value in walk transcripts for background traversals.
pub const MEMWALK_SLOT_BACKGROUND: u8 = 0xff;

/// A frame body that can live in an object cache pool.
pub trait FrameBody: Default + Send {
    const OB_TYPE: ObType;

    /// Reset to the zero state without altering object identity.
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A data page. The content lives in the physical frame and is reached
/// through the HAL's transient window; the body only records placement and
/// the chain of mapping tables this page has produced.
#[derive(Default)]
pub struct PageFrame {
    pub pa: Paddr,
    pub products: Option<MapRef>,
}

impl FrameBody for PageFrame {
    const OB_TYPE: ObType = ObType::Page;

    fn clear(&mut self) {
        // Placement survives a clear; the page content is zeroed by the
        // cache, which owns the physical frame.
        self.products = None;
    }
}

/// A capability page: 256 capability slots.
pub struct CapPageFrame {
    pub caps: Box<[Capability; CAPS_PER_PAGE]>,
    pub products: Option<MapRef>,
}

impl Default for CapPageFrame {
    fn default() -> Self {
        CapPageFrame {
            caps: Box::new([Capability::null(); CAPS_PER_PAGE]),
            products: None,
        }
    }
}

impl FrameBody for CapPageFrame {
    const OB_TYPE: ObType = ObType::CapPage;

    fn clear(&mut self) {
        self.caps.fill(Capability::null());
        self.products = None;
    }
}

/// A guarded page table node.
#[derive(Default)]
pub struct GptFrame {
    pub l2v: u8,
    /// Slot 15 holds a fault handler capability.
    pub ha: bool,
    /// Slot 14 holds a background capability; only the lower 8 slots are
    /// then addressable.
    pub bg: bool,
    pub caps: [Capability; NUM_GPT_SLOTS],
    pub products: Option<MapRef>,
}

impl FrameBody for GptFrame {
    const OB_TYPE: ObType = ObType::Gpt;
}

impl GptFrame {
    pub fn addressable_slots(&self) -> usize {
        NUM_GPT_SLOTS - (self.bg as usize) * (NUM_GPT_SLOTS / 2)
    }

    pub fn effective_l2g(&self) -> u32 {
        let span = self.l2v as u32 + GPT_SLOT_INDEX_BITS - (self.bg as u32);
        span.min(crate::types::SOFTADDR_BITS)
    }
}

/// Process run states.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum RunState {
    #[default]
    Running = 0,
    Receiving = 1,
    Faulted = 2,
}

/// The externalizable portion of a process.
pub struct ProcessState {
    pub run_state: RunState,
    pub flags: u16,
    pub soft_ints: u32,
    pub notices: u32,
    pub fault_code: u32,
    pub fault_info: CoyAddr,

    pub schedule: Capability,
    pub addr_space: Capability,
    pub brand: Capability,
    pub cohort: Capability,
    pub io_space: Capability,
    pub handler: Capability,
    pub cap_regs: [Capability; NUM_CAP_REGS],
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState {
            run_state: RunState::Running,
            flags: 0,
            soft_ints: 0,
            notices: 0,
            fault_code: 0,
            fault_info: 0,
            schedule: Capability::null(),
            addr_space: Capability::null(),
            brand: Capability::null(),
            cohort: Capability::null(),
            io_space: Capability::null(),
            handler: Capability::null(),
            cap_regs: [Capability::null(); NUM_CAP_REGS],
        }
    }
}

/// Numbered per-process capability slots, as addressed by the process
/// capability's slot operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ProcSlot {
    AddrSpace = 0,
    Schedule = 1,
    Brand = 2,
    Cohort = 3,
    IoSpace = 4,
    Handler = 5,
}

impl ProcSlot {
    pub fn from_u32(v: u32) -> Option<ProcSlot> {
        use ProcSlot::*;
        Some(match v {
            0 => AddrSpace,
            1 => Schedule,
            2 => Brand,
            3 => Cohort,
            4 => IoSpace,
            5 => Handler,
            _ => return None,
        })
    }
}

/// A process frame.
#[derive(Default)]
pub struct ProcessFrame {
    pub state: ProcessState,
    pub regs: RegSave,
    pub soft: SoftRegs,

    /// Which stall queue this process sleeps on, if any.
    pub on_q: Option<QueueId>,
    pub on_cpu: Option<u32>,
    /// An invocation is latched in the save area and should be re-executed
    /// when the process is next dispatched.
    pub pending_syscall: bool,
    pub wake_time: Interval,
    /// Top-level mapping table, lazily produced from the address space.
    pub mapping_tab: Option<MapRef>,
}

impl ProcessFrame {
    pub fn cap_slot(&self, slot: ProcSlot) -> &Capability {
        match slot {
            ProcSlot::AddrSpace => &self.state.addr_space,
            ProcSlot::Schedule => &self.state.schedule,
            ProcSlot::Brand => &self.state.brand,
            ProcSlot::Cohort => &self.state.cohort,
            ProcSlot::IoSpace => &self.state.io_space,
            ProcSlot::Handler => &self.state.handler,
        }
    }

    pub fn cap_slot_mut(&mut self, slot: ProcSlot) -> &mut Capability {
        match slot {
            ProcSlot::AddrSpace => &mut self.state.addr_space,
            ProcSlot::Schedule => &mut self.state.schedule,
            ProcSlot::Brand => &mut self.state.brand,
            ProcSlot::Cohort => &mut self.state.cohort,
            ProcSlot::IoSpace => &mut self.state.io_space,
            ProcSlot::Handler => &mut self.state.handler,
        }
    }
}

impl FrameBody for ProcessFrame {
    const OB_TYPE: ObType = ObType::Process;
}

/// An endpoint frame.
#[derive(Default)]
pub struct EndpointFrame {
    /// Entry capabilities must match `prot_payload` to get through.
    pub pm: bool,
    pub prot_payload: u32,
    pub endpoint_id: u64,
    /// Must be a Process or Null capability.
    pub recipient: Capability,
}

impl FrameBody for EndpointFrame {
    const OB_TYPE: ObType = ObType::Endpoint;
}
