// SPDX-License-Identifier: MPL-2.0

//! The system-call surface: invocation control word layout, parameter-word
//! indices, result codes, fault codes, kernel interface types, and the
//! order codes of every kernel capability interface.

use crate::types::Word;

pub const SC_INVOKE_CAP: Word = 0;
pub const SC_COPY_CAP: Word = 2;
pub const SC_YIELD: Word = 3;

/// Bit layout of IPW0 for InvokeCap:
///
/// ```text
///          22 21 20 19 18 17 16 15 14 13 12 11 10  9 8   7 6   4 3  0
/// +------------+--+--+--+--+--+--+--+--+--+--+-----+-----+-----+----+
/// |reserved (0)|EX|CO|AC|SC|RC|SP|RP|CW|NB|AS|SG| lrc | lsc | ldw |nr |
/// +------------+--+--+--+--+--+--+--+--+--+--+-----+-----+-----+----+
/// ```
pub mod ipw0 {
    use crate::types::Word;

    pub const NR_MASK: Word = 0x000000f;
    pub const LDW_MASK: Word = 0x0000070;
    pub const LSC_MASK: Word = 0x0000180;
    pub const LRC_MASK: Word = 0x0000600;

    pub const SG: Word = 0x0000800;
    pub const AS: Word = 0x0001000;
    pub const NB: Word = 0x0002000;
    pub const CW: Word = 0x0004000;
    pub const RP: Word = 0x0008000;
    pub const SP: Word = 0x0010000;
    pub const RC: Word = 0x0020000;
    pub const SC: Word = 0x0040000;
    pub const AC: Word = 0x0080000;
    pub const CO: Word = 0x0100000;
    pub const EX: Word = 0x0200000;

    /// Input control bits preserved on completion of the receive phase.
    pub const PRESERVE: Word = LRC_MASK | AS | AC | CO | EX;

    pub fn nr(w: Word) -> Word {
        w & NR_MASK
    }

    pub fn ldw(w: Word) -> usize {
        ((w & LDW_MASK) >> 4) as usize
    }

    pub fn make_ldw(ldw: usize) -> Word {
        ((ldw as Word) & 0x7) << 4
    }

    pub fn with_ldw(w: Word, ldw: usize) -> Word {
        (w & !LDW_MASK) | make_ldw(ldw)
    }

    pub fn lsc(w: Word) -> usize {
        ((w & LSC_MASK) >> 7) as usize
    }

    pub fn make_lsc(lsc: usize) -> Word {
        ((lsc as Word) & 0x3) << 7
    }

    pub fn lrc(w: Word) -> usize {
        ((w & LRC_MASK) >> 9) as usize
    }

    pub fn make_lrc(lrc: usize) -> Word {
        ((lrc as Word) & 0x3) << 9
    }
}

/// Parameter word holding the ICW (doubles as data word 0).
pub const IPW_ICW: usize = 0;
/// Parameter word holding the order code.
pub const IPW_OPCODE: usize = 1;

pub const COYOTOS_MAX_SNDLEN: u32 = 65536;

/// Invocation result codes, delivered in the exception data-word pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum Rc {
    Ok = 0,
    /// Malformed request.
    RequestError = 1,
    /// Opcode not implemented by this capability type.
    UnknownRequest = 2,
    /// Restriction or type mismatch.
    NoAccess = 3,
    InvalidDataReference = 4,
    MalformedSpace = 5,
    AccessViolation = 6,
    NoSuchSlot = 7,
    CapAccessTypeError = 8,
    LimitReached = 9,
    RangeErr = 10,
    RequestWouldBlock = 11,
    Closed = 12,
}

/// Memory fault codes, as recorded in a process's fault state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum FaultCode {
    NoFault = 0,
    InvalidDataReference = 1,
    AccessViolation = 2,
    MalformedSpace = 3,
}

impl FaultCode {
    pub fn to_rc(self) -> Rc {
        match self {
            FaultCode::NoFault => Rc::Ok,
            FaultCode::InvalidDataReference => Rc::InvalidDataReference,
            FaultCode::AccessViolation => Rc::AccessViolation,
            FaultCode::MalformedSpace => Rc::MalformedSpace,
        }
    }
}

/// Kernel interface types, returned by `getType`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum Ikt {
    Null = 0,
    Window = 1,
    LocalWindow = 2,
    Background = 3,
    Discrim = 4,
    CapBits = 5,
    KernLog = 6,
    IrqWait = 7,
    Sleep = 8,
    SysCtl = 9,
    Range = 10,
    Schedule = 11,
    Endpoint = 16,
    Entry = 17,
    AppInt = 18,
    AppNotice = 19,
    Page = 20,
    CapPage = 21,
    Gpt = 22,
    Process = 23,
}

impl Ikt {
    pub fn of(ty: crate::cap::CapType) -> Ikt {
        use crate::cap::CapType as T;
        match ty {
            T::Null => Ikt::Null,
            T::Window => Ikt::Window,
            T::LocalWindow => Ikt::LocalWindow,
            T::Background => Ikt::Background,
            T::Discrim => Ikt::Discrim,
            T::CapBits => Ikt::CapBits,
            T::KernLog => Ikt::KernLog,
            T::IrqWait => Ikt::IrqWait,
            T::Sleep => Ikt::Sleep,
            T::SysCtl => Ikt::SysCtl,
            T::Range => Ikt::Range,
            T::Schedule => Ikt::Schedule,
            T::Endpoint => Ikt::Endpoint,
            T::Entry => Ikt::Entry,
            T::AppInt => Ikt::AppInt,
            T::AppNotice => Ikt::AppNotice,
            T::Page => Ikt::Page,
            T::CapPage => Ikt::CapPage,
            T::Gpt => Ikt::Gpt,
            T::Process => Ikt::Process,
        }
    }
}

/// Order codes, grouped by interface.
pub mod oc {
    use crate::types::Word;

    // Cap
    pub const CAP_GET_TYPE: Word = 1;
    pub const CAP_DESTROY: Word = 2;

    // Memory
    pub const MEMORY_REDUCE: Word = 16;
    pub const MEMORY_GET_RESTRICTIONS: Word = 17;
    pub const MEMORY_GET_GUARD: Word = 18;
    pub const MEMORY_SET_GUARD: Word = 19;

    // AddressSpace
    pub const ADDR_SPACE_GET_SLOT: Word = 32;
    pub const ADDR_SPACE_SET_SLOT: Word = 33;
    pub const ADDR_SPACE_GUARDED_SET_SLOT: Word = 34;
    pub const ADDR_SPACE_FETCH: Word = 35;
    pub const ADDR_SPACE_STORE: Word = 36;
    pub const ADDR_SPACE_EXTENDED_FETCH: Word = 37;
    pub const ADDR_SPACE_EXTENDED_STORE: Word = 38;
    pub const ADDR_SPACE_COPY_FROM: Word = 39;
    pub const ADDR_SPACE_ERASE: Word = 40;

    // GPT
    pub const GPT_GET_L2V: Word = 48;
    pub const GPT_SET_L2V: Word = 49;
    pub const GPT_GET_HANDLER: Word = 50;
    pub const GPT_SET_HANDLER: Word = 51;
    pub const GPT_GET_BACKGROUND: Word = 52;
    pub const GPT_SET_BACKGROUND: Word = 53;

    // Process
    pub const PROCESS_GET_CAP_REG: Word = 64;
    pub const PROCESS_SET_CAP_REG: Word = 65;
    pub const PROCESS_GET_STATE: Word = 66;
    pub const PROCESS_RESUME: Word = 67;
    pub const PROCESS_SET_FAULT: Word = 68;
    pub const PROCESS_GET_SLOT: Word = 69;
    pub const PROCESS_SET_SLOT: Word = 70;
    pub const PROCESS_GET_REGS: Word = 71;
    pub const PROCESS_SET_REGS: Word = 72;
    pub const PROCESS_GET_FLOAT_REGS: Word = 73;
    pub const PROCESS_SET_FLOAT_REGS: Word = 74;

    // Endpoint
    pub const ENDPOINT_SET_RECIPIENT: Word = 80;
    pub const ENDPOINT_SET_PAYLOAD_MATCH: Word = 81;
    pub const ENDPOINT_SET_EPID: Word = 82;
    pub const ENDPOINT_GET_EPID: Word = 83;
    pub const ENDPOINT_MAKE_ENTRY_CAP: Word = 84;
    pub const ENDPOINT_MAKE_APP_NOTIFIER: Word = 85;

    // Range
    pub const RANGE_NEXT_BACKED_SUBRANGE: Word = 96;
    pub const RANGE_IDENTIFY: Word = 97;
    pub const RANGE_RESCIND: Word = 98;
    pub const RANGE_GET_CAP: Word = 99;
    pub const RANGE_WAIT_CAP: Word = 100;
    pub const RANGE_GET_PROCESS: Word = 101;
    pub const RANGE_WAIT_PROCESS: Word = 102;

    // Discrim
    pub const DISCRIM_CLASSIFY: Word = 112;
    pub const DISCRIM_IS_DISCREET: Word = 113;
    pub const DISCRIM_COMPARE: Word = 114;

    // CapBits
    pub const CAPBITS_GET: Word = 120;

    // KernLog
    pub const KERNLOG_LOG: Word = 128;

    // Sleep
    pub const SLEEP_TILL: Word = 136;
    pub const SLEEP_FOR: Word = 137;

    // SysCtl
    pub const SYSCTL_HALT: Word = 144;
    pub const SYSCTL_POWERDOWN: Word = 145;
    pub const SYSCTL_REBOOT: Word = 146;

    // IrqWait
    pub const IRQ_WAIT: Word = 152;
    pub const IRQ_ENABLE: Word = 153;
    pub const IRQ_DISABLE: Word = 154;

    // AppInt
    pub const APPINT_POST_INTERRUPT: Word = 160;

    // AppNotice
    pub const APPNOTICE_POST_NOTICE: Word = 168;
    pub const APPNOTICE_GET_NOTICES: Word = 169;
}

/// Object type codes used by the Range interface.
pub mod range_ob_type {
    pub const INVALID: u32 = 0;
    pub const PAGE: u32 = 1;
    pub const CAP_PAGE: u32 = 2;
    pub const GPT: u32 = 3;
    pub const PROCESS: u32 = 4;
    pub const ENDPOINT: u32 = 5;
}

/// Capability classes reported by `Discrim.classify`.
pub mod cap_class {
    pub const NULL: u32 = 0;
    pub const WINDOW: u32 = 1;
    pub const MEMORY: u32 = 2;
    pub const SCHED: u32 = 3;
    pub const ENDPOINT: u32 = 4;
    pub const ENTRY: u32 = 5;
    pub const PROCESS: u32 = 6;
    pub const APP_NOTICE: u32 = 7;
    pub const OTHER: u32 = 8;
}
