// SPDX-License-Identifier: MPL-2.0

//! Per-type kernel capability handlers.
//!
//! Dispatch is a tagged function table with an explicit fallthrough chain:
//! a type-specific handler owns its opcodes and hands everything else to
//! the next-broader interface (CapPage falls through to AddressSpace, to
//! Memory, to Cap). `getType` is always overridden; unknown opcodes end in
//! `UnknownRequest`.

pub mod addr_space;
pub mod app_int;
pub mod app_notice;
pub mod cap_bits;
pub mod cap_cap;
pub mod cap_page;
pub mod discrim;
pub mod endpoint;
pub mod entry;
pub mod gpt;
pub mod irq_wait;
pub mod kern_log;
pub mod memory;
pub mod page;
pub mod process;
pub mod range;
pub mod sleep;
pub mod sys_ctl;

use crate::{
    cap::CapType,
    ipc::param::{HandlerResult, InvError, InvParam},
    ipc::syscall::Rc,
    sched::Tx,
};

pub type Handler = fn(&mut Tx<'_>, &mut InvParam) -> HandlerResult<()>;

/// The handler for a capability type.
pub fn handler_for(ty: CapType) -> Handler {
    match ty {
        CapType::Null => null_cap,
        CapType::Window | CapType::LocalWindow | CapType::Background => cap_cap::handle,
        CapType::Schedule => cap_cap::handle,
        CapType::Discrim => discrim::handle,
        CapType::CapBits => cap_bits::handle,
        CapType::KernLog => kern_log::handle,
        CapType::IrqWait => irq_wait::handle,
        CapType::Sleep => sleep::handle,
        CapType::SysCtl => sys_ctl::handle,
        CapType::Range => range::handle,
        CapType::Endpoint => endpoint::handle,
        CapType::Entry => entry::handle,
        CapType::AppInt => app_int::handle,
        CapType::AppNotice => app_notice::handle,
        CapType::Page => page::handle,
        CapType::CapPage => cap_page::handle,
        CapType::Gpt => gpt::handle,
        CapType::Process => process::handle,
    }
}

/// Invoking a Null capability conveys no authority at all; every request
/// is refused. A capability nulled by staleness detection lands here.
fn null_cap(_tx: &mut Tx<'_>, _ip: &mut InvParam) -> HandlerResult<()> {
    Err(InvError::Ex(Rc::NoAccess))
}
