// SPDX-License-Identifier: MPL-2.0

//! The abstract AddressSpace interface.
//!
//! Every operation defined here is personalized to the concrete object, so
//! there is no common implementation; the concrete handlers own the
//! opcodes and everything else falls through to Memory.

use crate::{
    ipc::param::{HandlerResult, InvParam},
    sched::Tx,
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    super::memory::handle(tx, ip)
}
