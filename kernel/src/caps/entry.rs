// SPDX-License-Identifier: MPL-2.0

//! Entry capability operations.

use crate::{
    ipc::param::{HandlerResult, InvError, InvParam},
    sched::{Abandon, Tx},
};

/// No opcodes are implemented by Entry capabilities.
///
/// Reaching this handler means invocation resolution declined the
/// rendezvous without consuming the capability; the thing to do is wait
/// for conditions on the endpoint to change.
pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    if let Some(ep) = ip.icap.cap.prep_target() {
        let oid = k.cache.hdr(ep).meta().oid;
        let qid = k.ob_stall_queue(oid);
        k.enqueue_current_on(tx, qid);
    }
    Err(InvError::Yield(Abandon::Park))
}
