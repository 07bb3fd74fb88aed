// SPDX-License-Identifier: MPL-2.0

//! IrqWait: blocking on hardware interrupt vectors.
//!
//! The interrupt pin this capability speaks for rides in its protected
//! payload. Waiting on a vector with no pending interrupt parks the
//! process on the vector's stall queue and unmasks the pin at the
//! controller on first use.

use crate::{
    ipc::{
        param::{HandlerResult, InvError, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    irq::NUM_IRQ,
    sched::{queue::QueueId, Abandon, Tx},
};

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    let irq = ip.icap.cap.payload;

    if irq as usize >= NUM_IRQ {
        return Err(InvError::Ex(Rc::RequestError));
    }

    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::IrqWait);
            Ok(())
        }

        oc::IRQ_WAIT => {
            ip.require_args(k, 0)?;

            {
                let mut v = k.vectors.vector(irq).lock();
                if !v.pending {
                    if !v.unmasked {
                        v.unmasked = true;
                        k.hal().irq_unmask(irq);
                    }
                    drop(v);
                    k.enqueue_current_on(tx, QueueId::Vector(irq as u8));
                    return Err(InvError::Yield(Abandon::Park));
                }

                // No capabilities and no strings are involved, so the
                // commit point cannot yield and the vector lock may be
                // held across it. Releasing it here would race another
                // waiter for the pending bit.
                tx.commit_point();
                v.pending = false;
            }

            ip.complete(0);
            Ok(())
        }

        oc::IRQ_ENABLE => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            let wake = {
                let mut v = k.vectors.vector(irq).lock();
                v.disable_count = v.disable_count.saturating_sub(1);
                v.disable_count == 0 && v.pending
            };
            if wake {
                k.wake_all(QueueId::Vector(irq as u8));
            }

            ip.complete(0);
            Ok(())
        }

        oc::IRQ_DISABLE => {
            ip.require_args(k, 0)?;

            tx.commit_point();

            k.vectors.vector(irq).lock().disable_count += 1;

            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
