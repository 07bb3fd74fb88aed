// SPDX-License-Identifier: MPL-2.0

//! Sleep capability operations.
//!
//! A sleeping process parks with its invocation still latched, so a
//! wakeup simply re-executes the sleep. To make that re-execution
//! harmless, `sleepFor` first rewrites itself into the equivalent
//! absolute-time `sleepTill` in the caller's parameter words.

use crate::{
    ipc::{
        param::{HandlerResult, InvError, InvParam},
        syscall::{oc, Ikt, Rc},
    },
    sched::{queue::QueueId, Abandon, Tx},
    types::Interval,
};

const USEC_PER_SEC: u32 = 1_000_000;

pub fn handle(tx: &mut Tx<'_>, ip: &mut InvParam) -> HandlerResult<()> {
    let k = tx.k;
    match ip.op_code {
        oc::CAP_GET_TYPE => {
            ip.require_args(k, 0)?;

            tx.commit_point();
            ip.type_reply(Ikt::Sleep);
            Ok(())
        }

        oc::SLEEP_TILL | oc::SLEEP_FOR => {
            let sec = ip.get_iparam32(k);
            let usec = ip.get_iparam32(k);

            ip.require_args(k, 0)?;

            if usec >= USEC_PER_SEC {
                return Err(InvError::Ex(Rc::RequestError));
            }

            let now = k.clock.now();
            let mut wake = Interval {
                epoch: now.epoch,
                sec,
                usec,
            };

            if ip.op_code == oc::SLEEP_FOR {
                wake.sec += now.sec;
                wake.usec += now.usec;
                if wake.usec >= USEC_PER_SEC {
                    wake.usec -= USEC_PER_SEC;
                    wake.sec += 1;
                }

                // In case this restarts for any reason, the latched
                // invocation resumes as an absolute-time sleep.
                k.set_pw(ip.invoker, 1, oc::SLEEP_TILL);
                k.set_pw(ip.invoker, 2, wake.sec as u64);
                k.set_pw(ip.invoker, 3, wake.usec as u64);
            }

            k.cache.procs.with_body(ip.invoker.slot, |b| b.wake_time = wake);

            if wake.is_after(now) {
                k.clock.note_wake_target(wake);
                k.enqueue_current_on(tx, QueueId::Sleepers);
                return Err(InvError::Yield(Abandon::Park));
            }

            tx.commit_point();

            ip.complete(0);
            Ok(())
        }

        _ => super::cap_cap::handle(tx, ip),
    }
}
