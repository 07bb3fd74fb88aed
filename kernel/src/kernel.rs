// SPDX-License-Identifier: MPL-2.0

//! The process-wide kernel state and the dispatch driver.
//!
//! All mutable kernel state hangs off a single [`Kernel`] value constructed
//! once during boot and accessed by shared reference thereafter; interior
//! mutability is confined to the documented lock disciplines (transaction
//! locks on headers, short-section spinlocks on everything else).

use alloc::string::String;

use spin::Mutex;

use crate::{
    cache::{hash::ObHash, Cache, CacheSizes},
    cap::Capability,
    cpu::Cpu,
    hal::{Hal, ObjectStore},
    interval::IntervalClock,
    irq::VectorTable,
    mm::{depend::DependTable, mapping::MappingPool, revmap::RevMap},
    obj::{frames::RunState, ObRef, ObType, OtTable},
    prelude::*,
    sched::{
        mutex::HoldInfo,
        queue::{QueueId, StallQueue},
        Abandon, Tx, Txr,
    },
    types::{Interval, Oid, Word},
};

pub const N_OBSTALLQUEUE: usize = 128;

/// Everything needed to bring the nucleus up.
pub struct BootSpec {
    pub hal: Box<dyn Hal>,
    pub store: Box<dyn ObjectStore>,
    pub ncpu: usize,
    /// Kernel command line; recognized keys override the derived sizes.
    pub cmdline: String,
    pub sizes: CacheSizes,
    /// One greater than the largest backed OID, per frame type.
    pub max_oids: [Oid; crate::obj::NUM_OB_TYPES],
}

/// What happened when the dispatcher ran a process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DispatchOutcome {
    /// The invocation ran to completion; the process returns to user mode.
    Completed,
    /// The process parked on a stall queue or entered receiving state.
    Parked,
    /// Nothing was runnable.
    Idle,
}

pub struct Kernel {
    pub(crate) hal: Box<dyn Hal>,
    pub(crate) store: Box<dyn ObjectStore>,

    pub(crate) cache: Cache,
    pub(crate) obhash: ObHash,
    pub(crate) ot: OtTable,

    pub(crate) depend: DependTable,
    pub(crate) revmap: RevMap,
    pub(crate) mappings: MappingPool,

    pub(crate) cpus: Vec<Cpu>,
    current: Vec<Mutex<Option<ObRef>>>,

    pub(crate) ready: StallQueue,
    ob_stall: Vec<StallQueue>,
    rcv_wait: Vec<StallQueue>,
    pub(crate) sleepers: StallQueue,
    pub(crate) vectors: VectorTable,
    pub(crate) clock: IntervalClock,
}

impl Kernel {
    /// Construct and initialize the kernel state in the strict boot order:
    /// HAL is ready before this is called; then caches, object hash,
    /// tables, vectors.
    pub fn new(spec: BootSpec) -> Self {
        let sizes = crate::boot::cmdline::apply_options(&spec.cmdline, spec.sizes);
        info!(
            "cache sizes: {} pages, {} cappages, {} gpts, {} procs, {} endpoints",
            sizes.npage, sizes.ncappage, sizes.ngpt, sizes.nproc, sizes.nendpt
        );

        let cache = Cache::new(&sizes, spec.max_oids);
        let nproc = cache.procs.count();

        Kernel {
            hal: spec.hal,
            store: spec.store,
            obhash: ObHash::new(),
            ot: OtTable::new(sizes.note),
            depend: DependTable::new(sizes.ndepend),
            revmap: RevMap::new(sizes.ndepend),
            mappings: MappingPool::new(sizes.nmapping),
            cpus: (0..spec.ncpu as u32).map(Cpu::new).collect(),
            current: (0..spec.ncpu).map(|_| Mutex::new(None)).collect(),
            ready: StallQueue::new(),
            ob_stall: (0..N_OBSTALLQUEUE).map(|_| StallQueue::new()).collect(),
            rcv_wait: (0..nproc).map(|_| StallQueue::new()).collect(),
            sleepers: StallQueue::new(),
            vectors: VectorTable::new(),
            clock: IntervalClock::new(),
            cache,
        }
    }

    pub fn hal(&self) -> &dyn Hal {
        &*self.hal
    }

    pub fn cpu(&self, cpu: u32) -> &Cpu {
        &self.cpus[cpu as usize]
    }

    pub fn current(&self, cpu: u32) -> Option<ObRef> {
        *self.current[cpu as usize].lock()
    }

    pub(crate) fn set_current(&self, cpu: u32, p: Option<ObRef>) {
        *self.current[cpu as usize].lock() = p;
    }

    // ------------------------------------------------------------------
    // Header locks
    // ------------------------------------------------------------------

    pub(crate) fn grab_header_lock(&self, cpu: u32, obref: ObRef) -> Txr<HoldInfo> {
        self.cache
            .hdr(obref)
            .lock
            .grab(self.cpu(cpu), obref, |c| self.cpus[c as usize].proc_mutex_value())
    }

    pub(crate) fn release_header_lock(&self, hi: HoldInfo) {
        self.cache.hdr(hi.obref).lock.release(hi);
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub(crate) fn queue(&self, qid: QueueId) -> &StallQueue {
        match qid {
            QueueId::Ready => &self.ready,
            QueueId::ObStall(i) => &self.ob_stall[i as usize],
            QueueId::RcvWait(slot) => &self.rcv_wait[slot as usize],
            QueueId::Vector(v) => self.vectors.stall_queue(v as u32),
            QueueId::Sleepers => &self.sleepers,
        }
    }

    /// The shared stall bucket for an object, hashed by OID.
    pub(crate) fn ob_stall_queue(&self, oid: Oid) -> QueueId {
        QueueId::ObStall((oid % N_OBSTALLQUEUE as u64) as u8)
    }

    /// Park the current process on `qid`. The caller abandons right after.
    pub(crate) fn enqueue_current_on(&self, tx: &Tx<'_>, qid: QueueId) {
        tx.assert_uncommitted();
        let p = tx.current();
        self.cache.procs.with_body(p.slot, |body| {
            debug_assert!(body.on_q.is_none());
            body.on_q = Some(qid);
        });
        self.queue(qid).push_back(p);
    }

    /// Move every process on `qid` to the ready queue.
    pub(crate) fn wake_all(&self, qid: QueueId) {
        let woken = self.queue(qid).drain();
        for p in woken {
            self.cache.procs.with_body(p.slot, |body| {
                body.on_q = Some(QueueId::Ready);
            });
            self.ready.push_back(p);
        }
    }

    /// Remove a process from whatever queue it is on, without making it
    /// runnable.
    pub(crate) fn unlink_from_queue(&self, p: ObRef) {
        let on_q = self.cache.procs.with_body(p.slot, |body| body.on_q.take());
        if let Some(qid) = on_q {
            self.queue(qid).unlink(p);
        }
    }

    /// Move one parked process to the ready queue, wherever it sleeps.
    /// No effect if it is not asleep or is already ready.
    pub(crate) fn unsleep(&self, p: ObRef) {
        let on_q = self.cache.procs.with_body(p.slot, |body| body.on_q);
        match on_q {
            None | Some(QueueId::Ready) => {}
            Some(qid) => {
                if self.queue(qid).unlink(p) {
                    self.cache.procs.with_body(p.slot, |body| {
                        body.on_q = Some(QueueId::Ready);
                    });
                    self.ready.push_back(p);
                }
            }
        }
    }

    pub(crate) fn ready_add(&self, p: ObRef, at_front: bool) {
        self.cache.procs.with_body(p.slot, |body| {
            body.on_q = Some(QueueId::Ready);
        });
        if at_front {
            self.ready.push_front(p);
        } else {
            self.ready.push_back(p);
        }
    }

    /// Resume a receiving process: mark it running and make it ready.
    pub(crate) fn resume_process(&self, p: ObRef) {
        self.cache.procs.with_body(p.slot, |body| {
            debug_assert!(body.on_q.is_none());
            body.state.run_state = RunState::Running;
            body.pending_syscall = false;
        });
        self.ready_add(p, false);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one process off the ready queue to its next yield.
    pub fn dispatch(&self, cpu: u32) -> DispatchOutcome {
        let Some(p) = self.ready.pop_front() else {
            return DispatchOutcome::Idle;
        };
        let pending = self.cache.procs.with_body(p.slot, |body| {
            body.on_q = None;
            body.on_cpu = Some(cpu);
            body.pending_syscall
        });
        if !pending {
            // Nothing latched: the process just returns to user mode.
            self.cache.procs.with_body(p.slot, |body| body.on_cpu = None);
            return DispatchOutcome::Completed;
        }
        self.run_process(cpu, p)
    }

    /// Drive `p` through its latched invocation, handling restart and
    /// abandon outcomes.
    pub fn run_process(&self, cpu: u32, p: ObRef) -> DispatchOutcome {
        self.set_current(cpu, Some(p));
        self.cache.procs.with_body(p.slot, |body| body.on_cpu = Some(cpu));
        loop {
            let mut tx = Tx::new(self, cpu, Some(p));
            let r = crate::ipc::invoke::do_syscall(&mut tx);
            // Transaction over: everything this CPU stamped is released.
            tx.release_all_locks();
            match r {
                Ok(()) => {
                    self.cache.procs.with_body(p.slot, |body| {
                        body.pending_syscall = false;
                        body.on_cpu = None;
                    });
                    self.set_current(cpu, None);
                    return DispatchOutcome::Completed;
                }
                Err(Abandon::Restart) => {
                    trace!("restarting transaction for {:?}", p);
                    continue;
                }
                Err(Abandon::Park) => {
                    self.cache.procs.with_body(p.slot, |body| {
                        body.on_cpu = None;
                    });
                    self.set_current(cpu, None);
                    return DispatchOutcome::Parked;
                }
            }
        }
    }

    /// Run the ready queue dry.
    pub fn run_until_idle(&self, cpu: u32) {
        while self.dispatch(cpu) != DispatchOutcome::Idle {}
    }

    // ------------------------------------------------------------------
    // External stimuli
    // ------------------------------------------------------------------

    /// An interrupt arrived on `irq`.
    pub fn deliver_irq(&self, irq: u32) {
        let wake = {
            let mut v = self.vectors.vector(irq).lock();
            v.count += 1;
            v.pending = true;
            v.disable_count == 0
        };
        self.hal.irq_ack(irq);
        if wake {
            self.wake_all(QueueId::Vector(irq as u8));
        }
    }

    /// The timer tick: advance the clock and run due wakeups.
    pub fn timer_tick(&self, now: Interval) {
        self.clock.set_now(now);
        if self.clock.take_due_wakeup() {
            self.wake_all(QueueId::Sleepers);
        }
    }

    // ------------------------------------------------------------------
    // Test-harness conveniences
    // ------------------------------------------------------------------

    /// Materialize `(ty, oid)` in the cache without a current process, as
    /// boot-time seeding does. Returns None if the OID is unbacked or the
    /// cache cannot make room.
    pub fn materialize(&self, ty: ObType, oid: Oid) -> Option<ObRef> {
        let tx = Tx::new(self, 0, None);
        let r = self.require_object(&tx, ty, oid, false).ok().flatten();
        self.cpu(0).bump_lock_generation();
        r
    }

    /// Run a closure over a process frame.
    pub fn with_process<R>(
        &self,
        p: ObRef,
        f: impl FnOnce(&mut crate::obj::frames::ProcessFrame) -> R,
    ) -> R {
        debug_assert_eq!(p.ty, ObType::Process);
        self.cache.procs.with_body(p.slot, f)
    }

    /// Run a closure over a GPT frame.
    pub fn with_gpt<R>(
        &self,
        g: ObRef,
        f: impl FnOnce(&mut crate::obj::frames::GptFrame) -> R,
    ) -> R {
        debug_assert_eq!(g.ty, ObType::Gpt);
        self.cache.gpts.with_body(g.slot, f)
    }

    /// Run a closure over a capability-page frame.
    pub fn with_cap_page<R>(
        &self,
        cp: ObRef,
        f: impl FnOnce(&mut crate::obj::frames::CapPageFrame) -> R,
    ) -> R {
        debug_assert_eq!(cp.ty, ObType::CapPage);
        self.cache.cap_pages.with_body(cp.slot, f)
    }

    /// Run a closure over an endpoint frame.
    pub fn with_endpoint<R>(
        &self,
        ep: ObRef,
        f: impl FnOnce(&mut crate::obj::frames::EndpointFrame) -> R,
    ) -> R {
        debug_assert_eq!(ep.ty, ObType::Endpoint);
        self.cache.endpoints.with_body(ep.slot, f)
    }

    /// The generation number of an object, as capabilities see it.
    pub fn alloc_count_of(&self, obref: ObRef) -> u32 {
        self.cache.hdr(obref).meta().alloc_count
    }

    /// The OID of a resident frame.
    pub fn oid_of(&self, obref: ObRef) -> Oid {
        self.cache.hdr(obref).meta().oid
    }

    /// Write bytes into a page frame.
    pub fn write_page(&self, pg: ObRef, off: usize, bytes: &[u8]) {
        debug_assert_eq!(pg.ty, ObType::Page);
        let pa = self.cache.pages.with_body(pg.slot, |b| b.pa);
        self.hal.with_page(pa, &mut |p| {
            p[off..off + bytes.len()].copy_from_slice(bytes);
        });
    }

    /// Read bytes out of a page frame.
    pub fn read_page(&self, pg: ObRef, off: usize, buf: &mut [u8]) {
        debug_assert_eq!(pg.ty, ObType::Page);
        let pa = self.cache.pages.with_body(pg.slot, |b| b.pa);
        self.hal.with_page(pa, &mut |p| {
            buf.copy_from_slice(&p[off..off + buf.len()]);
        });
    }

    /// Whether any hardware PTE (or process top slot) still names a page.
    pub fn page_is_mapped(&self, pg: ObRef) -> bool {
        debug_assert_eq!(pg.ty, ObType::Page);
        self.revmap.has_referents(crate::mm::revmap::RmTarget::Page(pg))
    }

    /// Latch an invocation into a process's save area, as the system-call
    /// entry glue would, and mark it pending.
    pub fn post_syscall(&self, p: ObRef, pw: [Word; 4], pb_va: u64) {
        debug_assert_eq!(p.ty, ObType::Process);
        self.cache.procs.with_body(p.slot, |body| {
            body.regs.pw = pw;
            body.regs.pb_va = pb_va;
            body.pending_syscall = true;
        });
    }

    /// Read a capability register of a process.
    pub fn cap_reg(&self, p: ObRef, idx: usize) -> Capability {
        self.cache.procs.with_body(p.slot, |body| body.state.cap_regs[idx])
    }

    /// Read a register-carried parameter word of a process.
    pub fn reg_pw(&self, p: ObRef, idx: usize) -> Word {
        self.cache.procs.with_body(p.slot, |body| body.regs.pw[idx])
    }
}
