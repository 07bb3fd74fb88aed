// SPDX-License-Identifier: MPL-2.0

//! Transaction-scoped mutual exclusion.
//!
//! A [`TransMutex`] is a single word stamped with `(generation, kind, cpu)`
//! when held. The stamp equals the owning CPU's current lock value, so a
//! held lock becomes logically free the moment its owner bumps its lock
//! generation; nobody ever walks the set of held locks to release them.
//! Recursive acquisition by the owning CPU is permitted and is a no-op.
//!
//! The release token ([`HoldInfo`]) records the word to restore for the rare
//! paths that release a lock early, before the end-of-transaction gang
//! release.

use core::sync::atomic::{AtomicU32, Ordering};

use bit_field::BitField;

use crate::{cpu::Cpu, obj::ObRef, sched::Abandon};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum LockKind {
    Free = 0,
    Transient = 1,
}

/// Pack a lock stamp word: generation in bits 12.., kind in bits 8..12,
/// CPU id in bits 0..8.
pub fn lock_value(generation: u32, kind: LockKind, cpu: u32) -> u32 {
    let mut v = 0u32;
    v.set_bits(12.., generation & 0xf_ffff);
    v.set_bits(8..12, kind as u32);
    v.set_bits(0..8, cpu);
    v
}

pub fn lock_generation(v: u32) -> u32 {
    v.get_bits(12..)
}

pub fn lock_kind(v: u32) -> u32 {
    v.get_bits(8..12)
}

pub fn lock_cpu(v: u32) -> u32 {
    v.get_bits(0..8)
}

/// Token for early release of a transaction lock.
#[derive(Clone, Copy, Debug)]
pub struct HoldInfo {
    pub obref: ObRef,
    pub(crate) old_value: u32,
}

/// A generation-valued transaction lock.
pub struct TransMutex {
    word: AtomicU32,
}

impl Default for TransMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl TransMutex {
    pub const fn new() -> Self {
        TransMutex {
            word: AtomicU32::new(0),
        }
    }

    /// One acquisition attempt against the observed value `cur`.
    ///
    /// Returns `Ok(release_word)` on success, `Err(newly_observed)` on
    /// failure. A stamp from a gang-released generation counts as free and
    /// the release word preserves it, so early release restores exactly the
    /// state the owner left behind.
    fn try_lock_once(
        &self,
        cur: u32,
        my_value: u32,
        owner_value_of: impl Fn(u32) -> u32,
    ) -> core::result::Result<u32, u32> {
        let mut cas_against = 0;

        if lock_kind(cur) == LockKind::Transient as u32 {
            if cur == my_value {
                // Recursive acquisition by the owning CPU.
                return Ok(cur);
            }
            if cur != owner_value_of(lock_cpu(cur)) {
                // Stale stamp: the owner gang-released this lock.
                cas_against = cur;
            }
        }

        match self
            .word
            .compare_exchange(cas_against, my_value, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(cas_against),
            Err(seen) => Err(seen),
        }
    }

    /// Grab the lock for the current transaction, spinning until it is
    /// available. If a remote CPU has asked us to defer, the transaction is
    /// abandoned instead of spinning.
    pub fn grab(
        &self,
        cpu: &Cpu,
        obref: ObRef,
        owner_value_of: impl Fn(u32) -> u32 + Copy,
    ) -> core::result::Result<HoldInfo, Abandon> {
        let my_value = cpu.proc_mutex_value();
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            match self.try_lock_once(cur, my_value, owner_value_of) {
                Ok(old_value) => {
                    return Ok(HoldInfo { obref, old_value });
                }
                Err(seen) => {
                    cur = seen;
                    if cpu.should_defer.load(Ordering::Relaxed) {
                        return Err(Abandon::Park);
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }

    pub fn try_grab(
        &self,
        cpu: &Cpu,
        obref: ObRef,
        owner_value_of: impl Fn(u32) -> u32,
    ) -> Option<HoldInfo> {
        let my_value = cpu.proc_mutex_value();
        let cur = self.word.load(Ordering::Relaxed);
        self.try_lock_once(cur, my_value, owner_value_of)
            .ok()
            .map(|old_value| HoldInfo { obref, old_value })
    }

    pub fn is_held_by(&self, cpu: &Cpu) -> bool {
        self.word.load(Ordering::Relaxed) == cpu.proc_mutex_value()
    }

    /// Early release. The normal path never calls this; locks die in the
    /// end-of-transaction gang release.
    pub fn release(&self, hi: HoldInfo) {
        self.word.store(hi.old_value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{ObRef, ObType};

    fn obref() -> ObRef {
        ObRef {
            ty: ObType::Process,
            slot: 0,
        }
    }

    #[test]
    fn grab_release_and_regrab() {
        let cpu = Cpu::new(0);
        let m = TransMutex::new();
        let owner = |_c: u32| cpu.proc_mutex_value();

        let hi = m.grab(&cpu, obref(), owner).unwrap();
        assert!(m.is_held_by(&cpu));
        // Recursive grab succeeds and does not change the stamp.
        let _hi2 = m.grab(&cpu, obref(), owner).unwrap();
        m.release(hi);
        assert!(!m.is_held_by(&cpu));
    }

    #[test]
    fn gang_release_frees_stale_stamp() {
        let cpu0 = Cpu::new(0);
        let cpu1 = Cpu::new(1);
        let m = TransMutex::new();

        let v0 = cpu0.proc_mutex_value();
        let _ = m.grab(&cpu0, obref(), |c| if c == 0 { v0 } else { 0 }).unwrap();

        // cpu0 abandons: its generation bump releases the lock without
        // touching the word.
        cpu0.bump_lock_generation();

        let hi = m
            .try_grab(&cpu1, obref(), |c| {
                if c == 0 {
                    cpu0.proc_mutex_value()
                } else {
                    cpu1.proc_mutex_value()
                }
            })
            .expect("stale transient lock should be reclaimable");
        assert!(m.is_held_by(&cpu1));
        // The preserved release word is the stale stamp of cpu0.
        assert_eq!(lock_cpu(hi.old_value), 0);
    }
}
