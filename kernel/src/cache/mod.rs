// SPDX-License-Identifier: MPL-2.0

//! The kernel object cache.
//!
//! Each frame type has a fixed pool sized at boot. A pool is a header
//! vector, a body vector behind short-section locks, and the aging state
//! that tracks which frames are active, being checked, or reclaimable.

pub mod age;
pub mod hash;
pub mod store;

use spin::Mutex;

use crate::{
    cache::age::Aging,
    obj::{
        frames::{CapPageFrame, EndpointFrame, FrameBody, GptFrame, PageFrame, ProcessFrame},
        Header, ObRef, ObType,
    },
    prelude::*,
    types::{Oid, Paddr, PAGE_SIZE},
};

/// Base physical address of the page frame array in the hosted machine
/// model. Real ports take this from the physical memory map.
pub const PAGE_SPACE_BASE: Paddr = 0x10_0000;

/// OIDs at or above this base name physical page frames directly.
pub const PHYS_OID_START: Oid = 0xff00_0000_0000_0000;

/// One typed frame pool.
pub struct FramePool<B: FrameBody> {
    hdrs: Vec<Header>,
    bodies: Vec<Mutex<B>>,
    pub aging: Mutex<Aging>,
    /// One greater than the largest backed OID for this type.
    pub max_oid: Oid,
}

impl<B: FrameBody> FramePool<B> {
    pub fn new(count: usize, max_oid: Oid) -> Self {
        let mut hdrs = Vec::with_capacity(count);
        let mut bodies = Vec::with_capacity(count);
        for _ in 0..count {
            hdrs.push(Header::default());
            bodies.push(Mutex::new(B::default()));
        }
        FramePool {
            hdrs,
            bodies,
            aging: Mutex::new(Aging::new(count)),
            max_oid,
        }
    }

    pub fn count(&self) -> usize {
        self.hdrs.len()
    }

    pub fn hdr(&self, slot: u32) -> &Header {
        &self.hdrs[slot as usize]
    }

    pub fn body(&self, slot: u32) -> &Mutex<B> {
        &self.bodies[slot as usize]
    }

    /// Run `f` over the body of a frame under its short-section lock.
    pub fn with_body<R>(&self, slot: u32, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.bodies[slot as usize].lock())
    }
}

/// Pool sizes, fixed at boot.
#[derive(Clone, Copy, Debug)]
pub struct CacheSizes {
    pub npage: usize,
    pub ncappage: usize,
    pub ngpt: usize,
    pub nproc: usize,
    pub nendpt: usize,
    pub nmapping: usize,
    pub ndepend: usize,
    pub note: usize,
}

impl CacheSizes {
    /// Derive defaults from the page budget: a handful of pages per
    /// process, and book-keeping structures in proportion.
    pub fn from_pages(npage: usize) -> Self {
        let nproc = (npage / 16).max(4);
        CacheSizes {
            npage,
            ncappage: (npage / 4).max(4),
            ngpt: (nproc * 4).max(8),
            nproc,
            nendpt: (nproc * 2).max(4),
            nmapping: (nproc * 4).max(8),
            ndepend: (npage * 2).max(64),
            note: (npage * 4).max(64),
        }
    }
}

impl Default for CacheSizes {
    fn default() -> Self {
        CacheSizes::from_pages(64)
    }
}

/// All typed frame pools.
pub struct Cache {
    pub pages: FramePool<PageFrame>,
    pub cap_pages: FramePool<CapPageFrame>,
    pub gpts: FramePool<GptFrame>,
    pub procs: FramePool<ProcessFrame>,
    pub endpoints: FramePool<EndpointFrame>,
}

/// Dispatch to the pool for an object type, binding it as `$p`.
///
/// The body may only use the type-independent pool surface (headers,
/// aging); typed body access goes through the concrete pool fields.
macro_rules! with_pool {
    ($cache:expr, $ty:expr, $p:ident => $body:expr) => {
        match $ty {
            $crate::obj::ObType::Page => {
                let $p = &$cache.pages;
                $body
            }
            $crate::obj::ObType::CapPage => {
                let $p = &$cache.cap_pages;
                $body
            }
            $crate::obj::ObType::Gpt => {
                let $p = &$cache.gpts;
                $body
            }
            $crate::obj::ObType::Process => {
                let $p = &$cache.procs;
                $body
            }
            $crate::obj::ObType::Endpoint => {
                let $p = &$cache.endpoints;
                $body
            }
        }
    };
}
pub(crate) use with_pool;

impl Cache {
    pub fn new(sizes: &CacheSizes, max_oids: [Oid; crate::obj::NUM_OB_TYPES]) -> Self {
        let cache = Cache {
            pages: FramePool::new(sizes.npage, max_oids[ObType::Page as usize]),
            cap_pages: FramePool::new(sizes.ncappage, max_oids[ObType::CapPage as usize]),
            gpts: FramePool::new(sizes.ngpt, max_oids[ObType::Gpt as usize]),
            procs: FramePool::new(sizes.nproc, max_oids[ObType::Process as usize]),
            endpoints: FramePool::new(sizes.nendpt, max_oids[ObType::Endpoint as usize]),
        };

        // Page frames get their placement once, at boot.
        for slot in 0..cache.pages.count() as u32 {
            cache.pages.with_body(slot, |pg| {
                pg.pa = PAGE_SPACE_BASE + slot as u64 * PAGE_SIZE as u64;
            });
        }
        cache
    }

    pub fn hdr(&self, obref: ObRef) -> &Header {
        with_pool!(self, obref.ty, p => p.hdr(obref.slot))
    }

    pub fn count(&self, ty: ObType) -> usize {
        with_pool!(self, ty, p => p.count())
    }

    pub fn max_oid(&self, ty: ObType) -> Oid {
        with_pool!(self, ty, p => p.max_oid)
    }

    /// Find the page frame that owns physical address `pa`.
    pub fn page_by_pa(&self, pa: Paddr) -> Option<ObRef> {
        if pa < PAGE_SPACE_BASE || pa % PAGE_SIZE as u64 != 0 {
            return None;
        }
        let slot = (pa - PAGE_SPACE_BASE) / PAGE_SIZE as u64;
        if (slot as usize) < self.pages.count() {
            Some(ObRef {
                ty: ObType::Page,
                slot: slot as u32,
            })
        } else {
            None
        }
    }
}
