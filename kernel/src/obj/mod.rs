// SPDX-License-Identifier: MPL-2.0

//! Object frames and their common header.

pub mod ext;
pub mod frames;

use bitflags::bitflags;
use spin::Mutex;

use crate::{prelude::*, sched::mutex::TransMutex, types::Oid};

/// Types of object cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum ObType {
    Page = 0,
    CapPage = 1,
    Gpt = 2,
    Process = 3,
    Endpoint = 4,
}

pub const NUM_OB_TYPES: usize = 5;

impl ObType {
    pub const ALL: [ObType; NUM_OB_TYPES] = [
        ObType::Page,
        ObType::CapPage,
        ObType::Gpt,
        ObType::Process,
        ObType::Endpoint,
    ];

    pub fn from_u8(v: u8) -> Option<ObType> {
        ObType::ALL.get(v as usize).copied()
    }
}

/// Name of a frame in the object cache: its type and its pool slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObRef {
    pub ty: ObType,
    pub slot: u32,
}

/// Index of an object-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OteIndex(pub u32);

/// An object-table entry: the identity of a frame at the moment some
/// capability was swizzled against it.
#[derive(Clone, Copy, Debug, Default)]
pub struct OtEntry {
    pub oid: Oid,
    pub destroyed: bool,
    pub mark: bool,
}

struct OtTableInner {
    entries: Vec<OtEntry>,
    free: Vec<u32>,
}

/// The object table.
pub struct OtTable {
    inner: Mutex<OtTableInner>,
}

impl OtTable {
    pub fn new(count: usize) -> Self {
        OtTable {
            inner: Mutex::new(OtTableInner {
                entries: vec![OtEntry::default(); count],
                free: (0..count as u32).rev().collect(),
            }),
        }
    }

    pub fn alloc(&self, oid: Oid) -> Result<OteIndex> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.free.pop() else {
            return_errno_with_msg!(NoMemory, "object table exhausted");
        };
        inner.entries[idx as usize] = OtEntry {
            oid,
            destroyed: false,
            mark: false,
        };
        Ok(OteIndex(idx))
    }

    pub fn get(&self, idx: OteIndex) -> OtEntry {
        self.inner.lock().entries[idx.0 as usize]
    }

    pub fn set_destroyed(&self, idx: OteIndex) {
        self.inner.lock().entries[idx.0 as usize].destroyed = true;
    }

    pub fn set_mark(&self, idx: OteIndex) {
        self.inner.lock().entries[idx.0 as usize].mark = true;
    }

    /// Return an entry to the free list. Only safe once no capability can
    /// still name it, which the incremental collector establishes.
    pub fn free(&self, idx: OteIndex) {
        let mut inner = self.inner.lock();
        inner.entries[idx.0 as usize] = OtEntry::default();
        inner.free.push(idx.0);
    }
}

bitflags! {
    /// Header state bits.
    pub struct FrameFlags: u8 {
        /// Most current version of the object.
        const CURRENT       = 0x01;
        /// Involved in a snapshot.
        const SNAPSHOT      = 0x02;
        /// Modified; requires write-back.
        const DIRTY         = 0x04;
        /// Cannot be aged out.
        const PINNED        = 0x08;
        /// A valid capability to this object was deprepared to store form.
        const HAS_DISK_CAPS = 0x10;
    }
}

/// Mutable header fields, guarded by a short-section lock.
#[derive(Clone, Debug)]
pub struct HeaderMeta {
    pub oid: Oid,
    /// Generation number; 20 bits are stored in capabilities.
    pub alloc_count: u32,
    pub ot: Option<OteIndex>,
    /// On the check aging list; the next prepare should upgrade the age.
    pub check_ref: bool,
    pub flags: FrameFlags,
}

impl Default for HeaderMeta {
    fn default() -> Self {
        HeaderMeta {
            oid: 0,
            alloc_count: 0,
            ot: None,
            check_ref: false,
            flags: FrameFlags::empty(),
        }
    }
}

/// The common object header. The transaction lock lives outside the meta
/// mutex so it can be taken without touching frame state.
pub struct Header {
    pub lock: TransMutex,
    pub meta: Mutex<HeaderMeta>,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            lock: TransMutex::new(),
            meta: Mutex::new(HeaderMeta::default()),
        }
    }
}

impl Header {
    pub fn meta(&self) -> HeaderMeta {
        self.meta.lock().clone()
    }

    pub fn set_dirty(&self) {
        let mut m = self.meta.lock();
        debug_assert!(m.flags.contains(FrameFlags::CURRENT));
        debug_assert!(!m.flags.contains(FrameFlags::SNAPSHOT));
        m.flags.insert(FrameFlags::DIRTY);
    }
}
