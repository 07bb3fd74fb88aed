// SPDX-License-Identifier: MPL-2.0

//! The capability record.
//!
//! A capability is a fixed-width value: a type tag, a restriction mask, a
//! 20-bit generation number, a 32-bit payload, and a target. The payload is
//! the protected payload for entry-class capabilities and the packed guard
//! word for memory-class capabilities. The target is an OID when the
//! capability is in store form, an `(object-table entry, frame)` pair when
//! swizzled, and a window offset for window capabilities.

pub mod prepare;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    obj::{ObRef, ObType, OteIndex},
    types::{CoyAddr, Guard, Oid, PAGE_ADDR_BITS},
};

/// Capability type tags. Tags at or above [`CapType::FIRST_OBJECT`] name
/// cacheable objects and are candidates for swizzling; everything below is
/// carried by value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
#[repr(u8)]
pub enum CapType {
    #[default]
    Null = 0,
    /// Window onto the enclosing space's background.
    Window = 1,
    /// Window through a named slot of the containing GPT.
    LocalWindow = 2,
    /// Reserved alias of Window kept for image compatibility.
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

impl CapType {
    pub const FIRST_OBJECT: CapType = CapType::Endpoint;

    pub fn from_u8(v: u8) -> Option<CapType> {
        use CapType::*;
        Some(match v {
            0 => Null,
            1 => Window,
            2 => LocalWindow,
            3 => Background,
            4 => Discrim,
            5 => CapBits,
            6 => KernLog,
            7 => IrqWait,
            8 => Sleep,
            9 => SysCtl,
            10 => Range,
            11 => Schedule,
            16 => Endpoint,
            17 => Entry,
            18 => AppInt,
            19 => AppNotice,
            20 => Page,
            21 => CapPage,
            22 => Gpt,
            23 => Process,
            _ => return None,
        })
    }

    /// The frame type this capability type references, if any.
    pub fn ob_type(self) -> Option<ObType> {
        use CapType::*;
        Some(match self {
            Endpoint | Entry | AppInt | AppNotice => ObType::Endpoint,
            Page => ObType::Page,
            CapPage => ObType::CapPage,
            Gpt => ObType::Gpt,
            Process => ObType::Process,
            _ => return None,
        })
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            CapType::Page
                | CapType::CapPage
                | CapType::Gpt
                | CapType::Window
                | CapType::LocalWindow
                | CapType::Background
        )
    }
}

bitflags! {
    /// Capability restrictions. Weak implies read-only wherever it is set.
    #[derive(Default)]
    pub struct Restr: u8 {
        const WEAK      = 0x01;
        const RO        = 0x02;
        const NX        = 0x04;
        const OPAQUE    = 0x08;
        /// No-call on entry capabilities; restart-only on process
        /// capabilities.
        const NO_CALL   = 0x10;
        const RESTART   = 0x10;
    }
}

impl Restr {
    pub fn read_only(self) -> bool {
        self.intersects(Restr::RO | Restr::WEAK)
    }
}

/// The target union of a capability.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    /// Store form: the OID of the referenced object.
    Oid(Oid),
    /// Swizzled form: the frame plus the object-table entry that recorded
    /// its identity at swizzling time.
    Prepared { ote: OteIndex, frame: ObRef },
    /// Window offset.
    Offset(CoyAddr),
}

impl Default for Target {
    fn default() -> Self {
        Target::Oid(0)
    }
}

/// A capability.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Capability {
    pub ty: CapType,
    pub restr: Restr,
    /// Generation of the referenced object; doubles as the target slot
    /// number in local-window capabilities.
    pub alloc_count: u32,
    /// Protected payload for entry-class capabilities; packed guard word
    /// for memory-class capabilities.
    pub payload: u32,
    pub target: Target,
}

/// On-store image of a capability: always the deprepared form.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CapBlob {
    /// type:6 swizzled:1 (always 0) restr:5 allocCount:20
    pub w0: u32,
    pub payload: u32,
    pub target: u64,
}

const_assert_eq!(core::mem::size_of::<CapBlob>(), crate::types::CAPABILITY_SIZE);

impl Capability {
    pub const fn null() -> Self {
        Capability {
            ty: CapType::Null,
            restr: Restr::empty(),
            alloc_count: 0,
            payload: 0,
            target: Target::Oid(0),
        }
    }

    /// A store-form memory capability with the minimum page guard.
    pub fn object(ty: CapType, oid: Oid, alloc_count: u32) -> Self {
        debug_assert!(ty.ob_type().is_some());
        let payload = if ty.is_memory() {
            Guard::new(0, PAGE_ADDR_BITS).raw()
        } else {
            0
        };
        Capability {
            ty,
            restr: Restr::empty(),
            alloc_count,
            payload,
            target: Target::Oid(oid),
        }
    }

    pub fn init(&mut self) {
        *self = Capability::null();
    }

    pub fn is_null(&self) -> bool {
        self.ty == CapType::Null
    }

    pub fn is_swizzled(&self) -> bool {
        matches!(self.target, Target::Prepared { .. })
    }

    pub fn can_prepare(&self) -> bool {
        self.ty >= CapType::FIRST_OBJECT
    }

    pub fn guard(&self) -> Guard {
        Guard::from_raw(self.payload)
    }

    pub fn set_guard(&mut self, g: Guard) {
        self.payload = g.raw();
    }

    pub fn l2g(&self) -> u32 {
        self.guard().l2g()
    }

    /// Window offset; zero for anything that is not a window.
    pub fn offset(&self) -> CoyAddr {
        match self.target {
            Target::Offset(off) => off,
            _ => 0,
        }
    }

    /// The prepared target frame, if the capability is swizzled.
    pub fn prep_target(&self) -> Option<ObRef> {
        match self.target {
            Target::Prepared { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Demote this capability according to the rules of weak fetch.
    ///
    /// Always applied to a copy, after the copy, so that the source is
    /// never demoted in place.
    pub fn weaken(&mut self) {
        match self.ty {
            CapType::Null
            | CapType::Window
            | CapType::LocalWindow
            | CapType::Background
            | CapType::Discrim => {}
            CapType::Gpt | CapType::CapPage => {
                self.restr = Restr::RO | Restr::WEAK;
            }
            CapType::Page => {
                self.restr = Restr::RO;
            }
            _ => self.init(),
        }
    }

    /// Raw 16-byte store form. The capability must not be swizzled.
    pub fn to_blob(&self) -> CapBlob {
        let target = match self.target {
            Target::Oid(oid) => oid,
            Target::Offset(off) => off,
            Target::Prepared { .. } => {
                debug_assert!(false, "blob of a swizzled capability");
                0
            }
        };
        let w0 = (self.ty as u32)
            | ((self.restr.bits() as u32) << 7)
            | ((self.alloc_count & 0xf_ffff) << 12);
        CapBlob {
            w0,
            payload: self.payload,
            target,
        }
    }

    /// Parse a store-form capability. Unknown type tags collapse to Null.
    pub fn from_blob(blob: &CapBlob) -> Self {
        let Some(ty) = CapType::from_u8((blob.w0 & 0x3f) as u8) else {
            return Capability::null();
        };
        let restr = Restr::from_bits_truncate(((blob.w0 >> 7) & 0x1f) as u8);
        let alloc_count = (blob.w0 >> 12) & 0xf_ffff;
        let target = match ty {
            CapType::Window | CapType::LocalWindow | CapType::Background => {
                Target::Offset(blob.target)
            }
            _ => Target::Oid(blob.target),
        };
        Capability {
            ty,
            restr,
            alloc_count,
            payload: blob.payload,
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weaken_is_idempotent() {
        let mut protos = [
            Capability::null(),
            Capability::object(CapType::Page, 7, 0),
            Capability::object(CapType::CapPage, 7, 0),
            Capability::object(CapType::Gpt, 7, 0),
            Capability::object(CapType::Process, 7, 0),
            Capability {
                ty: CapType::Discrim,
                ..Capability::null()
            },
        ];
        for c in protos.iter_mut() {
            let mut once = *c;
            once.weaken();
            let mut twice = once;
            twice.weaken();
            assert_eq!(once, twice);
            if once.restr.contains(Restr::WEAK) {
                assert!(once.restr.contains(Restr::RO));
            }
        }
    }

    #[test]
    fn weaken_nulls_non_memory_objects() {
        let mut c = Capability::object(CapType::Endpoint, 3, 0);
        c.weaken();
        assert!(c.is_null());
        let mut p = Capability::object(CapType::Process, 3, 0);
        p.weaken();
        assert!(p.is_null());
    }

    #[test]
    fn blob_round_trip() {
        let c = Capability {
            ty: CapType::Gpt,
            restr: Restr::RO,
            alloc_count: 0x5_5555,
            payload: Guard::new(0x42, 20).raw(),
            target: Target::Oid(0xdead_beef),
        };
        assert_eq!(Capability::from_blob(&c.to_blob()), c);

        let w = Capability {
            ty: CapType::Window,
            restr: Restr::empty(),
            alloc_count: 0,
            payload: Guard::new(0, 20).raw(),
            target: Target::Offset(0x4000_0000),
        };
        assert_eq!(Capability::from_blob(&w.to_blob()), w);
    }
}
