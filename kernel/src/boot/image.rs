// SPDX-License-Identifier: MPL-2.0

//! The persistent image format.
//!
//! An image begins with a header page carrying the `coyimage` magic,
//! format and target identifiers, per-type frame counts, and the starting
//! OIDs of the metadata regions. The body is the frame payload, one region
//! per frame type in header order, each frame in its externalized form.
//! Frame content is endian-tagged by the header but not otherwise
//! portable.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    cap::CapBlob,
    hal::ObjectStore,
    obj::{
        ext::{ExEndpoint, ExGpt, ExProcess, FrameImage},
        ObType, NUM_OB_TYPES,
    },
    prelude::*,
    types::{Oid, CAPS_PER_PAGE, PAGE_SIZE},
};

pub const COYIMG_MAGIC: [u8; 8] = *b"coyimage";
pub const COYIMG_VERSION: u32 = 1;
/// Stored in native order; reading it back differently means the image
/// was built for the other endianness.
pub const COYIMG_ENDIAN_TAG: u32 = 0x0102_0304;

/// The image header, written onto page zero of the image.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CoyImgHdr {
    pub magic: [u8; 8],

    pub endian: u32,
    pub version: u32,
    /// Architecture number.
    pub target: u32,
    /// Sanity check.
    pub pg_size: u32,

    /// Number of allocated object structures.
    pub n_alloc: u32,
    /// Number of allocated bank structures.
    pub n_bank: u32,
    /// Number of external symbols.
    pub n_symbol: u32,
    /// Size of string table bytes, including the trailing NUL.
    pub n_string_bytes: u32,

    pub n_page: u32,
    pub n_cap_page: u32,
    pub n_gpt: u32,
    pub n_endpoint: u32,
    pub n_proc: u32,

    /// Total image bytes.
    pub img_bytes: u32,

    /// Starting OID for bank structures.
    pub bank_vec_oid: Oid,
    /// Starting OID for external symbol structures.
    pub sym_vec_oid: Oid,
    /// Starting OID for the string table.
    pub string_table_oid: Oid,
    /// Starting OID for allocation structures.
    pub alloc_vec_oid: Oid,
    /// End OID for pages of metadata.
    pub end_vec_oid: Oid,
}

pub const COYIMG_HDR_SIZE: usize = core::mem::size_of::<CoyImgHdr>();
const_assert!(COYIMG_HDR_SIZE <= crate::types::PAGE_SIZE);

/// Parse and sanity-check an image header.
pub fn parse_header(bytes: &[u8]) -> Result<CoyImgHdr> {
    if bytes.len() < COYIMG_HDR_SIZE {
        return_errno_with_msg!(BadImage, "image shorter than its header");
    }
    let hdr = CoyImgHdr::read_from_bytes(&bytes[..COYIMG_HDR_SIZE])
        .map_err(|_| Error::with_msg(BadImage, "unreadable image header"))?;

    if hdr.magic != COYIMG_MAGIC {
        return_errno_with_msg!(BadImage, "bad image magic");
    }
    if hdr.endian != COYIMG_ENDIAN_TAG {
        return_errno_with_msg!(BadImage, "image built for the other endianness");
    }
    if hdr.version != COYIMG_VERSION {
        return_errno_with_msg!(BadImage, "unsupported image version");
    }
    if hdr.pg_size != PAGE_SIZE as u32 {
        return_errno_with_msg!(BadImage, "image page size mismatch");
    }
    Ok(hdr)
}

/// One greater than the largest backed OID, per frame type.
pub fn max_oids(hdr: &CoyImgHdr) -> [Oid; NUM_OB_TYPES] {
    let mut m = [0; NUM_OB_TYPES];
    m[ObType::Page as usize] = hdr.n_page as Oid;
    m[ObType::CapPage as usize] = hdr.n_cap_page as Oid;
    m[ObType::Gpt as usize] = hdr.n_gpt as Oid;
    m[ObType::Process as usize] = hdr.n_proc as Oid;
    m[ObType::Endpoint as usize] = hdr.n_endpoint as Oid;
    m
}

const EX_GPT_SIZE: usize = core::mem::size_of::<ExGpt>();
const EX_ENDPOINT_SIZE: usize = core::mem::size_of::<ExEndpoint>();
const EX_PROCESS_SIZE: usize = core::mem::size_of::<ExProcess>();

/// An object store backed by an in-memory boot image.
///
/// Regions follow the header page in header order: pages, cap pages,
/// GPTs, endpoints, processes. OIDs index into the owning region.
pub struct ImageStore {
    hdr: CoyImgHdr,
    bytes: Vec<u8>,
}

impl ImageStore {
    pub fn new(hdr: CoyImgHdr, bytes: Vec<u8>) -> Result<Self> {
        let store = ImageStore { hdr, bytes };
        let needed = store.region_offset(ObType::Process) + hdr.n_proc as usize * EX_PROCESS_SIZE;
        if store.bytes.len() < needed {
            return_errno_with_msg!(BadImage, "image truncated");
        }
        Ok(store)
    }

    fn region_offset(&self, ty: ObType) -> usize {
        let h = &self.hdr;
        let mut off = PAGE_SIZE;
        for t in [
            ObType::Page,
            ObType::CapPage,
            ObType::Gpt,
            ObType::Endpoint,
            ObType::Process,
        ] {
            if t == ty {
                return off;
            }
            off += match t {
                ObType::Page => h.n_page as usize * PAGE_SIZE,
                ObType::CapPage => h.n_cap_page as usize * PAGE_SIZE,
                ObType::Gpt => h.n_gpt as usize * EX_GPT_SIZE,
                ObType::Endpoint => h.n_endpoint as usize * EX_ENDPOINT_SIZE,
                ObType::Process => h.n_proc as usize * EX_PROCESS_SIZE,
            };
        }
        off
    }

    fn frame_bytes(&self, ty: ObType, oid: Oid) -> Option<&[u8]> {
        let (count, size) = match ty {
            ObType::Page => (self.hdr.n_page, PAGE_SIZE),
            ObType::CapPage => (self.hdr.n_cap_page, PAGE_SIZE),
            ObType::Gpt => (self.hdr.n_gpt, EX_GPT_SIZE),
            ObType::Endpoint => (self.hdr.n_endpoint, EX_ENDPOINT_SIZE),
            ObType::Process => (self.hdr.n_proc, EX_PROCESS_SIZE),
        };
        if oid >= count as Oid {
            return None;
        }
        let start = self.region_offset(ty) + oid as usize * size;
        self.bytes.get(start..start + size)
    }
}

impl ObjectStore for ImageStore {
    fn load(&self, ty: ObType, oid: Oid) -> Result<Option<(u32, FrameImage)>> {
        let Some(src) = self.frame_bytes(ty, oid) else {
            return Ok(None);
        };
        let img = match ty {
            ObType::Page => {
                let mut pg = Box::new([0u8; PAGE_SIZE]);
                pg.copy_from_slice(src);
                FrameImage::Page(pg)
            }
            ObType::CapPage => {
                let mut caps = Box::new([CapBlob::default(); CAPS_PER_PAGE]);
                for (cap, chunk) in caps.iter_mut().zip(src.chunks_exact(16)) {
                    *cap = CapBlob::read_from_bytes(chunk)
                        .map_err(|_| Error::with_msg(BadImage, "unreadable capability"))?;
                }
                FrameImage::CapPage(caps)
            }
            ObType::Gpt => FrameImage::Gpt(Box::new(
                ExGpt::read_from_bytes(src)
                    .map_err(|_| Error::with_msg(BadImage, "unreadable GPT frame"))?,
            )),
            ObType::Endpoint => FrameImage::Endpoint(
                ExEndpoint::read_from_bytes(src)
                    .map_err(|_| Error::with_msg(BadImage, "unreadable endpoint frame"))?,
            ),
            ObType::Process => FrameImage::Process(Box::new(
                ExProcess::read_from_bytes(src)
                    .map_err(|_| Error::with_msg(BadImage, "unreadable process frame"))?,
            )),
        };
        // Images carry freshly minted objects.
        Ok(Some((0, img)))
    }

    fn store(&self, _ty: ObType, _oid: Oid, _alloc_count: u32, _img: FrameImage) -> Result<()> {
        // The boot image is immutable; dirty state ages out into whatever
        // real store the system mounts later.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> CoyImgHdr {
        CoyImgHdr {
            magic: COYIMG_MAGIC,
            endian: COYIMG_ENDIAN_TAG,
            version: COYIMG_VERSION,
            pg_size: PAGE_SIZE as u32,
            n_page: 2,
            n_cap_page: 1,
            n_gpt: 2,
            n_endpoint: 1,
            n_proc: 1,
            ..CoyImgHdr::default()
        }
    }

    fn image_with(hdr: &CoyImgHdr) -> Vec<u8> {
        let body = hdr.n_page as usize * PAGE_SIZE
            + hdr.n_cap_page as usize * PAGE_SIZE
            + hdr.n_gpt as usize * EX_GPT_SIZE
            + hdr.n_endpoint as usize * EX_ENDPOINT_SIZE
            + hdr.n_proc as usize * EX_PROCESS_SIZE;
        let mut bytes = vec![0u8; PAGE_SIZE + body];
        bytes[..COYIMG_HDR_SIZE].copy_from_slice(hdr.as_bytes());
        bytes
    }

    #[test]
    fn header_round_trip() {
        let hdr = test_header();
        let bytes = image_with(&hdr);
        let parsed = parse_header(&bytes).unwrap();
        assert_eq!(parsed.n_gpt, 2);
        assert_eq!(max_oids(&parsed)[ObType::Gpt as usize], 2);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut hdr = test_header();
        hdr.magic = *b"notanimg";
        assert!(parse_header(&image_with(&hdr)).is_err());
    }

    #[test]
    fn frames_load_by_oid() {
        let hdr = test_header();
        let mut bytes = image_with(&hdr);
        // Scribble a recognizable byte into page OID 1.
        let off = PAGE_SIZE + PAGE_SIZE + 17;
        bytes[off] = 0xab;
        let store = ImageStore::new(hdr, bytes).unwrap();

        match store.load(ObType::Page, 1).unwrap() {
            Some((0, FrameImage::Page(pg))) => assert_eq!(pg[17], 0xab),
            other => panic!("unexpected load result: {:?}", other.is_some()),
        }
        assert!(store.load(ObType::Page, 2).unwrap().is_none());
    }
}
