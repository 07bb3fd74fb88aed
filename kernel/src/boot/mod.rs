// SPDX-License-Identifier: MPL-2.0

//! Boot bring-up.
//!
//! The strict order is: the HAL is ready before anything here runs; then
//! the command line is consulted for cache sizing, the caches and tables
//! come up, and finally the boot image seeds the object space. No process
//! runs before all of it is done, and none of it is torn down short of a
//! reboot.

pub mod cmdline;
pub mod image;

use alloc::string::String;

use crate::{
    boot::image::ImageStore,
    cache::CacheSizes,
    hal::Hal,
    kernel::{BootSpec, Kernel},
    prelude::*,
};

/// Bring the nucleus up from a persistent image.
pub fn kernel_from_image(
    hal: Box<dyn Hal>,
    image_bytes: Vec<u8>,
    cmdline: String,
) -> Result<Kernel> {
    let hdr = image::parse_header(&image_bytes)?;
    let max_oids = image::max_oids(&hdr);

    let sizes = CacheSizes::from_pages((hdr.n_page as usize).max(16));
    let store = Box::new(ImageStore::new(hdr, image_bytes)?);

    Ok(Kernel::new(BootSpec {
        hal,
        store,
        ncpu: 1,
        cmdline,
        sizes,
        max_oids,
    }))
}
