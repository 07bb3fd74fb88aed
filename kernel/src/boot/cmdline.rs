// SPDX-License-Identifier: MPL-2.0

//! Kernel command line processing.

use crate::cache::CacheSizes;

/// Find the value of `name=value` on the command line, treating any run
/// of whitespace as a separator.
fn option_arg<'a>(cmdline: &'a str, name: &str) -> Option<&'a str> {
    for tok in cmdline.split_whitespace() {
        if let Some(rest) = tok.strip_prefix(name) {
            match rest.strip_prefix('=') {
                Some(v) => return Some(v),
                None if rest.is_empty() => return Some(""),
                None => {}
            }
        }
    }
    None
}

pub fn has_option(cmdline: &str, name: &str) -> bool {
    option_arg(cmdline, name).is_some()
}

/// The integral value of an option, or zero if absent or malformed.
pub fn option_uvalue(cmdline: &str, name: &str) -> usize {
    option_arg(cmdline, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Apply the recognized cache-sizing options over the derived defaults.
pub fn apply_options(cmdline: &str, mut sizes: CacheSizes) -> CacheSizes {
    let npage = option_uvalue(cmdline, "npage");
    if npage != 0 {
        sizes = CacheSizes::from_pages(npage);
    }
    let nproc = option_uvalue(cmdline, "nproc");
    if nproc != 0 {
        sizes.nproc = nproc;
    }
    let ngpt = option_uvalue(cmdline, "ngpt");
    if ngpt != 0 {
        sizes.ngpt = ngpt;
    }
    let nendpt = option_uvalue(cmdline, "nendpt");
    if nendpt != 0 {
        sizes.nendpt = nendpt;
    }
    let depend = option_uvalue(cmdline, "depend");
    if depend != 0 {
        sizes.ndepend = depend;
    }
    sizes
}
