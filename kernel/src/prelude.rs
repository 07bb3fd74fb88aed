// SPDX-License-Identifier: MPL-2.0

//! The crate-internal prelude.

pub(crate) use alloc::{boxed::Box, vec, vec::Vec};

pub(crate) use crate::{
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

#[allow(unused_imports)]
pub(crate) use log::{debug, error, info, trace, warn};
