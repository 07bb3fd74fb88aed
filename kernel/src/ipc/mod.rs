// SPDX-License-Identifier: MPL-2.0

//! The synchronous invocation path.

pub mod invoke;
pub mod param;
pub mod syscall;
