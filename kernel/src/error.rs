// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// Kernel-internal error codes.
///
/// These never cross the system-call boundary; invocation-visible failures
/// use the 64-bit result-code space in [`crate::ipc::syscall`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Invalid arguments.
    InvalidArgs,
    /// A fixed-size pool is exhausted.
    NoMemory,
    /// Not found.
    NotFound,
    /// The boot image is malformed.
    BadImage,
    /// The backing store failed.
    IoFailed,
}

/// The error with an error type and an optional message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
