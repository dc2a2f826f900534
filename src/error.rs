use core::fmt::{self, Debug};

use crate::traits::{BdAddr, BdSize};

/// Success code at the block-device boundary.
pub const BD_ERROR_OK: i32 = 0;
/// The single failure code at the block-device boundary.
pub const BD_ERROR_DEVICE_ERROR: i32 = -4001;

/// The error type used by this library.
///
/// This encapsulates an error reported by the memory interface peripheral and
/// adds the device's own state and protocol errors on top of that. Callers
/// that only speak the generic block-device contract should use
/// [`Error::code`], which collapses every variant to one device error.
pub enum Error<E> {
    /// A data operation was attempted before `init()`.
    NotInitialized,
    /// The request does not fit inside the device.
    OutOfBounds { addr: BdAddr, size: BdSize },
    /// The chip or the peripheral engine stayed busy past the polling budget.
    Timeout,
    /// The chip flagged a program error in its status register.
    ProgramFailed { status: u8 },
    /// A peripheral command failed.
    Peripheral(E),
}

impl<E> Error<E> {
    /// Flat block-device error code for this error.
    pub fn code(&self) -> i32 {
        BD_ERROR_DEVICE_ERROR
    }
}

impl<E: Debug> Debug for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "Error::NotInitialized"),
            Error::OutOfBounds { addr, size } => {
                write!(f, "Error::OutOfBounds {{ addr: {:#x}, size: {} }}", addr, size)
            }
            Error::Timeout => write!(f, "Error::Timeout"),
            Error::ProgramFailed { status } => {
                write!(f, "Error::ProgramFailed {{ status: {:#04x} }}", status)
            }
            Error::Peripheral(e) => write!(f, "Error::Peripheral({:?})", e),
        }
    }
}

impl<E: PartialEq> PartialEq for Error<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::NotInitialized, Error::NotInitialized) => true,
            (
                Error::OutOfBounds { addr: a1, size: s1 },
                Error::OutOfBounds { addr: a2, size: s2 },
            ) => a1 == a2 && s1 == s2,
            (Error::Timeout, Error::Timeout) => true,
            (Error::ProgramFailed { status: a }, Error::ProgramFailed { status: b }) => a == b,
            (Error::Peripheral(a), Error::Peripheral(b)) => a == b,
            _ => false,
        }
    }
}

/// Block-device return code of an operation: [`BD_ERROR_OK`] or the code of
/// its error.
pub fn status_code<T, E>(result: &Result<T, Error<E>>) -> i32 {
    match result {
        Ok(_) => BD_ERROR_OK,
        Err(e) => e.code(),
    }
}

/// Wraps a failed peripheral command, logging which one it was.
pub(crate) fn peripheral<E>(command: &'static str) -> impl FnOnce(E) -> Error<E> {
    move |e| {
        error!("{} failed", command);
        Error::Peripheral(e)
    }
}

#[cfg(feature = "defmt")]
impl<E> defmt::Format for Error<E> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::NotInitialized => defmt::write!(fmt, "Error::NotInitialized"),
            Error::OutOfBounds { addr, size } => {
                defmt::write!(fmt, "Error::OutOfBounds(addr={:#x}, size={})", addr, size)
            }
            Error::Timeout => defmt::write!(fmt, "Error::Timeout"),
            Error::ProgramFailed { status } => {
                defmt::write!(fmt, "Error::ProgramFailed(status={:#x})", status)
            }
            Error::Peripheral(_) => defmt::write!(fmt, "Error::Peripheral"),
        }
    }
}
