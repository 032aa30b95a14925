//! Unified error type for the wifi-settings library.
//!
//! Every exported operation funnels into a single `Error` enum with a
//! stable signed integer mapping, because handler results travel over the
//! remote-control wire as an `i32` and host tooling decodes them by value.
//! All variants are `Copy` so they can be passed through the session state
//! machine and the connection manager without allocation.

use core::fmt;

/// Every fallible operation in the library funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was out of range or malformed.
    InvalidArg,
    /// Data read back from flash did not match what was written.
    InvalidData,
    /// The operation is not valid in the current lifecycle state.
    InvalidState,
    /// A socket or session could not be allocated.
    InsufficientResources,
    /// The requested port or peripheral is already in use.
    ResourceInUse,
    /// A flash address was not aligned to the erase sector.
    BadAlignment,
    /// An address fell outside the permitted flash or RAM windows.
    InvalidAddress,
    /// Staged data no longer matches its declared hash.
    ModifiedData,
    /// The platform cannot perform the requested modification.
    UnsupportedModification,
    /// The other core could not be locked out.
    NotPermitted,
    /// A bounded wait expired.
    Timeout,
    /// Anything else.
    Generic,
}

impl Error {
    /// Stable wire encoding. Success is `0` and is not represented here.
    pub const fn code(self) -> i32 {
        match self {
            Self::Generic => -1,
            Self::Timeout => -2,
            Self::NotPermitted => -4,
            Self::InvalidArg => -5,
            Self::InsufficientResources => -9,
            Self::InvalidAddress => -10,
            Self::BadAlignment => -11,
            Self::InvalidState => -12,
            Self::ModifiedData => -15,
            Self::InvalidData => -16,
            Self::UnsupportedModification => -18,
            Self::ResourceInUse => -21,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "invalid argument"),
            Self::InvalidData => write!(f, "flash verify mismatch"),
            Self::InvalidState => write!(f, "invalid lifecycle state"),
            Self::InsufficientResources => write!(f, "insufficient resources"),
            Self::ResourceInUse => write!(f, "resource in use"),
            Self::BadAlignment => write!(f, "bad sector alignment"),
            Self::InvalidAddress => write!(f, "address out of range"),
            Self::ModifiedData => write!(f, "staged data hash mismatch"),
            Self::UnsupportedModification => write!(f, "unsupported modification"),
            Self::NotPermitted => write!(f, "lock-out not permitted"),
            Self::Timeout => write!(f, "timed out"),
            Self::Generic => write!(f, "generic failure"),
        }
    }
}

impl std::error::Error for Error {}

/// Library-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Error; 12] = [
        Error::InvalidArg,
        Error::InvalidData,
        Error::InvalidState,
        Error::InsufficientResources,
        Error::ResourceInUse,
        Error::BadAlignment,
        Error::InvalidAddress,
        Error::ModifiedData,
        Error::UnsupportedModification,
        Error::NotPermitted,
        Error::Timeout,
        Error::Generic,
    ];

    #[test]
    fn codes_are_negative() {
        for e in ALL {
            assert!(e.code() < 0, "{e} must encode negative");
        }
    }

    #[test]
    fn codes_are_distinct() {
        for (i, a) in ALL.iter().enumerate() {
            for b in &ALL[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a} and {b} share a code");
            }
        }
    }
}
