//! Error taxonomy shared by the shootdown core and the context layer.

use std::fmt;

/// Errors surfaced to device drivers through the narrow call ABI.
///
/// The two busy-wait paths (channel acquisition and completion polling)
/// never fail; by hardware contract they retry until the operation
/// completes, so no timeout variant exists here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad creation flags, mismatched release callback on re-attach, or an
    /// out-of-bounds routing value.
    InvalidArgument,
    /// A link routing value does not resolve to a registered device.
    NoSuchLinkedDevice,
    /// The owner refers to an actor with no address space; invalidation
    /// identifiers are meaningless for it.
    OwnerHasNoAddressSpace,
    /// Resource allocation failed in this core or in a collaborator.
    AllocationFailed,
    /// Device bring-up exceeded the fixed device table.
    ConfigurationExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NoSuchLinkedDevice => "link does not route to a registered device",
            Error::OwnerHasNoAddressSpace => "owner has no address space",
            Error::AllocationFailed => "allocation failed",
            Error::ConfigurationExhausted => "device table exhausted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}
