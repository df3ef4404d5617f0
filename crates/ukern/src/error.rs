use std::fmt;

/// Result codes returned by UKern wait primitives and thread-control APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidHandle,
    InvalidAddress,
    InvalidPriority,
    InvalidStackSize,
    InvalidCoreId,
    InvalidCoreMask,
    InvalidLockAddressValue,
    InvalidWaitAddressValue,
    ValueOutOfRange,
    NoWaiters,
    Timeout,
    SamePriority,
    SameCoreMask,
    SameActivityLevel,
    RequiresLock,
    ThreadStorageExhaustion,
    HandleExhaustion,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidHandle => "invalid ukern handle",
            Error::InvalidAddress => "invalid wait/lock address (null)",
            Error::InvalidPriority => "priority out of range [-2, 2]",
            Error::InvalidStackSize => "stack size is zero",
            Error::InvalidCoreId => "core id not permitted by the process core mask",
            Error::InvalidCoreMask => "core mask outside the process core mask",
            Error::InvalidLockAddressValue => "lock address does not tag the expected owner",
            Error::InvalidWaitAddressValue => "wait address value does not satisfy the predicate",
            Error::ValueOutOfRange => "address value out of expected range",
            Error::NoWaiters => "no fiber is waiting on this address",
            Error::Timeout => "wait timed out",
            Error::SamePriority => "priority unchanged",
            Error::SameCoreMask => "core mask unchanged",
            Error::SameActivityLevel => "activity level unchanged",
            Error::RequiresLock => "caller does not hold the lock",
            Error::ThreadStorageExhaustion => "no free fiber-local-storage slots",
            Error::HandleExhaustion => "handle table exhausted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<handle_table::Error> for Error {
    fn from(e: handle_table::Error) -> Self {
        match e {
            handle_table::Error::HandleExhaustion => Error::HandleExhaustion,
            handle_table::Error::InvalidHandle => Error::InvalidHandle,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
