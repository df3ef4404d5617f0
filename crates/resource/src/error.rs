//! Error taxonomy for the external collaborator interfaces and the unit
//! state machine.

use std::fmt;

/// Errors returned by [`crate::external::IFileDevice`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    FileNotFound,
    PathNotFound,
    FileSharingViolation,
    FileLockViolation,
    OpenFileExhaustion,
    DirectoryExhausted,
    InvalidOpenMode,
    InvalidFileHandle,
    InvalidFileOffset,
    FileSizeRetrievalFailed,
    PathTooLong,
    ExhaustedDirectoryDepth,
    DirectoryNotFound,
    UnknownOsError,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for FileError {}

/// Errors returned by [`crate::external::IDecompressor`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressError {
    UnsupportedCompressionType,
    CorruptStream,
    DestinationTooSmall,
}

impl fmt::Display for DecompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for DecompressError {}

/// Errors surfaced by the resource-unit state machine and the manager that
/// owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    FailedToLoadResource,
    FailedToPreFinalizeResource,
    NoExternalHeap,
    NoLocalArchive,
    InactiveLoadThread,
    StillInReference,
    PathTooLong,
    InvalidHandle,
    MemoryAllocationFailure,
    File(FileError),
    Decompress(DecompressError),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for ResourceError {}

impl From<FileError> for ResourceError {
    fn from(e: FileError) -> Self {
        ResourceError::File(e)
    }
}

impl From<DecompressError> for ResourceError {
    fn from(e: DecompressError) -> Self {
        ResourceError::Decompress(e)
    }
}

impl From<handle_table::Error> for ResourceError {
    fn from(_: handle_table::Error) -> Self {
        ResourceError::InvalidHandle
    }
}

pub type Result<T> = std::result::Result<T, ResourceError>;
