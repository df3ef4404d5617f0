//! Async resource-unit pipeline: request, load (through an external file
//! device and optional decompressor), initialize, and unload resources on a
//! deferred, frame-ticked schedule.

pub mod binder;
pub mod error;
pub mod external;
pub mod manager;
pub mod unit;

pub use binder::ResourceBinder;
pub use error::{DecompressError, FileError, ResourceError, Result};
pub use external::{CompressionType, FileHandle, HeapBlock, IDecompressor, IFileDevice, IHeap, OpenMode, Resource};
pub use manager::{AsyncResourceManager, LoadRequest, ManagerInfo, ThreadInfo};
pub use unit::{CachePolicy, RefCountOutcome, ResourceUnit, ResourceUnitStatus};
