//! The resource-unit state machine: allocate heap, load (optionally
//! decompressing), initialize, post-initialize, live, pre-finalize,
//! finalize, free.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{ResourceError, Result};
use crate::external::{CompressionType, HeapBlock, IDecompressor, IFileDevice, IHeap, OpenMode, Resource};

/// Maximum accepted `file_path` length, mirroring the source's bounded
/// path buffer.
pub const MAX_FILE_PATH_LEN: usize = 260;

/// Lifecycle state of one resource unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUnitStatus {
    Uninitialized,
    InLoad,
    Loaded,
    Error,
    FailedToLoadResource,
    InResourceInitialize,
    ResourceInitialized,
    FailedToInitializeResource,
    ResourcePostInitialized,
    FailedToPostInitializeResource,
    InResourcePreFinalize,
    ResourcePreFinalized,
    FailedToPreFinalizeResource,
    InResourceFinalize,
    Freed,
}

impl ResourceUnitStatus {
    /// A unit in one of these states is done with loading (successfully or
    /// not) and any thread blocked on [`ResourceUnit::wait_for_load`]
    /// should wake.
    #[must_use]
    pub fn is_load_terminal(self) -> bool {
        !matches!(self, ResourceUnitStatus::Uninitialized | ResourceUnitStatus::InLoad)
    }

    /// Any of the `Failed*`/`Error` states: the unit cannot usefully be
    /// referenced further and is only eligible for teardown.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResourceUnitStatus::Error
                | ResourceUnitStatus::FailedToLoadResource
                | ResourceUnitStatus::FailedToInitializeResource
                | ResourceUnitStatus::FailedToPostInitializeResource
                | ResourceUnitStatus::FailedToPreFinalizeResource
        )
    }
}

/// Outcome of [`ResourceUnit::adjust_reference_count`]: what the caller
/// (normally the async resource manager) should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountOutcome {
    /// The unit is still referenced; nothing to schedule.
    StillReferenced,
    /// `reference_count` reached zero and the unit's cache policy and
    /// status allow it to stay resident; schedule a cache-unload (finalize
    /// only, returning to `Loaded`).
    ScheduleCacheUnload,
    /// `reference_count` reached zero and the unit must be fully torn
    /// down: finalize, free its heap block, transition to `Freed`.
    ScheduleFullUnload,
}

/// Policy bits controlling whether a unit may linger resident at
/// `reference_count == 0` rather than being freed immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachePolicy {
    pub is_cache_unload: bool,
    pub is_cache_unload_for_no_ref: bool,
    pub is_cache_unload_for_no_error: bool,
}

impl CachePolicy {
    #[must_use]
    fn allows_caching(self, status: ResourceUnitStatus) -> bool {
        self.is_cache_unload
            && self.is_cache_unload_for_no_ref
            && (!self.is_cache_unload_for_no_error || !status.is_failure())
    }
}

type ResourceFactory = dyn Fn(&[u8]) -> Box<dyn Resource> + Send + Sync;

/// A single resource's full lifecycle: identity, backing collaborators, and
/// the status machine described in `§4.G`.
pub struct ResourceUnit {
    file_path: String,
    /// `crc32b(file_path)`; the key a [`crate::manager::ResourceUnitManager`]
    /// dedups on.
    pub(crate) path_key: u32,
    compression_type: CompressionType,
    priority: u32,
    cache_policy: CachePolicy,

    heap: Arc<dyn IHeap>,
    file_device: Arc<dyn IFileDevice>,
    decompressor: Option<Arc<dyn IDecompressor>>,
    resource_factory: Arc<ResourceFactory>,

    status: Mutex<ResourceUnitStatus>,
    status_changed: Condvar,

    reference_count: AtomicI64,
    deferred_adjust_count: [AtomicI32; 2],

    resource_initialize_guard: AtomicBool,
    is_file_not_found: AtomicBool,
    is_memory_allocation_failure: AtomicBool,
    is_managed: AtomicBool,
    is_transient_on_load: AtomicBool,

    block: Mutex<Option<HeapBlock>>,
    resource: Mutex<Option<Box<dyn Resource>>>,
}

impl ResourceUnit {
    pub fn new(
        file_path: &str,
        priority: u32,
        compression_type: CompressionType,
        cache_policy: CachePolicy,
        heap: Arc<dyn IHeap>,
        file_device: Arc<dyn IFileDevice>,
        decompressor: Option<Arc<dyn IDecompressor>>,
        resource_factory: Arc<ResourceFactory>,
    ) -> Result<Self> {
        if file_path.len() > MAX_FILE_PATH_LEN {
            return Err(ResourceError::PathTooLong);
        }
        Ok(Self {
            file_path: file_path.to_owned(),
            path_key: crc32fast::hash(file_path.as_bytes()),
            compression_type,
            priority,
            cache_policy,
            heap,
            file_device,
            decompressor,
            resource_factory,
            status: Mutex::new(ResourceUnitStatus::Uninitialized),
            status_changed: Condvar::new(),
            reference_count: AtomicI64::new(0),
            deferred_adjust_count: [AtomicI32::new(0), AtomicI32::new(0)],
            resource_initialize_guard: AtomicBool::new(false),
            is_file_not_found: AtomicBool::new(false),
            is_memory_allocation_failure: AtomicBool::new(false),
            is_managed: AtomicBool::new(false),
            is_transient_on_load: AtomicBool::new(false),
            block: Mutex::new(None),
            resource: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    #[must_use]
    pub fn status(&self) -> ResourceUnitStatus {
        *self.status.lock().unwrap()
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[must_use]
    pub fn reference_count(&self) -> i64 {
        self.reference_count.load(Ordering::Acquire)
    }

    fn set_status(&self, new: ResourceUnitStatus) {
        *self.status.lock().unwrap() = new;
        self.status_changed.notify_all();
        tracing::trace!(path = %self.file_path, status = ?new, "resource unit status changed");
    }

    /// Blocks the calling thread until load has either succeeded or failed.
    pub fn wait_for_load(&self) -> ResourceUnitStatus {
        let mut guard = self.status.lock().unwrap();
        while !guard.is_load_terminal() {
            guard = self.status_changed.wait(guard).unwrap();
        }
        *guard
    }

    /// Marks the unit as entering load. Must be called once, from
    /// `Uninitialized`.
    pub fn begin_load(&self) -> Result<()> {
        let mut guard = self.status.lock().unwrap();
        if *guard != ResourceUnitStatus::Uninitialized {
            return Err(ResourceError::InvalidHandle);
        }
        *guard = ResourceUnitStatus::InLoad;
        self.status_changed.notify_all();
        Ok(())
    }

    /// Synchronously performs the load: open, (optionally decompress),
    /// read into a freshly allocated heap block, construct the resource.
    /// Intended to run on a load-queue worker.
    pub fn load_file(&self) {
        let outcome = self.try_load_file();
        match outcome {
            Ok(()) => self.set_status(ResourceUnitStatus::Loaded),
            Err(ResourceError::File(crate::error::FileError::FileNotFound)) => {
                self.is_file_not_found.store(true, Ordering::Release);
                self.set_status(ResourceUnitStatus::FailedToLoadResource);
            }
            Err(ResourceError::MemoryAllocationFailure) => {
                self.is_memory_allocation_failure.store(true, Ordering::Release);
                self.set_status(ResourceUnitStatus::Error);
            }
            Err(_) => self.set_status(ResourceUnitStatus::FailedToLoadResource),
        }
    }

    fn try_load_file(&self) -> Result<()> {
        let handle = self.file_device.open_file(&self.file_path, OpenMode::Read)?;
        let size = self.file_device.file_size(handle)?;
        let size = usize::try_from(size).unwrap_or(usize::MAX);

        let result = (|| -> Result<()> {
            let mut block =
                self.heap.try_allocate(size, 16).ok_or(ResourceError::MemoryAllocationFailure)?;

            match self.compression_type {
                CompressionType::None => {
                    self.file_device.read_file(handle, block.as_mut_slice(), 0)?;
                }
                CompressionType::Auto | CompressionType::Zstandard => {
                    let decompressor =
                        self.decompressor.as_ref().ok_or(ResourceError::NoExternalHeap)?;
                    let mut compressed = vec![0u8; size];
                    self.file_device.read_file(handle, &mut compressed, 0)?;
                    decompressor.decompress(&compressed, block.as_mut_slice())?;
                }
            }

            let resource = (self.resource_factory)(block.as_slice());
            *self.resource.lock().unwrap() = Some(resource);
            *self.block.lock().unwrap() = Some(block);
            Ok(())
        })();

        let _ = self.file_device.close_file(handle);
        result
    }

    /// Runs `initialize` then `post_initialize`, guarded so at most one
    /// caller ever drives a given unit's initializer at a time.
    pub fn initialize(&self) -> Result<()> {
        if self.resource_initialize_guard.swap(true, Ordering::AcqRel) {
            return Err(ResourceError::InvalidHandle);
        }
        let outcome = self.run_initialize_chain();
        self.resource_initialize_guard.store(false, Ordering::Release);
        outcome
    }

    fn run_initialize_chain(&self) -> Result<()> {
        if self.status() != ResourceUnitStatus::Loaded {
            return Err(ResourceError::InvalidHandle);
        }
        self.set_status(ResourceUnitStatus::InResourceInitialize);
        let ok = self.resource.lock().unwrap().as_mut().is_some_and(|r| r.initialize());
        if !ok {
            self.set_status(ResourceUnitStatus::FailedToInitializeResource);
            return Err(ResourceError::FailedToLoadResource);
        }
        self.set_status(ResourceUnitStatus::ResourceInitialized);

        let ok = self.resource.lock().unwrap().as_mut().is_some_and(|r| r.post_initialize());
        if !ok {
            self.set_status(ResourceUnitStatus::FailedToPostInitializeResource);
            return Err(ResourceError::FailedToLoadResource);
        }
        self.set_status(ResourceUnitStatus::ResourcePostInitialized);
        Ok(())
    }

    /// Runs `pre_finalize` then `finalize`. `full_unload` selects whether
    /// the unit returns to `Loaded` (cache-unload: resource torn down, file
    /// bytes retained) or proceeds to `Uninitialized`/free (full unload).
    pub fn finalize_for_unload(&self, full_unload: bool) -> Result<()> {
        self.set_status(ResourceUnitStatus::InResourcePreFinalize);
        let ok = self.resource.lock().unwrap().as_mut().is_some_and(|r| r.pre_finalize());
        if !ok {
            self.set_status(ResourceUnitStatus::FailedToPreFinalizeResource);
            return Err(ResourceError::FailedToPreFinalizeResource);
        }
        self.set_status(ResourceUnitStatus::ResourcePreFinalized);

        self.set_status(ResourceUnitStatus::InResourceFinalize);
        if let Some(resource) = self.resource.lock().unwrap().as_mut() {
            resource.finalize();
        }

        if full_unload {
            *self.resource.lock().unwrap() = None;
            if let Some(block) = self.block.lock().unwrap().take() {
                self.heap.free(block);
            }
            self.set_status(ResourceUnitStatus::Uninitialized);
        } else {
            self.set_status(ResourceUnitStatus::Loaded);
        }
        Ok(())
    }

    /// Transitions a fully-unloaded unit to `Freed`, its terminal state.
    pub fn free(&self) {
        self.set_status(ResourceUnitStatus::Freed);
    }

    /// Adjusts the live reference count by `delta` and reports what the
    /// caller should schedule as a result.
    pub fn adjust_reference_count(&self, delta: i64) -> RefCountOutcome {
        let prev = self.reference_count.fetch_add(delta, Ordering::AcqRel);
        let new = prev + delta;
        if new > 0 {
            return RefCountOutcome::StillReferenced;
        }
        if self.cache_policy.allows_caching(self.status()) {
            RefCountOutcome::ScheduleCacheUnload
        } else {
            RefCountOutcome::ScheduleFullUnload
        }
    }

    /// Accumulates a deferred negative reference-count delta into the
    /// current frame's double-buffer slot, per `§4.G`'s
    /// `RequestUnloadResourceUnit`.
    pub fn request_unload(&self, frame_index: usize, delta: i32) {
        self.deferred_adjust_count[frame_index % 2].fetch_add(delta, Ordering::AcqRel);
    }

    /// Drains the deferred delta accumulated for `frame_index`, applying it
    /// to `reference_count` and returning the resulting outcome (or `None`
    /// if nothing had been accumulated).
    pub fn drain_deferred_adjust(&self, frame_index: usize) -> Option<RefCountOutcome> {
        let slot = &self.deferred_adjust_count[frame_index % 2];
        let delta = slot.swap(0, Ordering::AcqRel);
        if delta == 0 {
            None
        } else {
            Some(self.adjust_reference_count(i64::from(delta)))
        }
    }

    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.is_managed.load(Ordering::Acquire)
    }

    pub fn set_managed(&self, value: bool) {
        self.is_managed.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_transient_on_load(&self) -> bool {
        self.is_transient_on_load.load(Ordering::Acquire)
    }

    pub fn set_transient_on_load(&self, value: bool) {
        self.is_transient_on_load.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_file_not_found(&self) -> bool {
        self.is_file_not_found.load(Ordering::Acquire)
    }
}
