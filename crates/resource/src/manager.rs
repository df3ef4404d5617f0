//! Owns the control/memory/load queues and threads, deduplicates resource
//! units per file extension, and drives the deferred-unload frame tick.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_task_queue::{AsyncQueue, AsyncQueueThread, TaskInfo, TaskOutcome};

use crate::binder::ResourceBinder;
use crate::error::{ResourceError, Result};
use crate::external::{CompressionType, IDecompressor, IFileDevice, IHeap, Resource};
use crate::unit::{CachePolicy, RefCountOutcome, ResourceUnit, ResourceUnitStatus};

/// Priority the memory thread schedules unload tasks at; `0xD` of its
/// `1..0xE` range, per `§4.G`.
const UNLOAD_TASK_PRIORITY: usize = 0xD;

/// Per-thread-role configuration the manager is constructed with, mirroring
/// the source's three thread-info records.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub name: String,
    pub core_number: u32,
    pub stack_size: usize,
    pub priority: i32,
}

/// Construction-time configuration for [`AsyncResourceManager`].
pub struct ManagerInfo {
    pub control_thread_info: ThreadInfo,
    pub memory_thread_info: ThreadInfo,
    pub load_thread_info: Vec<ThreadInfo>,
    pub resource_size_table_path: Option<String>,
}

/// Dedup map for one file extension: `crc32b(path) -> unit`, per `§4.H`.
#[derive(Default)]
struct ResourceUnitManager {
    units: HashMap<u32, Arc<ResourceUnit>>,
}

impl ResourceUnitManager {
    fn find(&self, key: u32) -> Option<Arc<ResourceUnit>> {
        self.units.get(&key).cloned()
    }

    fn insert(&mut self, unit: Arc<ResourceUnit>) {
        self.units.insert(unit.path_key, unit);
    }

    fn remove(&mut self, key: u32) {
        self.units.remove(&key);
    }
}

fn extension_of(path: &str) -> String {
    Path::new(path).extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase()
}

/// Per-request parameters for a load.
pub struct LoadRequest<'a> {
    pub path: &'a str,
    pub priority: u32,
    pub allow_archive_reference: bool,
    pub compression_type: CompressionType,
    pub cache_policy: CachePolicy,
    pub resource_factory: Arc<dyn Fn(&[u8]) -> Box<dyn Resource> + Send + Sync>,
}

/// Owns the three thread pools (control/memory/load), the per-extension
/// dedup tables, and the deferred-unload frame bookkeeping.
pub struct AsyncResourceManager {
    self_weak: Weak<AsyncResourceManager>,

    heap: Arc<dyn IHeap>,
    file_device: Arc<dyn IFileDevice>,
    decompressor: Option<Arc<dyn IDecompressor>>,

    control_queue: Arc<AsyncQueue>,
    memory_queue: Arc<AsyncQueue>,
    load_queue: Arc<AsyncQueue>,

    unit_managers: Mutex<HashMap<String, ResourceUnitManager>>,

    /// Guards advancing `frame_index` and draining the previous frame's
    /// deferred deltas; mirrors `free_frame_cs`.
    free_frame_cs: Mutex<()>,
    frame_index: AtomicUsize,

    suspended_control: std::sync::atomic::AtomicBool,
    suspended_memory: std::sync::atomic::AtomicBool,
    suspended_load: std::sync::atomic::AtomicBool,
}

const CONTROL_PRIORITY_LEVELS: usize = 3;
const MEMORY_PRIORITY_LEVELS: usize = 0xF;
const LOAD_PRIORITY_LEVELS: usize = 3;

impl AsyncResourceManager {
    #[must_use]
    pub fn new(
        heap: Arc<dyn IHeap>,
        file_device: Arc<dyn IFileDevice>,
        decompressor: Option<Arc<dyn IDecompressor>>,
        info: ManagerInfo,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            heap,
            file_device,
            decompressor,
            control_queue: Arc::new(AsyncQueue::new(CONTROL_PRIORITY_LEVELS)),
            memory_queue: Arc::new(AsyncQueue::new(MEMORY_PRIORITY_LEVELS)),
            load_queue: Arc::new(AsyncQueue::new(LOAD_PRIORITY_LEVELS)),
            unit_managers: Mutex::new(HashMap::new()),
            free_frame_cs: Mutex::new(()),
            frame_index: AtomicUsize::new(0),
            suspended_control: std::sync::atomic::AtomicBool::new(false),
            suspended_memory: std::sync::atomic::AtomicBool::new(false),
            suspended_load: std::sync::atomic::AtomicBool::new(false),
        });

        spawn_queue_thread(&manager.control_queue, &info.control_thread_info);
        spawn_queue_thread(&manager.memory_queue, &info.memory_thread_info);
        for load_info in &info.load_thread_info {
            spawn_queue_thread(&manager.load_queue, load_info);
        }

        manager
    }

    /// Looks up (dedup) or allocates the unit backing `request.path`,
    /// schedules its load on the load queue, and returns a binder the
    /// caller can wait on. Two concurrent requests for the same path before
    /// the first completes return binders pointing at the same unit.
    pub fn try_load_async(&self, request: LoadRequest<'_>) -> Result<ResourceBinder> {
        let unit = self.lookup_or_allocate(&request)?;
        if unit.status() == ResourceUnitStatus::Uninitialized {
            self.schedule_load(unit.clone(), &request);
        }
        Ok(ResourceBinder::new(unit, self.self_weak.clone()))
    }

    /// Like [`Self::try_load_async`] but performs the load synchronously on
    /// the calling thread rather than scheduling it on the load queue.
    pub fn try_load_sync(&self, request: LoadRequest<'_>) -> Result<ResourceBinder> {
        let unit = self.lookup_or_allocate(&request)?;
        if unit.status() == ResourceUnitStatus::Uninitialized {
            unit.begin_load().map_err(|_| ResourceError::InvalidHandle)?;
            unit.load_file();
        }
        Ok(ResourceBinder::new(unit, self.self_weak.clone()))
    }

    fn lookup_or_allocate(&self, request: &LoadRequest<'_>) -> Result<Arc<ResourceUnit>> {
        let extension = extension_of(request.path);
        let key = crc32fast::hash(request.path.as_bytes());
        let mut managers = self.unit_managers.lock().unwrap();
        let bucket = managers.entry(extension).or_default();
        if let Some(existing) = bucket.find(key) {
            if existing.status() != ResourceUnitStatus::Freed {
                tracing::trace!(path = request.path, "resource unit deduplicated");
                return Ok(existing);
            }
            bucket.remove(key);
        }

        let unit = Arc::new(ResourceUnit::new(
            request.path,
            request.priority,
            request.compression_type,
            request.cache_policy,
            self.heap.clone(),
            self.file_device.clone(),
            self.decompressor.clone(),
            request.resource_factory.clone(),
        )?);
        bucket.insert(unit.clone());
        Ok(unit)
    }

    fn schedule_load(&self, unit: Arc<ResourceUnit>, request: &LoadRequest<'_>) {
        if unit.begin_load().is_err() {
            return;
        }
        let convert_priority =
            ((request.priority << 1) | u32::from(request.allow_archive_reference)) as usize;
        let level = convert_priority.min(LOAD_PRIORITY_LEVELS - 1);
        let _ = self.load_queue.push_task(TaskInfo {
            priority: level,
            is_sync: false,
            exe_fn: Box::new(move |_cancel| {
                unit.load_file();
                TaskOutcome::Success
            }),
            result_fn: None,
        });
    }

    /// Accumulates a deferred `-1` for `unit` into the current frame's
    /// bucket; actually applied on the next [`Self::calculate`] tick.
    pub(crate) fn request_unload_resource_unit(&self, unit: &Arc<ResourceUnit>) {
        let frame = self.frame_index.load(Ordering::Acquire);
        unit.request_unload(frame, -1);
    }

    /// One manager tick: advances the deferred-unload frame and schedules
    /// unload tasks for every unit whose accumulated delta brought its
    /// reference count to zero during the just-closed frame.
    pub fn calculate(&self) {
        self.reserve_unload();
    }

    fn reserve_unload(&self) {
        let _guard = self.free_frame_cs.lock().unwrap();
        let draining_frame = self.frame_index.load(Ordering::Acquire);
        self.frame_index.store(1 - draining_frame, Ordering::Release);

        let managers = self.unit_managers.lock().unwrap();
        let mut to_remove: Vec<(String, u32)> = Vec::new();
        for (extension, bucket) in managers.iter() {
            for unit in bucket.units.values() {
                if let Some(outcome) = unit.drain_deferred_adjust(draining_frame) {
                    if self.dispatch_unload_outcome(unit, outcome) {
                        to_remove.push((extension.clone(), unit.path_key));
                    }
                }
            }
        }
        drop(managers);
        if !to_remove.is_empty() {
            let mut managers = self.unit_managers.lock().unwrap();
            for (extension, key) in to_remove {
                if let Some(bucket) = managers.get_mut(&extension) {
                    bucket.remove(key);
                }
            }
        }
    }

    /// Returns `true` if the unit was fully unloaded and should be dropped
    /// from its `ResourceUnitManager` bucket.
    fn dispatch_unload_outcome(&self, unit: &Arc<ResourceUnit>, outcome: RefCountOutcome) -> bool {
        match outcome {
            RefCountOutcome::StillReferenced => false,
            RefCountOutcome::ScheduleCacheUnload => {
                let unit = unit.clone();
                let _ = self.memory_queue.push_task(TaskInfo {
                    priority: UNLOAD_TASK_PRIORITY,
                    is_sync: false,
                    exe_fn: Box::new(move |_| {
                        let _ = unit.finalize_for_unload(false);
                        TaskOutcome::Success
                    }),
                    result_fn: None,
                });
                false
            }
            RefCountOutcome::ScheduleFullUnload => {
                let unit = unit.clone();
                let _ = self.memory_queue.push_task(TaskInfo {
                    priority: UNLOAD_TASK_PRIORITY,
                    is_sync: false,
                    exe_fn: Box::new(move |_| {
                        let _ = unit.finalize_for_unload(true);
                        unit.free();
                        TaskOutcome::Success
                    }),
                    result_fn: None,
                });
                true
            }
        }
    }

    /// Immediately finalizes and frees every unit at `reference_count == 0`
    /// whose cache policy would otherwise keep it resident. Runs inline on
    /// the calling thread rather than going through the memory queue.
    pub fn force_clear_all_caches(&self) {
        let mut managers = self.unit_managers.lock().unwrap();
        let mut to_remove: Vec<(String, u32)> = Vec::new();
        for (extension, bucket) in managers.iter() {
            for unit in bucket.units.values() {
                if unit.reference_count() == 0 && unit.status() == ResourceUnitStatus::Loaded {
                    let _ = unit.finalize_for_unload(true);
                    unit.free();
                    to_remove.push((extension.clone(), unit.path_key));
                }
            }
        }
        for (extension, key) in to_remove {
            if let Some(bucket) = managers.get_mut(&extension) {
                bucket.remove(key);
            }
        }
    }

    pub fn suspend_control_thread(&self) {
        self.suspended_control.store(true, Ordering::Release);
    }

    pub fn resume_control_thread(&self) {
        self.suspended_control.store(false, Ordering::Release);
        self.control_queue.force_calc_sync(CONTROL_PRIORITY_LEVELS - 1);
    }

    pub fn suspend_memory_thread(&self) {
        self.suspended_memory.store(true, Ordering::Release);
    }

    pub fn resume_memory_thread(&self) {
        self.suspended_memory.store(false, Ordering::Release);
        self.memory_queue.force_calc_sync(MEMORY_PRIORITY_LEVELS - 1);
    }

    pub fn suspend_load_threads(&self) {
        self.suspended_load.store(true, Ordering::Release);
    }

    pub fn resume_load_threads(&self) {
        self.suspended_load.store(false, Ordering::Release);
        self.load_queue.force_calc_sync(LOAD_PRIORITY_LEVELS - 1);
    }

    pub fn shutdown(&self) {
        self.control_queue.close();
        self.memory_queue.close();
        self.load_queue.close();
    }
}

fn spawn_queue_thread(queue: &Arc<AsyncQueue>, info: &ThreadInfo) {
    let queue = queue.clone();
    let name = info.name.clone();
    let builder = std::thread::Builder::new().name(name).stack_size(info.stack_size.max(64 * 1024));
    let _ = builder.spawn(move || {
        let worker = AsyncQueueThread::new(queue);
        worker.run();
    });
}
