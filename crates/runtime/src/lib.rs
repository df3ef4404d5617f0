//! Top-level facade wiring the UKern scheduler, the dependency job queue,
//! and the async resource manager into one owned runtime instance, the way
//! a hosting application would construct and tear one down.
//!
//! There is no implicit global singleton here: every component is reached
//! through the [`Runtime`] handle returned by [`Runtime::new`], matching
//! the construction style of the layers it wires together.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use job_queue::{JobHandle, JobQueue};
use resource::{AsyncResourceManager, IDecompressor, IFileDevice, IHeap, LoadRequest, ManagerInfo, ResourceBinder, ResourceError};
use ukern::{Priority, UserScheduler};

/// Construction-time configuration for a [`Runtime`]. Passed to [`Runtime::new`]
/// rather than read from an implicit global config file; the hosting
/// framework is the only source of these values.
pub struct RuntimeConfig {
    pub core_count: u32,
    pub job_worker_count: u32,
    pub resource_manager: ManagerInfo,
}

/// Initializes a process-wide `tracing` subscriber writing to stderr. Call
/// once from the hosting application's entry point; library code never does
/// this itself.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Owns one instance of every layer: the fiber scheduler's dispatcher
/// threads, the job queue's worker threads, and the async resource
/// manager's control/memory/load threads.
pub struct Runtime {
    scheduler: Arc<UserScheduler>,
    jobs: Arc<JobQueue>,
    resources: Arc<AsyncResourceManager>,
    dispatcher_threads: Mutex<Vec<JoinHandle<()>>>,
    job_worker_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    #[must_use]
    pub fn new(
        heap: Arc<dyn IHeap>,
        file_device: Arc<dyn IFileDevice>,
        decompressor: Option<Arc<dyn IDecompressor>>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let core_count = config.core_count.max(1);
        let scheduler = UserScheduler::new(core_count);
        let jobs = Arc::new(JobQueue::new(core_count));
        let resources = AsyncResourceManager::new(heap, file_device, decompressor, config.resource_manager);

        let mut dispatcher_threads = Vec::with_capacity(core_count as usize);
        for core_id in 0..core_count {
            let scheduler = scheduler.clone();
            dispatcher_threads.push(
                std::thread::Builder::new()
                    .name(format!("ukern-dispatch-{core_id}"))
                    .spawn(move || scheduler.run_core(core_id))
                    .expect("failed to spawn dispatcher thread"),
            );
        }

        let job_worker_count = config.job_worker_count.max(1);
        let mut job_worker_threads = Vec::with_capacity(job_worker_count as usize);
        for worker_id in 0..job_worker_count {
            let jobs = jobs.clone();
            let core_id = worker_id % core_count;
            job_worker_threads.push(
                std::thread::Builder::new()
                    .name(format!("job-worker-{worker_id}"))
                    .spawn(move || {
                        while let Some(handle) = jobs.wait_for_job(core_id) {
                            jobs.run_job(handle);
                        }
                    })
                    .expect("failed to spawn job worker thread"),
            );
        }

        tracing::debug!(core_count, job_worker_count, "runtime constructed");
        Arc::new(Self {
            scheduler,
            jobs,
            resources,
            dispatcher_threads: Mutex::new(dispatcher_threads),
            job_worker_threads: Mutex::new(job_worker_threads),
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<UserScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn job_queue(&self) -> &Arc<JobQueue> {
        &self.jobs
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<AsyncResourceManager> {
        &self.resources
    }

    /// Spawns a cooperative fiber at `priority`, eligible to run on any core
    /// in `core_mask`.
    pub fn spawn_fiber<F>(&self, priority: Priority, core_mask: u64, body: F) -> ukern::Result<handle_table::Handle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.create_thread(priority, core_mask, body)
    }

    /// Requests the asynchronous load of a resource, returning a binder the
    /// caller can wait on or drop once it no longer needs the unit
    /// referenced.
    pub fn load_resource(&self, request: LoadRequest<'_>) -> Result<ResourceBinder, ResourceError> {
        self.resources.try_load_async(request)
    }

    /// Advances the resource manager's deferred-unload frame. The hosting
    /// application calls this once per tick (frame), analogous to the
    /// source's `Calculate()`.
    pub fn tick_resources(&self) {
        self.resources.calculate();
    }

    /// Submits a leaf job (no dependencies) for immediate dispatch.
    pub fn submit_job<F>(&self, priority: u16, core_affinity: Option<u32>, body: F) -> JobHandle
    where
        F: FnMut(u32) + Send + 'static,
    {
        let handle = self.jobs.add_job(priority, core_affinity, 1, body);
        self.jobs.schedule_ready();
        handle
    }

    /// Signals every subsystem to wind down and joins their worker threads.
    /// Blocks until every dispatcher and job worker thread has exited.
    pub fn shutdown(&self) {
        tracing::debug!("runtime shutdown requested");
        self.scheduler.request_shutdown();
        self.jobs.set_ready_to_exit();
        self.resources.shutdown();

        for handle in self.dispatcher_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        for handle in self.job_worker_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource::{CachePolicy, CompressionType, Resource};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct TestHeap;
    impl IHeap for TestHeap {
        fn try_allocate(&self, size: usize, _align: usize) -> Option<resource::HeapBlock> {
            Some(resource::HeapBlock::zeroed(size))
        }
        fn free(&self, _block: resource::HeapBlock) {}
        fn adjust_allocation(&self, _block: &mut resource::HeapBlock, new_size: usize) -> usize {
            new_size
        }
        fn maximum_allocatable_size(&self, _align: usize) -> usize {
            usize::MAX
        }
        fn adjust_heap(&self) -> (usize, usize) {
            (0, 0)
        }
        fn is_gpu_heap(&self) -> bool {
            false
        }
        fn is_thread_safe(&self) -> bool {
            true
        }
        fn total_size(&self) -> usize {
            usize::MAX
        }
        fn resize_heap_back(&self, _size: usize) {}
    }

    struct TestFileDevice {
        files: StdMutex<HashMap<String, Vec<u8>>>,
    }

    impl IFileDevice for TestFileDevice {
        fn open_file(&self, path: &str, _mode: resource::OpenMode) -> Result<resource::FileHandle, resource::FileError> {
            if self.files.lock().unwrap().contains_key(path) {
                Ok(resource::FileHandle(0))
            } else {
                Err(resource::FileError::FileNotFound)
            }
        }
        fn read_file(&self, _h: resource::FileHandle, buf: &mut [u8], offset: u64) -> Result<usize, resource::FileError> {
            let files = self.files.lock().unwrap();
            let data = files.values().next().unwrap();
            let offset = offset as usize;
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
        fn write_file(&self, _h: resource::FileHandle, _b: &[u8], _o: u64) -> Result<usize, resource::FileError> {
            unimplemented!()
        }
        fn close_file(&self, _h: resource::FileHandle) -> Result<(), resource::FileError> {
            Ok(())
        }
        fn file_size(&self, _h: resource::FileHandle) -> Result<u64, resource::FileError> {
            Ok(self.files.lock().unwrap().values().next().unwrap().len() as u64)
        }
        fn check_directory_exists(&self, _path: &str) -> bool {
            true
        }
    }

    struct NoopResource;
    impl Resource for NoopResource {}

    fn make_runtime(files: HashMap<String, Vec<u8>>) -> Arc<Runtime> {
        Runtime::new(
            Arc::new(TestHeap),
            Arc::new(TestFileDevice { files: StdMutex::new(files) }),
            None,
            RuntimeConfig {
                core_count: 1,
                job_worker_count: 1,
                resource_manager: ManagerInfo {
                    control_thread_info: resource::ThreadInfo {
                        name: "control".into(),
                        core_number: 0,
                        stack_size: 65536,
                        priority: 0,
                    },
                    memory_thread_info: resource::ThreadInfo {
                        name: "memory".into(),
                        core_number: 0,
                        stack_size: 65536,
                        priority: 0,
                    },
                    load_thread_info: vec![resource::ThreadInfo {
                        name: "load0".into(),
                        core_number: 0,
                        stack_size: 65536,
                        priority: 0,
                    }],
                    resource_size_table_path: None,
                },
            },
        )
    }

    #[test]
    fn fiber_runs_on_dispatcher_thread() {
        let runtime = make_runtime(HashMap::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        runtime.spawn_fiber(Priority(0), 0b1, move || {
            r.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn job_submission_runs_to_completion() {
        let runtime = make_runtime(HashMap::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let handle = runtime.submit_job(0, None, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        runtime.job_queue().wait_for_completion(handle);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn resource_load_reaches_loaded_status() {
        let mut files = HashMap::new();
        files.insert("a.bin".to_owned(), b"payload".to_vec());
        let runtime = make_runtime(files);
        let binder = runtime
            .load_resource(LoadRequest {
                path: "a.bin",
                priority: 0,
                allow_archive_reference: false,
                compression_type: CompressionType::None,
                cache_policy: CachePolicy::default(),
                resource_factory: Arc::new(|_: &[u8]| Box::new(NoopResource) as Box<dyn Resource>),
            })
            .unwrap();
        assert_eq!(binder.wait_for_load(), resource::ResourceUnitStatus::Loaded);
        drop(binder);
        runtime.tick_resources();
        runtime.shutdown();
    }
}
