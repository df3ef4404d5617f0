//! End-to-end scenarios exercising the job queue, the fiber scheduler, and
//! the resource manager the way a hosting application actually drives them,
//! rather than one layer in isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use job_queue::JobQueue;
use resource::{
    AsyncResourceManager, CachePolicy, CompressionType, FileError, FileHandle, HeapBlock, IFileDevice, IHeap,
    LoadRequest, ManagerInfo, OpenMode, Resource, ResourceUnitStatus, ThreadInfo,
};
use runtime::{Runtime, RuntimeConfig};
use ukern::{Priority, UserScheduler};

struct TestHeap;
impl IHeap for TestHeap {
    fn try_allocate(&self, size: usize, _align: usize) -> Option<HeapBlock> {
        Some(HeapBlock::zeroed(size))
    }
    fn free(&self, _block: HeapBlock) {}
    fn adjust_allocation(&self, _block: &mut HeapBlock, new_size: usize) -> usize {
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

struct CountingFileDevice {
    files: Mutex<HashMap<String, Vec<u8>>>,
    opens: AtomicUsize,
}

impl IFileDevice for CountingFileDevice {
    fn open_file(&self, path: &str, _mode: OpenMode) -> Result<FileHandle, FileError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.files.lock().unwrap().contains_key(path) {
            Ok(FileHandle(0))
        } else {
            Err(FileError::FileNotFound)
        }
    }
    fn read_file(&self, _h: FileHandle, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        let files = self.files.lock().unwrap();
        let data = files.values().next().unwrap();
        let offset = offset as usize;
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
    fn write_file(&self, _h: FileHandle, _b: &[u8], _o: u64) -> Result<usize, FileError> {
        unimplemented!()
    }
    fn close_file(&self, _h: FileHandle) -> Result<(), FileError> {
        Ok(())
    }
    fn file_size(&self, _h: FileHandle) -> Result<u64, FileError> {
        Ok(self.files.lock().unwrap().values().next().unwrap().len() as u64)
    }
    fn check_directory_exists(&self, _path: &str) -> bool {
        true
    }
}

struct NoopResource;
impl Resource for NoopResource {}

fn thread_info(name: &str) -> ThreadInfo {
    ThreadInfo { name: name.to_owned(), core_number: 0, stack_size: 65536, priority: 0 }
}

fn make_runtime(files: HashMap<String, Vec<u8>>) -> (Arc<Runtime>, Arc<CountingFileDevice>) {
    let file_device = Arc::new(CountingFileDevice { files: Mutex::new(files), opens: AtomicUsize::new(0) });
    let runtime = Runtime::new(
        Arc::new(TestHeap),
        file_device.clone(),
        None,
        RuntimeConfig {
            core_count: 2,
            job_worker_count: 2,
            resource_manager: ManagerInfo {
                control_thread_info: thread_info("control"),
                memory_thread_info: thread_info("memory"),
                load_thread_info: vec![thread_info("load0")],
                resource_size_table_path: None,
            },
        },
    );
    (runtime, file_device)
}

/// Scenario 1: a single job with no dependencies and one run, dispatched to
/// a pool of workers, runs exactly once.
#[test]
fn single_job_runs_exactly_once_across_workers() {
    let (runtime, _files) = make_runtime(HashMap::new());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = invocations.clone();
    let job = runtime.submit_job(2, None, move |_run_index| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    runtime.job_queue().wait_for_completion(job);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    runtime.shutdown();
}

/// Scenario 2: `A -> {B, C}`, `D -> C`. `A` must complete before `B` and `C`
/// start; `D` must complete before `C` starts; `B` and `C` may overlap.
#[test]
fn dependency_fan_out_respects_parent_completion() {
    let queue = JobQueue::new(1);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let a = queue.add_job(0, None, 1, move |_| o.lock().unwrap().push("A"));
    let o = order.clone();
    let b = queue.add_job(0, None, 1, move |_| o.lock().unwrap().push("B"));
    let o = order.clone();
    let c = queue.add_job(0, None, 1, move |_| o.lock().unwrap().push("C"));
    let o = order.clone();
    let d = queue.add_job(0, None, 1, move |_| o.lock().unwrap().push("D"));

    queue.add_dependency(a, b).unwrap();
    queue.add_dependency(a, c).unwrap();
    queue.add_dependency(d, c).unwrap();
    queue.schedule_ready();

    // Only A and D have no parents; run D first, then A, then whichever of
    // B/C becomes ready.
    let first = queue.acquire_next_job(0).unwrap();
    assert!(first.raw() == a.raw() || first.raw() == d.raw());
    queue.run_job(first);
    let second = queue.acquire_next_job(0).unwrap();
    queue.run_job(second);

    while let Some(h) = queue.acquire_next_job(0) {
        queue.run_job(h);
    }

    let order = order.lock().unwrap();
    let pos = |name: &str| order.iter().position(|&x| x == name).unwrap();
    assert!(pos("A") < pos("B"));
    assert!(pos("A") < pos("C"));
    assert!(pos("D") < pos("C"));
}

/// Scenario 3: jobs pinned to core 0 and core 1 are only ever handed to that
/// core's queue; a job with no affinity is reachable from either.
#[test]
fn core_pinned_jobs_stay_on_their_core() {
    let queue = JobQueue::new(2);
    let a = queue.add_job(0, Some(0), 1, |_| {});
    let b = queue.add_job(0, Some(1), 1, |_| {});
    let c = queue.add_job(0, None, 1, |_| {});
    queue.schedule_ready();

    assert_eq!(queue.acquire_next_job(0).unwrap().raw(), a.raw());
    assert_eq!(queue.acquire_next_job(1).unwrap().raw(), b.raw());
    // `C` went to the shared ready queue, reachable from either core.
    assert_eq!(queue.acquire_next_job(0).unwrap().raw(), c.raw());
}

/// Scenario 4: a job with `multi_run_count = 3` is observed running exactly
/// three times, and its dependent only becomes runnable once all three runs
/// have finished (not after the first).
#[test]
fn multi_run_job_completes_all_runs_before_dependent() {
    let queue = Arc::new(JobQueue::new(1));
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let a = queue.add_job(0, None, 3, move |_run_index| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let child_ran = Arc::new(AtomicBool::new(false));
    let cr = child_ran.clone();
    let child = queue.add_job(0, None, 1, move |_| cr.store(true, Ordering::SeqCst));
    queue.add_dependency(a, child).unwrap();
    queue.schedule_ready();

    // Drain every dispatched run of `A` before `child` can appear.
    for _ in 0..3 {
        let h = queue.acquire_next_job(0).unwrap();
        assert_eq!(h.raw(), a.raw());
        assert!(!child_ran.load(Ordering::SeqCst));
        queue.run_job(h);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let h = queue.acquire_next_job(0).unwrap();
    assert_eq!(h.raw(), child.raw());
    queue.run_job(h);
    assert!(child_ran.load(Ordering::SeqCst));
}

/// Scenario 5: fiber 1 holds a lock and waits on a condition key; fiber 2
/// takes the lock, signals the key, and releases it. Fiber 1 must resume
/// holding the lock, and the lock word must read back as "free" once fiber 1
/// releases it in turn (no other waiter remained).
#[test]
fn lock_and_condition_variable_handoff() {
    let scheduler = UserScheduler::new(1);
    let lock = Arc::new(AtomicU32::new(0));
    let cv_key = Arc::new(AtomicU32::new(0));
    let handle1_cell: Arc<Mutex<Option<handle_table::Handle>>> = Arc::new(Mutex::new(None));
    let resumed_holding_lock = Arc::new(AtomicBool::new(false));

    let sched1 = scheduler.clone();
    let lock1 = lock.clone();
    let key1 = cv_key.clone();
    let cell1 = handle1_cell.clone();
    let resumed = resumed_holding_lock.clone();
    let h1 = scheduler
        .create_thread(Priority(0), 0b1, move || {
            let handle = cell1.lock().unwrap().expect("handle1 set before dispatch");
            sched1.arbitrate_lock(handle, &lock1, i64::MAX).unwrap();
            sched1.wait_key(handle, &lock1, &key1, i64::MAX).unwrap();
            resumed.store(true, Ordering::SeqCst);
            sched1.arbitrate_unlock(handle, &lock1).unwrap();
        })
        .unwrap();
    *handle1_cell.lock().unwrap() = Some(h1);

    let sched2 = scheduler.clone();
    let lock2 = lock.clone();
    let key2 = cv_key.clone();
    let handle2_cell: Arc<Mutex<Option<handle_table::Handle>>> = Arc::new(Mutex::new(None));
    let cell2 = handle2_cell.clone();
    let h2 = scheduler
        .create_thread(Priority(0), 0b1, move || {
            // Give fiber 1 a chance to acquire the lock and park on the key
            // before fiber 2 signals it.
            std::thread::sleep(Duration::from_millis(30));
            let handle = cell2.lock().unwrap().expect("handle2 set before dispatch");
            sched2.arbitrate_lock(handle, &lock2, i64::MAX).unwrap();
            sched2.signal_key(&lock2, &key2, 1).unwrap();
            sched2.arbitrate_unlock(handle, &lock2).unwrap();
        })
        .unwrap();
    *handle2_cell.lock().unwrap() = Some(h2);

    let dispatcher = scheduler.clone();
    let dispatcher_thread = std::thread::spawn(move || dispatcher.run_core(0));

    std::thread::sleep(Duration::from_millis(200));
    assert!(resumed_holding_lock.load(Ordering::SeqCst));
    assert_eq!(lock.load(Ordering::SeqCst), 0);

    scheduler.request_shutdown();
    dispatcher_thread.join().unwrap();
}

/// Scenario 6: two `TryLoadAsync` calls for the same path issued back to
/// back, before the first completes, dedup onto one unit: the file is read
/// exactly once, both binders observe the same unit once loaded, and the
/// reference count reflects both live binders.
#[test]
fn resource_reload_before_completion_dedups() {
    let mut files = HashMap::new();
    files.insert("a.bin".to_owned(), b"payload".to_vec());
    let file_device = Arc::new(CountingFileDevice { files: Mutex::new(files), opens: AtomicUsize::new(0) });
    let manager = AsyncResourceManager::new(
        Arc::new(TestHeap),
        file_device.clone(),
        None,
        ManagerInfo {
            control_thread_info: thread_info("control"),
            memory_thread_info: thread_info("memory"),
            load_thread_info: vec![thread_info("load0")],
            resource_size_table_path: None,
        },
    );

    let factory: Arc<dyn Fn(&[u8]) -> Box<dyn Resource> + Send + Sync> =
        Arc::new(|_: &[u8]| Box::new(NoopResource) as Box<dyn Resource>);

    let request = |factory: Arc<dyn Fn(&[u8]) -> Box<dyn Resource> + Send + Sync>| LoadRequest {
        path: "a.bin",
        priority: 0,
        allow_archive_reference: false,
        compression_type: CompressionType::None,
        cache_policy: CachePolicy::default(),
        resource_factory: factory,
    };

    let b1 = manager.try_load_async(request(factory.clone())).unwrap();
    let b2 = manager.try_load_async(request(factory)).unwrap();

    assert!(b1.points_to_same_unit(&b2));
    assert_eq!(b1.wait_for_load(), ResourceUnitStatus::Loaded);
    assert_eq!(b2.status(), ResourceUnitStatus::Loaded);
    assert!(b1.reference_count() >= 2);
    assert_eq!(file_device.opens.load(Ordering::SeqCst), 1);

    manager.shutdown();
}
