//! Cooperative scheduler: one OS thread per fiber, coordinated through a
//! shared lock so that only one fiber per core ever runs user code at a
//! time. A fiber's thread blocks on its own [`Baton`] condvar whenever the
//! scheduler does not intend for it to be running; the scheduler only ever
//! touches [`SchedulerState`] while holding `inner`, and always drops that
//! lock before waking a fiber's baton or waiting on its own condvar, so user
//! code never runs while the scheduler lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use handle_table::{Handle, HandleTable};
use intrusive::{PriorityQueue, RingBuffer};

use crate::error::{Error, Result};
use crate::fls::{ActivityLevel, FiberRecord, FiberState, Priority, WaitReason};
use crate::time;

const LOCAL_RING_CAPACITY: usize = 8;

/// Tag bit OR'd into a lock word's owning handle once a second waiter
/// arrives, per `§3`'s "a lock address stores `handle | HAS_CHILD_WAITERS_BIT`".
pub const HAS_CHILD_WAITERS_BIT: u32 = 0x4000_0000;

enum BatonSignal {
    Idle,
    Run,
    Exit,
}

struct Baton {
    state: Mutex<BatonSignal>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self { state: Mutex::new(BatonSignal::Idle), cv: Condvar::new() }
    }

    fn signal(&self, s: BatonSignal) {
        *self.state.lock().unwrap() = s;
        self.cv.notify_one();
    }

    /// Blocks the calling (fiber) thread until told to run or exit.
    fn wait_for_run(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        loop {
            match *guard {
                BatonSignal::Run => {
                    *guard = BatonSignal::Idle;
                    return true;
                }
                BatonSignal::Exit => return false,
                BatonSignal::Idle => guard = self.cv.wait(guard).unwrap(),
            }
        }
    }
}

struct CoreState {
    local_ring: RingBuffer<Handle>,
    current: Option<Handle>,
}

impl CoreState {
    fn new() -> Self {
        Self { local_ring: RingBuffer::new(LOCAL_RING_CAPACITY), current: None }
    }
}

struct SchedulerState {
    fibers: HandleTable<FiberRecord>,
    batons: HashMap<Handle, Arc<Baton>>,
    join_handles: HashMap<Handle, JoinHandle<()>>,
    cores: Vec<CoreState>,
    /// Shared runnable queue, consulted once a core's local ring is empty.
    /// Keyed by `Reverse(priority.0)` rather than `Priority` directly: the
    /// underlying [`PriorityQueue`] is a min-heap and `Priority`'s natural
    /// order is ascending `-2..=2`, but `§3` defines higher priority as more
    /// eager to run (Win32 `THREAD_PRIORITY_*`-style), so the sign must be
    /// flipped for the heap to dispatch the most eager fiber first.
    ready_queue: PriorityQueue<(Priority, Handle), std::cmp::Reverse<i8>, fn(&(Priority, Handle)) -> std::cmp::Reverse<i8>>,
    /// Deadline-ordered sleepers and lock/key/address waiters whose timeout
    /// has not yet fired; address/key identity is carried in the fiber's own
    /// `wait_reason`, so this only needs to be ordered by deadline.
    timed_waits: BTreeMap<u64, Vec<Handle>>,
    current_activity_floor: ActivityLevel,
    shutting_down: bool,
}

/// The cooperative user-mode scheduler.
///
/// Owns one [`Baton`] per live fiber and a pool of dispatcher threads, one
/// per core. Every public method acquires `inner` only long enough to
/// mutate scheduler-owned state; it never calls into fiber code while held.
pub struct UserScheduler {
    inner: Mutex<SchedulerState>,
    cv: Condvar,
    core_count: u32,
}

fn priority_of(entry: &(Priority, Handle)) -> std::cmp::Reverse<i8> {
    std::cmp::Reverse(entry.0 .0)
}

impl UserScheduler {
    #[must_use]
    pub fn new(core_count: u32) -> Arc<Self> {
        let cores = (0..core_count).map(|_| CoreState::new()).collect();
        let state = SchedulerState {
            fibers: HandleTable::with_capacity(256),
            batons: HashMap::new(),
            join_handles: HashMap::new(),
            cores,
            ready_queue: PriorityQueue::new(priority_of),
            timed_waits: BTreeMap::new(),
            current_activity_floor: ActivityLevel::NORMAL,
            shutting_down: false,
        };
        Arc::new(Self { inner: Mutex::new(state), cv: Condvar::new(), core_count })
    }

    /// Creates a fiber and enqueues it as runnable on a core permitted by
    /// `core_mask`. The fiber's body runs on a dedicated OS thread that
    /// parks on its baton until the scheduler dispatches it.
    pub fn create_thread<F>(
        self: &Arc<Self>,
        priority: Priority,
        core_mask: u64,
        body: F,
    ) -> Result<Handle>
    where
        F: FnOnce() + Send + 'static,
    {
        if !priority.is_valid() {
            return Err(Error::InvalidPriority);
        }
        if core_mask == 0 {
            return Err(Error::InvalidCoreMask);
        }

        let record = FiberRecord::new(priority, core_mask);
        let mut guard = self.inner.lock().unwrap();
        let handle = guard.fibers.reserve(record)?;
        let baton = Arc::new(Baton::new());
        guard.batons.insert(handle, baton.clone());
        place_on_least_loaded_ring(&mut guard, handle, priority, core_mask);
        drop(guard);
        tracing::debug!(handle = handle.raw(), priority = priority.0, core_mask, "fiber created");

        let scheduler = self.clone();
        let join = std::thread::spawn(move || {
            if baton.wait_for_run() {
                body();
            }
            scheduler.on_fiber_exit(handle);
        });

        self.inner.lock().unwrap().join_handles.insert(handle, join);
        self.cv.notify_all();
        Ok(handle)
    }

    fn on_fiber_exit(self: &Arc<Self>, handle: Handle) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(record) = guard.fibers.get_mut(handle) {
            record.state = FiberState::Dead;
        }
        let _ = guard.fibers.free(handle);
        guard.batons.remove(&handle);
        for core in &mut guard.cores {
            if core.current == Some(handle) {
                core.current = None;
            }
        }
        self.cv.notify_all();
        tracing::trace!(handle = handle.raw(), "fiber exited");
    }

    /// Runs the dispatch loop for `core_id` until [`Self::request_shutdown`]
    /// is observed with no runnable work left anywhere. Intended to be
    /// called from a dedicated per-core dispatcher thread.
    pub fn run_core(self: &Arc<Self>, core_id: u32) {
        tracing::debug!(core_id, "dispatcher starting");
        loop {
            let mut guard = self.inner.lock().unwrap();
            self.wake_expired_timers(&mut guard);

            let next = self.pick_next(&mut guard, core_id);
            let Some(handle) = next else {
                if guard.shutting_down && self.all_cores_idle(&guard) {
                    tracing::debug!(core_id, "dispatcher exiting, no work left");
                    return;
                }
                let wait_ms = self.next_deadline_millis(&guard);
                tracing::trace!(core_id, wait_ms, "dispatcher idle, parking");
                let (g, _) = if wait_ms == time::MAX_TIME {
                    (self.cv.wait(guard).unwrap(), ())
                } else {
                    let (g, _) = self
                        .cv
                        .wait_timeout(guard, std::time::Duration::from_millis(wait_ms.min(1000)))
                        .unwrap();
                    (g, ())
                };
                drop(g);
                continue;
            };

            tracing::trace!(core_id, handle = handle.raw(), "dispatching fiber");
            guard.cores[core_id as usize].current = Some(handle);
            if let Some(record) = guard.fibers.get_mut(handle) {
                record.state = FiberState::Running;
                record.current_core = Some(core_id);
            }
            let baton = guard.batons.get(&handle).cloned();

            // Signal the fiber's thread to run while still holding the
            // scheduler lock: `Baton::signal` only touches its own private
            // mutex and returns immediately, it never blocks on `inner`, so
            // this cannot deadlock. The fiber's own thread clears
            // `cores[core_id].current` (via `release_core`) the moment it
            // re-enters the scheduler through a wait primitive, or on exit;
            // until then no other handle may be dispatched onto this core,
            // so we block here on the same guard rather than looping
            // immediately and risking two fibers running on one core at
            // once.
            if let Some(baton) = baton {
                baton.signal(BatonSignal::Run);
                guard = self
                    .cv
                    .wait_while(guard, |s| s.cores[core_id as usize].current == Some(handle))
                    .unwrap();
            }
            drop(guard);
        }
    }

    fn all_cores_idle(&self, guard: &SchedulerState) -> bool {
        guard.cores.iter().all(|c| c.current.is_none() && c.local_ring.is_empty())
            && guard.ready_queue.is_empty()
            && guard.timed_waits.is_empty()
    }

    fn next_deadline_millis(&self, guard: &SchedulerState) -> u64 {
        guard
            .timed_waits
            .keys()
            .next()
            .map_or(time::MAX_TIME, |&d| time::millis_until(d))
    }

    fn wake_expired_timers(&self, guard: &mut SchedulerState) {
        let now = time::system_tick();
        let expired: Vec<u64> = guard
            .timed_waits
            .range(..=now)
            .map(|(&d, _)| d)
            .collect();
        for deadline in expired {
            if let Some(handles) = guard.timed_waits.remove(&deadline) {
                for handle in handles {
                    tracing::trace!(handle = handle.raw(), deadline, "timer expired, requeueing");
                    requeue_runnable(guard, handle);
                }
            }
        }
    }

    /// Per `§4.C` step 3: prefer the local ring, then the shared queue. A
    /// shared-queue entry whose `core_mask` forbids `core_id` is not
    /// eligible to run here — it is redirected onto the least-loaded local
    /// ring among the cores it does permit, and the search continues with
    /// the next shared-queue entry, so no fiber is ever dispatched onto a
    /// core its `core_mask` excludes.
    fn pick_next(&self, guard: &mut SchedulerState, core_id: u32) -> Option<Handle> {
        if let Some(h) = guard.cores[core_id as usize].local_ring.remove_front() {
            tracing::trace!(core_id, handle = h.raw(), "dequeued from local ring");
            return Some(h);
        }
        loop {
            let (priority, handle) = guard.ready_queue.remove_front()?;
            let mask = guard.fibers.get(handle).map_or(u64::MAX, |r| r.core_mask);
            if core_allowed(mask, core_id) {
                tracing::trace!(core_id, handle = handle.raw(), "dequeued from shared ready queue");
                return Some(handle);
            }
            tracing::trace!(core_id, handle = handle.raw(), core_mask = mask, "core_mask forbids this core, redirecting");
            place_on_least_loaded_ring(guard, handle, priority, mask);
        }
    }

    /// Parks the calling fiber for `timeout_ns` nanoseconds. A non-positive
    /// timeout returns [`Error::Timeout`] immediately without parking, per
    /// the "timeout 0 fails immediately" boundary behavior.
    pub fn sleep_thread(self: &Arc<Self>, handle: Handle, timeout_ns: i64) -> Result<()> {
        if timeout_ns <= 0 {
            return Err(Error::Timeout);
        }
        let deadline = time::absolute_deadline(timeout_ns);
        tracing::trace!(handle = handle.raw(), timeout_ns, "sleep_thread parking");
        let baton = {
            let mut guard = self.inner.lock().unwrap();
            let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
            record.state = FiberState::Waiting;
            record.wait_reason = Some(WaitReason::Sleep);
            record.deadline = deadline;
            guard.timed_waits.entry(deadline).or_default().push(handle);
            release_core(&mut guard, handle);
            let baton = guard.batons.get(&handle).cloned();
            self.cv.notify_all();
            baton
        };
        if let Some(baton) = baton {
            baton.wait_for_run();
        }
        tracing::trace!(handle = handle.raw(), "sleep_thread woke");
        Ok(())
    }

    /// Attempts to acquire the lock at `lock_addr` on behalf of `handle`,
    /// tagging the word with `handle | HAS_CHILD_WAITERS_BIT` as soon as a
    /// second waiter arrives. Parks on the current owner's `wait_queue` if
    /// already held.
    pub fn arbitrate_lock(
        self: &Arc<Self>,
        handle: Handle,
        lock: &std::sync::atomic::AtomicU32,
        timeout_ns: i64,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        loop {
            let mut guard = self.inner.lock().unwrap();
            let current = lock.load(Ordering::Acquire);
            if current == 0 {
                lock.store(handle.raw(), Ordering::Release);
                tracing::trace!(handle = handle.raw(), "arbitrate_lock acquired uncontended");
                return Ok(());
            }
            let owner_raw = current & !HAS_CHILD_WAITERS_BIT;
            let owner = Handle::from_raw(owner_raw);
            if owner == handle {
                return Err(Error::InvalidLockAddressValue);
            }
            if current & HAS_CHILD_WAITERS_BIT == 0 {
                lock.store(owner_raw | HAS_CHILD_WAITERS_BIT, Ordering::Release);
            }
            if timeout_ns <= 0 {
                return Err(Error::Timeout);
            }
            let deadline = time::absolute_deadline(timeout_ns);
            let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
            record.state = FiberState::Waiting;
            record.wait_reason = Some(WaitReason::Lock { address: lock as *const _ as usize });
            record.deadline = deadline;
            let owner_record = guard.fibers.get_mut(owner).ok_or(Error::InvalidLockAddressValue)?;
            owner_record.wait_queue.push_back(handle);
            release_core(&mut guard, handle);
            let baton = guard.batons.get(&handle).cloned();
            self.cv.notify_all();
            drop(guard);
            tracing::trace!(handle = handle.raw(), owner = owner.raw(), "arbitrate_lock contended, parking");
            if let Some(baton) = baton {
                baton.wait_for_run();
            }
            // Woken: either handed the lock directly by `arbitrate_unlock`
            // (retry observes `current == handle`) or by timeout expiry.
            if lock.load(Ordering::Acquire) & !HAS_CHILD_WAITERS_BIT == handle.raw() {
                tracing::trace!(handle = handle.raw(), "arbitrate_lock handed off");
                return Ok(());
            }
            if time::system_tick() >= deadline {
                tracing::trace!(handle = handle.raw(), "arbitrate_lock timed out");
                return Err(Error::Timeout);
            }
        }
    }

    /// Releases a lock owned by `handle`, handing it to the next waiter in
    /// that fiber's `wait_queue` if one exists.
    pub fn arbitrate_unlock(
        self: &Arc<Self>,
        handle: Handle,
        lock: &std::sync::atomic::AtomicU32,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        let mut guard = self.inner.lock().unwrap();
        let current = lock.load(Ordering::Acquire);
        if current & !HAS_CHILD_WAITERS_BIT != handle.raw() {
            return Err(Error::RequiresLock);
        }
        let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
        let next = record.wait_queue.pop_front();
        match next {
            Some(next_handle) => {
                let has_more = !record.wait_queue.is_empty();
                let tag = if has_more { next_handle.raw() | HAS_CHILD_WAITERS_BIT } else { next_handle.raw() };
                lock.store(tag, Ordering::Release);
                tracing::trace!(handle = handle.raw(), next = next_handle.raw(), "arbitrate_unlock handing off");
                requeue_runnable(&mut guard, next_handle);
                drop(guard);
                self.cv.notify_all();
            }
            None => {
                lock.store(0, Ordering::Release);
                tracing::trace!(handle = handle.raw(), "arbitrate_unlock released, no waiters");
            }
        }
        Ok(())
    }

    /// Atomically releases `lock`, parks `handle` on the condition chain
    /// rooted at `cv_key`, and on wake reacquires `lock` before returning.
    pub fn wait_key(
        self: &Arc<Self>,
        handle: Handle,
        lock: &std::sync::atomic::AtomicU32,
        cv_key: &std::sync::atomic::AtomicU32,
        timeout_ns: i64,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        self.arbitrate_unlock(handle, lock)?;
        if timeout_ns <= 0 {
            return Err(Error::Timeout);
        }
        let deadline = time::absolute_deadline(timeout_ns);
        let baton = {
            let mut guard = self.inner.lock().unwrap();
            let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
            record.state = FiberState::Waiting;
            record.wait_reason = Some(WaitReason::Key { key: cv_key as *const _ as usize });
            record.deadline = deadline;
            cv_key.store(1, Ordering::Release);
            guard.timed_waits.entry(deadline).or_default().push(handle);
            release_core(&mut guard, handle);
            let baton = guard.batons.get(&handle).cloned();
            self.cv.notify_all();
            baton
        };
        tracing::trace!(handle = handle.raw(), "wait_key parking on condition variable");
        if let Some(baton) = baton {
            baton.wait_for_run();
        }
        tracing::trace!(handle = handle.raw(), "wait_key woke, re-arbitrating lock");
        self.arbitrate_lock(handle, lock, i64::MAX)
    }

    /// Wakes up to `count` fibers parked in [`Self::wait_key`] on `cv_key`,
    /// each either re-acquiring `lock` directly (if free) or being
    /// transferred onto the lock's waiter chain.
    pub fn signal_key(
        self: &Arc<Self>,
        _lock: &std::sync::atomic::AtomicU32,
        cv_key: &std::sync::atomic::AtomicU32,
        count: u32,
    ) -> Result<u32> {
        let key_addr = cv_key as *const _ as usize;
        let mut guard = self.inner.lock().unwrap();
        let waiting: Vec<Handle> = collect_timed_waiters(&guard, |r| {
            matches!(r.wait_reason, Some(WaitReason::Key { key }) if key == key_addr)
        });
        if waiting.is_empty() {
            return Err(Error::NoWaiters);
        }
        let mut woken = 0;
        for handle in waiting.into_iter().take(count.max(1) as usize) {
            remove_from_timed_waits(&mut guard, handle);
            requeue_runnable(&mut guard, handle);
            woken += 1;
        }
        self.cv.notify_all();
        tracing::trace!(key = key_addr, woken, "signal_key woke waiters");
        Ok(woken)
    }

    /// Parks `handle` while `*addr == value` holds, subject to `timeout_ns`.
    pub fn wait_for_address_if_equal(
        self: &Arc<Self>,
        handle: Handle,
        addr: &std::sync::atomic::AtomicU32,
        value: u32,
        timeout_ns: i64,
    ) -> Result<()> {
        self.park_on_address(handle, addr, WaitReason::AddressIfEqual { address: addr as *const _ as usize }, move |v| v == value, timeout_ns)
    }

    /// Parks `handle` while `*addr < value` holds, subject to `timeout_ns`.
    pub fn wait_for_address_if_less_than(
        self: &Arc<Self>,
        handle: Handle,
        addr: &std::sync::atomic::AtomicU32,
        value: u32,
        timeout_ns: i64,
    ) -> Result<()> {
        self.park_on_address(handle, addr, WaitReason::AddressIfLessThan { address: addr as *const _ as usize }, move |v| v < value, timeout_ns)
    }

    fn park_on_address(
        self: &Arc<Self>,
        handle: Handle,
        addr: &std::sync::atomic::AtomicU32,
        reason: WaitReason,
        predicate: impl Fn(u32) -> bool,
        timeout_ns: i64,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        if !predicate(addr.load(Ordering::Acquire)) {
            return Ok(());
        }
        if timeout_ns <= 0 {
            return Err(Error::Timeout);
        }
        let deadline = time::absolute_deadline(timeout_ns);
        let baton = {
            let mut guard = self.inner.lock().unwrap();
            let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
            record.state = FiberState::Waiting;
            record.wait_reason = Some(reason);
            record.deadline = deadline;
            guard.timed_waits.entry(deadline).or_default().push(handle);
            release_core(&mut guard, handle);
            let baton = guard.batons.get(&handle).cloned();
            self.cv.notify_all();
            baton
        };
        tracing::trace!(handle = handle.raw(), "park_on_address parking");
        if let Some(baton) = baton {
            baton.wait_for_run();
        }
        tracing::trace!(handle = handle.raw(), "park_on_address woke");
        Ok(())
    }

    /// Wakes up to `count` fibers parked on `addr` via
    /// [`Self::wait_for_address_if_equal`] or
    /// [`Self::wait_for_address_if_less_than`].
    pub fn wake_by_address(self: &Arc<Self>, addr: &std::sync::atomic::AtomicU32, count: u32) -> Result<u32> {
        let key_addr = addr as *const _ as usize;
        let mut guard = self.inner.lock().unwrap();
        let waiting: Vec<Handle> = collect_timed_waiters(&guard, |r| match r.wait_reason {
            Some(WaitReason::AddressIfEqual { address }) | Some(WaitReason::AddressIfLessThan { address }) => {
                address == key_addr
            }
            _ => false,
        });
        if waiting.is_empty() {
            return Err(Error::NoWaiters);
        }
        let mut woken = 0;
        for handle in waiting.into_iter().take(count.max(1) as usize) {
            remove_from_timed_waits(&mut guard, handle);
            requeue_runnable(&mut guard, handle);
            woken += 1;
        }
        self.cv.notify_all();
        tracing::trace!(address = key_addr, woken, "wake_by_address woke waiters");
        Ok(woken)
    }

    /// Increments `*addr` then wakes up to `count` fibers parked on it via
    /// [`Self::wait_for_address_if_equal`].
    pub fn wake_by_address_increment_equal(
        self: &Arc<Self>,
        addr: &std::sync::atomic::AtomicU32,
        count: u32,
    ) -> Result<u32> {
        addr.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        self.wake_by_address(addr, count)
    }

    /// Decrements `*addr` then wakes up to `count` fibers parked on it via
    /// [`Self::wait_for_address_if_less_than`]. `count == 0` is treated as
    /// "wake exactly one waiter" (see `DESIGN.md`'s Open Question
    /// resolution), not "wake nobody".
    pub fn wake_by_address_modify_less_than(
        self: &Arc<Self>,
        addr: &std::sync::atomic::AtomicU32,
        count: u32,
    ) -> Result<u32> {
        addr.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        self.wake_by_address(addr, if count == 0 { 1 } else { count })
    }

    /// Adjusts `handle`'s priority; returns [`Error::SamePriority`] if
    /// unchanged, matching the source API's "report no-op" convention.
    pub fn set_priority(&self, handle: Handle, priority: Priority) -> Result<()> {
        if !priority.is_valid() {
            return Err(Error::InvalidPriority);
        }
        let mut guard = self.inner.lock().unwrap();
        let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
        if record.priority == priority {
            return Err(Error::SamePriority);
        }
        record.priority = priority;
        tracing::trace!(handle = handle.raw(), priority = priority.0, "priority changed");
        Ok(())
    }

    pub fn set_activity_level(&self, handle: Handle, level: ActivityLevel) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
        if record.activity_level == level {
            return Err(Error::SameActivityLevel);
        }
        record.activity_level = level;
        tracing::trace!(handle = handle.raw(), activity_level = level.0, "activity level changed");
        Ok(())
    }

    pub fn set_core_mask(&self, handle: Handle, mask: u64) -> Result<()> {
        if mask == 0 {
            return Err(Error::InvalidCoreMask);
        }
        let mut guard = self.inner.lock().unwrap();
        let record = guard.fibers.get_mut(handle).ok_or(Error::InvalidHandle)?;
        if record.core_mask == mask {
            return Err(Error::SameCoreMask);
        }
        record.core_mask = mask;
        tracing::trace!(handle = handle.raw(), core_mask = mask, "core mask changed");
        Ok(())
    }

    /// Requests that every dispatcher loop wind down once its core has no
    /// more runnable work. Does not forcibly interrupt running fibers.
    pub fn request_shutdown(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.shutting_down = true;
        self.cv.notify_all();
        tracing::debug!("shutdown requested");
    }
}

/// Collects the handles of every fiber on the global timed-wait list whose
/// `FiberRecord` satisfies `predicate`, in insertion order. Used by the key
/// and address wake primitives, which target a specific address/key rather
/// than the earliest deadline.
fn collect_timed_waiters(guard: &SchedulerState, predicate: impl Fn(&FiberRecord) -> bool) -> Vec<Handle> {
    let mut out = Vec::new();
    for handles in guard.timed_waits.values() {
        for &handle in handles {
            if guard.fibers.get(handle).is_some_and(&predicate) {
                out.push(handle);
            }
        }
    }
    out
}

fn remove_from_timed_waits(guard: &mut SchedulerState, handle: Handle) {
    let deadline = guard.fibers.get(handle).map(|r| r.deadline);
    if let Some(deadline) = deadline {
        if let Some(list) = guard.timed_waits.get_mut(&deadline) {
            list.retain(|&h| h != handle);
            if list.is_empty() {
                guard.timed_waits.remove(&deadline);
            }
        }
    }
}

/// Clears the core slot a parking or exiting fiber was occupying, so the
/// dispatcher blocked in [`UserScheduler::run_core`] can proceed. Must be
/// called with `inner` held, immediately before the fiber's thread parks on
/// its baton (or tears itself down), so no other fiber is ever dispatched
/// onto the same core while this one is still mid-flight.
fn release_core(guard: &mut SchedulerState, handle: Handle) {
    let core = guard.fibers.get(handle).and_then(|r| r.current_core);
    if let Some(core) = core {
        if let Some(c) = guard.cores.get_mut(core as usize) {
            if c.current == Some(handle) {
                c.current = None;
            }
        }
    }
}

fn requeue_runnable(guard: &mut SchedulerState, handle: Handle) {
    let Some(record) = guard.fibers.get_mut(handle) else { return };
    record.state = FiberState::Runnable;
    record.wait_reason = None;
    let priority = record.priority;
    let mask = record.core_mask;
    place_on_least_loaded_ring(guard, handle, priority, mask);
}

/// `true` iff `core_id` is one of the cores permitted by `mask`. A core id
/// at or beyond the bit width of `mask` is treated as forbidden.
fn core_allowed(mask: u64, core_id: u32) -> bool {
    core_id < 64 && (mask & (1u64 << core_id)) != 0
}

/// Places `handle` onto the local ring of the least-loaded core its
/// `core_mask` permits (per `§4.C` step 3's "rank the allowed cores by
/// `LocalRing[core].count` ascending"), falling back to the shared ready
/// queue if every permitted ring is full or `mask` names no core this
/// scheduler has.
fn place_on_least_loaded_ring(guard: &mut SchedulerState, handle: Handle, priority: Priority, mask: u64) {
    let target = (0..guard.cores.len())
        .filter(|&c| core_allowed(mask, c as u32))
        .min_by_key(|&c| guard.cores[c].local_ring.len());
    if let Some(core) = target {
        if guard.cores[core].local_ring.insert(handle).is_ok() {
            return;
        }
    }
    guard.ready_queue.insert((priority, handle));
}
