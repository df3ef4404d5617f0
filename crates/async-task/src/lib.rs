//! Priority-leveled async task queue.
//!
//! An [`AsyncQueue`] holds one FIFO ring per priority level; one or more
//! [`AsyncQueueThread`]s drain it, always preferring the most urgent
//! non-empty level (level `0` is most urgent, mirroring the lower-is-more-urgent
//! convention used by [`job_queue`](../job_queue) and the UKern priority
//! queue). A task can ask to be rescheduled rather than completed, can be
//! cancelled before or during its run, and its priority can only move
//! upward (toward level `0`) once queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use handle_table::{Handle, HandleTable};

pub type TaskHandle = Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidHandle,
    InvalidPriority,
    /// [`AsyncQueue::change_priority`] only allows moving toward a more
    /// urgent (numerically lower) level.
    PriorityMustIncrease,
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidHandle => "invalid task handle",
            Error::InvalidPriority => "priority level out of range for this queue",
            Error::PriorityMustIncrease => "change_priority only allows increasing urgency",
            Error::Closed => "queue is closed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// What a task's body reports after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task is done; its watcher is signaled and `result_fn` is invoked
    /// with `is_rescheduled = false`.
    Success,
    /// The task should be placed back at the tail of its current level
    /// rather than completed; `result_fn` is invoked with
    /// `is_rescheduled = true` and the watcher is not yet signaled.
    Rescheduled,
}

/// Passed to a task's optional `result_fn` after each invocation.
#[derive(Debug, Clone, Copy)]
pub struct TaskResultInvokeInfo {
    pub is_cancelled: bool,
    pub is_rescheduled: bool,
}

type ExeFn = Box<dyn FnMut(&CancelFlag) -> TaskOutcome + Send>;
type ResultFn = Box<dyn FnMut(TaskResultInvokeInfo) + Send>;

/// Shared cancellation flag a running task body can poll.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A caller-held completion signal for one task, analogous to the source's
/// "watcher handle the caller waits on".
pub struct Watcher {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Watcher {
    fn new() -> Arc<Self> {
        Arc::new(Self { done: Mutex::new(false), cv: Condvar::new() })
    }

    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Blocks the calling thread until the task this watcher belongs to
    /// completes (successfully, cancelled, or by running out of retries).
    pub fn wait(&self) {
        let mut guard = self.done.lock().unwrap();
        while !*guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap()
    }
}

struct TaskSlot {
    exe_fn: Option<ExeFn>,
    result_fn: Option<ResultFn>,
    level: usize,
    cancel: CancelFlag,
    watcher: Arc<Watcher>,
}

struct Inner {
    rings: Vec<VecDeque<TaskHandle>>,
    tasks: HandleTable<TaskSlot>,
    closed: bool,
}

impl Inner {
    fn most_urgent_nonempty(&self) -> Option<usize> {
        self.rings.iter().position(|r| !r.is_empty())
    }
}

/// A priority-leveled ring of pending tasks, shared by one or more consumer
/// threads.
pub struct AsyncQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
    level_count: usize,
}

/// Describes a task submission.
pub struct TaskInfo {
    pub priority: usize,
    pub is_sync: bool,
    pub exe_fn: ExeFn,
    pub result_fn: Option<ResultFn>,
}

impl AsyncQueue {
    #[must_use]
    pub fn new(priority_level_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rings: (0..priority_level_count.max(1)).map(|_| VecDeque::new()).collect(),
                tasks: HandleTable::with_capacity(4096),
                closed: false,
            }),
            cv: Condvar::new(),
            level_count: priority_level_count.max(1),
        }
    }

    /// Queues `info` at its priority level. If `info.is_sync`, the returned
    /// [`Watcher`] should be waited on by the caller before returning;
    /// otherwise the caller may drop it and let the task run in the
    /// background.
    pub fn push_task(&self, info: TaskInfo) -> Result<(TaskHandle, Arc<Watcher>), Error> {
        if info.priority >= self.level_count {
            return Err(Error::InvalidPriority);
        }
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        let watcher = Watcher::new();
        let slot = TaskSlot {
            exe_fn: Some(info.exe_fn),
            result_fn: info.result_fn,
            level: info.priority,
            cancel: CancelFlag(Arc::new(AtomicBool::new(false))),
            watcher: watcher.clone(),
        };
        let handle = guard.tasks.reserve(slot).expect("async task table exhausted");
        guard.rings[info.priority].push_back(handle);
        drop(guard);
        tracing::trace!(priority = info.priority, is_sync = info.is_sync, "task pushed");
        self.cv.notify_one();
        if info.is_sync {
            watcher.wait();
        }
        Ok((handle, watcher))
    }

    /// Marks `handle` cancelled. A task already dispatched to a worker
    /// observes this the next time its body checks [`CancelFlag::is_cancelled`];
    /// a task still queued is skipped (treated as immediately cancelled) the
    /// next time a worker would have dequeued it.
    pub fn cancel_task(&self, handle: TaskHandle) -> Result<(), Error> {
        let guard = self.inner.lock().unwrap();
        let slot = guard.tasks.get(handle).ok_or(Error::InvalidHandle)?;
        slot.cancel.0.store(true, Ordering::Release);
        tracing::trace!(?handle, "task cancelled");
        Ok(())
    }

    /// Moves `handle` to a more urgent (numerically lower) level. Returns
    /// [`Error::PriorityMustIncrease`] if `new_priority` is not strictly more
    /// urgent than its current level, matching the "upward only" contract.
    pub fn change_priority(&self, handle: TaskHandle, new_priority: usize) -> Result<(), Error> {
        if new_priority >= self.level_count {
            return Err(Error::InvalidPriority);
        }
        let mut guard = self.inner.lock().unwrap();
        let current_level = guard.tasks.get(handle).ok_or(Error::InvalidHandle)?.level;
        if new_priority >= current_level {
            return Err(Error::PriorityMustIncrease);
        }
        if let Some(ring) = guard.rings.get_mut(current_level) {
            if let Some(pos) = ring.iter().position(|&h| h == handle) {
                ring.remove(pos);
                guard.rings[new_priority].push_back(handle);
            }
        }
        if let Some(slot) = guard.tasks.get_mut(handle) {
            slot.level = new_priority;
        }
        self.cv.notify_one();
        Ok(())
    }

    /// Pops and runs the single most urgent pending task on the calling
    /// thread, blocking until one is available or the queue is closed.
    /// Returns `false` once the queue is closed and drained.
    fn run_one(&self, block: bool) -> bool {
        let (handle, mut exe_fn, cancel, watcher) = {
            let mut guard = self.inner.lock().unwrap();
            loop {
                if let Some(level) = guard.most_urgent_nonempty() {
                    let handle = guard.rings[level].pop_front().unwrap();
                    let slot = guard.tasks.get_mut(handle).expect("stale task handle");
                    let exe_fn = slot.exe_fn.take().expect("task body missing");
                    break (handle, exe_fn, slot.cancel.clone(), slot.watcher.clone());
                }
                if guard.closed || !block {
                    return false;
                }
                guard = self.cv.wait(guard).unwrap();
            }
        };

        let outcome = if cancel.is_cancelled() { TaskOutcome::Success } else { exe_fn(&cancel) };
        let info = TaskResultInvokeInfo {
            is_cancelled: cancel.is_cancelled(),
            is_rescheduled: outcome == TaskOutcome::Rescheduled,
        };

        let mut guard = self.inner.lock().unwrap();
        let slot = guard.tasks.get_mut(handle).expect("stale task handle");
        if let Some(result_fn) = slot.result_fn.as_mut() {
            result_fn(info);
        }
        match outcome {
            TaskOutcome::Rescheduled if !cancel.is_cancelled() => {
                slot.exe_fn = Some(exe_fn);
                let level = slot.level;
                guard.rings[level].push_back(handle);
                self.cv.notify_one();
            }
            _ => {
                let _ = guard.tasks.free(handle);
                watcher.signal();
            }
        }
        true
    }

    /// Runs every currently pending task at or more urgent than
    /// `priority_threshold` synchronously on the calling thread, then
    /// returns. Used to force-drain control-plane work (e.g. before
    /// suspending a consumer thread) without waiting on a worker.
    pub fn force_calc_sync(&self, priority_threshold: usize) {
        loop {
            let has_work = {
                let guard = self.inner.lock().unwrap();
                guard
                    .rings
                    .iter()
                    .take(priority_threshold.saturating_add(1).min(self.level_count))
                    .any(|r| !r.is_empty())
            };
            if !has_work || !self.run_one(false) {
                break;
            }
        }
    }

    /// Closes the queue: [`Self::push_task`] starts failing and every
    /// blocked [`AsyncQueueThread::run`] loop returns once drained.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.rings.iter().all(VecDeque::is_empty)
    }
}

/// A consumer of an [`AsyncQueue`]. Typically one per dedicated OS thread;
/// several threads may share one queue.
pub struct AsyncQueueThread {
    queue: Arc<AsyncQueue>,
}

impl AsyncQueueThread {
    #[must_use]
    pub fn new(queue: Arc<AsyncQueue>) -> Self {
        Self { queue }
    }

    /// Runs tasks until the queue is closed and fully drained.
    pub fn run(&self) {
        while self.queue.run_one(true) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn push(queue: &AsyncQueue, priority: usize, f: impl FnMut(&CancelFlag) -> TaskOutcome + Send + 'static) -> Arc<Watcher> {
        queue
            .push_task(TaskInfo { priority, is_sync: false, exe_fn: Box::new(f), result_fn: None })
            .unwrap()
            .1
    }

    #[test]
    fn higher_urgency_level_runs_first() {
        let queue = Arc::new(AsyncQueue::new(3));
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        push(&queue, 2, move |_| {
            o1.lock().unwrap().push("low");
            TaskOutcome::Success
        });
        let o2 = order.clone();
        push(&queue, 0, move |_| {
            o2.lock().unwrap().push("high");
            TaskOutcome::Success
        });
        assert!(queue.run_one(false));
        assert!(queue.run_one(false));
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn rescheduled_task_runs_again() {
        let queue = Arc::new(AsyncQueue::new(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (_h, watcher) = queue
            .push_task(TaskInfo {
                priority: 0,
                is_sync: false,
                exe_fn: Box::new(move |_| {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { TaskOutcome::Rescheduled } else { TaskOutcome::Success }
                }),
                result_fn: None,
            })
            .unwrap();
        assert!(queue.run_one(false));
        assert!(queue.run_one(false));
        assert!(queue.run_one(false));
        watcher.wait();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let queue = Arc::new(AsyncQueue::new(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let (handle, watcher) = queue
            .push_task(TaskInfo {
                priority: 0,
                is_sync: false,
                exe_fn: Box::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    TaskOutcome::Success
                }),
                result_fn: None,
            })
            .unwrap();
        queue.cancel_task(handle).unwrap();
        assert!(queue.run_one(false));
        watcher.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn change_priority_rejects_downgrade() {
        let queue = AsyncQueue::new(3);
        let (handle, _w) = push_task_at(&queue, 1);
        assert_eq!(queue.change_priority(handle, 2), Err(Error::PriorityMustIncrease));
        assert!(queue.change_priority(handle, 0).is_ok());
    }

    fn push_task_at(queue: &AsyncQueue, priority: usize) -> (TaskHandle, Arc<Watcher>) {
        queue
            .push_task(TaskInfo { priority, is_sync: false, exe_fn: Box::new(|_| TaskOutcome::Success), result_fn: None })
            .unwrap()
    }
}
