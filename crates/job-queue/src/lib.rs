//! Dependency-aware parallel job queue.
//!
//! Jobs form a DAG: a job only becomes runnable once every job it depends on
//! has finished. Each job can additionally be scheduled to run more than
//! once concurrently (`multi_run`), in which case its dependents only become
//! runnable once every run has finished, not just the first.

use std::fmt;
use std::sync::{Condvar, Mutex};

use handle_table::{Handle, HandleTable};
use intrusive::PriorityQueue;

/// Key extractor for the priority queues below: lower `priority` dispatches
/// first, FIFO within equal priority (the queue's own tiebreaker).
type PriorityKeyFn = fn(&(u16, Handle)) -> u16;
fn priority_key(entry: &(u16, Handle)) -> u16 {
    entry.0
}
type JobRing = PriorityQueue<(u16, Handle), u16, PriorityKeyFn>;

pub type JobHandle = Handle;

/// Sentinel `parent_count` marking a job that has already finished all its
/// runs and had its dependencies torn down; distinguishes "done" from
/// "has zero dependencies and was never finished" (which is `0`).
const TOMBSTONE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidHandle,
    WouldCreateCycle,
    AlreadyFinished,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidHandle => "invalid job handle",
            Error::WouldCreateCycle => "dependency would create a cycle",
            Error::AlreadyFinished => "job has already finished all its runs",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<handle_table::Error> for Error {
    fn from(_: handle_table::Error) -> Self {
        Error::InvalidHandle
    }
}

type JobBody = Box<dyn FnMut(u32) + Send>;

struct JobNode {
    body: Option<JobBody>,
    dependents: Vec<Handle>,
    /// Number of not-yet-finished jobs this one depends on. `TOMBSTONE` once
    /// this job has fully finished and propagated to its dependents.
    parent_count: u32,
    priority: u16,
    core_affinity: Option<u32>,
    /// Total number of runs requested (>=1).
    total_runs: u16,
    /// Runs handed out to a worker but not yet finished.
    active_running_count: u16,
    /// Runs handed out so far, including ones already finished.
    runs_dispatched: u16,
}

struct Inner {
    nodes: HandleTable<JobNode>,
    ready_queue: JobRing,
    core_queues: Vec<JobRing>,
    outstanding: usize,
    ready_to_exit: bool,
}

/// A dependency graph of jobs plus the run queues workers pull from.
pub struct JobQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
    finished_cv: Condvar,
}

impl JobQueue {
    #[must_use]
    pub fn new(core_count: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HandleTable::with_capacity(1024),
                ready_queue: PriorityQueue::new(priority_key),
                core_queues: (0..core_count).map(|_| PriorityQueue::new(priority_key)).collect(),
                outstanding: 0,
                ready_to_exit: false,
            }),
            cv: Condvar::new(),
            finished_cv: Condvar::new(),
        }
    }

    /// Adds a job. It becomes runnable immediately if it has no
    /// dependencies added afterward via [`Self::add_dependency`].
    pub fn add_job<F>(&self, priority: u16, core_affinity: Option<u32>, runs: u16, body: F) -> JobHandle
    where
        F: FnMut(u32) + Send + 'static,
    {
        let runs = runs.max(1);
        let mut guard = self.inner.lock().unwrap();
        let node = JobNode {
            body: Some(Box::new(body)),
            dependents: Vec::new(),
            parent_count: 0,
            priority,
            core_affinity,
            total_runs: runs,
            active_running_count: 0,
            runs_dispatched: 0,
        };
        let handle = guard.nodes.reserve(node).expect("job table exhausted");
        guard.outstanding += 1;
        tracing::trace!(handle = handle.raw(), priority, core_affinity = ?core_affinity, runs, "job added");
        handle
    }

    /// Declares that `child` must not run until `parent` has fully finished.
    /// Must be called before the graph starts draining (before any call to
    /// [`Self::schedule_ready`]); does not detect cycles introduced after
    /// jobs have already started running.
    pub fn add_dependency(&self, parent: JobHandle, child: JobHandle) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        if guard.nodes.get(parent).is_none() {
            return Err(Error::InvalidHandle);
        }
        {
            let child_node = guard.nodes.get_mut(child).ok_or(Error::InvalidHandle)?;
            if child_node.parent_count == TOMBSTONE {
                return Err(Error::AlreadyFinished);
            }
            child_node.parent_count += 1;
        }
        let parent_node = guard.nodes.get_mut(parent).ok_or(Error::InvalidHandle)?;
        parent_node.dependents.push(child);
        tracing::trace!(parent = parent.raw(), child = child.raw(), "dependency added");
        Ok(())
    }

    /// Pushes every job with no outstanding dependencies onto its run queue.
    /// Call once after the graph has been fully built with
    /// [`Self::add_job`]/[`Self::add_dependency`].
    pub fn schedule_ready(&self) {
        let mut guard = self.inner.lock().unwrap();
        let ready: Vec<Handle> = collect_parentless(&guard);
        tracing::debug!(ready_count = ready.len(), "schedule_ready enqueuing parentless jobs");
        for handle in ready {
            enqueue(&mut guard, handle);
        }
        self.cv.notify_all();
    }

    /// Pulls the next job for `core_id`: its own core-pinned queue first,
    /// then the shared ready queue (skipping entries pinned to a different
    /// core).
    pub fn acquire_next_job(&self, core_id: u32) -> Option<JobHandle> {
        let mut guard = self.inner.lock().unwrap();
        if let Some((_, h)) = guard.core_queues[core_id as usize].remove_front() {
            tracing::trace!(core_id, handle = h.raw(), "acquired from core-pinned queue");
            return Some(h);
        }
        let job = guard.ready_queue.remove_front().map(|(_, h)| h);
        if let Some(h) = job {
            tracing::trace!(core_id, handle = h.raw(), "acquired from shared ready queue");
        }
        job
    }

    /// Blocks until a job is available or the queue is drained and marked
    /// ready to exit.
    pub fn wait_for_job(&self, core_id: u32) -> Option<JobHandle> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some((_, h)) = guard.core_queues[core_id as usize].remove_front() {
                tracing::trace!(core_id, handle = h.raw(), "wait_for_job dequeued from core-pinned queue");
                return Some(h);
            }
            if let Some((_, h)) = guard.ready_queue.remove_front() {
                tracing::trace!(core_id, handle = h.raw(), "wait_for_job dequeued from shared ready queue");
                return Some(h);
            }
            if guard.ready_to_exit && guard.outstanding == 0 {
                tracing::debug!(core_id, "wait_for_job exiting, queue drained");
                return None;
            }
            tracing::trace!(core_id, "wait_for_job parking");
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Runs one dispatched copy of `handle`'s body. Runs of a `multi_run`
    /// job are dispatched one at a time, each receiving its run index; once
    /// the last run finishes, completion propagates to dependents.
    pub fn run_job(&self, handle: JobHandle) {
        let (mut body, run_index) = {
            let mut guard = self.inner.lock().unwrap();
            let node = guard.nodes.get_mut(handle).expect("stale job handle");
            node.active_running_count += 1;
            let run_index = node.runs_dispatched;
            node.runs_dispatched += 1;
            let body = node.body.take().expect("job body missing");
            (body, run_index)
        };

        tracing::trace!(handle = handle.raw(), run_index, "run_job dispatching");
        body(u32::from(run_index));

        let mut guard = self.inner.lock().unwrap();
        let more_runs_remaining = {
            let node = guard.nodes.get_mut(handle).expect("stale job handle");
            node.active_running_count -= 1;
            node.body = Some(body);
            node.runs_dispatched < node.total_runs
        };
        if more_runs_remaining {
            tracing::trace!(handle = handle.raw(), run_index, "run_job re-enqueuing remaining run");
            enqueue(&mut guard, handle);
            self.cv.notify_all();
        } else {
            tracing::debug!(handle = handle.raw(), run_index, "run_job finished all runs");
            self.finish_job(&mut guard, handle);
            self.finished_cv.notify_all();
        }
    }

    fn finish_job(&self, guard: &mut Inner, handle: JobHandle) {
        let dependents = {
            let node = guard.nodes.get_mut(handle).expect("stale job handle");
            node.parent_count = TOMBSTONE;
            std::mem::take(&mut node.dependents)
        };
        guard.outstanding = guard.outstanding.saturating_sub(1);
        for dep in dependents {
            let ready = {
                let dep_node = guard.nodes.get_mut(dep).expect("dangling dependent handle");
                dep_node.parent_count = dep_node.parent_count.saturating_sub(1);
                dep_node.parent_count == 0
            };
            if ready {
                tracing::trace!(parent = handle.raw(), child = dep.raw(), "dependent became ready");
                enqueue(guard, dep);
            }
        }
        self.cv.notify_all();
    }

    /// Forces `handle` to be treated as finished even if it still has
    /// outstanding planned runs, canceling them and propagating completion
    /// to its dependents immediately.
    pub fn force_remove_for_complete_once(&self, handle: JobHandle) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        {
            let node = guard.nodes.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if node.parent_count == TOMBSTONE {
                return Err(Error::AlreadyFinished);
            }
            node.total_runs = node.runs_dispatched.max(node.active_running_count);
        }
        if guard.nodes.get(handle).unwrap().active_running_count == 0 {
            self.finish_job(&mut guard, handle);
        }
        tracing::debug!(handle = handle.raw(), "force_remove_for_complete_once");
        Ok(())
    }

    /// Blocks until `handle` has fully finished (all runs done and
    /// dependencies propagated).
    pub fn wait_for_completion(&self, handle: JobHandle) {
        let mut guard = self.inner.lock().unwrap();
        while guard.nodes.get(handle).map_or(true, |n| n.parent_count != TOMBSTONE) {
            guard = self.finished_cv.wait(guard).unwrap();
        }
    }

    /// Signals every worker blocked in [`Self::wait_for_job`] to return
    /// `None` once the ready/core queues are empty and nothing is
    /// outstanding.
    pub fn set_ready_to_exit(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.ready_to_exit = true;
        self.cv.notify_all();
        tracing::debug!("queue marked ready to exit");
    }
}

fn collect_parentless(guard: &Inner) -> Vec<Handle> {
    guard
        .nodes
        .iter()
        .filter(|(_, node)| node.parent_count == 0)
        .map(|(handle, _)| handle)
        .collect()
}

fn enqueue(guard: &mut Inner, handle: Handle) {
    let node = guard.nodes.get(handle).expect("stale job handle");
    let priority = node.priority;
    let affinity = node.core_affinity;
    match affinity {
        Some(core) if (core as usize) < guard.core_queues.len() => {
            guard.core_queues[core as usize].insert((priority, handle));
        }
        _ => guard.ready_queue.insert((priority, handle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn single_job_runs_and_finishes() {
        let queue = JobQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let job = queue.add_job(0, None, 1, move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        queue.schedule_ready();
        let h = queue.acquire_next_job(0).unwrap();
        queue.run_job(h);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.wait_for_completion(job);
    }

    #[test]
    fn dependent_job_waits_for_parent() {
        let queue = JobQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let parent = queue.add_job(0, None, 1, move |_| o1.lock().unwrap().push("parent"));
        let o2 = order.clone();
        let child = queue.add_job(0, None, 1, move |_| o2.lock().unwrap().push("child"));
        queue.add_dependency(parent, child).unwrap();
        queue.schedule_ready();
        let h = queue.acquire_next_job(0).unwrap();
        assert_eq!(h.raw(), parent.raw());
        queue.run_job(h);
        let h2 = queue.acquire_next_job(0).unwrap();
        assert_eq!(h2.raw(), child.raw());
        queue.run_job(h2);
        assert_eq!(*order.lock().unwrap(), vec!["parent", "child"]);
    }

    #[test]
    fn force_remove_cancels_remaining_runs() {
        let queue = JobQueue::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let job = queue.add_job(0, None, 5, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.schedule_ready();
        let h = queue.acquire_next_job(0).unwrap();
        queue.run_job(h);
        queue.force_remove_for_complete_once(job).unwrap();
        queue.wait_for_completion(job);
    }

    #[test]
    fn ready_jobs_dispatch_in_priority_order() {
        let queue = JobQueue::new(1);
        let low = queue.add_job(5, None, 1, |_| {});
        let high = queue.add_job(0, None, 1, |_| {});
        let mid = queue.add_job(2, None, 1, |_| {});
        queue.schedule_ready();
        assert_eq!(queue.acquire_next_job(0).unwrap().raw(), high.raw());
        assert_eq!(queue.acquire_next_job(0).unwrap().raw(), mid.raw());
        assert_eq!(queue.acquire_next_job(0).unwrap().raw(), low.raw());
    }
}
