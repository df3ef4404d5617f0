//! Bounded, blocking, multi-producer multi-consumer message queue.
//!
//! Built directly on `std` synchronization rather than the `ukern` address-wait
//! primitives: a service queue is a boundary type used by ordinary callers
//! (including ones not running as a scheduled fiber), so it parks real OS
//! threads via `Condvar` rather than requiring the caller to be a fiber.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Errors a service queue's blocking operations can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The queue has been closed; no further sends are accepted.
    Closed,
    /// A `try_*` call found nothing to do without blocking.
    WouldBlock,
    /// A bounded wait expired before the operation completed.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Closed => "service queue is closed",
            Error::WouldBlock => "operation would block",
            Error::Timeout => "wait timed out",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A fixed-capacity FIFO queue with blocking send/receive.
pub struct ServiceQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> ServiceQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::with_capacity(capacity), capacity, closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Sends a message, blocking while the queue is full.
    pub fn send(&self, value: T) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return Err(Error::Closed);
            }
            if guard.queue.len() < guard.capacity {
                guard.queue.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            guard = self.not_full.wait(guard).unwrap();
        }
    }

    /// Sends a message, bypassing the capacity limit entirely. Mirrors the
    /// original's "Jam" operation: used for high-priority control messages
    /// that must not be blocked behind a full queue.
    pub fn jam(&self, value: T) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        guard.queue.push_front(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Sends without blocking; fails with [`Error::WouldBlock`] if full.
    pub fn try_send(&self, value: T) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        if guard.queue.len() >= guard.capacity {
            return Err(Error::WouldBlock);
        }
        guard.queue.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Receives a message, blocking while the queue is empty and open.
    pub fn receive(&self) -> Result<T, Error> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(value) = guard.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if guard.closed {
                return Err(Error::Closed);
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Receives with a bounded wait.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(value) = guard.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if guard.closed {
                return Err(Error::Closed);
            }
            let (g, timed_out) = self.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if timed_out.timed_out() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Receives without blocking.
    pub fn try_receive(&self) -> Result<T, Error> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(value) = guard.queue.pop_front() {
            self.not_full.notify_one();
            return Ok(value);
        }
        if guard.closed {
            return Err(Error::Closed);
        }
        Err(Error::WouldBlock)
    }

    /// Closes the queue, waking any blocked senders and receivers. Already
    /// enqueued messages can still be drained with `receive`/`try_receive`.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> ServiceQueue<T> {
    /// Returns a clone of the next message without dequeuing it.
    pub fn try_peek(&self) -> Result<T, Error> {
        let guard = self.inner.lock().unwrap();
        if let Some(value) = guard.queue.front() {
            return Ok(value.clone());
        }
        if guard.closed {
            return Err(Error::Closed);
        }
        Err(Error::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn send_receive_is_fifo() {
        let q = ServiceQueue::new(4);
        q.send(1).unwrap();
        q.send(2).unwrap();
        assert_eq!(q.receive().unwrap(), 1);
        assert_eq!(q.receive().unwrap(), 2);
    }

    #[test]
    fn try_send_fails_when_full() {
        let q = ServiceQueue::new(1);
        q.try_send(1).unwrap();
        assert_eq!(q.try_send(2), Err(Error::WouldBlock));
    }

    #[test]
    fn jam_bypasses_capacity_and_ordering() {
        let q = ServiceQueue::new(1);
        q.try_send(1).unwrap();
        q.jam(0).unwrap();
        assert_eq!(q.receive().unwrap(), 0);
        assert_eq!(q.receive().unwrap(), 1);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let q = Arc::new(ServiceQueue::<i32>::new(1));
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.receive());
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(t.join().unwrap(), Err(Error::Closed));
    }

    #[test]
    fn receive_timeout_expires() {
        let q = ServiceQueue::<i32>::new(1);
        assert_eq!(q.receive_timeout(Duration::from_millis(10)), Err(Error::Timeout));
    }
}
