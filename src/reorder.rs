//! Concurrent reorder buffer for the pipelined loader.
//!
//! Workers finish items out of order; the buffer hands them back strictly
//! by sequence number. Workers push, main thread pops.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Thread-safe reorder buffer with a bounded look-ahead window.
pub struct ConcurrentReorderBuffer<T> {
    inner: Mutex<ReorderInner<T>>,
    capacity: usize,
    not_full: Condvar,
    ready: Condvar,
}

struct ReorderInner<T> {
    pending: BTreeMap<usize, T>,
    next: usize,
    closed: bool,
}

impl<T> ConcurrentReorderBuffer<T> {
    /// Create a new reorder buffer.
    ///
    /// - `capacity`: how far past the next expected sequence number a push
    ///   may land before it blocks.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            inner: Mutex::new(ReorderInner {
                pending: BTreeMap::new(),
                next: 0,
                closed: false,
            }),
            capacity,
            not_full: Condvar::new(),
            ready: Condvar::new(),
        }
    }

    /// Push the item with sequence number `seq`. Blocks while `seq` is too
    /// far ahead of the consumer. The next expected item never blocks.
    /// Returns false if buffer is closed (shutdown).
    pub fn push(&self, seq: usize, item: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return false;
            }
            if seq < guard.next + self.capacity {
                let is_next = seq == guard.next;
                guard.pending.insert(seq, item);
                if is_next {
                    self.ready.notify_all();
                }
                return true;
            }
            let (new_guard, _) = self
                .not_full
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = new_guard;
        }
    }

    /// Pop the next item in sequence, waiting up to `timeout` for it.
    /// Returns None on timeout, or when closed and the next item is absent.
    /// Use is_closed() to distinguish timeout vs closed.
    pub fn try_pop(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();

        if let Some(item) = self.try_pop_inner(&mut guard) {
            return Some(item);
        }

        if guard.closed {
            return None;
        }

        let (mut new_guard, _) = self.ready.wait_timeout(guard, timeout).unwrap();
        self.try_pop_inner(&mut new_guard)
    }

    fn try_pop_inner(&self, guard: &mut MutexGuard<ReorderInner<T>>) -> Option<T> {
        let next = guard.next;
        let item = guard.pending.remove(&next)?;
        guard.next += 1;
        self.not_full.notify_all();
        Some(item)
    }

    /// Sequence number the next pop will return.
    pub fn next_seq(&self) -> usize {
        self.inner.lock().unwrap().next
    }

    /// Check if buffer is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Close the buffer. Wakes all waiters, causes push() to return false.
    /// Items already pushed can still be popped.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.not_full.notify_all();
        self.ready.notify_all();
    }

    /// Number of items waiting, in or out of order.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
