//! Bounded mutex-guarded queue shared by the Mix Scheduler's ready queues, the
//! per-IP command queue, and the MP3 PCM/output queues. Grounded on the
//! `ThreadSafeQueue<T>` idiom the original mixer is built around; a condvar
//! wakes waiting consumers without them spinning on the mutex.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// What happened to the element that didn't fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    DroppedOldest,
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
}

/// A bounded FIFO queue. Cloning shares the underlying storage (cheap `Arc` clone),
/// matching how an IP's producer handle and a mixer's consumer handle both need a
/// reference to the same queue.
pub struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                cv: Condvar::new(),
                capacity: capacity.max(1),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Push an item, dropping the oldest queued item if already at capacity.
    pub fn push_drop_oldest(&self, item: T) -> PushOutcome {
        let mut items = self.inner.items.lock();
        let outcome = if items.len() >= self.inner.capacity {
            items.pop_front();
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Pushed
        };
        items.push_back(item);
        self.inner.cv.notify_one();
        outcome
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    /// Block (with a timeout) until an item is available or the queue is closed.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let mut items = self.inner.items.lock();
        if items.is_empty() && !self.inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
            self.inner.cv.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.inner.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
