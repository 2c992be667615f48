//! Bounded double-ended work queue.
//!
//! Normal submissions go to the back and are refused (or wait) once the
//! queue holds `capacity` items. Requeues go to the front and are always
//! accepted, so a job handed back by a retiring worker can never be lost.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub enum PushError<T> {
    /// The queue is at capacity. The item is handed back.
    Full(T),
    /// The queue was closed. The item is handed back.
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct WorkQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Enqueue at the back without waiting.
    pub fn try_push_back(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue at the back, waiting for space. Fails only if the queue is
    /// closed before space appears.
    pub fn push_back_blocking(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Re-insert at the front. Ignores both capacity and the closed flag.
    pub fn push_front(&self, item: T) {
        let mut state = self.lock();
        state.items.push_front(item);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Dequeue from the front, waiting for an item. Returns `None` once the
    /// queue is closed and empty.
    pub fn take(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Refuse further back-insertions and wake every waiter. Items already
    /// queued can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.lock().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }
}
