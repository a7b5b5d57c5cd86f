//! Event queue between the poller (sole producer) and the dispatcher (sole
//! consumer).
//!
//! Two flavours share one interface and the same contract: FIFO delivery,
//! new events are rejected when the queue is full, and after [`EventQueue::close`]
//! the consumer drains whatever is buffered before [`EventQueue::pop_wait`]
//! returns `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::yield_now;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::{QueueConfig, Value};

/// Spins before the lock-free consumer starts yielding its time slice.
const LOCK_FREE_SPIN_LIMIT: u32 = 64;

pub enum EventQueue {
    Locked(LockedQueue),
    LockFree(LockFreeQueue),
}

impl EventQueue {
    pub fn new(config: &QueueConfig) -> Self {
        match *config {
            QueueConfig::Locked { capacity } => EventQueue::Locked(LockedQueue::new(capacity)),
            QueueConfig::LockFree { capacity } => {
                EventQueue::LockFree(LockFreeQueue::new(capacity))
            }
        }
    }

    /// Enqueues a captured value, handing it back if the queue is full.
    pub fn push(&self, value: Value) -> Result<(), Value> {
        let res = match self {
            EventQueue::Locked(q) => q.push(value),
            EventQueue::LockFree(q) => q.push(value),
        };
        if res.is_err() {
            self.dropped_counter().fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    /// Blocks until a value is available. Returns `None` once the queue is
    /// closed and fully drained.
    pub fn pop_wait(&self) -> Option<Value> {
        match self {
            EventQueue::Locked(q) => q.pop_wait(),
            EventQueue::LockFree(q) => q.pop_wait(),
        }
    }

    /// Marks the producer side as finished and wakes the consumer.
    pub fn close(&self) {
        match self {
            EventQueue::Locked(q) => q.close(),
            EventQueue::LockFree(q) => q.close(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EventQueue::Locked(q) => q.state.lock().events.len(),
            EventQueue::LockFree(q) => q.ring.len(),
        }
    }

    /// Number of events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped_counter().load(Ordering::Relaxed)
    }

    fn dropped_counter(&self) -> &AtomicU64 {
        match self {
            EventQueue::Locked(q) => &q.dropped,
            EventQueue::LockFree(q) => &q.dropped,
        }
    }
}

struct LockedState {
    events: VecDeque<Value>,
    closed: bool,
}

pub struct LockedQueue {
    state: Mutex<LockedState>,
    ready: Condvar,
    capacity: Option<usize>,
    dropped: AtomicU64,
}

impl LockedQueue {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(LockedState {
                events: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.map(|c| c.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, value: Value) -> Result<(), Value> {
        {
            let mut state = self.state.lock();
            if let Some(cap) = self.capacity
                && state.events.len() >= cap
            {
                return Err(value);
            }
            state.events.push_back(value);
        }
        self.ready.notify_one();
        Ok(())
    }

    fn pop_wait(&self) -> Option<Value> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.events.pop_front() {
                return Some(value);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

pub struct LockFreeQueue {
    ring: ArrayQueue<Value>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl LockFreeQueue {
    fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, value: Value) -> Result<(), Value> {
        self.ring.push(value)
    }

    fn pop_wait(&self) -> Option<Value> {
        let mut spins = 0u32;
        loop {
            if let Some(value) = self.ring.pop() {
                return Some(value);
            }
            // producer is joined before close, so one more pop sees its last push
            if self.closed.load(Ordering::Acquire) {
                return self.ring.pop();
            }
            if spins < LOCK_FREE_SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                yield_now();
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
