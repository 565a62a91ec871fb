//! Counting semaphore with FIFO waiters
//!
//! Unlike a plain counting semaphore, releases hand the permit straight
//! to the oldest waiter (no decrement), so waiters are admitted strictly
//! in arrival order and a flood of `try_acquire` callers cannot starve
//! them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Why an `acquire` did not produce a permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The deadline passed while queued
    #[error("semaphore acquire timed out")]
    Timeout,
    /// The semaphore was torn down while queued
    #[error("semaphore closed")]
    Closed,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct SemState {
    current: usize,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

/// FIFO-fair counting semaphore
///
/// Invariants: `current <= capacity`, and waiters wake in arrival order.
#[derive(Debug)]
pub struct FifoSemaphore {
    capacity: usize,
    state: Mutex<SemState>,
}

impl FifoSemaphore {
    /// Create a semaphore with the given permit count
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(SemState {
                current: 0,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Non-blocking acquire
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        // Queued waiters go first; barging past them would break FIFO
        if state.current < self.capacity && state.waiters.is_empty() {
            state.current += 1;
            true
        } else {
            false
        }
    }

    /// Acquire, waiting in line up to `timeout` (forever when `None`)
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<(), AcquireError> {
        let (id, mut rx) = {
            let mut state = self.state.lock();
            if state.current < self.capacity && state.waiters.is_empty() {
                state.current += 1;
                return Ok(());
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut rx).await,
            None => Ok((&mut rx).await),
        };

        match waited {
            Ok(Ok(())) => Ok(()), // woken by release; permit inherited
            Ok(Err(_)) => Err(AcquireError::Closed),
            Err(_elapsed) => {
                let mut state = self.state.lock();
                if let Some(position) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(position);
                    return Err(AcquireError::Timeout);
                }
                drop(state);
                // A release already popped this waiter; the handoff sits
                // in the channel. Pass the permit to the next in line.
                if rx.try_recv().is_ok() {
                    self.release();
                }
                Err(AcquireError::Timeout)
            }
        }
    }

    /// Return a permit
    ///
    /// The oldest live waiter inherits it without touching the counter;
    /// only when the queue is empty does the counter decrement.
    pub fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
            // Receiver dropped (cancelled waiter that raced removal);
            // try the next one.
            debug!("skipping cancelled semaphore waiter");
        }
        state.current = state.current.saturating_sub(1);
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.state.lock().current
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
