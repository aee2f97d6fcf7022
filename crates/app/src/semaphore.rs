//! Priority semaphore — a bounded-concurrency gate.
//!
//! Waiters are served by ascending priority, ties in arrival order. Queued
//! (not yet dispatched) waiters can be rejected in bulk with
//! [`Semaphore::cancel`]; running work is never affected.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// A queued acquisition was rejected by [`Semaphore::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    #[error("semaphore acquisition cancelled")]
    Cancelled,
}

/// Failure of [`Semaphore::run_exclusive`].
///
/// Keeps a cancelled acquisition distinguishable from a failing worker.
#[derive(Debug, thiserror::Error)]
pub enum ExclusiveError<E> {
    #[error("semaphore acquisition cancelled")]
    Cancelled,
    #[error("exclusive worker failed")]
    Worker(#[source] E),
}

type Grant = oneshot::Sender<Result<(), SemaphoreError>>;

struct Waiter {
    priority: u32,
    seq: u64,
    grant: Grant,
}

struct State {
    available: usize,
    next_seq: u64,
    waiters: Vec<Waiter>,
}

impl State {
    /// Hand a freed slot to the first live waiter, or return it to the pool.
    fn release(&mut self) {
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            if waiter.grant.send(Ok(())).is_ok() {
                return;
            }
        }
        self.available += 1;
    }
}

/// Bounded-concurrency gate with priority-ordered waiters.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct Semaphore {
    capacity: usize,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// An acquired slot, released exactly once when dropped.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    state: Arc<Mutex<State>>,
    remaining: usize,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl Permit {
    /// Free slots left right after this permit was granted.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Release the slot now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
    }
}

/// Removes an abandoned waiter, or gives back a slot it was handed after
/// the acquiring future stopped listening.
struct PendingGuard<'a> {
    semaphore: &'a Semaphore,
    seq: u64,
    receiver: Option<oneshot::Receiver<Result<(), SemaphoreError>>>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        let mut state = self.semaphore.lock();
        state.waiters.retain(|waiter| waiter.seq != self.seq);
        if let Ok(Ok(())) = receiver.try_recv() {
            state.release();
        }
    }
}

impl Semaphore {
    /// Gate admitting `capacity` holders at once (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Arc::new(Mutex::new(State {
                available: capacity,
                next_seq: 0,
                waiters: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn permit(&self, remaining: usize) -> Permit {
        Permit {
            state: Arc::clone(&self.state),
            remaining,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Waiters currently queued.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// `true` iff no slot is currently free.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.available() == 0
    }

    /// Take a slot without waiting.
    ///
    /// Returns `None` when every slot is taken or waiters are queued.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.lock();
        if state.available == 0 || !state.waiters.is_empty() {
            return None;
        }
        state.available -= 1;
        let remaining = state.available;
        drop(state);
        Some(self.permit(remaining))
    }

    /// Wait for a slot. Lower `priority` values are served first.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::Cancelled`] when the request is rejected by
    /// [`Semaphore::cancel`] while queued.
    pub async fn acquire(&self, priority: u32) -> Result<Permit, SemaphoreError> {
        let (receiver, seq) = {
            let mut state = self.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                let remaining = state.available;
                drop(state);
                return Ok(self.permit(remaining));
            }
            let (grant, receiver) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            let index = state
                .waiters
                .partition_point(|waiter| waiter.priority <= priority);
            state.waiters.insert(
                index,
                Waiter {
                    priority,
                    seq,
                    grant,
                },
            );
            (receiver, seq)
        };

        let mut guard = PendingGuard {
            semaphore: self,
            seq,
            receiver: Some(receiver),
        };
        let result = match guard.receiver.as_mut() {
            Some(receiver) => receiver.await,
            None => return Err(SemaphoreError::Cancelled),
        };
        guard.receiver = None;
        match result {
            Ok(Ok(())) => Ok(self.permit(self.available())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SemaphoreError::Cancelled),
        }
    }

    /// Run `worker` while holding a slot, retrying failures by re-queueing
    /// with `priority + 1` until `retries` is exhausted.
    ///
    /// The slot is released before each retry and on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`ExclusiveError::Cancelled`] when an acquisition is
    /// cancelled, or [`ExclusiveError::Worker`] with the last worker error.
    pub async fn run_exclusive<F, Fut, T, E>(
        &self,
        mut worker: F,
        mut priority: u32,
        mut retries: u32,
    ) -> Result<T, ExclusiveError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            let permit = self
                .acquire(priority)
                .await
                .map_err(|_| ExclusiveError::Cancelled)?;
            let result = worker().await;
            drop(permit);
            match result {
                Ok(value) => return Ok(value),
                Err(err) if retries == 0 => return Err(ExclusiveError::Worker(err)),
                Err(_) => {
                    tracing::debug!(priority, retries, "retrying exclusive worker");
                    priority = priority.saturating_add(1);
                    retries -= 1;
                }
            }
        }
    }

    /// Reject every queued waiter with [`SemaphoreError::Cancelled`].
    ///
    /// Returns how many waiters were rejected.
    pub fn cancel(&self) -> usize {
        let waiters = std::mem::take(&mut self.lock().waiters);
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.grant.send(Err(SemaphoreError::Cancelled));
        }
        count
    }
}
