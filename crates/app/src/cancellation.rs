//! Cancellable signal passed through an action sequence.
//!
//! Cancellation is cooperative: holders poll [`Signal::is_cancelled`] between
//! steps or race their own work against [`Signal::cancelled`].

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::{CancellationToken, DropGuard};

/// One-shot, broadcastable cancellation token with an optional reason.
///
/// Clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

/// Keeps an [`Signal::on_cancel`] listener registered; dropping it
/// unregisters the listener.
#[derive(Debug)]
#[must_use = "the listener is removed as soon as the guard is dropped"]
pub struct ListenerGuard {
    _guard: DropGuard,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`Signal::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Flip the signal. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    /// Reason given to the first [`Signal::cancel`] call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the signal is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Run `listener` once when the signal is cancelled, for as long as the
    /// returned guard lives. Must be called within a tokio runtime.
    pub fn on_cancel<F>(&self, listener: F) -> ListenerGuard
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let registration = CancellationToken::new();
        let stop = registration.clone();
        let token = self.token.clone();
        let reason = Arc::clone(&self.reason);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    let reason = reason.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    listener(reason);
                }
                () = stop.cancelled() => {}
            }
        });
        ListenerGuard {
            _guard: registration.drop_guard(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn should_share_cancellation_between_clones() {
        let signal = Signal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());
        signal.cancel("restart");
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason().as_deref(), Some("restart"));
    }

    #[test]
    fn should_keep_first_reason() {
        let signal = Signal::new();
        signal.cancel("first");
        signal.cancel("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn should_notify_every_listener() {
        let signal = Signal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut guards = Vec::new();
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let tx = tx.clone();
            guards.push(signal.on_cancel(move |reason| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(reason);
            }));
        }
        tokio::task::yield_now().await;
        signal.cancel("stop");
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().as_deref(), Some("stop"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_not_call_dropped_listener() {
        let signal = Signal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            let _guard = signal.on_cancel(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        signal.cancel("late");
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
