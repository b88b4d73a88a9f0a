//! Cancellation shared by a data source, its connections and the transport
//!
//! Blocking code waits on [`CancelToken::closed_receiver`] inside a
//! `crossbeam_channel::select!`; async transport code awaits
//! [`CancelToken::cancelled`]. Cancelling disconnects the channel and wakes
//! every async waiter, so both sides observe it immediately.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    // Dropped on cancel; receivers then see a disconnected channel
    closer: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.notify.notify_waiters();
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cloneable cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                closer: Mutex::new(Some(tx)),
                closed: rx,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// New token cancelled together with this one
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Parent may have been cancelled before the child was registered
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Cancel this token and its children; idempotent
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Receiver that becomes disconnected once cancelled
    ///
    /// Never yields a message; use it as a `recv(..)` arm in `select!`.
    pub fn closed_receiver(&self) -> &Receiver<()> {
        &self.inner.closed
    }

    /// Sleep for `timeout` unless cancelled first
    ///
    /// # Returns
    /// `true` if cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        // Only disconnection can end the wait early
        let _ = self.inner.closed.recv_timeout(timeout);
        self.is_cancelled()
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a cancel in between is seen
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
