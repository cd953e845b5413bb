//! Shared cancellation handle between an engine and the stream it hands out.
//!
//! Both ends hold a clone. The consumer side marks the entry unlocked and its body
//! drained, either side may cancel it with the first fatal error, and the other
//! side observes the error on its next await or poll.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::task::Waker;
use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    unlocked: bool,
    drained: bool,
    error: Option<Error>,
    waker: Option<Waker>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct Link {
    inner: Arc<Inner>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    fn update(&self, f: impl FnOnce(&mut State)) {
        let waker = {
            let mut state = self.state();
            f(&mut state);
            state.waker.take()
        };
        self.inner.notify.notify_waiters();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Marks the entry as acknowledged by its consumer.
    pub fn unlock(&self) {
        self.update(|s| s.unlocked = true);
    }

    /// Marks the entry body as fully delivered.
    pub fn drain(&self) {
        self.update(|s| s.drained = true);
    }

    /// Cancels the link, only the first error is kept.
    ///
    /// # Returns
    /// * `true` - This call cancelled the link.
    /// * `false` - The link was already cancelled.
    pub fn cancel(&self, err: Error) -> bool {
        let mut first = false;
        self.update(|s| {
            if s.error.is_none() {
                s.error = Some(err);
                first = true;
            }
        });
        first
    }

    pub fn error(&self) -> Option<Error> {
        self.state().error.clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state().unlocked
    }

    pub fn is_drained(&self) -> bool {
        self.state().drained
    }

    /// Stores a waker that is woken on the next state change.
    pub fn register(&self, waker: &Waker) {
        let mut state = self.state();
        match &state.waker {
            Some(current) if current.will_wake(waker) => {}
            _ => state.waker = Some(waker.clone()),
        }
    }

    /// Waits until the entry is both unlocked and drained.
    ///
    /// # Returns
    /// * `Ok(())` - The consumer released the entry.
    /// * `Err(e)` - The link was cancelled first.
    pub async fn released(&self) -> Result<()> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state();
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if state.unlocked && state.drained {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Waits until the link is cancelled and returns the error.
    pub async fn cancelled(&self) -> Error {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(err) = self.error() {
                return err;
            }
            notified.await;
        }
    }
}
