//! One-Shot Timers
//!
//! Restartable one-shot timers on the tokio runtime. Cancellation is
//! best-effort: a callback the runtime has already queued may still run
//! after `cancel`, so each arming carries a generation number that is
//! checked before the callback fires, and callers re-validate whatever
//! state the callback acts on.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, trace};

/// Restartable one-shot timer
///
/// Armed with a delay and a callback; fires the callback once unless
/// cancelled first. A timer counts as armed from `arm` until it fires or
/// is cancelled.
pub struct OneShotTimer {
    name: &'static str,
    inner: Arc<Mutex<TimerInner>>,
}

struct TimerInner {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(TimerInner {
                generation: 0,
                handle: None,
            })),
        }
    }

    /// Timer name, used in log lines
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True from `arm` until the timer fires or is cancelled
    pub fn is_armed(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// Arm the timer. Arming an already-armed timer is a contract
    /// violation: asserted in debug builds, logged and ignored in release.
    pub fn arm<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.handle.is_some() {
            debug_assert!(false, "timer {} armed while already armed", self.name);
            error!("timer {} armed while already armed, ignoring", self.name);
            return;
        }
        inner.generation += 1;
        let generation = inner.generation;
        let shared = Arc::clone(&self.inner);
        let name = self.name;
        trace!("timer {} armed for {:?}", name, delay);
        inner.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = shared.lock();
                if inner.generation != generation {
                    // cancelled or re-armed while this callback was queued
                    return;
                }
                inner.handle = None;
            }
            trace!("timer {} fired", name);
            callback();
        }));
    }

    /// Cancel if armed, then arm
    pub fn restart<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.arm(delay, callback);
    }

    /// Cancel the timer. Idempotent; a callback the runtime has already
    /// dequeued may still run afterwards.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if let Some(handle) = inner.handle.take() {
            handle.abort();
            trace!("timer {} cancelled", self.name);
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
