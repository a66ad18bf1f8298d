//! Delta Stream Observation
//!
//! The delta stream delivers the totally-ordered op stream from the relay.
//! [`CatchUpMonitor`] watches it and signals once the locally processed
//! sequence number reaches the stream head known at the moment the monitor
//! was created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Listener invoked with each locally processed op's sequence number.
/// Return `false` to unsubscribe.
pub type OpListener = Box<dyn FnMut(u64) -> bool + Send>;

/// Read and observe the sequenced op stream
pub trait DeltaStream: Send + Sync {
    /// Latest sequence number the relay service has reported
    fn last_known_sequence_number(&self) -> u64;

    /// Latest sequence number processed locally
    fn last_processed_sequence_number(&self) -> u64;

    /// Register an op listener
    fn on_op(&self, listener: OpListener);
}

/// Thread-safe delta stream bookkeeping
///
/// Hosts feed it the service-reported head (`set_last_known`) and each
/// locally processed op (`process_op`); listeners run synchronously with
/// `process_op`.
pub struct DeltaTracker {
    last_known: AtomicU64,
    last_processed: AtomicU64,
    listeners: Mutex<Vec<OpListener>>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::with_sequence_numbers(0, 0)
    }

    pub fn with_sequence_numbers(last_processed: u64, last_known: u64) -> Self {
        Self {
            last_known: AtomicU64::new(last_known.max(last_processed)),
            last_processed: AtomicU64::new(last_processed),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Record the service-reported head of the stream
    pub fn set_last_known(&self, sequence_number: u64) {
        self.last_known.fetch_max(sequence_number, Ordering::SeqCst);
    }

    /// Record a locally processed op and notify listeners
    pub fn process_op(&self, sequence_number: u64) {
        self.last_processed.store(sequence_number, Ordering::SeqCst);
        self.last_known.fetch_max(sequence_number, Ordering::SeqCst);

        // Listeners run outside the lock so one may re-register or feed the
        // tracker without deadlocking; survivors are merged back afterwards.
        let mut active = std::mem::take(&mut *self.listeners.lock());
        active.retain_mut(|listener| listener(sequence_number));
        self.listeners.lock().append(&mut active);
    }
}

impl Default for DeltaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaStream for DeltaTracker {
    fn last_known_sequence_number(&self) -> u64 {
        self.last_known.load(Ordering::SeqCst)
    }

    fn last_processed_sequence_number(&self) -> u64 {
        self.last_processed.load(Ordering::SeqCst)
    }

    fn on_op(&self, listener: OpListener) {
        self.listeners.lock().push(listener);
    }
}

#[derive(Default)]
struct MonitorState {
    fired: bool,
    disposed: bool,
    listeners: Vec<Box<dyn FnOnce() + Send>>,
}

struct MonitorInner {
    target: u64,
    state: Mutex<MonitorState>,
}

impl MonitorInner {
    fn fire(inner: &Arc<MonitorInner>) {
        let listeners = {
            let mut state = inner.state.lock();
            if state.fired || state.disposed {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.listeners)
        };
        trace!("delta stream caught up to {}", inner.target);
        for listener in listeners {
            listener();
        }
    }
}

/// One-shot caught-up signal
///
/// Snapshots the stream head at construction and fires once the locally
/// processed sequence number reaches it. The signal never fires inside the
/// constructor: a stream that is already caught up fires on the next task
/// poll, so observers can attach listeners first.
#[derive(Clone)]
pub struct CatchUpMonitor {
    inner: Arc<MonitorInner>,
}

impl CatchUpMonitor {
    pub fn new(deltas: &Arc<dyn DeltaStream>) -> Self {
        let target = deltas.last_known_sequence_number();
        let inner = Arc::new(MonitorInner {
            target,
            state: Mutex::new(MonitorState::default()),
        });

        let weak = Arc::downgrade(&inner);
        deltas.on_op(Box::new(move |sequence_number| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if sequence_number < inner.target {
                return true;
            }
            MonitorInner::fire(&inner);
            false
        }));

        if deltas.last_processed_sequence_number() >= target {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    MonitorInner::fire(&inner);
                }
            });
        }

        debug!("catch-up monitor armed for sequence {}", target);
        Self { inner }
    }

    /// Sequence number the local stream must reach
    pub fn target_sequence_number(&self) -> u64 {
        self.inner.target
    }

    /// True once the signal has fired
    pub fn is_caught_up(&self) -> bool {
        self.inner.state.lock().fired
    }

    /// Register a one-shot listener. Each listener runs at most once; a
    /// listener registered after the signal fired runs immediately.
    pub fn on_caught_up(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        if state.fired {
            drop(state);
            listener();
            return;
        }
        state.listeners.push(Box::new(listener));
    }

    /// Cancel the pending signal; later stream events are ignored
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.disposed = true;
        state.listeners.clear();
    }
}
