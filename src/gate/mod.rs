//! Catch-Up Gating
//!
//! Optional adapter in front of the connection state core. It forwards the
//! external interface unchanged, but holds the Connected notification back
//! until the local delta stream has processed every op the relay knew about
//! when the connection was established. The externally observed state is
//! the gate's cached state, which lags the inner core by at most one
//! catch-up interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::deltas::{CatchUpMonitor, DeltaStream};
use crate::handler::{
    ConnectionStateCore, ConnectionStateHandler, HostHooks, StateObserver,
};
use crate::metrics::Metrics;
use crate::protocol::{ClientId, ConnectionDetails, ConnectionMode, ConnectionState};
use crate::quorum::QuorumClients;
use crate::telemetry::TelemetrySink;

/// Reason attached to the gated Connected notification
const CAUGHT_UP_REASON: &str = "caught up";

struct GateState {
    cached: ConnectionState,
    monitor: Option<CatchUpMonitor>,
    /// Bumped on every disconnect so a caught-up listener from a previous
    /// connection attempt cannot forward a stale promotion
    epoch: u64,
}

struct GateShared {
    observer: Arc<dyn StateObserver>,
    deltas: Arc<dyn DeltaStream>,
    state: Mutex<GateState>,
}

impl GateShared {
    fn begin_catch_up(&self, old_state: ConnectionState, reason: Option<&str>) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.monitor.is_none(), "catch-up monitor already exists");
            if let Some(stale) = state.monitor.take() {
                error!("catch-up monitor already exists, replacing");
                stale.dispose();
            }
            state.monitor = Some(CatchUpMonitor::new(&self.deltas));
            state.cached = ConnectionState::CatchingUp;
        }
        self.observer
            .connection_state_changed(ConnectionState::CatchingUp, old_state, reason);
    }

    fn hold_connected(shared: &Arc<GateShared>) {
        let (monitor, epoch) = {
            let state = shared.state.lock();
            (state.monitor.clone(), state.epoch)
        };
        let Some(monitor) = monitor else {
            // no stream snapshot to wait on, forward unconditionally
            error!("connected without a catch-up monitor, forwarding");
            shared.forward_connected(epoch);
            return;
        };

        trace!(
            "holding Connected until sequence {}",
            monitor.target_sequence_number()
        );
        let weak = Arc::downgrade(shared);
        monitor.on_caught_up(move || {
            if let Some(shared) = weak.upgrade() {
                shared.forward_connected(epoch);
            }
        });
    }

    fn forward_connected(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.cached != ConnectionState::CatchingUp {
                // disconnected while catching up, drop the stale promotion
                return;
            }
            state.cached = ConnectionState::Connected;
        }
        self.observer.connection_state_changed(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            Some(CAUGHT_UP_REASON),
        );
    }

    fn pass_disconnected(&self, reason: Option<&str>) {
        let observed_old = {
            let mut state = self.state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            if let Some(monitor) = state.monitor.take() {
                monitor.dispose();
            }
            let observed_old = state.cached;
            state.cached = ConnectionState::Disconnected;
            observed_old
        };
        // the inner core may already have reached Connected while the gate
        // was still holding it back; report the state observers actually saw
        self.observer.connection_state_changed(
            ConnectionState::Disconnected,
            observed_old,
            reason,
        );
    }
}

/// Observer handed to the inner core; routes transitions through the gate
struct GateObserver {
    shared: Arc<GateShared>,
}

impl StateObserver for GateObserver {
    fn connection_state_changed(
        &self,
        new_state: ConnectionState,
        old_state: ConnectionState,
        reason: Option<&str>,
    ) {
        match new_state {
            ConnectionState::CatchingUp => self.shared.begin_catch_up(old_state, reason),
            ConnectionState::Connected => GateShared::hold_connected(&self.shared),
            ConnectionState::Disconnected => self.shared.pass_disconnected(reason),
        }
    }
}

/// Connection state handler that also waits for delta stream catch-up
/// before declaring Connected
pub struct CatchUpGate {
    core: Arc<ConnectionStateCore>,
    shared: Arc<GateShared>,
}

impl CatchUpGate {
    pub fn new(
        hooks: Arc<dyn HostHooks>,
        observer: Arc<dyn StateObserver>,
        telemetry: Arc<dyn TelemetrySink>,
        metrics: Option<Arc<Metrics>>,
        deltas: Arc<dyn DeltaStream>,
        join_op_timeout: Duration,
        initial_client_id: Option<ClientId>,
    ) -> Arc<Self> {
        let shared = Arc::new(GateShared {
            observer,
            deltas,
            state: Mutex::new(GateState {
                cached: ConnectionState::Disconnected,
                monitor: None,
                epoch: 0,
            }),
        });
        let core = ConnectionStateCore::new(
            hooks,
            Arc::new(GateObserver {
                shared: Arc::clone(&shared),
            }),
            telemetry,
            metrics,
            join_op_timeout,
            initial_client_id,
        );
        Arc::new(Self { core, shared })
    }
}

impl ConnectionStateHandler for CatchUpGate {
    fn init_protocol(&self, quorum: &Arc<dyn QuorumClients>) {
        self.core.init_protocol(quorum);
    }

    fn on_connect(&self, mode: ConnectionMode, details: &ConnectionDetails) {
        self.core.on_connect(mode, details);
    }

    fn on_disconnect(&self, reason: &str) {
        self.core.on_disconnect(reason);
    }

    fn container_saved(&self) {
        self.core.container_saved();
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().cached
    }

    fn pending_client_id(&self) -> Option<ClientId> {
        self.core.pending_client_id()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.core.client_id()
    }

    fn dispose(&self) {
        if let Some(monitor) = self.shared.state.lock().monitor.take() {
            monitor.dispose();
        }
        self.core.dispose();
    }
}
