//! Connection State Handler
//!
//! The reconnect-safety state machine that bookends a client's session with
//! the relay service. After a connection drop, ops sent on the previous
//! connection may still be in flight: the relay can sequence them under the
//! old client identifier after the new socket is already open. The handler
//! therefore refuses to report Connected until the relay has both admitted
//! the new client (its Join op) and retired the previous one (its Leave op),
//! or the configured waits expire.
//!
//! All inputs (transport events, quorum events, timer callbacks) must be
//! delivered on one serialized execution context; the handler performs no
//! suspension of its own and emits exactly one notification per transition.

mod membership;
mod transport;


use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigProvider, CATCH_UP_BEFORE_DECLARING_CONNECTED};
use crate::deltas::DeltaStream;
use crate::gate::CatchUpGate;
use crate::metrics::Metrics;
use crate::protocol::{ClientId, ConnectionDetails, ConnectionMode, ConnectionState};
use crate::quorum::QuorumClients;
use crate::telemetry::TelemetrySink;
use crate::timer::OneShotTimer;

/// How long a write connection may wait for its Join op before the
/// `NoJoinOp` diagnostic fires
pub const JOIN_OP_TIMEOUT: Duration = Duration::from_secs(45);

/// Default wait for the previous client's Leave op before promoting anyway
pub const DEFAULT_LEAVE_WAIT: Duration = Duration::from_secs(300);

/// Callbacks the owning container provides to the handler
pub trait HostHooks: Send + Sync {
    /// True while ops submitted on a previous connection are still
    /// unacknowledged, so the next connection must be a write connection
    /// and must wait out the previous client's Leave
    fn should_client_join_write(&self) -> bool;

    /// Override for the Leave wait; `None` selects [`DEFAULT_LEAVE_WAIT`]
    fn max_client_leave_wait(&self) -> Option<Duration> {
        None
    }

    /// The quorum, once the protocol layer has initialized it
    fn quorum_clients(&self) -> Option<Arc<dyn QuorumClients>>;
}

/// Receiver for the authoritative state-change notifications
pub trait StateObserver: Send + Sync {
    fn connection_state_changed(
        &self,
        new_state: ConnectionState,
        old_state: ConnectionState,
        reason: Option<&str>,
    );
}

/// External interface shared by [`ConnectionStateCore`] and
/// [`CatchUpGate`](crate::gate::CatchUpGate)
pub trait ConnectionStateHandler: Send + Sync {
    /// Register membership listeners; called once the protocol layer is up
    fn init_protocol(&self, quorum: &Arc<dyn QuorumClients>);

    /// Transport reports an open socket with an assigned client id
    fn on_connect(&self, mode: ConnectionMode, details: &ConnectionDetails);

    /// Transport reports connection loss
    fn on_disconnect(&self, reason: &str);

    /// The owning container reports no outstanding ops
    fn container_saved(&self);

    /// Current externally observable state
    fn connection_state(&self) -> ConnectionState;

    /// Identifier assigned by the just-established transport, if any
    fn pending_client_id(&self) -> Option<ClientId>;

    /// Identifier currently live for the outgoing op stream, if any
    fn client_id(&self) -> Option<ClientId>;

    /// Cancel timers and detach; the handler must not be used afterwards
    fn dispose(&self);
}

/// What triggered a promotion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromotionSource {
    AddMemberEvent,
    RemoveMemberEvent,
    ContainerSaved,
    Timeout,
}

impl PromotionSource {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PromotionSource::AddMemberEvent => "addMemberEvent",
            PromotionSource::RemoveMemberEvent => "removeMemberEvent",
            PromotionSource::ContainerSaved => "containerSaved",
            PromotionSource::Timeout => "timeout",
        }
    }

    /// Reason attached to the Connected transition. Membership-driven
    /// promotions are the expected path and carry none.
    pub(crate) fn transition_reason(self) -> Option<&'static str> {
        match self {
            PromotionSource::AddMemberEvent | PromotionSource::RemoveMemberEvent => None,
            PromotionSource::ContainerSaved => Some("containerSaved"),
            PromotionSource::Timeout => Some("timeout"),
        }
    }
}

/// Mutable handler state, serialized behind one lock
struct CoreState {
    state: ConnectionState,
    /// Identifier live for the outgoing op stream; set to the pending id at
    /// promotion, never cleared on disconnect
    client_id: Option<ClientId>,
    /// Identifier assigned by the just-established transport; cleared on
    /// disconnect, consumed (but not cleared) at promotion
    pending_client_id: Option<ClientId>,
    mode: Option<ConnectionMode>,
    /// Start of the wait-before-client-leave span, if one is open
    leave_wait_started: Option<Instant>,
}

/// The state machine proper
///
/// Constructed in `Disconnected`. Drives itself through transport and
/// quorum notifications plus two one-shot timers, and reports every
/// transition to the registered [`StateObserver`].
pub struct ConnectionStateCore {
    weak_self: Weak<ConnectionStateCore>,
    hooks: Arc<dyn HostHooks>,
    observer: Arc<dyn StateObserver>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Option<Arc<Metrics>>,
    join_op_timeout: Duration,
    join_op_timer: OneShotTimer,
    prev_client_left_timer: OneShotTimer,
    state: Mutex<CoreState>,
}

impl ConnectionStateCore {
    /// Construct in `Disconnected`. `initial_client_id` is the previous
    /// session's identifier when resuming.
    pub fn new(
        hooks: Arc<dyn HostHooks>,
        observer: Arc<dyn StateObserver>,
        telemetry: Arc<dyn TelemetrySink>,
        metrics: Option<Arc<Metrics>>,
        join_op_timeout: Duration,
        initial_client_id: Option<ClientId>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            hooks,
            observer,
            telemetry,
            metrics,
            join_op_timeout,
            join_op_timer: OneShotTimer::new("join_op_timer"),
            prev_client_left_timer: OneShotTimer::new("prev_client_left_timer"),
            state: Mutex::new(CoreState {
                state: ConnectionState::Disconnected,
                client_id: initial_client_id,
                pending_client_id: None,
                mode: None,
                leave_wait_started: None,
            }),
        })
    }

    /// Emit one authoritative transition notification
    fn emit_transition(
        &self,
        new_state: ConnectionState,
        old_state: ConnectionState,
        reason: Option<&str>,
    ) {
        info!(
            "connection state {} -> {}{}",
            old_state,
            new_state,
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .state_transitions_total
                .with_label_values(&[new_state.as_str()])
                .inc();
        }
        self.observer
            .connection_state_changed(new_state, old_state, reason);
    }

    fn record_diagnostic(&self, event_name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .diagnostics_total
                .with_label_values(&[event_name])
                .inc();
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.state.lock().state
    }

    fn handle_dispose(&self) {
        debug_assert!(
            !self.join_op_timer.is_armed(),
            "join op timer still armed at dispose"
        );
        if self.join_op_timer.is_armed() {
            error!("join op timer still armed at dispose, cancelling");
            self.join_op_timer.cancel();
        }
        self.prev_client_left_timer.cancel();
        debug!("connection state handler disposed");
    }
}

impl ConnectionStateHandler for ConnectionStateCore {
    fn init_protocol(&self, quorum: &Arc<dyn QuorumClients>) {
        self.handle_init_protocol(quorum);
    }

    fn on_connect(&self, mode: ConnectionMode, details: &ConnectionDetails) {
        self.handle_connect(mode, details);
    }

    fn on_disconnect(&self, reason: &str) {
        self.handle_disconnect(reason);
    }

    fn container_saved(&self) {
        self.handle_container_saved();
    }

    fn connection_state(&self) -> ConnectionState {
        self.current_state()
    }

    fn pending_client_id(&self) -> Option<ClientId> {
        self.state.lock().pending_client_id.clone()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.state.lock().client_id.clone()
    }

    fn dispose(&self) {
        self.handle_dispose();
    }
}

/// Build the configured handler: the catch-up gate when
/// `catch_up_before_declaring_connected` is set and a delta stream is
/// available, the plain core otherwise.
pub fn create_connection_state_handler(
    config: &dyn ConfigProvider,
    hooks: Arc<dyn HostHooks>,
    observer: Arc<dyn StateObserver>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Option<Arc<Metrics>>,
    deltas: Option<Arc<dyn DeltaStream>>,
    initial_client_id: Option<ClientId>,
) -> Arc<dyn ConnectionStateHandler> {
    let gated = config
        .get_bool(CATCH_UP_BEFORE_DECLARING_CONNECTED)
        .unwrap_or(false);
    match (gated, deltas) {
        (true, Some(deltas)) => CatchUpGate::new(
            hooks,
            observer,
            telemetry,
            metrics,
            deltas,
            JOIN_OP_TIMEOUT,
            initial_client_id,
        ),
        (true, None) => {
            warn!("catch-up gating requested without a delta stream, running ungated");
            ConnectionStateCore::new(
                hooks,
                observer,
                telemetry,
                metrics,
                JOIN_OP_TIMEOUT,
                initial_client_id,
            )
        }
        (false, _) => ConnectionStateCore::new(
            hooks,
            observer,
            telemetry,
            metrics,
            JOIN_OP_TIMEOUT,
            initial_client_id,
        ),
    }
}
