//! Transport-driven events: connect, disconnect, container save

use serde_json::json;
use tracing::{debug, error};

use crate::protocol::{ConnectionDetails, ConnectionMode, ConnectionState};
use crate::telemetry::{self, TelemetryEvent};

use super::{ConnectionStateCore, PromotionSource};

impl ConnectionStateCore {
    /// The transport has an open socket and an assigned client id.
    /// Only legal from `Disconnected`.
    pub(crate) fn handle_connect(&self, mode: ConnectionMode, details: &ConnectionDetails) {
        let should_join_write = self.hooks.should_client_join_write();
        let waiting_for_leave = self.prev_client_left_timer.is_armed();

        {
            let mut state = self.state.lock();
            if state.state != ConnectionState::Disconnected {
                debug_assert!(
                    false,
                    "on_connect received in {} state",
                    state.state.as_str()
                );
                error!("on_connect received in {} state, ignoring", state.state);
                return;
            }
            state.state = ConnectionState::CatchingUp;
            state.pending_client_id = Some(details.client_id.clone());
            state.mode = Some(mode);
        }

        // Outstanding local ops, or a live leave wait, can only be resolved
        // by a write connection.
        if should_join_write && !mode.is_write() {
            debug_assert!(mode.is_write(), "outstanding ops require a write connection");
            error!("outstanding ops require a write connection, got {}", mode);
        }
        if waiting_for_leave && !mode.is_write() {
            debug_assert!(mode.is_write(), "leave wait requires a write connection");
            error!("leave wait active on a {} connection", mode);
        }

        if let Some(metrics) = &self.metrics {
            metrics.connects_total.inc();
        }
        self.emit_transition(
            ConnectionState::CatchingUp,
            ConnectionState::Disconnected,
            None,
        );

        let quorum = self.hooks.quorum_clients();
        let pending_in_quorum = quorum
            .as_ref()
            .map(|quorum| quorum.get_member(&details.client_id).is_some())
            .unwrap_or(false);

        // A write connection is live only once its Join op is sequenced
        let waiting_for_join = mode.is_write() && !pending_in_quorum;
        if waiting_for_join {
            debug!("waiting for join op for {}", details.client_id);
            self.start_join_timer();
            return;
        }

        if self.prev_client_left_timer.is_armed() {
            // the Leave op, container save, or the leave timeout will finish
            // the promotion
            debug!("connected, waiting for the previous client to leave");
            return;
        }

        self.set_connected(None);
    }

    /// The transport lost the connection. Legal in any state; redundant
    /// calls are reported and ignored.
    pub(crate) fn handle_disconnect(&self, reason: &str) {
        let quorum = self.hooks.quorum_clients();

        let (old_state, prev_client) = {
            let mut state = self.state.lock();
            if state.state == ConnectionState::Disconnected {
                drop(state);
                self.record_diagnostic(telemetry::SET_CONNECTION_STATE_SAME);
                self.telemetry.log_connection_issue(
                    telemetry::SET_CONNECTION_STATE_SAME,
                    json!({
                        "state": ConnectionState::Disconnected.as_str(),
                        "reason": reason,
                    }),
                );
                return;
            }
            let old_state = state.state;
            let prev_client = state.client_id.clone();
            state.state = ConnectionState::Disconnected;
            state.pending_client_id = None;
            state.mode = None;
            state.leave_wait_started = None;
            (old_state, prev_client)
        };

        self.join_op_timer.cancel();

        let in_quorum = quorum
            .as_ref()
            .zip(prev_client.as_ref())
            .and_then(|(quorum, client)| quorum.get_member(client))
            .is_some();
        let had_outstanding_ops = self.hooks.should_client_join_write();
        let waiting_for_leave = self.prev_client_left_timer.is_armed();

        // The leave wait deliberately survives the disconnect: it protects
        // the next connection attempt from promoting before the previous
        // client's Leave arrives.
        if in_quorum && had_outstanding_ops && !waiting_for_leave {
            self.start_leave_timer();
        } else {
            self.record_diagnostic(telemetry::NO_WAIT_ON_DISCONNECTED);
            self.telemetry
                .send_telemetry_event(TelemetryEvent::generic(
                    telemetry::NO_WAIT_ON_DISCONNECTED,
                    json!({
                        "inQuorum": in_quorum,
                        "waitingForLeaveOp": waiting_for_leave,
                        "hadOutstandingOps": had_outstanding_ops,
                    }),
                ));
        }

        if let Some(metrics) = &self.metrics {
            metrics.disconnects_total.inc();
        }
        self.emit_transition(ConnectionState::Disconnected, old_state, Some(reason));
    }

    /// The owning container has no outstanding ops left. Nothing the
    /// previous client's Leave could still reorder, so stop waiting for it.
    pub(crate) fn handle_container_saved(&self) {
        if self.prev_client_left_timer.is_armed() {
            debug!("container saved, abandoning the leave wait");
            self.prev_client_left_timer.cancel();
            self.apply_for_connected(PromotionSource::ContainerSaved);
        }
    }
}
