//! Quorum-driven events, the promotion gate, and the timers behind it

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, trace, warn};

use crate::protocol::{ClientId, ConnectionState};
use crate::quorum::QuorumClients;
use crate::telemetry::{self, EventCategory, TelemetryEvent};

use super::{ConnectionStateCore, PromotionSource, DEFAULT_LEAVE_WAIT};

impl ConnectionStateCore {
    /// Register membership listeners and, when resuming with a prior
    /// identifier that is still a member, start waiting for its Leave.
    pub(crate) fn handle_init_protocol(&self, quorum: &Arc<dyn QuorumClients>) {
        let weak = self.weak_self.clone();
        quorum.on_member_added(Box::new(move |client_id| {
            if let Some(core) = weak.upgrade() {
                core.handle_member_added(client_id);
            }
        }));
        let weak = self.weak_self.clone();
        quorum.on_member_removed(Box::new(move |client_id| {
            if let Some(core) = weak.upgrade() {
                core.handle_member_removed(client_id);
            }
        }));

        let prior = self.state.lock().client_id.clone();
        if let Some(prior) = prior {
            if quorum.get_member(&prior).is_some()
                && self.hooks.should_client_join_write()
                && !self.prev_client_left_timer.is_armed()
            {
                debug!("prior client {} still in quorum, awaiting its leave", prior);
                self.start_leave_timer();
            }
        }
    }

    /// A Join op was sequenced. Only the pending client's Join matters.
    pub(crate) fn handle_member_added(&self, client_id: &ClientId) {
        let pending = self.state.lock().pending_client_id.clone();
        if pending.as_deref() != Some(&**client_id) {
            return;
        }

        if self.join_op_timer.is_armed() {
            self.join_op_timer.cancel();
        } else {
            // the join arrived after its timer already fired, or was never
            // awaited
            self.record_diagnostic(telemetry::RECEIVED_JOIN_OP);
            self.telemetry
                .send_telemetry_event(TelemetryEvent::generic(
                    telemetry::RECEIVED_JOIN_OP,
                    json!({ "clientId": &**client_id }),
                ));
        }

        if self.prev_client_left_timer.is_armed() {
            let mut state = self.state.lock();
            if state.leave_wait_started.is_none() {
                state.leave_wait_started = Some(Instant::now());
                trace!("join observed, now waiting only for the previous client's leave");
            }
        }

        self.apply_for_connected(PromotionSource::AddMemberEvent);
    }

    /// A Leave op was sequenced. Only the live (previous) client's Leave
    /// matters.
    pub(crate) fn handle_member_removed(&self, client_id: &ClientId) {
        let live = self.state.lock().client_id.clone();
        if live.as_deref() != Some(&**client_id) {
            return;
        }
        self.prev_client_left_timer.cancel();
        self.apply_for_connected(PromotionSource::RemoveMemberEvent);
    }

    pub(crate) fn start_join_timer(&self) {
        let weak = self.weak_self.clone();
        self.join_op_timer.arm(self.join_op_timeout, move || {
            if let Some(core) = weak.upgrade() {
                core.handle_join_wait_expired();
            }
        });
    }

    fn handle_join_wait_expired(&self) {
        // Cancellation is best-effort; a stale callback lands here after
        // the state already moved on.
        let (state_now, pending) = {
            let state = self.state.lock();
            (state.state, state.pending_client_id.clone())
        };
        if state_now != ConnectionState::CatchingUp {
            return;
        }

        let quorum = self.hooks.quorum_clients();
        let in_quorum = quorum
            .as_ref()
            .zip(pending.as_ref())
            .and_then(|(quorum, client)| quorum.get_member(client))
            .is_some();

        warn!(
            "no join op for {} within {:?}",
            pending.as_deref().unwrap_or("<none>"),
            self.join_op_timeout
        );
        self.record_diagnostic(telemetry::NO_JOIN_OP);
        self.telemetry.log_connection_issue(
            telemetry::NO_JOIN_OP,
            json!({
                "quorumInitialized": quorum.is_some(),
                "pendingClientId": pending.as_deref(),
                "inQuorum": in_quorum,
                "waitingForLeaveOp": self.prev_client_left_timer.is_armed(),
            }),
        );
    }

    pub(crate) fn start_leave_timer(&self) {
        let wait = self
            .hooks
            .max_client_leave_wait()
            .unwrap_or(DEFAULT_LEAVE_WAIT);
        let weak = self.weak_self.clone();
        self.prev_client_left_timer.arm(wait, move || {
            if let Some(core) = weak.upgrade() {
                core.handle_leave_wait_expired();
            }
        });
    }

    fn handle_leave_wait_expired(&self) {
        let state_now = self.current_state();
        debug_assert!(
            state_now != ConnectionState::Connected,
            "leave wait expired after promotion"
        );
        if state_now == ConnectionState::Connected {
            error!("leave wait expired after promotion, ignoring");
            return;
        }
        warn!("previous client never left, applying for promotion on timeout");
        self.apply_for_connected(PromotionSource::Timeout);
    }

    /// The promotion gate: promote to Connected once every precondition
    /// holds, otherwise record why not.
    pub(crate) fn apply_for_connected(&self, source: PromotionSource) {
        let quorum = self.hooks.quorum_clients();
        debug_assert!(quorum.is_some(), "promotion attempted before quorum init");
        let Some(quorum) = quorum else {
            error!("promotion attempted before quorum init, ignoring");
            return;
        };

        let waiting_for_leave = self.prev_client_left_timer.is_armed();
        let (pending, live) = {
            let state = self.state.lock();
            (state.pending_client_id.clone(), state.client_id.clone())
        };

        if waiting_for_leave {
            let live_in_quorum = live
                .as_ref()
                .map(|client| quorum.get_member(client).is_some())
                .unwrap_or(false);
            debug_assert!(live_in_quorum, "leave wait armed without a live quorum member");
            if !live_in_quorum {
                error!("leave wait armed without a live quorum member");
            }
        }

        let in_quorum = pending
            .as_ref()
            .map(|client| quorum.get_member(client).is_some())
            .unwrap_or(false);
        let pending_differs = pending.is_some() && pending != live;

        if pending.is_some() && pending_differs && in_quorum && !waiting_for_leave {
            self.close_leave_wait_span(source);
            self.set_connected(Some(source));
        } else {
            let category = if source == PromotionSource::Timeout {
                EventCategory::Error
            } else {
                EventCategory::Generic
            };
            self.record_diagnostic(telemetry::CONNECTED_STATE_REJECTED);
            self.telemetry.send_telemetry_event(TelemetryEvent::new(
                telemetry::CONNECTED_STATE_REJECTED,
                category,
                json!({
                    "source": source.as_str(),
                    "pendingClientId": pending.as_deref(),
                    "clientId": live.as_deref(),
                    "waitingForLeaveOp": waiting_for_leave,
                    "inQuorum": in_quorum,
                }),
            ));
        }
    }

    fn close_leave_wait_span(&self, source: PromotionSource) {
        let started = self.state.lock().leave_wait_started.take();
        if let Some(started) = started {
            let waited = started.elapsed();
            if let Some(metrics) = &self.metrics {
                metrics.leave_wait_seconds.observe(waited.as_secs_f64());
            }
            self.telemetry
                .send_telemetry_event(TelemetryEvent::performance(
                    telemetry::WAIT_BEFORE_CLIENT_LEAVE,
                    json!({
                        "source": source.as_str(),
                        "durationMs": waited.as_millis() as u64,
                    }),
                ));
        }
    }

    /// Transition to Connected, promoting the pending identifier. Only
    /// legal from `CatchingUp`.
    pub(crate) fn set_connected(&self, source: Option<PromotionSource>) {
        let quorum = self.hooks.quorum_clients();

        let promoted = {
            let mut state = self.state.lock();
            if state.state != ConnectionState::CatchingUp {
                debug_assert!(false, "promotion outside CatchingUp");
                error!("promotion attempted in {} state, ignoring", state.state);
                return;
            }
            // Any op still sequenced under the previous identifier is stale
            if let (Some(prev), Some(quorum)) = (state.client_id.as_ref(), quorum.as_ref()) {
                if let Some(member) = quorum.get_member(prev) {
                    member.mark_should_have_left();
                }
            }
            state.client_id = state.pending_client_id.clone();
            state.state = ConnectionState::Connected;
            state.client_id.clone()
        };

        debug!(
            "client {} promoted",
            promoted.as_deref().unwrap_or("<none>")
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .promotions_total
                .with_label_values(&[source.map(PromotionSource::as_str).unwrap_or("connect")])
                .inc();
        }
        self.emit_transition(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            source.and_then(PromotionSource::transition_reason),
        );
    }
}
