//! Integration tests for the connection state handler
//!
//! These tests drive the full reconnect lifecycle with paused tokio time:
//! transport events, quorum membership, container saves, timer expiry, and
//! the catch-up gate, validating the emitted transition sequences and the
//! diagnostic events along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;

use opsync::{
    create_connection_state_handler, Config, ConnectionDetails, ConnectionMode, ConnectionState,
    ConnectionStateCore, ConnectionStateHandler, DeltaStream, DeltaTracker, HostHooks,
    QuorumClients, QuorumStore, StateObserver, TelemetryEvent, TelemetrySink, DEFAULT_LEAVE_WAIT,
    JOIN_OP_TIMEOUT,
};

/// Host double with a togglable outstanding-ops signal
struct TestHost {
    outstanding_write: AtomicBool,
    quorum: Mutex<Option<Arc<QuorumStore>>>,
    leave_wait: Mutex<Option<Duration>>,
}

impl TestHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outstanding_write: AtomicBool::new(false),
            quorum: Mutex::new(None),
            leave_wait: Mutex::new(None),
        })
    }

    fn set_quorum(&self, quorum: &Arc<QuorumStore>) {
        *self.quorum.lock() = Some(Arc::clone(quorum));
    }

    fn set_outstanding_write(&self, value: bool) {
        self.outstanding_write.store(value, Ordering::SeqCst);
    }
}

impl HostHooks for TestHost {
    fn should_client_join_write(&self) -> bool {
        self.outstanding_write.load(Ordering::SeqCst)
    }

    fn max_client_leave_wait(&self) -> Option<Duration> {
        *self.leave_wait.lock()
    }

    fn quorum_clients(&self) -> Option<Arc<dyn QuorumClients>> {
        self.quorum
            .lock()
            .clone()
            .map(|quorum| quorum as Arc<dyn QuorumClients>)
    }
}

type Transition = (ConnectionState, ConnectionState, Option<String>);

/// Observer recording every transition
#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<Transition>>,
}

impl Recorder {
    fn snapshot(&self) -> Vec<Transition> {
        self.transitions.lock().clone()
    }

    fn drain(&self) -> Vec<Transition> {
        std::mem::take(&mut *self.transitions.lock())
    }

    fn connected_count(&self) -> usize {
        self.transitions
            .lock()
            .iter()
            .filter(|(new, _, _)| *new == ConnectionState::Connected)
            .count()
    }
}

impl StateObserver for Recorder {
    fn connection_state_changed(
        &self,
        new_state: ConnectionState,
        old_state: ConnectionState,
        reason: Option<&str>,
    ) {
        self.transitions
            .lock()
            .push((new_state, old_state, reason.map(str::to_string)));
    }
}

/// Telemetry sink recording event names and details
#[derive(Default)]
struct TelemetryLog {
    events: Mutex<Vec<(String, Value)>>,
}

impl TelemetryLog {
    fn has(&self, name: &str) -> bool {
        self.events.lock().iter().any(|(event, _)| event == name)
    }
}

impl TelemetrySink for TelemetryLog {
    fn log_connection_issue(&self, event_name: &'static str, details: Value) {
        self.events.lock().push((event_name.to_string(), details));
    }

    fn send_telemetry_event(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .push((event.event_name.to_string(), event.details));
    }
}

struct Harness {
    host: Arc<TestHost>,
    quorum: Arc<QuorumStore>,
    recorder: Arc<Recorder>,
    telemetry: Arc<TelemetryLog>,
    core: Arc<ConnectionStateCore>,
}

fn harness() -> Harness {
    let host = TestHost::new();
    let quorum = Arc::new(QuorumStore::new());
    host.set_quorum(&quorum);
    let recorder = Arc::new(Recorder::default());
    let telemetry = Arc::new(TelemetryLog::default());
    let core = ConnectionStateCore::new(
        Arc::clone(&host) as Arc<dyn HostHooks>,
        Arc::clone(&recorder) as Arc<dyn StateObserver>,
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
        None,
        JOIN_OP_TIMEOUT,
        None,
    );
    let quorum_dyn: Arc<dyn QuorumClients> = Arc::clone(&quorum) as Arc<dyn QuorumClients>;
    core.init_protocol(&quorum_dyn);
    Harness {
        host,
        quorum,
        recorder,
        telemetry,
        core,
    }
}

fn details(client_id: &str) -> ConnectionDetails {
    ConnectionDetails::new(client_id)
}

/// Let queued timer callbacks and spawned tasks run
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

/// Drive the harness into Connected as a write client and flag outstanding
/// ops, the starting point of the reconnect scenarios
fn connected_write_session(h: &Harness, client_id: &str) {
    h.quorum.add_member(client_id);
    h.core.on_connect(ConnectionMode::Write, &details(client_id));
    assert_eq!(h.core.connection_state(), ConnectionState::Connected);
    h.host.set_outstanding_write(true);
    h.recorder.drain();
}

// Scenario: clean first connect in read mode
#[tokio::test(start_paused = true)]
async fn clean_first_connect_read() {
    let h = harness();

    h.core.on_connect(ConnectionMode::Read, &details("c1"));

    assert_eq!(
        h.recorder.snapshot(),
        vec![
            (
                ConnectionState::CatchingUp,
                ConnectionState::Disconnected,
                None
            ),
            (
                ConnectionState::Connected,
                ConnectionState::CatchingUp,
                None
            ),
        ]
    );
    assert_eq!(h.core.connection_state(), ConnectionState::Connected);
    assert_eq!(h.core.client_id().as_deref(), Some("c1"));
}

// Scenario: a write connect waits for its Join op
#[tokio::test(start_paused = true)]
async fn write_connect_requires_join() {
    let h = harness();
    h.host.set_outstanding_write(true);

    h.core.on_connect(ConnectionMode::Write, &details("c2"));
    assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);

    // just short of the join timeout: no diagnostic, still waiting
    advance(JOIN_OP_TIMEOUT - Duration::from_secs(1)).await;
    assert!(!h.telemetry.has("NoJoinOp"));
    assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);

    h.quorum.add_member("c2");
    assert_eq!(
        h.recorder.snapshot(),
        vec![
            (
                ConnectionState::CatchingUp,
                ConnectionState::Disconnected,
                None
            ),
            (
                ConnectionState::Connected,
                ConnectionState::CatchingUp,
                None
            ),
        ]
    );
    assert!(!h.telemetry.has("NoJoinOp"));

    // the cancelled join timer never fires
    advance(Duration::from_secs(10)).await;
    assert!(!h.telemetry.has("NoJoinOp"));
}

// Scenario: the Join op is slow
#[tokio::test(start_paused = true)]
async fn slow_join_is_reported_then_promotes() {
    let h = harness();
    h.host.set_outstanding_write(true);

    h.core.on_connect(ConnectionMode::Write, &details("c2"));

    advance(JOIN_OP_TIMEOUT + Duration::from_millis(100)).await;
    assert!(h.telemetry.has("NoJoinOp"));
    assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);

    advance(Duration::from_millis(900)).await;
    h.quorum.add_member("c2");
    assert!(h.telemetry.has("ReceivedJoinOp"));
    assert_eq!(h.core.connection_state(), ConnectionState::Connected);
    assert_eq!(h.core.client_id().as_deref(), Some("c2"));
}

// Scenario: a reconnect must wait for the previous client's Leave op
#[tokio::test(start_paused = true)]
async fn reconnect_waits_for_the_previous_leave() {
    let h = harness();
    connected_write_session(&h, "c_old");

    h.core.on_disconnect("net");
    assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);

    advance(Duration::from_millis(100)).await;
    h.core.on_connect(ConnectionMode::Write, &details("c_new"));

    advance(Duration::from_millis(100)).await;
    h.quorum.add_member("c_new");
    // the join alone is not enough while the leave wait is armed
    assert_eq!(h.recorder.connected_count(), 0);
    assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);

    advance(Duration::from_millis(300)).await;
    h.quorum.remove_member("c_old");
    assert_eq!(
        h.recorder.snapshot().last().unwrap(),
        &(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            None
        )
    );
    assert_eq!(h.core.client_id().as_deref(), Some("c_new"));
    assert!(h.telemetry.has("WaitBeforeClientLeave"));
}

// Scenario: the Leave op never arrives
#[tokio::test(start_paused = true)]
async fn leave_timeout_promotes_anyway() {
    let h = harness();
    connected_write_session(&h, "c_old");

    h.core.on_disconnect("net");
    advance(Duration::from_millis(100)).await;
    h.core.on_connect(ConnectionMode::Write, &details("c_new"));
    advance(Duration::from_millis(100)).await;
    h.quorum.add_member("c_new");
    assert_eq!(h.recorder.connected_count(), 0);

    // some of the earlier signals were rejected while the wait was armed
    assert!(h.telemetry.has("connectedStateRejected"));

    advance(DEFAULT_LEAVE_WAIT + Duration::from_millis(100)).await;
    assert_eq!(
        h.recorder.snapshot().last().unwrap(),
        &(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            Some("timeout".to_string())
        )
    );
    assert_eq!(h.core.client_id().as_deref(), Some("c_new"));
}

// Scenario: a container save shortcuts the leave wait
#[tokio::test(start_paused = true)]
async fn container_saved_shortcuts_the_leave_wait() {
    let h = harness();
    connected_write_session(&h, "c_old");

    h.core.on_disconnect("net");
    advance(Duration::from_millis(100)).await;
    h.core.on_connect(ConnectionMode::Write, &details("c_new"));
    advance(Duration::from_millis(100)).await;
    h.quorum.add_member("c_new");
    assert_eq!(h.recorder.connected_count(), 0);

    advance(Duration::from_millis(100)).await;
    h.core.container_saved();
    assert_eq!(
        h.recorder.snapshot().last().unwrap(),
        &(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            Some("containerSaved".to_string())
        )
    );
    assert_eq!(h.core.client_id().as_deref(), Some("c_new"));
}

// Scenario: the catch-up gate delays Connected until the stream catches up
#[tokio::test(start_paused = true)]
async fn catch_up_gate_delays_connected() {
    let host = TestHost::new();
    let quorum = Arc::new(QuorumStore::new());
    host.set_quorum(&quorum);
    let recorder = Arc::new(Recorder::default());
    let telemetry = Arc::new(TelemetryLog::default());

    let mut config = Config::default();
    config.connection.catch_up_before_declaring_connected = true;
    let deltas = Arc::new(DeltaTracker::with_sequence_numbers(80, 100));

    let handler = create_connection_state_handler(
        &config,
        Arc::clone(&host) as Arc<dyn HostHooks>,
        Arc::clone(&recorder) as Arc<dyn StateObserver>,
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
        None,
        Some(Arc::clone(&deltas) as Arc<dyn DeltaStream>),
        None,
    );
    let quorum_dyn: Arc<dyn QuorumClients> = Arc::clone(&quorum) as Arc<dyn QuorumClients>;
    handler.init_protocol(&quorum_dyn);

    handler.on_connect(ConnectionMode::Read, &details("c1"));
    settle().await;

    // the inner core promoted immediately; the gate holds it back
    assert_eq!(
        recorder.snapshot(),
        vec![(
            ConnectionState::CatchingUp,
            ConnectionState::Disconnected,
            None
        )]
    );
    assert_eq!(handler.connection_state(), ConnectionState::CatchingUp);

    deltas.process_op(90);
    assert_eq!(handler.connection_state(), ConnectionState::CatchingUp);

    deltas.process_op(100);
    assert_eq!(
        recorder.snapshot().last().unwrap(),
        &(
            ConnectionState::Connected,
            ConnectionState::CatchingUp,
            Some("caught up".to_string())
        )
    );
    assert_eq!(handler.connection_state(), ConnectionState::Connected);
    assert_eq!(handler.client_id().as_deref(), Some("c1"));
}

// The full loop again after a promotion: a second reconnect behaves like
// the first
#[tokio::test(start_paused = true)]
async fn two_reconnect_cycles() {
    let h = harness();
    connected_write_session(&h, "c1");

    for (old, new) in [("c1", "c2"), ("c2", "c3")] {
        h.core.on_disconnect("net");
        h.core.on_connect(ConnectionMode::Write, &details(new));
        h.quorum.add_member(new);
        assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);
        h.quorum.remove_member(old);
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
        assert_eq!(h.core.client_id().as_deref(), Some(new));
    }
}

// A disconnect while catching up goes straight back to Disconnected and
// the interrupted attempt never emits Connected
#[tokio::test(start_paused = true)]
async fn disconnect_while_catching_up() {
    let h = harness();
    h.host.set_outstanding_write(true);

    h.core.on_connect(ConnectionMode::Write, &details("c1"));
    assert_eq!(h.core.connection_state(), ConnectionState::CatchingUp);

    h.core.on_disconnect("gone");
    assert_eq!(
        h.recorder.snapshot(),
        vec![
            (
                ConnectionState::CatchingUp,
                ConnectionState::Disconnected,
                None
            ),
            (
                ConnectionState::Disconnected,
                ConnectionState::CatchingUp,
                Some("gone".to_string())
            ),
        ]
    );
    assert_eq!(h.core.pending_client_id(), None);

    // the late join for the abandoned attempt is a no-op
    h.quorum.add_member("c1");
    advance(JOIN_OP_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(h.recorder.connected_count(), 0);
    assert!(!h.telemetry.has("NoJoinOp"));
}
