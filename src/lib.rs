//! OpSync - Reconnect-safe connection state tracking for collaborative
//! op-stream relay clients
//!
//! A client of a collaboration relay reconnects often, and ops sent on the
//! previous connection can still be sequenced under the old client
//! identifier after the new socket opens. This crate coordinates the Join
//! op for the new identifier, the Leave op for the previous one, and an
//! optional delta-stream catch-up condition before a session is declared
//! Connected, so hosts never submit against a stale view.

pub mod config;
pub mod deltas;
pub mod gate;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod quorum;
pub mod telemetry;
pub mod timer;

pub use config::{Config, ConfigError, ConfigProvider};
pub use deltas::{CatchUpMonitor, DeltaStream, DeltaTracker};
pub use gate::CatchUpGate;
pub use handler::{
    create_connection_state_handler, ConnectionStateCore, ConnectionStateHandler, HostHooks,
    StateObserver, DEFAULT_LEAVE_WAIT, JOIN_OP_TIMEOUT,
};
pub use metrics::Metrics;
pub use protocol::{ClientId, ConnectionDetails, ConnectionMode, ConnectionState};
pub use quorum::{QuorumClients, QuorumMember, QuorumStore};
pub use telemetry::{
    init_logging, CompositeTelemetry, EventCategory, NullTelemetry, TelemetryEvent, TelemetrySink,
    TracingTelemetry,
};
pub use timer::OneShotTimer;
