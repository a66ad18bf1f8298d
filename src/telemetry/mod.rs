//! Connection Telemetry
//!
//! Structured diagnostics emitted by the connection state machine. Event
//! names are stable identifiers consumed by downstream telemetry pipelines
//! and must not be renamed.

use std::fmt;

use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Join op not observed within the join timeout
pub const NO_JOIN_OP: &str = "NoJoinOp";
/// Join op observed although no join wait was running
pub const RECEIVED_JOIN_OP: &str = "ReceivedJoinOp";
/// Performance span: time Connected was held back for the prior client's Leave
pub const WAIT_BEFORE_CLIENT_LEAVE: &str = "WaitBeforeClientLeave";
/// A promotion attempt did not meet the precondition set
pub const CONNECTED_STATE_REJECTED: &str = "connectedStateRejected";
/// Disconnected without arming the leave wait
pub const NO_WAIT_ON_DISCONNECTED: &str = "noWaitOnDisconnected";
/// Redundant transition request
pub const SET_CONNECTION_STATE_SAME: &str = "setConnectionStateSame";

/// Telemetry event category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Routine diagnostics
    Generic,
    /// Conditions operators should look at
    Error,
    /// Duration measurements
    Performance,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Generic => "generic",
            EventCategory::Error => "error",
            EventCategory::Performance => "performance",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured telemetry event
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub event_name: &'static str,
    pub category: EventCategory,
    pub details: Value,
}

impl TelemetryEvent {
    pub fn new(event_name: &'static str, category: EventCategory, details: Value) -> Self {
        Self {
            event_name,
            category,
            details,
        }
    }

    pub fn generic(event_name: &'static str, details: Value) -> Self {
        Self::new(event_name, EventCategory::Generic, details)
    }

    pub fn error(event_name: &'static str, details: Value) -> Self {
        Self::new(event_name, EventCategory::Error, details)
    }

    pub fn performance(event_name: &'static str, details: Value) -> Self {
        Self::new(event_name, EventCategory::Performance, details)
    }
}

/// Sink for connection diagnostics
///
/// Implement this to route diagnostics into a host telemetry pipeline. All
/// methods are synchronous; sinks must not block.
pub trait TelemetrySink: Send + Sync {
    /// Record a connection problem worth surfacing to operators
    fn log_connection_issue(&self, event_name: &'static str, details: Value);

    /// Record a structured telemetry event
    fn send_telemetry_event(&self, event: TelemetryEvent);
}

/// Sink that forwards everything to the tracing subscriber
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn log_connection_issue(&self, event_name: &'static str, details: Value) {
        warn!("connection issue {}: {}", event_name, details);
    }

    fn send_telemetry_event(&self, event: TelemetryEvent) {
        match event.category {
            EventCategory::Error => error!("{}: {}", event.event_name, event.details),
            EventCategory::Performance => info!("{}: {}", event.event_name, event.details),
            EventCategory::Generic => debug!("{}: {}", event.event_name, event.details),
        }
    }
}

/// Sink that drops everything
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn log_connection_issue(&self, _event_name: &'static str, _details: Value) {}

    fn send_telemetry_event(&self, _event: TelemetryEvent) {}
}

/// Fan-out sink that chains multiple implementations
///
/// Events are delivered to every sink in registration order.
pub struct CompositeTelemetry {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink
    pub fn add<S: TelemetrySink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    /// Add a sink and return self for chaining
    pub fn with<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.add(sink);
        self
    }
}

impl Default for CompositeTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for CompositeTelemetry {
    fn log_connection_issue(&self, event_name: &'static str, details: Value) {
        for sink in &self.sinks {
            sink.log_connection_issue(event_name, details.clone());
        }
    }

    fn send_telemetry_event(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.send_telemetry_event(event.clone());
        }
    }
}

/// Initialize the global tracing subscriber from a log level string.
///
/// `RUST_LOG` takes precedence when set. Safe to call more than once; later
/// calls are no-ops.
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
