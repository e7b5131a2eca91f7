//! Observability hooks for the sampling loop. Emission is strictly
//! fire-and-forget: a failing sink is logged and never disturbs the loop.

use serde_json::Value;
use strum_macros::Display;
use tracing::warn;

/// Loop lifecycle events a sink may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    TurnStarted,
    ModelResponse,
    ToolCallStarted,
    ToolExecuted,
    LoopDetected,
    RefusalRetry,
    Terminated,
}

pub trait TelemetrySink: Send + Sync {
    fn record_event(&self, kind: EventKind, payload: &Value) -> anyhow::Result<()>;
}

/// Discards everything.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record_event(&self, _kind: EventKind, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Deliver an event, downgrading sink failures to a warning.
pub fn emit(sink: &dyn TelemetrySink, kind: EventKind, payload: &Value) {
    if let Err(err) = sink.record_event(kind, payload) {
        warn!(event = %kind, "telemetry sink failed: {err}");
    }
}
