//! Telemetry events emitted by the gate.
//!
//! Every dispatch produces at most one terminal event: `Rejected` when an
//! admission check failed, `Halted` when a middleware stage stopped
//! propagation, or `Executed` once the handler body ran. Events flow through
//! a [`TelemetrySink`]; hosts wire one into the gate to feed dashboards or
//! audit logs, tests use [`RecordingSink`].

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::gate::Rejection;

/// Which stage list halted a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    PreChecks,
    PreThrottle,
    PreExecution,
    PostExecution,
    ReturnValue,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StagePhase::PreChecks => "pre-checks",
            StagePhase::PreThrottle => "pre-throttle",
            StagePhase::PreExecution => "pre-execution",
            StagePhase::PostExecution => "post-execution",
            StagePhase::ReturnValue => "return-value",
        };
        f.write_str(text)
    }
}

/// Terminal outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// An admission check failed; the handler never ran.
    Rejected { handler: String, rejection: Rejection },
    /// A middleware stage stopped propagation.
    Halted { handler: String, phase: StagePhase },
    /// The handler body ran (successfully or not).
    Executed { handler: String, success: bool, runtime_ms: u64 },
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateEvent::Rejected { handler, rejection } => {
                write!(f, "rejected handler={handler}: {rejection}")
            }
            GateEvent::Halted { handler, phase } => {
                write!(f, "halted handler={handler} phase={phase}")
            }
            GateEvent::Executed { handler, success, runtime_ms } => {
                write!(f, "executed handler={handler} success={success} runtime={runtime_ms}ms")
            }
        }
    }
}

/// Consumes gate events. Emission is best-effort: the gate never fails a
/// dispatch over a sink.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn emit(&self, event: GateEvent);
}

/// Sink that forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn emit(&self, event: GateEvent) {
        tracing::info!(event = %event, "gate_event");
    }
}

/// Sink that buffers events in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GateEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn emit(&self, event: GateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_buffers_events() {
        let sink = RecordingSink::new();
        assert!(sink.is_empty());

        sink.emit(GateEvent::Executed {
            handler: "ping".into(),
            success: true,
            runtime_ms: 3,
        })
        .await;
        sink.emit(GateEvent::Halted { handler: "ping".into(), phase: StagePhase::PreChecks })
            .await;

        assert_eq!(sink.len(), 2);
        let events = sink.events();
        assert!(matches!(events[0], GateEvent::Executed { .. }));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn event_display_is_log_friendly() {
        let event = GateEvent::Executed { handler: "ping".into(), success: false, runtime_ms: 12 };
        assert_eq!(event.to_string(), "executed handler=ping success=false runtime=12ms");

        let halted = GateEvent::Halted { handler: "ping".into(), phase: StagePhase::PreThrottle };
        assert!(halted.to_string().contains("pre-throttle"));
    }
}
