//! Netcode Events
//!
//! Structured events emitted by the core components. The core never logs
//! directly; an [`EventSink`] decides how events are displayed or stored.

use std::sync::{Arc, Mutex};

use serde::{Serialize, Deserialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::game::state::{EntityRef, PlayerId, Sequence};

/// Severity used by observers to pick a log level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// High-volume diagnostics
    Debug,
    /// Normal operation
    Info,
    /// Recoverable anomaly
    Warn,
    /// Fault needing attention
    Error,
}

/// Event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetcodeEvent {
    /// Server state machine moved
    ServerStateChanged {
        /// Previous state
        from: String,
        /// New state
        to: String,
    },

    /// Tick produced a snapshot
    TickCompleted {
        /// Snapshot sequence
        sequence: Sequence,
        /// Inputs consumed
        inputs: usize,
        /// Full snapshot (true) or delta
        full: bool,
        /// Encoded frame size
        bytes: usize,
        /// Simulation time
        tick_ms: f32,
    },

    /// Simulation step failed and the tick was skipped
    SimulationFault {
        /// Sequence the tick would have produced
        sequence: Sequence,
        /// Consecutive faults including this one
        consecutive: u32,
        /// Fault description
        message: String,
    },

    /// Consecutive faults reached the escalation threshold
    FaultEscalation {
        /// Consecutive faults
        consecutive: u32,
    },

    /// Tick rate changed in response to load
    TickRateAdjusted {
        /// Previous rate (Hz)
        old_rate: f32,
        /// New rate (Hz)
        new_rate: f32,
        /// Players considered
        players: usize,
        /// Entities considered
        entities: usize,
    },

    /// Input accepted for the next tick
    InputAccepted {
        /// Player
        player_id: PlayerId,
        /// Input sequence
        sequence: u64,
    },

    /// Input rejected at validation
    InputRejected {
        /// Player
        player_id: PlayerId,
        /// Input sequence
        sequence: u64,
        /// Reason sent back to the client
        reason: String,
    },

    /// Inbound frame failed to decode
    MessageRejected {
        /// Frame length
        len: usize,
        /// Parse error
        reason: String,
    },

    /// Snapshot ignored because it was not newer than the last applied one
    SnapshotDiscarded {
        /// Received sequence
        sequence: Sequence,
        /// Last applied sequence
        last_applied: Sequence,
    },

    /// Client lost its delta baseline
    ResyncRequired {
        /// Baseline the delta needed
        base_sequence: Sequence,
    },

    /// Local prediction made
    PredictionMade {
        /// Correlation id
        correlation_id: u64,
        /// Player
        player_id: PlayerId,
        /// Input sequence
        input_sequence: u64,
        /// Confidence in [0, 1]
        confidence: f32,
    },

    /// Prediction compared against authority
    PredictionValidated {
        /// Correlation id
        correlation_id: u64,
        /// Divergence magnitude
        error: f32,
        /// Whether a correction was applied
        corrected: bool,
    },

    /// Prediction withdrawn after a rejection
    PredictionRetracted {
        /// Correlation id
        correlation_id: u64,
        /// Input sequence
        input_sequence: u64,
    },

    /// Stale predictions purged
    PredictionsPurged {
        /// Number purged
        count: usize,
    },

    /// Correction applied to an entity
    RollbackApplied {
        /// Correction id
        correction_id: u64,
        /// Entity corrected
        entity: EntityRef,
        /// Correction error
        error: f32,
        /// Smoothing duration (0 when instant)
        smoothing_ms: u32,
        /// Whether inputs were replayed
        replayed: bool,
    },

    /// Correction for an entity no longer present
    CorrectionDropped {
        /// Entity referenced
        entity: EntityRef,
    },

    /// Metrics threshold breached
    ThresholdBreached {
        /// Threshold name
        name: String,
        /// Observed value
        value: f32,
        /// Configured limit
        limit: f32,
    },
}

impl NetcodeEvent {
    /// Default severity of the event.
    pub fn severity(&self) -> Severity {
        match self {
            NetcodeEvent::TickCompleted { .. }
            | NetcodeEvent::PredictionMade { .. }
            | NetcodeEvent::PredictionValidated { .. }
            | NetcodeEvent::InputAccepted { .. } => Severity::Debug,
            NetcodeEvent::ServerStateChanged { .. }
            | NetcodeEvent::TickRateAdjusted { .. }
            | NetcodeEvent::PredictionsPurged { .. }
            | NetcodeEvent::RollbackApplied { .. }
            | NetcodeEvent::PredictionRetracted { .. } => Severity::Info,
            NetcodeEvent::InputRejected { .. }
            | NetcodeEvent::MessageRejected { .. }
            | NetcodeEvent::SnapshotDiscarded { .. }
            | NetcodeEvent::ResyncRequired { .. }
            | NetcodeEvent::CorrectionDropped { .. }
            | NetcodeEvent::ThresholdBreached { .. } => Severity::Warn,
            NetcodeEvent::SimulationFault { .. } | NetcodeEvent::FaultEscalation { .. } => Severity::Error,
        }
    }

    /// Short event name.
    pub fn name(&self) -> &'static str {
        match self {
            NetcodeEvent::ServerStateChanged { .. } => "server_state_changed",
            NetcodeEvent::TickCompleted { .. } => "tick_completed",
            NetcodeEvent::SimulationFault { .. } => "simulation_fault",
            NetcodeEvent::FaultEscalation { .. } => "fault_escalation",
            NetcodeEvent::TickRateAdjusted { .. } => "tick_rate_adjusted",
            NetcodeEvent::InputAccepted { .. } => "input_accepted",
            NetcodeEvent::InputRejected { .. } => "input_rejected",
            NetcodeEvent::MessageRejected { .. } => "message_rejected",
            NetcodeEvent::SnapshotDiscarded { .. } => "snapshot_discarded",
            NetcodeEvent::ResyncRequired { .. } => "resync_required",
            NetcodeEvent::PredictionMade { .. } => "prediction_made",
            NetcodeEvent::PredictionValidated { .. } => "prediction_validated",
            NetcodeEvent::PredictionRetracted { .. } => "prediction_retracted",
            NetcodeEvent::PredictionsPurged { .. } => "predictions_purged",
            NetcodeEvent::RollbackApplied { .. } => "rollback_applied",
            NetcodeEvent::CorrectionDropped { .. } => "correction_dropped",
            NetcodeEvent::ThresholdBreached { .. } => "threshold_breached",
        }
    }
}

// =============================================================================
// SINKS
// =============================================================================

/// Receiver of core events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn emit(&self, event: NetcodeEvent);
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn EventSink>;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: NetcodeEvent) {}
}

/// Logs events through `tracing` at their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl EventSink for TracingObserver {
    fn emit(&self, event: NetcodeEvent) {
        let name = event.name();
        match event.severity() {
            Severity::Debug => debug!(event = name, detail = ?event),
            Severity::Info => info!(event = name, detail = ?event),
            Severity::Warn => warn!(event = name, detail = ?event),
            Severity::Error => error!(event = name, detail = ?event),
        }
    }
}

impl EventSink for mpsc::UnboundedSender<NetcodeEvent> {
    fn emit(&self, event: NetcodeEvent) {
        // Receiver gone means nobody is observing
        let _ = self.send(event);
    }
}

/// In-memory event recorder.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<NetcodeEvent>>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every recorded event.
    pub fn events(&self) -> Vec<NetcodeEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: NetcodeEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = NetcodeEvent::InputRejected {
            player_id: 2,
            sequence: 9,
            reason: "Unknown player 2".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"input_rejected\""));
        let back: NetcodeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_severity() {
        assert_eq!(NetcodeEvent::FaultEscalation { consecutive: 3 }.severity(), Severity::Error);
        assert_eq!(NetcodeEvent::PredictionsPurged { count: 1 }.severity(), Severity::Info);
    }

    #[test]
    fn test_event_log() {
        let log = EventLog::new();
        let sink: SharedSink = Arc::new(log.clone());
        sink.emit(NetcodeEvent::PredictionsPurged { count: 2 });
        sink.emit(NetcodeEvent::FaultEscalation { consecutive: 3 });
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.count("fault_escalation"), 1);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(NetcodeEvent::ResyncRequired { base_sequence: 4 });
        assert_eq!(rx.try_recv().unwrap(), NetcodeEvent::ResyncRequired { base_sequence: 4 });

        // Closed receiver is ignored
        drop(rx);
        tx.emit(NetcodeEvent::ResyncRequired { base_sequence: 5 });
    }
}
