//! Predictive client.
//!
//! [`PredictiveClient`] owns the client-side components and routes frames
//! between them:
//!
//! - `state_manager` - snapshot and prediction buffers, delta baseline
//! - `prediction` - outcome prediction and divergence scoring
//! - `interpolation` - per-entity visual transitions
//! - `rollback` - corrections and input replay
//! - `inputs` - sequencing and acknowledgment tracking

pub mod inputs;
pub mod interpolation;
pub mod prediction;
pub mod rollback;
pub mod state_manager;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::buffer::{mean, RollingHistory};
use crate::core::time::Millis;
use crate::error::NetcodeError;
use crate::game::events::{NetcodeEvent, NullSink, SharedSink};
use crate::game::input::{InputPayload, PredictiveInput};
use crate::game::state::{EntityRef, PlayerId, Sequence, Snapshot};
use crate::core::vec2::Vec2;
use crate::network::protocol::{Envelope, Payload, PerformanceMetrics};

pub use inputs::{AckOutcome, InputTracker, PendingInput};
pub use interpolation::{Easing, Extrapolation, InterpolationConfig, InterpolationFrame, InterpolationService, Priority, VisualState};
pub use prediction::{Divergence, PredictedOutcome, PredictionConfig, PredictionEngine, PredictionError, PredictionResult};
pub use rollback::{Reconciliation, RollbackConfig, RollbackManager};
pub use state_manager::{ClientStateManager, PredictionValidator, StateConfig, StateUpdate};

/// Bytes of a rejected frame included in the warning.
const REJECTED_PREVIEW: usize = 32;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Buffers and rendering
    pub state: StateConfig,
    /// Visual transitions
    pub interpolation: InterpolationConfig,
    /// Prediction confidence model
    pub prediction: PredictionConfig,
    /// Correction policy
    pub rollback: RollbackConfig,
    /// Input tracking
    pub inputs: InputConfig,
}

/// Input tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Unacknowledged inputs kept
    pub history: usize,
    /// Inputs unacknowledged this long are dropped (ms)
    pub timeout_ms: Millis,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            history: 64,
            timeout_ms: 5_000,
        }
    }
}

/// A locally submitted input.
#[derive(Debug, Clone)]
pub struct SubmittedInput {
    /// The sequenced input
    pub input: PredictiveInput,
    /// Prediction made for it
    pub prediction: PredictionResult,
    /// Encoded frame to send
    pub frame: Bytes,
}

/// What a received frame did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// Snapshot or reconstructed delta ingested
    State {
        /// Snapshot sequence
        sequence: Sequence,
        /// Came as a delta
        from_delta: bool,
        /// Buffer result
        update: StateUpdate,
        /// Corrections triggered by validation
        reconciliations: Vec<Reconciliation>,
    },
    /// Acknowledgment resolved
    Ack(AckOutcome),
    /// Server correction applied to this many entities
    Correction(usize),
    /// Server metrics stored
    Metrics,
    /// Frame not meant for clients
    Ignored,
}

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    /// Interpolated authoritative state
    pub snapshot: Snapshot,
    /// In-flight corrections, drawn instead of the snapshot position
    pub overlays: Vec<InterpolationFrame>,
    /// Unconfirmed local predictions
    pub predicted: Vec<PredictionResult>,
}

impl RenderFrame {
    /// Position to draw an entity at.
    pub fn position_of(&self, entity: EntityRef) -> Option<Vec2> {
        self.overlays
            .iter()
            .find(|f| f.entity == entity)
            .map(|f| f.state.position)
            .or_else(|| self.snapshot.position_of(entity))
    }
}

/// Result of periodic upkeep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// Inputs that timed out
    pub expired_inputs: usize,
    /// Predictions purged for age
    pub purged_predictions: usize,
    /// Buffer entries evicted
    pub evicted: usize,
}

/// Validates buffered predictions on behalf of the client.
struct RollbackContext<'a> {
    engine: &'a mut PredictionEngine,
    rollback: &'a mut RollbackManager,
    interpolation: &'a mut InterpolationService,
    inputs: &'a mut InputTracker,
    now: Millis,
    reconciliations: Vec<Reconciliation>,
}

impl PredictionValidator for RollbackContext<'_> {
    fn is_ready(&self, prediction: &PredictionResult, snapshot: &Snapshot) -> bool {
        let applied = self.inputs.applied_in(prediction.input_sequence, snapshot.sequence);
        match &prediction.outcome {
            PredictedOutcome::Placement { .. } => {
                applied
                    || snapshot
                        .arrows
                        .iter()
                        .any(|a| a.owner == prediction.player_id && a.input_sequence == prediction.input_sequence)
            }
            PredictedOutcome::Motion { .. } => true,
            PredictedOutcome::Cursor { .. } | PredictedOutcome::Action { .. } => applied,
        }
    }

    fn validate(&mut self, prediction: &PredictionResult, snapshot: &Snapshot) -> Vec<PredictionResult> {
        let divergence = self.engine.evaluate(prediction, snapshot);
        if let Err(e) = self.engine.confirm(prediction.correlation_id, &divergence) {
            debug!(error = %e, "Prediction already gone");
        }
        self.inputs.forget_applied(prediction.input_sequence);

        let replay = self.inputs.recent_unacknowledged(self.rollback.config().replay_inputs);
        match self.rollback.reconcile(
            prediction,
            &divergence,
            snapshot,
            &replay,
            self.interpolation,
            self.engine,
            self.now,
        ) {
            Some(reconciliation) => {
                let replacements = reconciliation.replacements.clone();
                self.reconciliations.push(reconciliation);
                replacements
            }
            None => Vec::new(),
        }
    }
}

/// Client runtime for one local player.
pub struct PredictiveClient {
    player_id: PlayerId,
    config: ClientConfig,
    state: ClientStateManager,
    prediction: PredictionEngine,
    interpolation: InterpolationService,
    rollback: RollbackManager,
    inputs: InputTracker,
    frame_sequence: u64,
    server_metrics: Option<PerformanceMetrics>,
    frame_times: RollingHistory<f32>,
    rejected_frames: u64,
    sink: SharedSink,
}

impl PredictiveClient {
    /// Create a client for `player_id`.
    pub fn new(player_id: PlayerId, config: ClientConfig, sink: SharedSink) -> Self {
        Self {
            player_id,
            state: ClientStateManager::new(config.state.clone(), sink.clone()),
            prediction: PredictionEngine::new(config.prediction.clone(), sink.clone()),
            interpolation: InterpolationService::new(config.interpolation.clone()),
            rollback: RollbackManager::new(config.rollback.clone(), sink.clone()),
            inputs: InputTracker::new(player_id, config.inputs.history),
            config,
            frame_sequence: 0,
            server_metrics: None,
            frame_times: RollingHistory::new(60),
            rejected_frames: 0,
            sink,
        }
    }

    /// Client with default configuration and no event sink.
    pub fn with_defaults(player_id: PlayerId) -> Self {
        Self::new(player_id, ClientConfig::default(), Arc::new(NullSink))
    }

    /// Sequence, predict and encode a local input.
    ///
    /// Inputs the engine cannot predict are not sent.
    pub fn submit_input(&mut self, payload: InputPayload, now: Millis) -> Result<SubmittedInput, PredictionError> {
        let sequence = self.inputs.next_sequence();
        let mut input = PredictiveInput::new(self.player_id, sequence, now, &payload);

        let world = self.state.latest().cloned().unwrap_or_default();
        let prediction = self.prediction.predict(&input, &world, now)?;
        input.prediction_confidence = Some(prediction.confidence);

        self.inputs.track(input.clone(), Some(prediction.correlation_id), now);
        self.state.add_prediction(prediction.clone(), now);

        let frame = self.frame(now, Payload::Input(input.clone()));
        Ok(SubmittedInput { input, prediction, frame })
    }

    /// Handle an inbound frame.
    ///
    /// A frame that fails to decode is rejected on its own; the client stays
    /// usable.
    pub fn receive(&mut self, data: &[u8], now: Millis) -> Result<ReceiveOutcome, NetcodeError> {
        let envelope = match Envelope::from_bytes(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.rejected_frames += 1;
                warn!(
                    len = data.len(),
                    head = %hex::encode(&data[..data.len().min(REJECTED_PREVIEW)]),
                    error = %e,
                    "Rejected frame"
                );
                self.sink.emit(NetcodeEvent::MessageRejected {
                    len: data.len(),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        match envelope.payload {
            Payload::Snapshot(snapshot) => {
                self.state.set_keyframe(snapshot.clone());
                Ok(self.ingest(snapshot, false, now))
            }
            Payload::Delta(delta) => {
                let snapshot = self.state.apply_delta(&delta)?;
                Ok(self.ingest(snapshot, true, now))
            }
            Payload::Ack(ack) => {
                let last_applied = self.state.last_applied().unwrap_or(0);
                let outcome = self.inputs.resolve(&ack, now, last_applied);
                if let AckOutcome::Rejected { pending, reason, .. } = &outcome {
                    debug!(sequence = pending.sequence, reason = %reason, "Input rejected");
                    self.prediction.retract(self.player_id, pending.sequence);
                    self.state.remove_predictions_for(pending.sequence);
                }
                Ok(ReceiveOutcome::Ack(outcome))
            }
            Payload::Correction(correction) => {
                let applied = match self.state.latest() {
                    Some(latest) => self.rollback.apply_remote(&correction, latest, &mut self.interpolation, now),
                    None => 0,
                };
                Ok(ReceiveOutcome::Correction(applied))
            }
            Payload::Metrics(metrics) => {
                self.server_metrics = Some(metrics);
                Ok(ReceiveOutcome::Metrics)
            }
            Payload::Input(_) => Ok(ReceiveOutcome::Ignored),
        }
    }

    fn ingest(&mut self, snapshot: Snapshot, from_delta: bool, now: Millis) -> ReceiveOutcome {
        let (min, max) = snapshot.bounds();
        self.interpolation.set_bounds(min, max);
        for entity in snapshot.entities() {
            self.interpolation
                .record_sample(EntityRef::Entity(entity.id), now, entity.position);
        }

        let sequence = snapshot.sequence;
        let mut ctx = RollbackContext {
            engine: &mut self.prediction,
            rollback: &mut self.rollback,
            interpolation: &mut self.interpolation,
            inputs: &mut self.inputs,
            now,
            reconciliations: Vec::new(),
        };
        let update = self.state.add_server_state(snapshot, now, &mut ctx);
        ReceiveOutcome::State {
            sequence,
            from_delta,
            update,
            reconciliations: ctx.reconciliations,
        }
    }

    /// Produce the frame to draw at `render_time`, advancing corrections by
    /// `dt_ms`.
    pub fn render(&mut self, render_time: Millis, dt_ms: f32) -> Option<RenderFrame> {
        self.frame_times.push(dt_ms);
        let overlays = self.interpolation.update_interpolations(dt_ms);
        let snapshot = self.state.get_interpolated_state(render_time)?;
        Some(RenderFrame {
            snapshot,
            overlays,
            predicted: self.state.predictions().cloned().collect(),
        })
    }

    /// Time out inputs and predictions, evict stale buffer entries.
    pub fn maintain(&mut self, now: Millis) -> Maintenance {
        let expired = self.inputs.expire(now, self.config.inputs.timeout_ms);
        for pending in &expired {
            self.prediction.retract(self.player_id, pending.sequence);
            self.state.remove_predictions_for(pending.sequence);
        }
        if let Some(latest) = self.state.latest() {
            let present: Vec<EntityRef> = latest.entities().map(|e| EntityRef::Entity(e.id)).collect();
            self.interpolation.retain_samples(|entity| present.contains(&entity));
        }
        Maintenance {
            expired_inputs: expired.len(),
            purged_predictions: self.prediction.purge_expired(now),
            evicted: self.state.evict(now),
        }
    }

    /// Client-side telemetry.
    pub fn performance_metrics(&self, now: Millis) -> PerformanceMetrics {
        let latest = self.state.latest();
        PerformanceMetrics {
            timestamp: now,
            player_count: latest.map_or(0, |s| s.players.len() as u32),
            entity_count: latest.map_or(0, |s| s.entity_count() as u32),
            prediction_accuracy: self.prediction.stats().accuracy(),
            rollback_count: self.rollback.stats().rollbacks,
            avg_rollback_error: self.rollback.average_error(),
            interpolation_tasks: self.interpolation.active_count() as u32,
            snapshot_buffer_len: self.state.snapshot_count() as u32,
            latency_ms: self.inputs.average_rtt().map_or(0.0, |rtt| rtt / 2.0),
            frame_time_ms: mean(self.frame_times.iter()).unwrap_or(0.0),
            dropped_snapshots: self.state.dropped_snapshots(),
            ..Default::default()
        }
    }

    fn frame(&mut self, now: Millis, payload: Payload) -> Bytes {
        self.frame_sequence += 1;
        Envelope::new(self.frame_sequence, now, payload).to_bytes()
    }

    /// Local player.
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// A delta arrived without its baseline; a full snapshot is needed.
    pub fn needs_resync(&self) -> bool {
        self.state.needs_resync()
    }

    /// Latest metrics reported by the server.
    pub fn server_metrics(&self) -> Option<&PerformanceMetrics> {
        self.server_metrics.as_ref()
    }

    /// Frames that failed to decode.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    /// Snapshot and prediction buffers.
    pub fn state(&self) -> &ClientStateManager {
        &self.state
    }

    /// Prediction engine.
    pub fn prediction(&self) -> &PredictionEngine {
        &self.prediction
    }

    /// Visual transitions.
    pub fn interpolation(&self) -> &InterpolationService {
        &self.interpolation
    }

    /// Correction history.
    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    /// Input tracking.
    pub fn inputs(&self) -> &InputTracker {
        &self.inputs
    }
}

// =============================================================================
// TESTS
// =============================================================================
