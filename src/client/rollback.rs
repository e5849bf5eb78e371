//! Rollback Manager
//!
//! Turns divergences between predicted and authoritative state into visual
//! corrections, and replays recent inputs when the error is large.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::interpolation::{Easing, InterpolationService, Priority, VisualState};
use crate::client::prediction::{Divergence, PredictionEngine, PredictionResult};
use crate::core::buffer::{mean, RollingHistory};
use crate::core::time::Millis;
use crate::core::vec2::Vec2;
use crate::game::events::{NetcodeEvent, SharedSink};
use crate::game::input::PredictiveInput;
use crate::game::state::{EntityRef, Sequence, Snapshot};
use crate::network::protocol::{CorrectionKind, CorrectionRecord, RollbackCorrection};

/// Correction thresholds and smoothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Errors below this are left alone (cells)
    pub threshold: f32,
    /// Errors above this also replay recent inputs
    pub replay_threshold: f32,
    /// Corrections shorter than this snap instantly
    pub instant_threshold: f32,
    /// Shortest smoothing, one render frame (ms)
    pub frame_ms: u32,
    /// Longest smoothing (ms)
    pub max_smoothing_ms: u32,
    /// Extra smoothing per cell of distance (ms)
    pub ms_per_unit: f32,
    /// Inputs replayed at most
    pub replay_inputs: usize,
    /// Rollback events kept for statistics
    pub history_len: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            replay_threshold: 8.0,
            instant_threshold: 0.5,
            frame_ms: 16,
            max_smoothing_ms: 50,
            ms_per_unit: 4.0,
            replay_inputs: 5,
            history_len: 128,
        }
    }
}

/// One entity's correction.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCorrection {
    /// Corrected entity
    pub entity: EntityRef,
    /// Correction kind
    pub kind: CorrectionKind,
    /// Value shown before the correction
    pub from: Option<Vec2>,
    /// Authoritative value
    pub to: Option<Vec2>,
    /// Confidence in the corrected value
    pub confidence: f32,
}

impl EntityCorrection {
    fn to_record(&self) -> CorrectionRecord {
        CorrectionRecord {
            entity: self.entity,
            kind: self.kind,
            previous: self.from,
            corrected: self.to,
            confidence: self.confidence,
        }
    }
}

/// Result of reconciling one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Correction id
    pub correction_id: u64,
    /// Authoritative sequence corrected to
    pub target_sequence: Sequence,
    /// Error that triggered it
    pub error: f32,
    /// Applied corrections
    pub corrections: Vec<EntityCorrection>,
    /// Smoothing used (0 when instant)
    pub smoothing_ms: u32,
    /// Whether inputs were replayed
    pub replay: bool,
    /// Predictions produced by the replay
    pub replacements: Vec<PredictionResult>,
}

impl Reconciliation {
    /// Wire form, for reporting a correction to peers.
    pub fn to_wire(&self, player_id: u32, timestamp: u64) -> RollbackCorrection {
        RollbackCorrection {
            correction_id: self.correction_id,
            rollback_to_sequence: self.target_sequence,
            timestamp,
            affected_player_ids: vec![player_id],
            corrections: self.corrections.iter().map(EntityCorrection::to_record).collect(),
            priority: Priority::High.code(),
            smoothing_duration_ms: self.smoothing_ms,
        }
    }
}

/// Recorded rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEvent {
    /// Correction id
    pub correction_id: u64,
    /// Authoritative sequence
    pub target_sequence: Sequence,
    /// Error magnitude
    pub error: f32,
    /// Corrections applied
    pub applied: usize,
    /// Corrections dropped for missing entities
    pub dropped: usize,
    /// Smoothing (ms)
    pub smoothing_ms: u32,
    /// Inputs replayed
    pub replayed: usize,
    /// Came from a server correction message
    pub remote: bool,
    /// Client time (ms)
    pub at: Millis,
}

/// Rollback statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollbackStats {
    /// Divergences evaluated
    pub evaluated: u64,
    /// Rollbacks performed
    pub rollbacks: u64,
    /// Rollbacks that replayed inputs
    pub replays: u64,
    /// Corrections dropped
    pub dropped: u64,
}

/// Applies corrections and records them.
pub struct RollbackManager {
    config: RollbackConfig,
    history: RollingHistory<RollbackEvent>,
    stats: RollbackStats,
    next_correction: u64,
    sink: SharedSink,
}

impl RollbackManager {
    /// Create a manager.
    pub fn new(config: RollbackConfig, sink: SharedSink) -> Self {
        Self {
            history: RollingHistory::new(config.history_len),
            config,
            stats: RollbackStats::default(),
            next_correction: 1,
            sink,
        }
    }

    /// Smoothing for a correction of `distance` cells. Zero means instant.
    pub fn smoothing_for(&self, distance: f32) -> u32 {
        if distance < self.config.instant_threshold {
            return 0;
        }
        let frame = self.config.frame_ms as f32;
        let max = self.config.max_smoothing_ms.max(self.config.frame_ms) as f32;
        (frame + distance * self.config.ms_per_unit).clamp(frame, max).round() as u32
    }

    /// Confidence in a correction, lower for larger errors.
    pub fn confidence_for(&self, error: f32) -> f32 {
        (1.0 / (1.0 + error.max(0.0))).clamp(0.0, 1.0)
    }

    /// Reconcile a prediction with authoritative state.
    ///
    /// Returns `None` when the error is below the threshold. Positional
    /// corrections become high-priority interpolation tasks from the value on
    /// screen to the authoritative one. Errors above the replay threshold also
    /// re-predict the most recent of `replay_inputs` from `authoritative`.
    #[allow(clippy::too_many_arguments)]
    pub fn reconcile(
        &mut self,
        prediction: &PredictionResult,
        divergence: &Divergence,
        authoritative: &Snapshot,
        replay_inputs: &[PredictiveInput],
        interpolation: &mut InterpolationService,
        engine: &mut PredictionEngine,
        now: Millis,
    ) -> Option<Reconciliation> {
        self.stats.evaluated += 1;
        if divergence.error < self.config.threshold {
            return None;
        }

        let correction_id = self.next_correction;
        self.next_correction += 1;

        let mut corrections = Vec::new();
        let mut smoothing_ms = 0;
        let mut dropped = 0;

        if let Some(entity) = divergence.entity {
            match authoritative.position_of(entity) {
                Some(to) => {
                    let from = interpolation
                        .current_state(entity)
                        .map(|s| s.position)
                        .or(divergence.predicted);
                    if divergence.kind.is_positional() {
                        let start = from.unwrap_or(to);
                        smoothing_ms = self.smooth(interpolation, entity, start, to, None);
                    }
                    corrections.push(EntityCorrection {
                        entity,
                        kind: divergence.kind,
                        from,
                        to: Some(to),
                        confidence: self.confidence_for(divergence.error),
                    });
                }
                None => {
                    dropped += 1;
                    self.drop_correction(interpolation, entity);
                }
            }
        }

        let replay = divergence.error > self.config.replay_threshold;
        let mut replacements = Vec::new();
        if replay && !replay_inputs.is_empty() {
            let skip = replay_inputs.len().saturating_sub(self.config.replay_inputs);
            replacements = engine.replay(authoritative, &replay_inputs[skip..], now);
        }

        for c in &corrections {
            self.sink.emit(NetcodeEvent::RollbackApplied {
                correction_id,
                entity: c.entity,
                error: divergence.error,
                smoothing_ms,
                replayed: replay,
            });
        }
        info!(
            correction_id,
            prediction = prediction.correlation_id,
            error = divergence.error,
            smoothing_ms,
            replayed = replacements.len(),
            "Rollback"
        );

        self.record(RollbackEvent {
            correction_id,
            target_sequence: authoritative.sequence,
            error: divergence.error,
            applied: corrections.len(),
            dropped,
            smoothing_ms,
            replayed: replacements.len(),
            remote: false,
            at: now,
        });

        Some(Reconciliation {
            correction_id,
            target_sequence: authoritative.sequence,
            error: divergence.error,
            corrections,
            smoothing_ms,
            replay,
            replacements,
        })
    }

    /// Apply a server-sent correction batch. Returns corrections applied.
    ///
    /// Records for entities absent from `authoritative` are dropped; the
    /// rest of the batch still applies.
    pub fn apply_remote(
        &mut self,
        correction: &RollbackCorrection,
        authoritative: &Snapshot,
        interpolation: &mut InterpolationService,
        now: Millis,
    ) -> usize {
        let mut applied = 0;
        let mut dropped = 0;
        let mut total_error = 0.0;
        let priority = Priority::from_code(correction.priority);

        for record in &correction.corrections {
            if !authoritative.contains(record.entity) {
                dropped += 1;
                self.drop_correction(interpolation, record.entity);
                continue;
            }
            applied += 1;
            let Some(to) = record.corrected.filter(|_| record.kind.is_positional()) else {
                continue;
            };
            let from = interpolation
                .current_state(record.entity)
                .map(|s| s.position)
                .or(record.previous)
                .unwrap_or(to);
            let error = from.distance(to);
            total_error += error;
            let duration = (correction.smoothing_duration_ms > 0).then_some(correction.smoothing_duration_ms);
            let smoothing_ms = self.smooth_with(interpolation, record.entity, from, to, duration, priority);
            self.sink.emit(NetcodeEvent::RollbackApplied {
                correction_id: correction.correction_id,
                entity: record.entity,
                error,
                smoothing_ms,
                replayed: false,
            });
        }

        debug!(correction_id = correction.correction_id, applied, dropped, "Remote correction");
        self.record(RollbackEvent {
            correction_id: correction.correction_id,
            target_sequence: correction.rollback_to_sequence,
            error: if applied > 0 { total_error / applied as f32 } else { 0.0 },
            applied,
            dropped,
            smoothing_ms: correction.smoothing_duration_ms,
            replayed: 0,
            remote: true,
            at: now,
        });
        applied
    }

    fn smooth(
        &mut self,
        interpolation: &mut InterpolationService,
        entity: EntityRef,
        from: Vec2,
        to: Vec2,
        duration: Option<u32>,
    ) -> u32 {
        self.smooth_with(interpolation, entity, from, to, duration, Priority::High)
    }

    fn smooth_with(
        &mut self,
        interpolation: &mut InterpolationService,
        entity: EntityRef,
        from: Vec2,
        to: Vec2,
        duration: Option<u32>,
        priority: Priority,
    ) -> u32 {
        let distance = from.distance(to);
        let smoothing_ms = duration.unwrap_or_else(|| self.smoothing_for(distance));
        if smoothing_ms == 0 {
            // Instant: the authoritative snapshot is drawn as is
            interpolation.cancel(entity);
            return 0;
        }
        interpolation.start_interpolation(
            entity,
            VisualState::at(from),
            VisualState::at(to),
            smoothing_ms as f32,
            Easing::for_correction_distance(distance),
            priority,
        );
        smoothing_ms
    }

    fn drop_correction(&mut self, interpolation: &mut InterpolationService, entity: EntityRef) {
        interpolation.cancel(entity);
        self.stats.dropped += 1;
        self.sink.emit(NetcodeEvent::CorrectionDropped { entity });
    }

    fn record(&mut self, event: RollbackEvent) {
        self.stats.rollbacks += 1;
        if event.replayed > 0 {
            self.stats.replays += 1;
        }
        self.history.push(event);
    }

    /// Recent rollbacks, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RollbackEvent> {
        self.history.iter()
    }

    /// Mean error over recorded rollbacks.
    pub fn average_error(&self) -> f32 {
        let errors: Vec<f32> = self.history.iter().map(|e| e.error).collect();
        mean(errors.iter()).unwrap_or(0.0)
    }

    /// Counters.
    pub fn stats(&self) -> &RollbackStats {
        &self.stats
    }

    /// Active configuration.
    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::client::interpolation::InterpolationConfig;
    use crate::client::prediction::PredictionConfig;
    use crate::game::events::{EventLog, NullSink};
    use crate::game::state::{Arrow, Direction, EntityKind, MovingEntity, PlayerState};

    struct Fixture {
        rollback: RollbackManager,
        interp: InterpolationService,
        engine: PredictionEngine,
        log: EventLog,
    }

    fn fixture() -> Fixture {
        let log = EventLog::new();
        Fixture {
            rollback: RollbackManager::new(RollbackConfig::default(), Arc::new(log.clone())),
            interp: InterpolationService::new(InterpolationConfig::default()),
            engine: PredictionEngine::new(PredictionConfig::default(), Arc::new(NullSink)),
            log,
        }
    }

    fn board_with_arrow(x: u32, y: u32) -> Snapshot {
        let mut s = Snapshot::new(20, 15);
        s.sequence = 4;
        s.players.push(PlayerState::new(1, "ada"));
        s.arrows.push(Arrow {
            id: 3,
            owner: 1,
            x,
            y,
            direction: Direction::Up,
            placed_at: 4,
            input_sequence: 1,
        });
        s
    }

    #[test]
    fn test_smoothing_bounds() {
        let rb = fixture().rollback;
        assert_eq!(rb.smoothing_for(0.2), 0);
        assert_eq!(rb.smoothing_for(0.5), 18);
        assert_eq!(rb.smoothing_for(5.0), 36);
        assert_eq!(rb.smoothing_for(100.0), 50);
        for d in [0.5_f32, 1.0, 2.0, 7.5, 9.0, 1e6] {
            let s = rb.smoothing_for(d);
            assert!((16..=50).contains(&s), "{d} -> {s}");
        }
    }

    #[test]
    fn test_confidence_falls_with_error() {
        let rb = fixture().rollback;
        assert_eq!(rb.confidence_for(0.0), 1.0);
        assert!(rb.confidence_for(2.0) > rb.confidence_for(5.0));
        assert!(rb.confidence_for(f32::MAX) >= 0.0);
    }

    #[test]
    fn test_below_threshold_no_correction() {
        let mut f = fixture();
        let auth = board_with_arrow(12, 8);
        let prediction = f
            .engine
            .predict(&PredictiveInput::place_arrow(1, 1, 0, 13, 8, Direction::Up), &auth, 0)
            .unwrap();
        let divergence = f.engine.evaluate(&prediction, &auth);
        assert_eq!(divergence.error, 1.0);
        let result = f.rollback.reconcile(&prediction, &divergence, &auth, &[], &mut f.interp, &mut f.engine, 0);
        assert!(result.is_none());
        assert_eq!(f.interp.active_count(), 0);
        assert_eq!(f.rollback.stats().rollbacks, 0);
    }

    #[test]
    fn test_misplaced_arrow_corrected_smoothly() {
        let mut f = fixture();
        let mut predicted_world = Snapshot::new(20, 15);
        predicted_world.players.push(PlayerState::new(1, "ada"));
        let prediction = f
            .engine
            .predict(&PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up), &predicted_world, 0)
            .unwrap();

        let auth = board_with_arrow(17, 8);
        let divergence = f.engine.evaluate(&prediction, &auth);
        assert_eq!(divergence.error, 5.0);

        let rec = f
            .rollback
            .reconcile(&prediction, &divergence, &auth, &[], &mut f.interp, &mut f.engine, 10)
            .unwrap();
        assert_eq!(rec.smoothing_ms, 36);
        assert!(!rec.replay);
        assert_eq!(rec.corrections.len(), 1);

        let task = f.interp.task(EntityRef::Arrow(3)).unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.start.position, Vec2::new(12.0, 8.0));
        assert_eq!(task.target.position, Vec2::new(17.0, 8.0));

        let frames = f.interp.update_interpolations(40.0);
        assert!(frames[0].completed);
        assert_eq!(frames[0].state.position, Vec2::new(17.0, 8.0));
        assert_eq!(f.log.count("rollback_applied"), 1);

        let wire = rec.to_wire(1, 10);
        assert_eq!(wire.smoothing_duration_ms, 36);
        assert_eq!(wire.corrections[0].corrected, Some(Vec2::new(17.0, 8.0)));
    }

    #[test]
    fn test_large_error_replays_recent_inputs() {
        let mut f = fixture();
        let mut auth = Snapshot::new(20, 15);
        auth.sequence = 9;
        auth.players.push(PlayerState::new(1, "ada"));
        auth.players[0].cursor = Vec2::new(19.0, 14.0);

        let prediction = f
            .engine
            .predict(&PredictiveInput::move_cursor(1, 1, 0, Vec2::ZERO), &auth, 0)
            .unwrap();
        let divergence = f.engine.evaluate(&prediction, &auth);
        assert!(divergence.error > 8.0);

        let inputs: Vec<PredictiveInput> = (2..=9)
            .map(|seq| PredictiveInput::move_cursor(1, seq, 0, Vec2::new(seq as f32, 1.0)))
            .collect();
        let rec = f
            .rollback
            .reconcile(&prediction, &divergence, &auth, &inputs, &mut f.interp, &mut f.engine, 5)
            .unwrap();
        assert!(rec.replay);
        let replayed: Vec<u64> = rec.replacements.iter().map(|p| p.input_sequence).collect();
        assert_eq!(replayed, vec![5, 6, 7, 8, 9]);
        assert_eq!(f.rollback.stats().replays, 1);
    }

    #[test]
    fn test_second_correction_replaces_first() {
        let mut f = fixture();
        let entity = EntityRef::Entity(7);
        let mut auth = Snapshot::new(20, 15);
        auth.strategy.mice.push(MovingEntity::new(7, EntityKind::default(), Vec2::new(10.0, 2.0), Direction::Right, 0.25));

        let record = |from: Vec2, to: Vec2| CorrectionRecord {
            entity,
            kind: CorrectionKind::Position,
            previous: Some(from),
            corrected: Some(to),
            confidence: 0.9,
        };
        let batch = |id: u64, rec: CorrectionRecord| RollbackCorrection {
            correction_id: id,
            corrections: vec![rec],
            priority: 2,
            ..Default::default()
        };

        f.rollback.apply_remote(&batch(1, record(Vec2::new(2.0, 2.0), Vec2::new(6.0, 2.0))), &auth, &mut f.interp, 0);
        f.interp.update_interpolations(5.0);
        f.rollback.apply_remote(&batch(2, record(Vec2::new(2.0, 2.0), Vec2::new(10.0, 2.0))), &auth, &mut f.interp, 5);

        assert_eq!(f.interp.active_count(), 1);
        let task = f.interp.task(entity).unwrap();
        assert_eq!(task.target.position, Vec2::new(10.0, 2.0));
        // Starts from the in-flight value, not the stale one
        assert!(task.start.position.x > 2.0);
        assert_eq!(f.rollback.history().count(), 2);
    }

    #[test]
    fn test_missing_entities_dropped_without_aborting() {
        let mut f = fixture();
        let mut auth = Snapshot::new(20, 15);
        auth.strategy.mice.push(MovingEntity::new(1, EntityKind::default(), Vec2::new(4.0, 4.0), Direction::Up, 0.25));

        let batch = RollbackCorrection {
            correction_id: 11,
            corrections: vec![
                CorrectionRecord {
                    entity: EntityRef::Entity(99),
                    kind: CorrectionKind::Position,
                    previous: Some(Vec2::ZERO),
                    corrected: Some(Vec2::new(3.0, 3.0)),
                    confidence: 0.5,
                },
                CorrectionRecord {
                    entity: EntityRef::Entity(1),
                    kind: CorrectionKind::Position,
                    previous: Some(Vec2::new(1.0, 4.0)),
                    corrected: Some(Vec2::new(4.0, 4.0)),
                    confidence: 0.5,
                },
            ],
            priority: 2,
            ..Default::default()
        };
        assert_eq!(f.rollback.apply_remote(&batch, &auth, &mut f.interp, 0), 1);
        assert_eq!(f.log.count("correction_dropped"), 1);
        assert!(f.interp.task(EntityRef::Entity(1)).is_some());
        assert_eq!(f.rollback.stats().dropped, 1);
    }

    #[test]
    fn test_tiny_remote_correction_is_instant() {
        let mut f = fixture();
        let mut auth = Snapshot::new(20, 15);
        auth.strategy.mice.push(MovingEntity::new(1, EntityKind::default(), Vec2::new(4.0, 4.0), Direction::Up, 0.25));
        let batch = RollbackCorrection {
            correction_id: 1,
            corrections: vec![CorrectionRecord {
                entity: EntityRef::Entity(1),
                kind: CorrectionKind::Position,
                previous: Some(Vec2::new(3.8, 4.0)),
                corrected: Some(Vec2::new(4.0, 4.0)),
                confidence: 1.0,
            }],
            ..Default::default()
        };
        assert_eq!(f.rollback.apply_remote(&batch, &auth, &mut f.interp, 0), 1);
        assert_eq!(f.interp.active_count(), 0);
    }
}
