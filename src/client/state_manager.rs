//! Client State Manager
//!
//! Buffers authoritative snapshots and local predictions, reconstructs deltas
//! and produces the interpolated state the renderer draws.

use serde::{Deserialize, Serialize};

use crate::client::prediction::PredictionResult;
use crate::core::buffer::TimedBuffer;
use crate::core::time::Millis;
use crate::core::vec2::Vec2;
use crate::error::StateError;
use crate::game::events::{NetcodeEvent, SharedSink};
use crate::game::state::{Sequence, Snapshot};
use crate::network::delta;
use crate::network::protocol::Delta;

/// Hooks used to validate buffered predictions against a new snapshot.
pub trait PredictionValidator {
    /// Whether the snapshot carries enough to judge the prediction.
    fn is_ready(&self, prediction: &PredictionResult, snapshot: &Snapshot) -> bool;

    /// Judge the prediction. Returns predictions that replace it.
    fn validate(&mut self, prediction: &PredictionResult, snapshot: &Snapshot) -> Vec<PredictionResult>;
}

/// Buffer and rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Render this far behind the newest snapshot (ms)
    pub interpolation_delay_ms: Millis,
    /// Larger jumps are shown without blending (cells)
    pub teleport_distance: f32,
    /// Predictions within this window of a snapshot are checked against it (ms)
    pub validation_tolerance_ms: Millis,
    /// Snapshot retention (ms)
    pub snapshot_retention_ms: Millis,
    /// Snapshots held at most
    pub snapshot_capacity: usize,
    /// Prediction retention (ms)
    pub prediction_retention_ms: Millis,
    /// Predictions held at most
    pub prediction_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            interpolation_delay_ms: 100,
            teleport_distance: 3.0,
            validation_tolerance_ms: 250,
            snapshot_retention_ms: 1_000,
            snapshot_capacity: 64,
            prediction_retention_ms: 30_000,
            prediction_capacity: 256,
        }
    }
}

/// What happened to an incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateUpdate {
    /// Snapshot stored
    pub accepted: bool,
    /// Predictions validated against it
    pub validated: usize,
    /// Replacement predictions buffered
    pub replaced: usize,
}

/// Client-side snapshot and prediction store.
pub struct ClientStateManager {
    config: StateConfig,
    snapshots: TimedBuffer<Snapshot>,
    predictions: TimedBuffer<PredictionResult>,
    keyframe: Option<Snapshot>,
    latest: Option<Snapshot>,
    last_applied: Option<Sequence>,
    dropped: u64,
    needs_resync: bool,
    sink: SharedSink,
}

impl ClientStateManager {
    /// Create a manager.
    pub fn new(config: StateConfig, sink: SharedSink) -> Self {
        Self {
            snapshots: TimedBuffer::new(config.snapshot_retention_ms, config.snapshot_capacity),
            predictions: TimedBuffer::new(config.prediction_retention_ms, config.prediction_capacity),
            config,
            keyframe: None,
            latest: None,
            last_applied: None,
            dropped: 0,
            needs_resync: false,
            sink,
        }
    }

    /// Store an authoritative snapshot received at `t`.
    ///
    /// Out-of-order and duplicate snapshots are dropped. Buffered predictions
    /// made within the validation window that the validator reports ready are
    /// handed to it.
    pub fn add_server_state(&mut self, snapshot: Snapshot, t: Millis, validator: &mut dyn PredictionValidator) -> StateUpdate {
        if let Some(last) = self.last_applied {
            if snapshot.sequence <= last {
                self.dropped += 1;
                self.sink.emit(NetcodeEvent::SnapshotDiscarded {
                    sequence: snapshot.sequence,
                    last_applied: last,
                });
                return StateUpdate::default();
            }
        }

        self.last_applied = Some(snapshot.sequence);
        self.latest = Some(snapshot.clone());
        self.dropped += self.snapshots.push(t, snapshot.clone()) as u64;
        self.dropped += self.snapshots.evict_stale(t) as u64;

        let tolerance = self.config.validation_tolerance_ms;
        let (lo, hi) = (t.saturating_sub(tolerance), t.saturating_add(tolerance));
        let ready = self
            .predictions
            .take_where(|pt, p| pt >= lo && pt <= hi && validator.is_ready(p, &snapshot));

        let mut update = StateUpdate {
            accepted: true,
            ..Default::default()
        };
        for (_, prediction) in ready {
            update.validated += 1;
            for replacement in validator.validate(&prediction, &snapshot) {
                self.remove_prediction(replacement.correlation_id);
                self.predictions.push(replacement.timestamp, replacement);
                update.replaced += 1;
            }
        }
        update
    }

    /// Buffer a local prediction made at `t`.
    pub fn add_prediction(&mut self, prediction: PredictionResult, t: Millis) {
        self.predictions.push(t, prediction);
        self.predictions.evict_stale(t);
    }

    /// Drop a buffered prediction.
    pub fn remove_prediction(&mut self, correlation_id: u64) -> bool {
        !self
            .predictions
            .take_where(|_, p| p.correlation_id == correlation_id)
            .is_empty()
    }

    /// Drop buffered predictions for an input.
    pub fn remove_predictions_for(&mut self, input_sequence: u64) -> usize {
        self.predictions
            .take_where(|_, p| p.input_sequence == input_sequence)
            .len()
    }

    /// Remember a full snapshot as the baseline for deltas.
    pub fn set_keyframe(&mut self, snapshot: Snapshot) {
        self.keyframe = Some(snapshot);
        self.needs_resync = false;
    }

    /// Rebuild the snapshot a delta describes.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<Snapshot, StateError> {
        let base = self
            .keyframe
            .as_ref()
            .filter(|k| k.sequence == delta.base_sequence)
            .or_else(|| self.snapshots.iter().map(|(_, s)| s).find(|s| s.sequence == delta.base_sequence));

        match base {
            Some(base) => delta::apply_delta(base, delta),
            None => {
                self.needs_resync = true;
                self.sink.emit(NetcodeEvent::ResyncRequired {
                    base_sequence: delta.base_sequence,
                });
                Err(StateError::MissingBaseline(delta.base_sequence))
            }
        }
    }

    /// Snapshot to draw at `render_time`.
    ///
    /// Renders `interpolation_delay_ms` in the past, blending moving entities
    /// and cursors between the two snapshots around that time. Falls back to
    /// the newest snapshot when nothing brackets it.
    pub fn get_interpolated_state(&self, render_time: Millis) -> Option<Snapshot> {
        let target = render_time.saturating_sub(self.config.interpolation_delay_ms);
        let Some(((t0, from), (t1, to))) = self.snapshots.bracket(target) else {
            return self.latest.clone();
        };

        let progress = if t1 > t0 {
            ((target - t0) as f32 / (t1 - t0) as f32).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let teleport = self.config.teleport_distance;
        let blend = |a: Vec2, b: Vec2| {
            if a.distance(b) > teleport {
                b
            } else {
                a.lerp(b, progress)
            }
        };

        let mut state = to.clone();
        for entity in state.entities_mut() {
            if let Some(prev) = from.entity(entity.id) {
                entity.position = blend(prev.position, entity.position);
            }
        }
        for player in &mut state.players {
            if let Some(prev) = from.player(player.id) {
                player.cursor = blend(prev.cursor, player.cursor);
            }
        }
        Some(state)
    }

    /// Evict stale snapshots and predictions.
    pub fn evict(&mut self, now: Millis) -> usize {
        let snapshots = self.snapshots.evict_stale(now);
        self.dropped += snapshots as u64;
        snapshots + self.predictions.evict_stale(now)
    }

    /// Newest authoritative snapshot.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Current delta baseline.
    pub fn keyframe(&self) -> Option<&Snapshot> {
        self.keyframe.as_ref()
    }

    /// Sequence of the newest snapshot.
    pub fn last_applied(&self) -> Option<Sequence> {
        self.last_applied
    }

    /// Buffered predictions, oldest first.
    pub fn predictions(&self) -> impl Iterator<Item = &PredictionResult> {
        self.predictions.iter().map(|(_, p)| p)
    }

    /// Snapshots buffered.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Snapshots dropped as stale, duplicate or evicted.
    pub fn dropped_snapshots(&self) -> u64 {
        self.dropped
    }

    /// A delta arrived without its baseline.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::client::prediction::PredictedOutcome;
    use crate::game::events::{EventLog, NullSink};
    use crate::game::state::{Direction, EntityKind, MovingEntity, PlayerState};
    use crate::network::delta::compute_delta;

    /// Validator that accepts everything and records what it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<u64>,
        replace_with: Vec<PredictionResult>,
    }

    impl PredictionValidator for Recorder {
        fn is_ready(&self, _prediction: &PredictionResult, _snapshot: &Snapshot) -> bool {
            true
        }

        fn validate(&mut self, prediction: &PredictionResult, _snapshot: &Snapshot) -> Vec<PredictionResult> {
            self.seen.push(prediction.correlation_id);
            std::mem::take(&mut self.replace_with)
        }
    }

    fn manager() -> ClientStateManager {
        ClientStateManager::new(StateConfig::default(), Arc::new(NullSink))
    }

    fn snapshot(sequence: u64, mouse_x: f32) -> Snapshot {
        let mut s = Snapshot::new(20, 15);
        s.sequence = sequence;
        s.strategy.mice.push(MovingEntity::new(
            1,
            EntityKind::default(),
            Vec2::new(mouse_x, 2.0),
            Direction::Right,
            0.25,
        ));
        s
    }

    fn prediction(correlation_id: u64, timestamp: Millis) -> PredictionResult {
        PredictionResult {
            correlation_id,
            player_id: 1,
            input_sequence: correlation_id,
            outcome: PredictedOutcome::Cursor { target: Vec2::ZERO, blocked: false },
            confidence: 0.8,
            timestamp,
        }
    }

    #[test]
    fn test_no_state_before_first_snapshot() {
        assert!(manager().get_interpolated_state(500).is_none());
    }

    #[test]
    fn test_stale_snapshots_dropped() {
        let log = EventLog::new();
        let mut m = ClientStateManager::new(StateConfig::default(), Arc::new(log.clone()));
        let mut v = Recorder::default();
        assert!(m.add_server_state(snapshot(5, 0.0), 100, &mut v).accepted);
        assert!(!m.add_server_state(snapshot(5, 0.0), 110, &mut v).accepted);
        assert!(!m.add_server_state(snapshot(3, 0.0), 120, &mut v).accepted);
        assert_eq!(m.dropped_snapshots(), 2);
        assert_eq!(m.last_applied(), Some(5));
        assert_eq!(log.count("snapshot_discarded"), 2);
    }

    #[test]
    fn test_interpolates_between_snapshots() {
        let mut m = manager();
        let mut v = Recorder::default();
        m.add_server_state(snapshot(1, 2.0), 1_000, &mut v);
        m.add_server_state(snapshot(2, 3.0), 1_050, &mut v);

        // Target 1025 is halfway
        let state = m.get_interpolated_state(1_125).unwrap();
        assert!((state.strategy.mice[0].position.x - 2.5).abs() < 1e-5);

        // Exact endpoints
        let start = m.get_interpolated_state(1_100).unwrap();
        assert_eq!(start.strategy.mice[0].position.x, 2.0);
        let end = m.get_interpolated_state(1_150).unwrap();
        assert_eq!(end.strategy.mice[0].position.x, 3.0);

        // Before the first snapshot there is no bracket
        let early = m.get_interpolated_state(900).unwrap();
        assert_eq!(early.sequence, 2);
    }

    #[test]
    fn test_teleport_not_blended() {
        let mut m = manager();
        let mut v = Recorder::default();
        m.add_server_state(snapshot(1, 2.0), 1_000, &mut v);
        m.add_server_state(snapshot(2, 12.0), 1_050, &mut v);
        let state = m.get_interpolated_state(1_125).unwrap();
        assert_eq!(state.strategy.mice[0].position.x, 12.0);
    }

    #[test]
    fn test_cursors_interpolated() {
        let mut m = manager();
        let mut v = Recorder::default();
        let mut a = Snapshot::new(20, 15);
        a.sequence = 1;
        a.players.push(PlayerState::new(1, "ada"));
        let mut b = a.clone();
        b.sequence = 2;
        b.players[0].cursor = Vec2::new(2.0, 0.0);
        m.add_server_state(a, 0, &mut v);
        m.add_server_state(b, 100, &mut v);
        let state = m.get_interpolated_state(125).unwrap();
        assert!((state.players[0].cursor.x - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_predictions_validated_in_window() {
        let mut m = manager();
        let mut v = Recorder::default();
        m.add_prediction(prediction(1, 900), 900);
        m.add_prediction(prediction(2, 400), 400);
        v.replace_with.push(prediction(9, 1_000));

        let update = m.add_server_state(snapshot(1, 0.0), 1_000, &mut v);
        assert_eq!(update.validated, 1);
        assert_eq!(update.replaced, 1);
        assert_eq!(v.seen, vec![1]);

        let held: Vec<u64> = m.predictions().map(|p| p.correlation_id).collect();
        assert_eq!(held, vec![2, 9]);

        assert!(m.remove_prediction(2));
        assert!(!m.remove_prediction(2));
    }

    #[test]
    fn test_delta_against_keyframe() {
        let mut m = manager();
        let mut v = Recorder::default();
        let base = snapshot(1, 2.0);
        m.set_keyframe(base.clone());
        m.add_server_state(base.clone(), 0, &mut v);

        let mut next = snapshot(2, 2.25);
        next.started = true;
        let rebuilt = m.apply_delta(&compute_delta(&base, &next)).unwrap();
        assert_eq!(rebuilt.strategy.mice, next.strategy.mice);
        assert!(rebuilt.started);
    }

    #[test]
    fn test_missing_baseline_flags_resync() {
        let log = EventLog::new();
        let mut m = ClientStateManager::new(StateConfig::default(), Arc::new(log.clone()));
        let delta = compute_delta(&snapshot(7, 0.0), &snapshot(8, 0.25));
        assert_eq!(m.apply_delta(&delta), Err(StateError::MissingBaseline(7)));
        assert!(m.needs_resync());
        assert_eq!(log.count("resync_required"), 1);

        m.set_keyframe(snapshot(7, 0.0));
        assert!(!m.needs_resync());
        assert!(m.apply_delta(&delta).is_ok());
    }

    #[test]
    fn test_snapshots_evicted_by_age() {
        let mut m = manager();
        let mut v = Recorder::default();
        m.add_server_state(snapshot(1, 0.0), 0, &mut v);
        m.add_server_state(snapshot(2, 0.0), 500, &mut v);
        m.add_server_state(snapshot(3, 0.0), 1_600, &mut v);
        assert_eq!(m.snapshot_count(), 1);
        // Latest survives eviction
        assert_eq!(m.get_interpolated_state(5_000).unwrap().sequence, 3);
    }
}
