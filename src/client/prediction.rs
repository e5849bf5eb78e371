//! Prediction Engine
//!
//! Speculative outcomes for local inputs, each with a confidence in [0,1].
//! Predictions are kept per player in a bounded ring keyed by correlation id
//! until they are confirmed against authoritative state, retracted, or time
//! out.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::time::Millis;
use crate::core::vec2::Vec2;
use crate::error::{ParseError, StateError};
use crate::game::events::{NetcodeEvent, SharedSink};
use crate::game::input::{ActionCode, InputKind, InputPayload, PredictiveInput};
use crate::game::state::{Arrow, Direction, EntityRef, PlayerId, Snapshot};
use crate::network::protocol::CorrectionKind;

/// Errors raised while predicting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictionError {
    /// Input kind with no prediction model
    #[error("Unsupported input type {0}")]
    UnsupportedInput(u32),

    /// Action code with no prediction model
    #[error("Unsupported action {0}")]
    UnsupportedAction(u32),

    /// Payload bytes did not decode
    #[error("Malformed input payload: {0}")]
    MalformedPayload(#[from] ParseError),

    /// Entity not present in the world used for prediction
    #[error("Entity {0} not found")]
    UnknownEntity(EntityRef),
}

/// Predicted fragment of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredictedOutcome {
    /// Arrow placement
    Placement {
        /// Column
        x: i32,
        /// Row
        y: i32,
        /// Direction
        direction: Direction,
        /// Whether the placement is expected to succeed
        valid: bool,
    },
    /// Cursor move
    Cursor {
        /// Cursor destination
        target: Vec2,
        /// An obstacle lies on the path
        blocked: bool,
    },
    /// Entity motion
    Motion {
        /// Entity moved
        entity: EntityRef,
        /// Forecast position
        position: Vec2,
        /// Forecast velocity
        velocity: Vec2,
    },
    /// Phase action
    Action {
        /// Action
        code: ActionCode,
        /// Legal in the current phase
        legal: bool,
    },
}

/// A stored prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Unique id tying the prediction to its validation
    pub correlation_id: u64,
    /// Predicting player
    pub player_id: PlayerId,
    /// Input that produced it (0 for motion forecasts)
    pub input_sequence: u64,
    /// Predicted fragment
    pub outcome: PredictedOutcome,
    /// Confidence in [0,1]
    pub confidence: f32,
    /// Client time of the prediction (ms)
    pub timestamp: Millis,
}

impl PredictionResult {
    /// Where the prediction puts the thing it is about, if positional.
    pub fn predicted_position(&self) -> Option<Vec2> {
        match &self.outcome {
            PredictedOutcome::Placement { x, y, valid: true, .. } => Some(Vec2::new(*x as f32, *y as f32)),
            PredictedOutcome::Cursor { target, .. } => Some(*target),
            PredictedOutcome::Motion { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Difference between a prediction and authoritative state.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    /// Error magnitude (cells, or the discrete penalty)
    pub error: f32,
    /// What kind of correction would fix it
    pub kind: CorrectionKind,
    /// Authoritative thing the prediction maps to
    pub entity: Option<EntityRef>,
    /// Predicted position
    pub predicted: Option<Vec2>,
    /// Authoritative position
    pub authoritative: Option<Vec2>,
}

impl Divergence {
    fn exact(entity: Option<EntityRef>, at: Option<Vec2>) -> Self {
        Self {
            error: 0.0,
            kind: CorrectionKind::State,
            entity,
            predicted: at,
            authoritative: at,
        }
    }
}

/// Motion forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionForecast {
    /// Projected position
    pub position: Vec2,
    /// Velocity carried forward
    pub velocity: Vec2,
    /// Confidence in [0,1]
    pub confidence: f32,
}

/// Moving circle for collision forecasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    /// Centre
    pub position: Vec2,
    /// Velocity per unit time
    pub velocity: Vec2,
    /// Radius
    pub radius: f32,
}

/// Prediction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Predictions kept per player
    pub ring_capacity: usize,
    /// Age after which predictions are purged (ms)
    pub timeout_ms: Millis,
    /// Confidence of a valid placement
    pub placement_valid: f32,
    /// Confidence of an invalid placement
    pub placement_invalid: f32,
    /// Confidence of a cursor move before discounts
    pub cursor_base: f32,
    /// Confidence lost per cell of cursor travel
    pub cursor_distance_discount: f32,
    /// Confidence lost when the path crosses an obstacle
    pub cursor_obstacle_penalty: f32,
    /// Confidence of a legal action
    pub action_legal: f32,
    /// Confidence of an illegal action
    pub action_illegal: f32,
    /// Error charged for a discrete mismatch
    pub mismatch_penalty: f32,
    /// Errors below this count as accurate
    pub accuracy_threshold: f32,
    /// Speed at which a forecast uses the full velocity (cells per tick)
    pub max_speed: f32,
    /// Obstacles closer than this nudge a forecast (cells)
    pub obstacle_radius: f32,
    /// Nudge strength
    pub repulsion: f32,
    /// Confidence decay per unit of horizon
    pub horizon_decay: f32,
    /// Confidence decay per unit of speed
    pub speed_decay: f32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 64,
            timeout_ms: 30_000,
            placement_valid: 0.95,
            placement_invalid: 0.05,
            cursor_base: 0.8,
            cursor_distance_discount: 0.02,
            cursor_obstacle_penalty: 0.3,
            action_legal: 0.9,
            action_illegal: 0.1,
            mismatch_penalty: 10.0,
            accuracy_threshold: 2.0,
            max_speed: 1.0,
            obstacle_radius: 1.5,
            repulsion: 0.1,
            horizon_decay: 0.05,
            speed_decay: 0.5,
        }
    }
}

/// Accuracy statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionStats {
    /// Predictions made
    pub made: u64,
    /// Predictions confirmed against authoritative state
    pub confirmed: u64,
    /// Confirmed with error under the accuracy threshold
    pub accurate: u64,
    /// Sum of confirmed errors
    pub total_error: f64,
    /// Predictions retracted after rejection
    pub retracted: u64,
    /// Predictions purged by timeout
    pub expired: u64,
}

impl PredictionStats {
    /// Fraction of confirmed predictions that were accurate. 1 when nothing
    /// has been confirmed yet.
    pub fn accuracy(&self) -> f32 {
        if self.confirmed == 0 {
            1.0
        } else {
            self.accurate as f32 / self.confirmed as f32
        }
    }

    /// Mean confirmed error.
    pub fn average_error(&self) -> f32 {
        if self.confirmed == 0 {
            0.0
        } else {
            (self.total_error / self.confirmed as f64) as f32
        }
    }
}

/// Makes, stores and scores predictions.
pub struct PredictionEngine {
    config: PredictionConfig,
    rings: BTreeMap<PlayerId, VecDeque<PredictionResult>>,
    next_correlation: u64,
    stats: PredictionStats,
    sink: SharedSink,
}

impl PredictionEngine {
    /// Create an engine.
    pub fn new(config: PredictionConfig, sink: SharedSink) -> Self {
        Self {
            config,
            rings: BTreeMap::new(),
            next_correlation: 1,
            stats: PredictionStats::default(),
            sink,
        }
    }

    /// Predict the outcome of an input against `world` and store it.
    pub fn predict(&mut self, input: &PredictiveInput, world: &Snapshot, now: Millis) -> Result<PredictionResult, PredictionError> {
        let (outcome, confidence) = self.outcome_for(input, world)?;
        Ok(self.store(input.player_id, input.sequence, outcome, confidence, now))
    }

    /// Forecast an entity's motion and store it as a prediction.
    pub fn predict_motion(
        &mut self,
        player_id: PlayerId,
        entity: EntityRef,
        world: &Snapshot,
        dt: f32,
        now: Millis,
    ) -> Result<PredictionResult, PredictionError> {
        let moving = match entity {
            EntityRef::Entity(id) => world.entity(id),
            _ => None,
        }
        .ok_or(PredictionError::UnknownEntity(entity))?;

        let forecast = self.forecast_motion(moving.position, moving.velocity(), dt, world);
        let outcome = PredictedOutcome::Motion {
            entity,
            position: forecast.position,
            velocity: forecast.velocity,
        };
        Ok(self.store(player_id, 0, outcome, forecast.confidence, now))
    }

    fn store(&mut self, player_id: PlayerId, input_sequence: u64, outcome: PredictedOutcome, confidence: f32, now: Millis) -> PredictionResult {
        let result = PredictionResult {
            correlation_id: self.next_correlation,
            player_id,
            input_sequence,
            outcome,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: now,
        };
        self.next_correlation += 1;
        self.stats.made += 1;

        let ring = self.rings.entry(player_id).or_default();
        ring.push_back(result.clone());
        while ring.len() > self.config.ring_capacity.max(1) {
            ring.pop_front();
        }

        self.sink.emit(NetcodeEvent::PredictionMade {
            correlation_id: result.correlation_id,
            player_id,
            input_sequence,
            confidence: result.confidence,
        });
        result
    }

    /// Predicted outcome and confidence, without storing anything.
    pub fn outcome_for(&self, input: &PredictiveInput, world: &Snapshot) -> Result<(PredictedOutcome, f32), PredictionError> {
        if let InputKind::Other(code) = input.input_type {
            return Err(PredictionError::UnsupportedInput(code));
        }
        let payload = input
            .payload()?
            .ok_or(PredictionError::UnsupportedInput(input.input_type.code()))?;

        let c = &self.config;
        let prediction = match payload {
            InputPayload::PlaceArrow(place) => {
                let valid = world.in_bounds(place.x as i64, place.y as i64)
                    && !world.is_occupied(place.x as u32, place.y as u32);
                let confidence = if valid { c.placement_valid } else { c.placement_invalid };
                (
                    PredictedOutcome::Placement {
                        x: place.x,
                        y: place.y,
                        direction: place.direction,
                        valid,
                    },
                    confidence,
                )
            }
            InputPayload::MoveCursor(mv) => {
                let from = world.player(input.player_id).map(|p| p.cursor).unwrap_or(mv.target);
                let distance = from.distance(mv.target);
                let blocked = path_blocked(world, from, mv.target);
                let mut confidence = c.cursor_base - distance * c.cursor_distance_discount;
                if blocked {
                    confidence -= c.cursor_obstacle_penalty;
                }
                (PredictedOutcome::Cursor { target: mv.target, blocked }, confidence)
            }
            InputPayload::Action(action) => {
                let code = action.action().ok_or(PredictionError::UnsupportedAction(action.code))?;
                let legal = code.is_legal(world.started);
                let confidence = if legal { c.action_legal } else { c.action_illegal };
                (PredictedOutcome::Action { code, legal }, confidence)
            }
        };
        Ok((prediction.0, prediction.1.clamp(0.0, 1.0)))
    }

    /// Project a position `dt` ahead.
    ///
    /// Velocity is scaled by `min(1, speed / max_speed)`, so slow entities
    /// are projected less than their raw velocity. The projection is clamped
    /// to the board, pushed away from nearby walls and goals, then clamped
    /// again. Confidence decays with horizon and speed.
    pub fn forecast_motion(&self, position: Vec2, velocity: Vec2, dt: f32, world: &Snapshot) -> MotionForecast {
        let c = &self.config;
        let dt = dt.max(0.0);
        let speed = velocity.length();
        let factor = if c.max_speed > 0.0 { (speed / c.max_speed).min(1.0) } else { 1.0 };
        let (min, max) = world.bounds();
        let mut projected = (position + velocity.scale(dt * factor)).clamp(min, max);

        let mut nudge = Vec2::ZERO;
        for obstacle in obstacle_cells(world) {
            let away = projected - obstacle;
            let d = away.length();
            if d > f32::EPSILON && d < c.obstacle_radius {
                nudge = nudge + away.normalize().scale(c.repulsion / d);
            }
        }
        projected = (projected + nudge).clamp(min, max);

        let confidence = (-(c.horizon_decay * dt + c.speed_decay * speed)).exp();
        MotionForecast {
            position: projected,
            velocity,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Earliest time in `[0, horizon]` at which two bodies touch.
    pub fn forecast_collision(a: &Body, b: &Body, horizon: f32) -> Option<f32> {
        let p = a.position - b.position;
        let v = a.velocity - b.velocity;
        let r = a.radius + b.radius;

        let qa = v.dot(v);
        let qb = 2.0 * p.dot(v);
        let qc = p.dot(p) - r * r;

        if qc <= 0.0 {
            return Some(0.0);
        }
        if qa <= f32::EPSILON {
            return None;
        }
        let disc = qb * qb - 4.0 * qa * qc;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        [(-qb - sq) / (2.0 * qa), (-qb + sq) / (2.0 * qa)]
            .into_iter()
            .filter(|t| *t >= 0.0 && *t <= horizon)
            .reduce(f32::min)
    }

    /// Compare a prediction with authoritative state.
    pub fn evaluate(&self, prediction: &PredictionResult, authoritative: &Snapshot) -> Divergence {
        let penalty = self.config.mismatch_penalty;
        match &prediction.outcome {
            PredictedOutcome::Placement { x, y, direction, valid } => {
                let placed = authoritative
                    .arrows
                    .iter()
                    .find(|a| a.owner == prediction.player_id && a.input_sequence == prediction.input_sequence);
                let predicted = Vec2::new(*x as f32, *y as f32);
                match (placed, *valid) {
                    (Some(arrow), true) => {
                        let actual = arrow.position();
                        let mut error = predicted.distance(actual);
                        let kind = if error > 0.0 {
                            CorrectionKind::Position
                        } else {
                            CorrectionKind::State
                        };
                        if arrow.direction != *direction {
                            error += penalty;
                        }
                        Divergence {
                            error,
                            kind,
                            entity: Some(EntityRef::Arrow(arrow.id)),
                            predicted: Some(predicted),
                            authoritative: Some(actual),
                        }
                    }
                    (Some(arrow), false) => Divergence {
                        error: penalty,
                        kind: CorrectionKind::Creation,
                        entity: Some(EntityRef::Arrow(arrow.id)),
                        predicted: None,
                        authoritative: Some(arrow.position()),
                    },
                    (None, true) => Divergence {
                        error: penalty,
                        kind: CorrectionKind::Deletion,
                        entity: None,
                        predicted: Some(predicted),
                        authoritative: None,
                    },
                    (None, false) => Divergence::exact(None, None),
                }
            }
            PredictedOutcome::Cursor { target, .. } => {
                let entity = EntityRef::Player(prediction.player_id);
                match authoritative.position_of(entity) {
                    Some(actual) => Divergence {
                        error: target.distance(actual),
                        kind: CorrectionKind::Position,
                        entity: Some(entity),
                        predicted: Some(*target),
                        authoritative: Some(actual),
                    },
                    None => Divergence {
                        error: penalty,
                        kind: CorrectionKind::Deletion,
                        entity: Some(entity),
                        predicted: Some(*target),
                        authoritative: None,
                    },
                }
            }
            PredictedOutcome::Motion { entity, position, .. } => match authoritative.position_of(*entity) {
                Some(actual) => Divergence {
                    error: position.distance(actual),
                    kind: CorrectionKind::Position,
                    entity: Some(*entity),
                    predicted: Some(*position),
                    authoritative: Some(actual),
                },
                None => Divergence {
                    error: penalty,
                    kind: CorrectionKind::Deletion,
                    entity: Some(*entity),
                    predicted: Some(*position),
                    authoritative: None,
                },
            },
            PredictedOutcome::Action { code, legal } => {
                let entity = EntityRef::Player(prediction.player_id);
                let player = authoritative.player(prediction.player_id);
                let matches = match (code, player) {
                    (ActionCode::Ready, Some(p)) => p.ready == *legal || authoritative.started,
                    (_, Some(_)) => true,
                    (_, None) => false,
                };
                let mut divergence = Divergence::exact(Some(entity), None);
                if !matches {
                    divergence.error = penalty;
                }
                divergence
            }
        }
    }

    /// Remove a prediction and fold its divergence into the statistics.
    pub fn confirm(&mut self, correlation_id: u64, divergence: &Divergence) -> Result<PredictionResult, StateError> {
        let prediction = self
            .take(|p| p.correlation_id == correlation_id)
            .into_iter()
            .next()
            .ok_or(StateError::PredictionNotFound(correlation_id))?;

        self.stats.confirmed += 1;
        self.stats.total_error += divergence.error as f64;
        let accurate = divergence.error < self.config.accuracy_threshold;
        if accurate {
            self.stats.accurate += 1;
        }
        self.sink.emit(NetcodeEvent::PredictionValidated {
            correlation_id,
            error: divergence.error,
            corrected: !accurate,
        });
        Ok(prediction)
    }

    /// Drop predictions made for a rejected input.
    pub fn retract(&mut self, player_id: PlayerId, input_sequence: u64) -> Vec<PredictionResult> {
        let removed = self.take(|p| p.player_id == player_id && p.input_sequence == input_sequence);
        for p in &removed {
            self.stats.retracted += 1;
            self.sink.emit(NetcodeEvent::PredictionRetracted {
                correlation_id: p.correlation_id,
                input_sequence,
            });
        }
        removed
    }

    /// Drop predictions older than the timeout. Returns the number dropped.
    pub fn purge_expired(&mut self, now: Millis) -> usize {
        let timeout = self.config.timeout_ms;
        let count = self.take(|p| now.saturating_sub(p.timestamp) > timeout).len();
        if count > 0 {
            self.stats.expired += count as u64;
            self.sink.emit(NetcodeEvent::PredictionsPurged { count });
        }
        count
    }

    /// Re-run predictions for `inputs` over a working copy of `baseline`.
    ///
    /// Each input's outcome is applied to the copy before the next one is
    /// predicted. The new predictions replace any held for the same input.
    pub fn replay(&mut self, baseline: &Snapshot, inputs: &[PredictiveInput], now: Millis) -> Vec<PredictionResult> {
        let mut working = baseline.clone();
        let mut replacements = Vec::with_capacity(inputs.len());

        for input in inputs {
            let Ok((outcome, confidence)) = self.outcome_for(input, &working) else {
                continue;
            };
            apply_outcome(&mut working, input, &outcome);
            self.take(|p| p.player_id == input.player_id && p.input_sequence == input.sequence);
            replacements.push(self.store(input.player_id, input.sequence, outcome, confidence, now));
        }
        replacements
    }

    fn take<F>(&mut self, mut pred: F) -> Vec<PredictionResult>
    where
        F: FnMut(&PredictionResult) -> bool,
    {
        let mut taken = Vec::new();
        for ring in self.rings.values_mut() {
            let mut kept = VecDeque::with_capacity(ring.len());
            for p in ring.drain(..) {
                if pred(&p) {
                    taken.push(p);
                } else {
                    kept.push_back(p);
                }
            }
            *ring = kept;
        }
        self.rings.retain(|_, ring| !ring.is_empty());
        taken
    }

    /// Stored prediction by correlation id.
    pub fn get(&self, correlation_id: u64) -> Option<&PredictionResult> {
        self.rings
            .values()
            .flat_map(|ring| ring.iter())
            .find(|p| p.correlation_id == correlation_id)
    }

    /// Stored predictions for a player, oldest first.
    pub fn pending(&self, player_id: PlayerId) -> impl Iterator<Item = &PredictionResult> {
        self.rings.get(&player_id).into_iter().flat_map(|ring| ring.iter())
    }

    /// Number of stored predictions.
    pub fn pending_count(&self) -> usize {
        self.rings.values().map(VecDeque::len).sum()
    }

    /// Accuracy statistics.
    pub fn stats(&self) -> &PredictionStats {
        &self.stats
    }

    /// Tuning in effect.
    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }
}

/// Cells holding a wall or a goal.
fn obstacle_cells(world: &Snapshot) -> impl Iterator<Item = Vec2> + '_ {
    world
        .strategy
        .walls
        .iter()
        .map(|w| Vec2::from_cell(w.x, w.y))
        .chain(world.strategy.goals.iter().map(|g| Vec2::from_cell(g.x, g.y)))
}

/// Sample the straight path and check for obstacle cells. Two samples per
/// cell of distance.
fn path_blocked(world: &Snapshot, from: Vec2, to: Vec2) -> bool {
    let steps = ((from.distance(to) * 2.0).ceil() as usize).max(1);
    (0..=steps).any(|i| {
        let (x, y) = from.lerp(to, i as f32 / steps as f32).to_cell();
        world.in_bounds(x, y) && {
            let (x, y) = (x as u32, y as u32);
            world.has_wall(x, y) || world.goal_at(x, y).is_some()
        }
    })
}

/// Apply a predicted outcome to a working snapshot.
fn apply_outcome(world: &mut Snapshot, input: &PredictiveInput, outcome: &PredictedOutcome) {
    match outcome {
        PredictedOutcome::Placement { x, y, direction, valid: true } => {
            let id = world.arrows.iter().map(|a| a.id).max().unwrap_or(0) + 1;
            world.arrows.push(Arrow {
                id,
                owner: input.player_id,
                x: *x as u32,
                y: *y as u32,
                direction: *direction,
                placed_at: world.sequence,
                input_sequence: input.sequence,
            });
        }
        PredictedOutcome::Cursor { target, .. } => {
            let (lo, hi) = world.bounds();
            if let Some(player) = world.player_mut(input.player_id) {
                player.cursor = target.clamp(lo, hi);
            }
        }
        PredictedOutcome::Action { code: ActionCode::Ready, legal: true } => {
            if let Some(player) = world.player_mut(input.player_id) {
                player.ready = true;
            }
        }
        PredictedOutcome::Action { code: ActionCode::ClearArrows, legal: true } => {
            world.arrows.retain(|a| a.owner != input.player_id);
        }
        _ => {}
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use proptest::prelude::*;
    use crate::game::events::{EventLog, NullSink};
    use crate::game::state::{Goal, PlayerState, Wall};

    fn engine() -> PredictionEngine {
        PredictionEngine::new(PredictionConfig::default(), Arc::new(NullSink))
    }

    fn world() -> Snapshot {
        let mut world = Snapshot::new(20, 15);
        world.players.push(PlayerState::new(1, "ada"));
        world.strategy.goals.push(Goal { x: 5, y: 7, owner: 1 });
        world
    }

    fn arrow(id: u32, x: u32, y: u32, input_sequence: u64) -> Arrow {
        Arrow {
            id,
            owner: 1,
            x,
            y,
            direction: Direction::Up,
            placed_at: 1,
            input_sequence,
        }
    }

    #[test]
    fn test_placement_confidence() {
        let mut engine = engine();
        let world = world();

        let ok = engine.predict(&PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up), &world, 0).unwrap();
        assert_eq!(ok.confidence, 0.95);
        assert!(matches!(ok.outcome, PredictedOutcome::Placement { valid: true, .. }));

        let on_goal = engine.predict(&PredictiveInput::place_arrow(1, 2, 0, 5, 7, Direction::Up), &world, 0).unwrap();
        assert_eq!(on_goal.confidence, 0.05);

        let off = engine.predict(&PredictiveInput::place_arrow(1, 3, 0, -1, 7, Direction::Up), &world, 0).unwrap();
        assert_eq!(off.confidence, 0.05);
        assert_ne!(ok.correlation_id, off.correlation_id);
        assert_eq!(engine.pending_count(), 3);
    }

    #[test]
    fn test_cursor_confidence() {
        let engine = engine();
        let mut world = world();

        let (_, near) = engine.outcome_for(&PredictiveInput::move_cursor(1, 1, 0, Vec2::new(1.0, 0.0)), &world).unwrap();
        let (_, far) = engine.outcome_for(&PredictiveInput::move_cursor(1, 1, 0, Vec2::new(10.0, 0.0)), &world).unwrap();
        assert!(near > far);
        assert!((near - 0.78).abs() < 1e-5);

        world.strategy.walls.push(Wall { x: 5, y: 0, side: Direction::Up });
        let (outcome, blocked) = engine.outcome_for(&PredictiveInput::move_cursor(1, 1, 0, Vec2::new(10.0, 0.0)), &world).unwrap();
        assert!(matches!(outcome, PredictedOutcome::Cursor { blocked: true, .. }));
        assert!((far - blocked - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_action_confidence_and_errors() {
        let engine = engine();
        let mut world = world();

        let (_, ready) = engine.outcome_for(&PredictiveInput::action(1, 1, 0, 1), &world).unwrap();
        assert_eq!(ready, 0.9);
        world.started = true;
        let (_, late_ready) = engine.outcome_for(&PredictiveInput::action(1, 1, 0, 1), &world).unwrap();
        assert_eq!(late_ready, 0.1);

        assert_eq!(
            engine.outcome_for(&PredictiveInput::action(1, 1, 0, 42), &world),
            Err(PredictionError::UnsupportedAction(42))
        );
        let odd = PredictiveInput {
            input_type: InputKind::Other(9),
            ..Default::default()
        };
        assert_eq!(engine.outcome_for(&odd, &world), Err(PredictionError::UnsupportedInput(9)));
    }

    #[test]
    fn test_evaluate_confirmed_placement() {
        let mut engine = engine();
        let mut world = world();
        let prediction = engine.predict(&PredictiveInput::place_arrow(1, 4, 0, 12, 8, Direction::Up), &world, 0).unwrap();

        world.arrows.push(arrow(7, 12, 8, 4));
        let divergence = engine.evaluate(&prediction, &world);
        assert_eq!(divergence.error, 0.0);
        assert_eq!(divergence.entity, Some(EntityRef::Arrow(7)));

        engine.confirm(prediction.correlation_id, &divergence).unwrap();
        assert_eq!(engine.stats().accuracy(), 1.0);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(
            engine.confirm(prediction.correlation_id, &divergence),
            Err(StateError::PredictionNotFound(prediction.correlation_id))
        );
    }

    #[test]
    fn test_evaluate_misplaced_and_missing() {
        let mut engine = engine();
        let mut world = world();
        let prediction = engine.predict(&PredictiveInput::place_arrow(1, 4, 0, 12, 8, Direction::Up), &world, 0).unwrap();

        let missing = engine.evaluate(&prediction, &world);
        assert_eq!(missing.error, 10.0);
        assert_eq!(missing.kind, CorrectionKind::Deletion);

        world.arrows.push(arrow(7, 17, 8, 4));
        let moved = engine.evaluate(&prediction, &world);
        assert_eq!(moved.error, 5.0);
        assert_eq!(moved.kind, CorrectionKind::Position);
        assert_eq!(moved.authoritative, Some(Vec2::new(17.0, 8.0)));

        engine.confirm(prediction.correlation_id, &moved).unwrap();
        assert_eq!(engine.stats().accuracy(), 0.0);
        assert_eq!(engine.stats().average_error(), 5.0);
    }

    #[test]
    fn test_retract_and_purge() {
        let log = EventLog::new();
        let mut engine = PredictionEngine::new(PredictionConfig::default(), Arc::new(log.clone()));
        let world = world();
        engine.predict(&PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up), &world, 0).unwrap();
        engine.predict(&PredictiveInput::place_arrow(1, 2, 1_000, 13, 8, Direction::Up), &world, 1_000).unwrap();

        assert_eq!(engine.retract(1, 2).len(), 1);
        assert_eq!(log.count("prediction_retracted"), 1);

        assert_eq!(engine.purge_expired(30_000), 0);
        assert_eq!(engine.purge_expired(30_001), 1);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(log.count("predictions_purged"), 1);
    }

    #[test]
    fn test_ring_is_bounded() {
        let config = PredictionConfig {
            ring_capacity: 4,
            ..Default::default()
        };
        let mut engine = PredictionEngine::new(config, Arc::new(NullSink));
        let world = world();
        for seq in 1..=10 {
            engine.predict(&PredictiveInput::action(1, seq, 0, 3), &world, 0).unwrap();
        }
        assert_eq!(engine.pending_count(), 4);
        let kept: Vec<u64> = engine.pending(1).map(|p| p.input_sequence).collect();
        assert_eq!(kept, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_replay_applies_in_order() {
        let mut engine = engine();
        let world = world();
        let inputs = vec![
            PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up),
            PredictiveInput::place_arrow(1, 2, 0, 12, 8, Direction::Left),
        ];
        for input in &inputs {
            engine.predict(input, &world, 0).unwrap();
        }

        let replayed = engine.replay(&world, &inputs, 10);
        assert_eq!(replayed.len(), 2);
        assert!(matches!(replayed[0].outcome, PredictedOutcome::Placement { valid: true, .. }));
        // The first replayed placement occupies the cell
        assert!(matches!(replayed[1].outcome, PredictedOutcome::Placement { valid: false, .. }));
        assert_eq!(engine.pending_count(), 2);
        assert!(engine.pending(1).all(|p| p.timestamp == 10));
    }

    #[test]
    fn test_forecast_collision() {
        let a = Body { position: Vec2::new(0.0, 0.0), velocity: Vec2::new(1.0, 0.0), radius: 0.5 };
        let b = Body { position: Vec2::new(10.0, 0.0), velocity: Vec2::new(-1.0, 0.0), radius: 0.5 };
        let t = PredictionEngine::forecast_collision(&a, &b, 10.0).unwrap();
        assert!((t - 4.5).abs() < 1e-5);
        assert!(PredictionEngine::forecast_collision(&a, &b, 4.0).is_none());

        let parallel = Body { position: Vec2::new(0.0, 5.0), ..a };
        assert!(PredictionEngine::forecast_collision(&a, &parallel, 100.0).is_none());

        let touching = Body { position: Vec2::new(0.5, 0.0), ..a };
        assert_eq!(PredictionEngine::forecast_collision(&a, &touching, 1.0), Some(0.0));
    }

    #[test]
    fn test_forecast_motion() {
        let engine = engine();
        let world = Snapshot::new(20, 15);
        let forecast = engine.forecast_motion(Vec2::new(2.0, 2.0), Vec2::new(1.0, 0.0), 3.0, &world);
        assert_eq!(forecast.position, Vec2::new(5.0, 2.0));

        let clamped = engine.forecast_motion(Vec2::new(18.0, 2.0), Vec2::new(1.0, 0.0), 5.0, &world);
        assert_eq!(clamped.position.x, 19.0);
        assert!(clamped.confidence < forecast.confidence);

        let mut walled = world.clone();
        walled.strategy.walls.push(Wall { x: 6, y: 2, side: Direction::Left });
        let nudged = engine.forecast_motion(Vec2::new(2.0, 2.0), Vec2::new(1.0, 0.0), 3.0, &walled);
        assert!(nudged.position.x < 5.0);
    }

    #[test]
    fn test_forecast_scales_slow_entities() {
        let engine = engine();
        let world = Snapshot::new(20, 15);
        let slow = engine.forecast_motion(Vec2::new(10.0, 7.0), Vec2::new(0.25, 0.0), 1.0, &world);
        assert_eq!(slow.position, Vec2::new(10.0625, 7.0));

        // Faster than max speed uses the raw velocity
        let fast = engine.forecast_motion(Vec2::new(10.0, 7.0), Vec2::new(2.0, 0.0), 1.0, &world);
        assert_eq!(fast.position, Vec2::new(12.0, 7.0));
    }

    #[test]
    fn test_forecast_nudge_stays_on_board() {
        let engine = engine();
        let mut world = Snapshot::new(20, 15);
        world.strategy.walls.push(Wall { x: 18, y: 7, side: Direction::Left });
        let f = engine.forecast_motion(Vec2::new(17.0, 7.0), Vec2::new(1.0, 0.0), 10.0, &world);
        let (min, max) = world.bounds();
        assert_eq!(f.position.clamp(min, max), f.position);
        assert!(f.position.x <= 19.0);
    }

    proptest! {
        #[test]
        fn prop_confidence_in_unit_range(
            x in -5i32..25,
            y in -5i32..20,
            tx in -50.0f32..50.0,
            ty in -50.0f32..50.0,
            code in 0u32..5,
            started in any::<bool>(),
        ) {
            let engine = engine();
            let mut world = world();
            world.started = started;
            let inputs = [
                PredictiveInput::place_arrow(1, 1, 0, x, y, Direction::Up),
                PredictiveInput::move_cursor(1, 1, 0, Vec2::new(tx, ty)),
                PredictiveInput::action(1, 1, 0, code),
            ];
            for input in &inputs {
                if let Ok((_, confidence)) = engine.outcome_for(input, &world) {
                    prop_assert!((0.0..=1.0).contains(&confidence));
                }
            }
            let f = engine.forecast_motion(Vec2::new(tx, ty), Vec2::new(ty, tx), x.unsigned_abs() as f32, &world);
            prop_assert!((0.0..=1.0).contains(&f.confidence));
        }
    }
}
