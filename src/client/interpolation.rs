//! Interpolation Service
//!
//! Per-entity visual transitions. Each entity has at most one task; starting a
//! new one replaces whatever was in flight. Also keeps a short position history
//! per entity for velocity-averaged extrapolation.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::time::Millis;
use crate::core::vec2::Vec2;
use crate::game::state::EntityRef;

/// Easing curve applied to raw progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Easing {
    /// Constant speed
    Linear,
    /// Cubic ease-out: fast start, gentle landing
    #[default]
    EaseOut,
    /// Cubic ease-in-out
    EaseInOut,
    /// Starts at full speed, ends at rest: `t + t² - t³`
    VelocityContinuous,
}

impl Easing {
    /// Map progress in [0,1] onto the curve. Endpoints are exact.
    pub fn apply(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseOut => 1.0 - (1.0 - t).powi(3),
            Easing::EaseInOut => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
            Easing::VelocityContinuous => t + t * t - t * t * t,
        }
    }

    /// Curve for a correction of the given size.
    pub fn for_correction_distance(distance: f32) -> Self {
        if distance < 1.0 {
            Easing::Linear
        } else if distance < 4.0 {
            Easing::EaseOut
        } else {
            Easing::EaseInOut
        }
    }
}

/// Task priority. Higher priorities are reported first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Cosmetic motion
    Low,
    /// Regular snapshot smoothing
    #[default]
    Normal,
    /// Rollback corrections
    High,
}

impl Priority {
    /// Wire code used by correction messages.
    pub fn code(self) -> u32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    /// Parse a wire code. Unknown codes are treated as high priority.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// What the renderer draws for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisualState {
    /// Board position in cells
    pub position: Vec2,
    /// Opacity in [0,1]
    pub opacity: f32,
    /// Scale factor
    pub scale: f32,
}

impl Default for VisualState {
    fn default() -> Self {
        Self::at(Vec2::ZERO)
    }
}

impl VisualState {
    /// Fully visible at a position.
    pub fn at(position: Vec2) -> Self {
        Self {
            position,
            opacity: 1.0,
            scale: 1.0,
        }
    }

    /// Blend towards `target` by `t`.
    pub fn blend(&self, target: &VisualState, t: f32) -> VisualState {
        let mix = |a: f32, b: f32| a + (b - a) * t;
        VisualState {
            position: self.position.lerp(target.position, t),
            opacity: mix(self.opacity, target.opacity).clamp(0.0, 1.0),
            scale: mix(self.scale, target.scale),
        }
    }
}

/// An in-flight transition.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationTask {
    /// Entity being moved
    pub entity: EntityRef,
    /// Where the transition started
    pub start: VisualState,
    /// Where it ends
    pub target: VisualState,
    /// Service time the task started (ms)
    pub started_at: f32,
    /// Length of the transition (ms)
    pub duration_ms: f32,
    /// Curve
    pub easing: Easing,
    /// Priority
    pub priority: Priority,
    /// Implied velocity in cells per ms
    pub velocity: Vec2,
}

/// Per-entity output of one update.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationFrame {
    /// Entity
    pub entity: EntityRef,
    /// Blended state
    pub state: VisualState,
    /// Raw progress before easing
    pub progress: f32,
    /// Task reached its target this update
    pub completed: bool,
    /// Time left (ms)
    pub remaining_ms: f32,
    /// Task velocity (cells per ms)
    pub velocity: Vec2,
    /// Task priority
    pub priority: Priority,
}

/// Projected position with its confidence in [0,1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrapolation {
    /// Projected position
    pub position: Vec2,
    /// Velocity used for the projection (cells per ms)
    pub velocity: Vec2,
    /// Falls with horizon and speed
    pub confidence: f32,
}

/// Interpolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// Clamp blended positions to `bounds`
    pub clamp_to_bounds: bool,
    /// Board bounds in cells
    pub bounds: Option<(Vec2, Vec2)>,
    /// Samples kept per entity for extrapolation
    pub history_len: usize,
    /// Extrapolation confidence decay per ms of horizon
    pub horizon_decay: f32,
    /// Extrapolation confidence decay per unit of speed (cells per ms)
    pub speed_decay: f32,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            clamp_to_bounds: true,
            bounds: None,
            history_len: 8,
            horizon_decay: 0.005,
            speed_decay: 10.0,
        }
    }
}

/// Owns every interpolation task.
#[derive(Debug, Clone)]
pub struct InterpolationService {
    config: InterpolationConfig,
    tasks: BTreeMap<EntityRef, InterpolationTask>,
    current: BTreeMap<EntityRef, VisualState>,
    samples: BTreeMap<EntityRef, VecDeque<(Millis, Vec2)>>,
    clock_ms: f32,
}

impl InterpolationService {
    /// Create a service.
    pub fn new(config: InterpolationConfig) -> Self {
        Self {
            config,
            tasks: BTreeMap::new(),
            current: BTreeMap::new(),
            samples: BTreeMap::new(),
            clock_ms: 0.0,
        }
    }

    /// Set the board bounds used for clamping.
    pub fn set_bounds(&mut self, min: Vec2, max: Vec2) {
        self.config.bounds = Some((min, max));
    }

    /// Start a transition, replacing any task for the entity.
    pub fn start_interpolation(
        &mut self,
        entity: EntityRef,
        start: VisualState,
        target: VisualState,
        duration_ms: f32,
        easing: Easing,
        priority: Priority,
    ) -> &InterpolationTask {
        let duration_ms = duration_ms.max(0.0);
        let velocity = if duration_ms > 0.0 {
            (target.position - start.position).scale(1.0 / duration_ms)
        } else {
            Vec2::ZERO
        };
        self.current.insert(entity, start);
        self.tasks.insert(
            entity,
            InterpolationTask {
                entity,
                start,
                target,
                started_at: self.clock_ms,
                duration_ms,
                easing,
                priority,
                velocity,
            },
        );
        &self.tasks[&entity]
    }

    /// Advance every task by `dt_ms`.
    ///
    /// Completed tasks appear once with `completed` set and are then removed,
    /// even when a single step overshoots them by far. A task that cannot
    /// produce a finite state is dropped without a frame.
    pub fn update_interpolations(&mut self, dt_ms: f32) -> Vec<InterpolationFrame> {
        self.clock_ms += dt_ms.max(0.0);
        let now = self.clock_ms;

        let mut frames = Vec::with_capacity(self.tasks.len());
        let mut broken = Vec::new();
        for task in self.tasks.values() {
            let elapsed = now - task.started_at;
            let progress = if task.duration_ms <= 0.0 {
                1.0
            } else {
                (elapsed / task.duration_ms).clamp(0.0, 1.0)
            };

            let mut state = task.start.blend(&task.target, task.easing.apply(progress));
            if self.config.clamp_to_bounds {
                if let Some((min, max)) = self.config.bounds {
                    state.position = state.position.clamp(min, max);
                }
            }

            if !(state.position.x.is_finite() && state.position.y.is_finite()) {
                broken.push(task.entity);
                continue;
            }

            frames.push(InterpolationFrame {
                entity: task.entity,
                state,
                progress,
                completed: progress >= 1.0,
                remaining_ms: (task.duration_ms - elapsed).max(0.0),
                velocity: task.velocity,
                priority: task.priority,
            });
        }

        for entity in broken {
            self.tasks.remove(&entity);
            self.current.remove(&entity);
        }
        for frame in &frames {
            if frame.completed {
                self.tasks.remove(&frame.entity);
                self.current.remove(&frame.entity);
            } else {
                self.current.insert(frame.entity, frame.state);
            }
        }

        frames.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.entity.cmp(&b.entity)));
        frames
    }

    /// Stop a task. Cancelling a missing task is a no-op.
    pub fn cancel(&mut self, entity: EntityRef) -> bool {
        self.current.remove(&entity);
        self.tasks.remove(&entity).is_some()
    }

    /// Last blended state of an in-flight task.
    pub fn current_state(&self, entity: EntityRef) -> Option<VisualState> {
        self.current.get(&entity).copied()
    }

    /// Task for an entity.
    pub fn task(&self, entity: EntityRef) -> Option<&InterpolationTask> {
        self.tasks.get(&entity)
    }

    /// Number of in-flight tasks.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Record an observed position for later extrapolation.
    pub fn record_sample(&mut self, entity: EntityRef, t: Millis, position: Vec2) {
        let cap = self.config.history_len.max(2);
        let samples = self.samples.entry(entity).or_default();
        if samples.back().is_some_and(|(last, _)| *last >= t) {
            return;
        }
        samples.push_back((t, position));
        while samples.len() > cap {
            samples.pop_front();
        }
    }

    /// Drop samples for entities that no longer exist.
    pub fn retain_samples<F>(&mut self, mut keep: F)
    where
        F: FnMut(EntityRef) -> bool,
    {
        self.samples.retain(|entity, _| keep(*entity));
    }

    /// Project a position `horizon_ms` ahead.
    ///
    /// With `use_history`, the given velocity is averaged with velocities
    /// derived from recorded samples, later samples weighted more.
    /// Confidence is `exp(-(horizon_decay * h + speed_decay * |v|))`.
    pub fn extrapolate_position(
        &self,
        entity: EntityRef,
        current: Vec2,
        velocity: Vec2,
        horizon_ms: f32,
        use_history: bool,
    ) -> Extrapolation {
        let mut velocity = velocity;
        if use_history {
            if let Some(samples) = self.samples.get(&entity) {
                let mut weighted = Vec2::ZERO;
                let mut total = 0.0;
                let mut weight = 1.0;
                for (a, b) in samples.iter().zip(samples.iter().skip(1)) {
                    let dt = (b.0 - a.0) as f32;
                    if dt > 0.0 {
                        weighted = weighted + (b.1 - a.1).scale(weight / dt);
                        total += weight;
                        weight += 1.0;
                    }
                }
                if total > 0.0 {
                    weighted = weighted + velocity.scale(weight);
                    total += weight;
                    velocity = weighted.scale(1.0 / total);
                }
            }
        }

        let horizon_ms = horizon_ms.max(0.0);
        let mut projected = current + velocity.scale(horizon_ms);
        if self.config.clamp_to_bounds {
            if let Some((min, max)) = self.config.bounds {
                projected = projected.clamp(min, max);
            }
        }
        let c = &self.config;
        let confidence = (-(c.horizon_decay * horizon_ms + c.speed_decay * velocity.length())).exp();
        Extrapolation {
            position: projected,
            velocity,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

impl Default for InterpolationService {
    fn default() -> Self {
        Self::new(InterpolationConfig::default())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Easing; 4] = [Easing::Linear, Easing::EaseOut, Easing::EaseInOut, Easing::VelocityContinuous];

    #[test]
    fn test_easing_endpoints_and_bounds() {
        for easing in ALL {
            assert_eq!(easing.apply(0.0), 0.0);
            assert_eq!(easing.apply(1.0), 1.0);
            for i in 0..=100 {
                let v = easing.apply(i as f32 / 100.0);
                assert!((0.0..=1.0).contains(&v), "{easing:?} at {i}: {v}");
            }
        }
        assert!(Easing::EaseOut.apply(0.5) > 0.5);
        assert_eq!(Easing::default(), Easing::EaseOut);
    }

    #[test]
    fn test_for_correction_distance() {
        assert_eq!(Easing::for_correction_distance(0.5), Easing::Linear);
        assert_eq!(Easing::for_correction_distance(2.0), Easing::EaseOut);
        assert_eq!(Easing::for_correction_distance(5.0), Easing::EaseInOut);
    }

    #[test]
    fn test_task_runs_to_target() {
        let mut service = InterpolationService::default();
        let entity = EntityRef::Arrow(1);
        let task = service.start_interpolation(
            entity,
            VisualState::at(Vec2::new(12.0, 8.0)),
            VisualState::at(Vec2::new(17.0, 8.0)),
            40.0,
            Easing::Linear,
            Priority::High,
        );
        assert!((task.velocity.x - 0.125).abs() < 1e-6);

        let frames = service.update_interpolations(10.0);
        assert_eq!(frames.len(), 1);
        assert!((frames[0].state.position.x - 13.25).abs() < 1e-4);
        assert!((frames[0].progress - 0.25).abs() < 1e-6);
        assert!(!frames[0].completed);
        assert!((frames[0].remaining_ms - 30.0).abs() < 1e-4);

        let frames = service.update_interpolations(30.0);
        assert!(frames[0].completed);
        assert_eq!(frames[0].state.position, Vec2::new(17.0, 8.0));

        // Reported once, then gone
        assert!(service.update_interpolations(10.0).is_empty());
        assert_eq!(service.active_count(), 0);
    }

    #[test]
    fn test_positions_stay_between_endpoints() {
        for easing in ALL {
            let mut service = InterpolationService::default();
            let entity = EntityRef::Entity(3);
            service.start_interpolation(
                entity,
                VisualState::at(Vec2::new(2.0, 2.0)),
                VisualState::at(Vec2::new(6.0, -2.0)),
                100.0,
                easing,
                Priority::Normal,
            );
            for _ in 0..12 {
                for frame in service.update_interpolations(9.0) {
                    let p = frame.state.position;
                    assert!((2.0..=6.0).contains(&p.x));
                    assert!((-2.0..=2.0).contains(&p.y));
                }
            }
        }
    }

    #[test]
    fn test_replace_and_cancel() {
        let mut service = InterpolationService::default();
        let entity = EntityRef::Player(1);
        service.start_interpolation(entity, VisualState::at(Vec2::ZERO), VisualState::at(Vec2::new(4.0, 0.0)), 100.0, Easing::Linear, Priority::Normal);
        service.update_interpolations(50.0);
        let midway = service.current_state(entity).unwrap();
        assert!((midway.position.x - 2.0).abs() < 1e-4);

        service.start_interpolation(entity, midway, VisualState::at(Vec2::new(0.0, 4.0)), 100.0, Easing::Linear, Priority::High);
        assert_eq!(service.active_count(), 1);
        assert_eq!(service.task(entity).unwrap().priority, Priority::High);

        assert!(service.cancel(entity));
        assert!(!service.cancel(entity));
        assert!(service.current_state(entity).is_none());
    }

    #[test]
    fn test_overshot_task_reports_completion() {
        let mut service = InterpolationService::default();
        let entity = EntityRef::Entity(1);
        service.start_interpolation(entity, VisualState::default(), VisualState::at(Vec2::new(1.0, 1.0)), 20.0, Easing::Linear, Priority::Low);

        let frames = service.update_interpolations(45.0);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].completed);
        assert_eq!(frames[0].state.position, Vec2::new(1.0, 1.0));
        assert_eq!(frames[0].remaining_ms, 0.0);

        assert!(service.update_interpolations(16.0).is_empty());
        assert_eq!(service.active_count(), 0);
    }

    #[test]
    fn test_non_finite_task_dropped() {
        let mut service = InterpolationService::default();
        let entity = EntityRef::Entity(2);
        service.start_interpolation(entity, VisualState::default(), VisualState::at(Vec2::new(f32::NAN, 0.0)), 20.0, Easing::Linear, Priority::Low);
        assert!(service.update_interpolations(5.0).is_empty());
        assert_eq!(service.active_count(), 0);
        assert!(service.current_state(entity).is_none());
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut service = InterpolationService::default();
        service.set_bounds(Vec2::ZERO, Vec2::new(19.0, 14.0));
        service.start_interpolation(EntityRef::Entity(1), VisualState::at(Vec2::new(18.0, 5.0)), VisualState::at(Vec2::new(25.0, 5.0)), 10.0, Easing::Linear, Priority::Normal);
        let frames = service.update_interpolations(10.0);
        assert_eq!(frames[0].state.position.x, 19.0);
    }

    #[test]
    fn test_frames_ordered_by_priority() {
        let mut service = InterpolationService::default();
        service.start_interpolation(EntityRef::Entity(1), VisualState::default(), VisualState::default(), 50.0, Easing::Linear, Priority::Low);
        service.start_interpolation(EntityRef::Entity(2), VisualState::default(), VisualState::default(), 50.0, Easing::Linear, Priority::High);
        let frames = service.update_interpolations(1.0);
        assert_eq!(frames[0].entity, EntityRef::Entity(2));
    }

    #[test]
    fn test_extrapolation() {
        let mut service = InterpolationService::default();
        let entity = EntityRef::Entity(5);
        let v = Vec2::new(0.01, 0.0);
        assert_eq!(service.extrapolate_position(entity, Vec2::new(1.0, 1.0), v, 100.0, false).position, Vec2::new(2.0, 1.0));

        service.record_sample(entity, 0, Vec2::new(0.0, 0.0));
        service.record_sample(entity, 100, Vec2::new(1.0, 0.0));
        service.record_sample(entity, 200, Vec2::new(2.0, 0.0));
        // Out-of-order sample ignored
        service.record_sample(entity, 150, Vec2::new(9.0, 9.0));

        let p = service.extrapolate_position(entity, Vec2::new(2.0, 0.0), v, 100.0, true).position;
        assert!((p.x - 3.0).abs() < 1e-4);
        assert_eq!(p.y, 0.0);

        // History of a slower mover pulls the estimate down
        let slow = EntityRef::Entity(6);
        service.record_sample(slow, 0, Vec2::ZERO);
        service.record_sample(slow, 100, Vec2::ZERO);
        let p = service.extrapolate_position(slow, Vec2::ZERO, v, 100.0, true).position;
        assert!(p.x > 0.0 && p.x < 1.0);

        service.retain_samples(|e| e == entity);
        let p = service.extrapolate_position(slow, Vec2::ZERO, v, 100.0, true).position;
        assert!((p.x - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_extrapolation_confidence_decays() {
        let service = InterpolationService::default();
        let entity = EntityRef::Entity(7);
        let v = Vec2::new(0.01, 0.0);

        let still = service.extrapolate_position(entity, Vec2::ZERO, Vec2::ZERO, 0.0, false);
        assert_eq!(still.confidence, 1.0);

        let mut last = still.confidence;
        for horizon in [25.0, 50.0, 100.0, 200.0] {
            let e = service.extrapolate_position(entity, Vec2::ZERO, v, horizon, false);
            assert!(e.confidence < last, "horizon {horizon}");
            assert!((0.0..=1.0).contains(&e.confidence));
            last = e.confidence;
        }

        let mut last = 1.0;
        for speed in [0.01, 0.02, 0.05, 0.1] {
            let e = service.extrapolate_position(entity, Vec2::ZERO, Vec2::new(speed, 0.0), 50.0, false);
            assert!(e.confidence < last, "speed {speed}");
            last = e.confidence;
        }
    }
}
