//! Simulation Step
//!
//! The server treats the game rules as an opaque `(prev, inputs) -> next`
//! function behind the [`Simulation`] trait. [`GridSimulation`] is a small
//! reference rule set: mice and cats walk the grid, arrows turn them, walls
//! turn them right, goals capture them.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::core::vec2::Vec2;
use crate::error::SimulationFault;
use crate::game::input::{ActionCode, InputPayload, PredictiveInput};
use crate::game::state::{
    Arrow, ArrowId, CatData, Direction, EntityId, EntityKind, EntityStatus, Goal, MouseData,
    MovingEntity, PlayerId, Snapshot,
};

/// One authoritative step.
pub trait Simulation: Send {
    /// Produce the next state from the previous one and this tick's inputs.
    /// Sequence and timestamp are stamped by the caller.
    fn step(&mut self, prev: &Snapshot, inputs: &[PredictiveInput]) -> Result<Snapshot, SimulationFault>;
}

impl<F> Simulation for F
where
    F: FnMut(&Snapshot, &[PredictiveInput]) -> Result<Snapshot, SimulationFault> + Send,
{
    fn step(&mut self, prev: &Snapshot, inputs: &[PredictiveInput]) -> Result<Snapshot, SimulationFault> {
        self(prev, inputs)
    }
}

// =============================================================================
// SPAWN TABLES
// =============================================================================

/// When a spawn rule fires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpawnTrigger {
    /// Every `ticks` ticks
    Every {
        /// Interval in ticks
        ticks: u64,
    },
    /// Each tick with a probability
    Chance {
        /// Probability per tick
        probability: f32,
    },
}

/// What a spawn rule creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnKind {
    /// Normal mouse
    Mouse,
    /// Golden mouse
    GoldenMouse,
    /// Cat
    Cat,
}

/// Declarative spawn rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnRule {
    /// Trigger
    pub trigger: SpawnTrigger,
    /// Entity kind
    pub kind: SpawnKind,
    /// Spawn cell
    pub origin: (u32, u32),
    /// Initial heading
    pub direction: Direction,
    /// Rule is skipped while this many of its kind are alive
    pub max_alive: usize,
}

/// Default table for a board of the given size.
pub fn classic_spawn_table(cols: u32, rows: u32) -> Vec<SpawnRule> {
    let last_col = cols.saturating_sub(1);
    let last_row = rows.saturating_sub(1);
    vec![
        SpawnRule {
            trigger: SpawnTrigger::Every { ticks: 8 },
            kind: SpawnKind::Mouse,
            origin: (0, 0),
            direction: Direction::Right,
            max_alive: 40,
        },
        SpawnRule {
            trigger: SpawnTrigger::Every { ticks: 8 },
            kind: SpawnKind::Mouse,
            origin: (last_col, last_row),
            direction: Direction::Left,
            max_alive: 40,
        },
        SpawnRule {
            trigger: SpawnTrigger::Chance { probability: 0.01 },
            kind: SpawnKind::GoldenMouse,
            origin: (last_col, 0),
            direction: Direction::Down,
            max_alive: 2,
        },
        SpawnRule {
            trigger: SpawnTrigger::Every { ticks: 120 },
            kind: SpawnKind::Cat,
            origin: (0, last_row),
            direction: Direction::Up,
            max_alive: 3,
        },
    ]
}

// =============================================================================
// GRID SIMULATION
// =============================================================================

/// Rules of the reference simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Board columns
    pub cols: u32,
    /// Board rows
    pub rows: u32,
    /// Mode name
    pub mode: String,
    /// Arrows per player; placing one more removes the oldest
    pub max_arrows_per_player: usize,
    /// Ticks an arrow stays on the board
    pub arrow_lifetime_ticks: u64,
    /// Mouse speed (cells per tick, power-of-two fraction keeps cell alignment exact)
    pub mouse_speed: f32,
    /// Cat speed
    pub cat_speed: f32,
    /// Points for a mouse
    pub mouse_points: u32,
    /// Points for a golden mouse
    pub golden_points: u32,
    /// RNG seed
    pub seed: u64,
    /// Spawn table; empty uses [`classic_spawn_table`]
    pub spawn_rules: Vec<SpawnRule>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cols: 20,
            rows: 15,
            mode: "classic".into(),
            max_arrows_per_player: 3,
            arrow_lifetime_ticks: 200,
            mouse_speed: 0.25,
            cat_speed: 0.125,
            mouse_points: 1,
            golden_points: 10,
            seed: 0x5eed,
            spawn_rules: Vec::new(),
        }
    }
}

/// Reference simulation.
#[derive(Clone, Debug)]
pub struct GridSimulation {
    config: GridConfig,
    spawn_rules: Vec<SpawnRule>,
    rng: DeterministicRng,
    next_entity_id: EntityId,
    next_arrow_id: ArrowId,
}

impl GridSimulation {
    /// Create a simulation.
    pub fn new(config: GridConfig) -> Self {
        let spawn_rules = if config.spawn_rules.is_empty() {
            classic_spawn_table(config.cols, config.rows)
        } else {
            config.spawn_rules.clone()
        };
        Self {
            rng: DeterministicRng::new(config.seed),
            spawn_rules,
            config,
            next_entity_id: 1,
            next_arrow_id: 1,
        }
    }

    /// Empty board matching the configuration.
    pub fn initial_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new(self.config.cols, self.config.rows);
        snapshot.strategy.name = self.config.mode.clone();
        snapshot
    }

    /// Rules in effect.
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Goal cells handed out to players in join order.
    fn goal_slots(&self) -> Vec<(u32, u32)> {
        let (c, r) = (self.config.cols, self.config.rows);
        [(1, 2), (3, 2), (2, 1), (2, 3), (1, 1), (3, 3), (3, 1), (1, 3)]
            .iter()
            .map(|(fx, fy)| (c * fx / 4, r * fy / 4))
            .collect()
    }

    fn assign_goals(&self, next: &mut Snapshot) {
        let slots = self.goal_slots();
        let owners: Vec<PlayerId> = next.players.iter().map(|p| p.id).collect();
        for owner in owners {
            if next.strategy.goals.iter().any(|g| g.owner == owner) {
                continue;
            }
            let free = slots
                .iter()
                .find(|(x, y)| next.goal_at(*x, *y).is_none() && next.arrow_at(*x, *y).is_none());
            if let Some((x, y)) = free {
                next.strategy.goals.push(Goal { x: *x, y: *y, owner });
            }
        }
    }

    fn apply_input(&mut self, next: &mut Snapshot, tick: u64, input: &PredictiveInput) {
        if next.player(input.player_id).is_none() {
            return;
        }
        // Payloads were validated at intake; anything undecodable here is ignored
        let payload = match input.payload() {
            Ok(Some(payload)) => payload,
            _ => return,
        };
        match payload {
            InputPayload::PlaceArrow(place) => {
                if !next.in_bounds(place.x as i64, place.y as i64) {
                    return;
                }
                let (x, y) = (place.x as u32, place.y as u32);
                if next.is_occupied(x, y) {
                    return;
                }
                let owned: Vec<ArrowId> = next
                    .arrows
                    .iter()
                    .filter(|a| a.owner == input.player_id)
                    .map(|a| a.id)
                    .collect();
                if owned.len() >= self.config.max_arrows_per_player {
                    if let Some(oldest) = owned.first() {
                        next.arrows.retain(|a| a.id != *oldest);
                    }
                }
                next.arrows.push(Arrow {
                    id: self.next_arrow_id,
                    owner: input.player_id,
                    x,
                    y,
                    direction: place.direction,
                    placed_at: tick,
                    input_sequence: input.sequence,
                });
                self.next_arrow_id += 1;
            }
            InputPayload::MoveCursor(mv) => {
                let (lo, hi) = next.bounds();
                if let Some(player) = next.player_mut(input.player_id) {
                    if mv.target.is_finite() {
                        player.cursor = mv.target.clamp(lo, hi);
                    }
                }
            }
            InputPayload::Action(action) => match action.action() {
                Some(ActionCode::Ready) if !next.started => {
                    if let Some(player) = next.player_mut(input.player_id) {
                        player.ready = true;
                    }
                }
                Some(ActionCode::ClearArrows) => {
                    next.arrows.retain(|a| a.owner != input.player_id);
                }
                _ => {}
            },
        }
    }

    fn spawn(&mut self, next: &mut Snapshot, tick: u64) {
        let rules = self.spawn_rules.clone();
        for rule in &rules {
            let fires = match rule.trigger {
                SpawnTrigger::Every { ticks } => ticks > 0 && tick % ticks == 0,
                SpawnTrigger::Chance { probability } => self.rng.next_bool(probability),
            };
            if !fires || !next.in_bounds(rule.origin.0 as i64, rule.origin.1 as i64) {
                continue;
            }
            let alive = match rule.kind {
                SpawnKind::Cat => next.strategy.cats.len(),
                SpawnKind::Mouse | SpawnKind::GoldenMouse => next.strategy.mice.len(),
            };
            if alive >= rule.max_alive {
                continue;
            }
            let (kind, speed) = match rule.kind {
                SpawnKind::Mouse => (EntityKind::Mouse(MouseData { golden: false }), self.config.mouse_speed),
                SpawnKind::GoldenMouse => (EntityKind::Mouse(MouseData { golden: true }), self.config.mouse_speed),
                SpawnKind::Cat => (EntityKind::Cat(CatData::default()), self.config.cat_speed),
            };
            let entity = MovingEntity::new(
                self.next_entity_id,
                kind,
                Vec2::from_cell(rule.origin.0, rule.origin.1),
                rule.direction,
                speed,
            );
            self.next_entity_id += 1;
            match kind {
                EntityKind::Cat(_) => next.strategy.cats.push(entity),
                EntityKind::Mouse(_) => next.strategy.mice.push(entity),
            }
        }
    }

    fn move_entities(&self, next: &mut Snapshot) -> Result<(), SimulationFault> {
        let mut movers = std::mem::take(&mut next.strategy.mice);
        movers.append(&mut next.strategy.cats);
        // Captured and fallen entities were shown for one tick
        movers.retain(|e| e.status == EntityStatus::Active);

        let mut eaten: Vec<ArrowId> = Vec::new();
        let mut awards: BTreeMap<PlayerId, Vec<EntityKind>> = BTreeMap::new();

        for entity in movers.iter_mut() {
            if let Some((cx, cy)) = cell_center(entity.position) {
                if !next.in_bounds(cx, cy) {
                    entity.status = EntityStatus::Falling;
                    continue;
                }
                let (x, y) = (cx as u32, cy as u32);
                if let Some(goal) = next.goal_at(x, y) {
                    entity.status = EntityStatus::Captured;
                    awards.entry(goal.owner).or_default().push(entity.kind);
                    continue;
                }
                if let Some(arrow) = next.arrow_at(x, y) {
                    if !eaten.contains(&arrow.id) {
                        entity.direction = arrow.direction;
                        if let EntityKind::Cat(data) = &mut entity.kind {
                            data.bites += 1;
                            eaten.push(arrow.id);
                        }
                    }
                }
                for _ in 0..4 {
                    if !next.wall_blocks(x, y, entity.direction) {
                        break;
                    }
                    entity.direction = entity.direction.turn_right();
                }
            }
            entity.position = entity.position + entity.velocity();
            if !entity.position.is_finite() {
                return Err(SimulationFault::InvalidState(format!(
                    "entity {} left finite space",
                    entity.id
                )));
            }
        }

        next.arrows.retain(|a| !eaten.contains(&a.id));
        for (owner, kinds) in awards {
            if let Some(player) = next.player_mut(owner) {
                for kind in kinds {
                    player.score = match kind {
                        EntityKind::Mouse(MouseData { golden: true }) => player.score + self.config.golden_points,
                        EntityKind::Mouse(_) => player.score + self.config.mouse_points,
                        EntityKind::Cat(_) => player.score * 2 / 3,
                    };
                }
            }
        }

        for entity in movers {
            match entity.kind {
                EntityKind::Mouse(_) => next.strategy.mice.push(entity),
                EntityKind::Cat(_) => next.strategy.cats.push(entity),
            }
        }
        Ok(())
    }
}

impl Default for GridSimulation {
    fn default() -> Self {
        Self::new(GridConfig::default())
    }
}

impl Simulation for GridSimulation {
    fn step(&mut self, prev: &Snapshot, inputs: &[PredictiveInput]) -> Result<Snapshot, SimulationFault> {
        let tick = prev.sequence + 1;
        let mut next = prev.clone();

        self.assign_goals(&mut next);
        for input in inputs {
            self.apply_input(&mut next, tick, input);
        }

        let all_ready = !next.players.is_empty() && next.players.iter().all(|p| p.ready);
        next.ready = all_ready;
        if all_ready && !next.started {
            next.started = true;
        }

        if next.started {
            let lifetime = self.config.arrow_lifetime_ticks;
            next.arrows.retain(|a| tick.saturating_sub(a.placed_at) < lifetime);
            self.move_entities(&mut next)?;
            self.spawn(&mut next, tick);
        }

        next.normalize();
        Ok(next)
    }
}

/// Cell whose centre `position` sits on, if any.
fn cell_center(position: Vec2) -> Option<(i64, i64)> {
    const EPS: f32 = 1e-4;
    let rx = position.x.round();
    let ry = position.y.round();
    if (position.x - rx).abs() < EPS && (position.y - ry).abs() < EPS {
        Some((rx as i64, ry as i64))
    } else {
        None
    }
}

// =============================================================================
// TESTS
// =============================================================================
