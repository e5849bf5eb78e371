//! Delta Compression
//!
//! Field-level differences between two snapshots. [`compute_delta`] and
//! [`apply_delta`] are pure; [`DeltaCompressor`] adds a rolling history of
//! compression ratios on top.
//!
//! Arrows are append-only: new arrows are sent whole and never diffed in
//! place. Removed players, entities and arrows are listed by id.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::core::buffer::{mean, RollingHistory};
use crate::error::StateError;
use crate::game::state::{EntityKind, MovingEntity, PlayerState, Snapshot};
use crate::network::protocol::{Delta, EntityField, EntityPatch, LayoutPatch, PlayerField, PlayerPatch};
use crate::network::wire::WireMessage;

// =============================================================================
// DIFF
// =============================================================================

/// Fields that differ between two states of one player.
pub fn player_field_changes(prev: &PlayerState, next: &PlayerState) -> Vec<PlayerField> {
    PlayerField::ALL
        .iter()
        .copied()
        .filter(|field| match field {
            PlayerField::Name => prev.name != next.name,
            PlayerField::Color => prev.color != next.color,
            PlayerField::Score => prev.score != next.score,
            PlayerField::Cursor => prev.cursor != next.cursor,
            PlayerField::Ready => prev.ready != next.ready,
            PlayerField::Connected => prev.connected != next.connected,
        })
        .collect()
}

/// Fields that differ between two states of one entity.
pub fn entity_field_changes(prev: &MovingEntity, next: &MovingEntity) -> Vec<EntityField> {
    EntityField::ALL
        .iter()
        .copied()
        .filter(|field| match field {
            EntityField::Kind => prev.kind != next.kind,
            EntityField::Position => prev.position != next.position,
            EntityField::Direction => prev.direction != next.direction,
            EntityField::Speed => prev.speed != next.speed,
            EntityField::Status => prev.status != next.status,
            EntityField::Tint => prev.tint != next.tint,
        })
        .collect()
}

fn player_patch(next: &PlayerState, fields: Vec<PlayerField>, is_new: bool) -> PlayerPatch {
    let mut patch = PlayerPatch {
        is_new,
        ..Default::default()
    };
    for field in &fields {
        match field {
            PlayerField::Name => patch.name = Some(next.name.clone()),
            PlayerField::Color => patch.color = Some(next.color),
            PlayerField::Score => patch.score = Some(next.score),
            PlayerField::Cursor => patch.cursor = Some(next.cursor),
            PlayerField::Ready => patch.ready = Some(next.ready),
            PlayerField::Connected => patch.connected = Some(next.connected),
        }
    }
    patch.changed_fields = fields;
    patch
}

fn entity_patch(next: &MovingEntity, fields: Vec<EntityField>, is_new: bool) -> EntityPatch {
    let mut patch = EntityPatch {
        is_new,
        ..Default::default()
    };
    for field in &fields {
        match field {
            EntityField::Kind => patch.kind = Some(next.kind),
            EntityField::Position => patch.position = Some(next.position),
            EntityField::Direction => patch.direction = Some(next.direction),
            EntityField::Speed => patch.speed = Some(next.speed),
            EntityField::Status => patch.status = Some(next.status),
            EntityField::Tint => patch.tint = Some(next.tint),
        }
    }
    patch.changed_fields = fields;
    patch
}

/// Compute the delta transforming `prev` into `next`.
///
/// The result carries its compression ratio measured over encoded bytes.
pub fn compute_delta(prev: &Snapshot, next: &Snapshot) -> Delta {
    let mut delta = Delta {
        base_sequence: prev.sequence,
        delta_sequence: next.sequence,
        timestamp: next.timestamp,
        ..Default::default()
    };

    // Players
    let prev_players: BTreeMap<_, _> = prev.players.iter().map(|p| (p.id, p)).collect();
    for player in &next.players {
        let (fields, is_new) = match prev_players.get(&player.id) {
            Some(old) => (player_field_changes(old, player), false),
            None => (PlayerField::ALL.to_vec(), true),
        };
        if is_new || !fields.is_empty() {
            delta.changed_player_ids.push(player.id);
            delta.changed_players.push(player_patch(player, fields, is_new));
        }
    }
    let next_player_ids: BTreeMap<_, _> = next.players.iter().map(|p| (p.id, ())).collect();
    delta.removed_player_ids = prev
        .players
        .iter()
        .map(|p| p.id)
        .filter(|id| !next_player_ids.contains_key(id))
        .collect();

    // Moving entities
    let prev_entities: BTreeMap<_, _> = prev.entities().map(|e| (e.id, e)).collect();
    for entity in next.entities() {
        let (fields, is_new) = match prev_entities.get(&entity.id) {
            Some(old) => (entity_field_changes(old, entity), false),
            None => (EntityField::ALL.to_vec(), true),
        };
        if is_new || !fields.is_empty() {
            delta.changed_entity_ids.push(entity.id);
            delta.changed_entities.push(entity_patch(entity, fields, is_new));
        }
    }
    let next_entity_ids: BTreeMap<_, _> = next.entities().map(|e| (e.id, ())).collect();
    delta.removed_entity_ids = prev
        .entities()
        .map(|e| e.id)
        .filter(|id| !next_entity_ids.contains_key(id))
        .collect();

    // Arrows: append-only
    let prev_arrows: BTreeMap<_, _> = prev.arrows.iter().map(|a| (a.id, ())).collect();
    let next_arrows: BTreeMap<_, _> = next.arrows.iter().map(|a| (a.id, ())).collect();
    delta.new_arrows = next
        .arrows
        .iter()
        .filter(|a| !prev_arrows.contains_key(&a.id))
        .cloned()
        .collect();
    delta.removed_arrow_ids = prev
        .arrows
        .iter()
        .map(|a| a.id)
        .filter(|id| !next_arrows.contains_key(id))
        .collect();

    // Flags, layout and board
    if prev.started != next.started {
        delta.started = Some(next.started);
    }
    if prev.ready != next.ready {
        delta.ready = Some(next.ready);
    }
    let layout_changed = prev.strategy.name != next.strategy.name
        || prev.strategy.walls != next.strategy.walls
        || prev.strategy.goals != next.strategy.goals;
    if layout_changed {
        delta.layout = Some(LayoutPatch {
            name: next.strategy.name.clone(),
            walls: next.strategy.walls.clone(),
            goals: next.strategy.goals.clone(),
        });
    }
    if prev.dims() != next.dims() {
        delta.board = Some(next.dims());
    }

    delta.compression_ratio = compression_ratio(&delta, next.encoded_len());
    delta
}

/// `1 - delta_len / full_len`, clamped to [0, 1].
///
/// Measured with the ratio field present so the result does not depend on
/// the value previously stored in `delta`.
pub fn compression_ratio(delta: &Delta, full_len: usize) -> f32 {
    if full_len == 0 {
        return 0.0;
    }
    let mut measured = delta.clone();
    measured.compression_ratio = 1.0;
    let delta_len = measured.encoded_len();
    (1.0 - delta_len as f32 / full_len as f32).clamp(0.0, 1.0)
}

// =============================================================================
// APPLY
// =============================================================================

fn apply_player_patch(player: &mut PlayerState, patch: &PlayerPatch) -> Result<(), StateError> {
    const MISSING: StateError = StateError::MalformedDelta("player field listed without value");
    for field in &patch.changed_fields {
        match field {
            PlayerField::Name => player.name = patch.name.clone().ok_or(MISSING)?,
            PlayerField::Color => player.color = patch.color.ok_or(MISSING)?,
            PlayerField::Score => player.score = patch.score.ok_or(MISSING)?,
            PlayerField::Cursor => player.cursor = patch.cursor.ok_or(MISSING)?,
            PlayerField::Ready => player.ready = patch.ready.ok_or(MISSING)?,
            PlayerField::Connected => player.connected = patch.connected.ok_or(MISSING)?,
        }
    }
    Ok(())
}

fn apply_entity_patch(entity: &mut MovingEntity, patch: &EntityPatch) -> Result<(), StateError> {
    const MISSING: StateError = StateError::MalformedDelta("entity field listed without value");
    for field in &patch.changed_fields {
        match field {
            EntityField::Kind => entity.kind = patch.kind.ok_or(MISSING)?,
            EntityField::Position => entity.position = patch.position.ok_or(MISSING)?,
            EntityField::Direction => entity.direction = patch.direction.ok_or(MISSING)?,
            EntityField::Speed => entity.speed = patch.speed.ok_or(MISSING)?,
            EntityField::Status => entity.status = patch.status.ok_or(MISSING)?,
            EntityField::Tint => entity.tint = patch.tint.ok_or(MISSING)?,
        }
    }
    Ok(())
}

fn take_entity(snapshot: &mut Snapshot, id: u32) -> Option<MovingEntity> {
    if let Some(idx) = snapshot.strategy.mice.iter().position(|e| e.id == id) {
        return Some(snapshot.strategy.mice.remove(idx));
    }
    if let Some(idx) = snapshot.strategy.cats.iter().position(|e| e.id == id) {
        return Some(snapshot.strategy.cats.remove(idx));
    }
    None
}

fn place_entity(snapshot: &mut Snapshot, entity: MovingEntity) {
    match entity.kind {
        EntityKind::Mouse(_) => snapshot.strategy.mice.push(entity),
        EntityKind::Cat(_) => snapshot.strategy.cats.push(entity),
    }
}

/// Reconstruct the delta's target from its base.
///
/// Patches for ids unknown to `base` that are not marked new are skipped.
pub fn apply_delta(base: &Snapshot, delta: &Delta) -> Result<Snapshot, StateError> {
    if base.sequence != delta.base_sequence {
        return Err(StateError::BaselineMismatch {
            expected: delta.base_sequence,
            actual: base.sequence,
        });
    }
    if delta.changed_player_ids.len() != delta.changed_players.len() {
        return Err(StateError::MalformedDelta("player ids and patches differ in length"));
    }
    if delta.changed_entity_ids.len() != delta.changed_entities.len() {
        return Err(StateError::MalformedDelta("entity ids and patches differ in length"));
    }

    let mut out = base.clone();
    out.sequence = delta.delta_sequence;
    out.timestamp = delta.timestamp;

    out.players.retain(|p| !delta.removed_player_ids.contains(&p.id));
    for (id, patch) in delta.changed_player_ids.iter().zip(&delta.changed_players) {
        if patch.is_new {
            let mut player = PlayerState { id: *id, ..Default::default() };
            apply_player_patch(&mut player, patch)?;
            out.players.retain(|p| p.id != *id);
            out.players.push(player);
        } else if let Some(player) = out.player_mut(*id) {
            apply_player_patch(player, patch)?;
        }
    }

    for id in &delta.removed_entity_ids {
        take_entity(&mut out, *id);
    }
    for (id, patch) in delta.changed_entity_ids.iter().zip(&delta.changed_entities) {
        let entity = if patch.is_new {
            take_entity(&mut out, *id);
            let mut entity = MovingEntity { id: *id, ..Default::default() };
            apply_entity_patch(&mut entity, patch)?;
            entity
        } else {
            match take_entity(&mut out, *id) {
                Some(mut entity) => {
                    apply_entity_patch(&mut entity, patch)?;
                    entity
                }
                None => continue,
            }
        };
        place_entity(&mut out, entity);
    }

    out.arrows.retain(|a| !delta.removed_arrow_ids.contains(&a.id));
    for arrow in &delta.new_arrows {
        out.arrows.retain(|a| a.id != arrow.id);
        out.arrows.push(arrow.clone());
    }

    if let Some(started) = delta.started {
        out.started = started;
    }
    if let Some(ready) = delta.ready {
        out.ready = ready;
    }
    if let Some(layout) = &delta.layout {
        out.strategy.name = layout.name.clone();
        out.strategy.walls = layout.walls.clone();
        out.strategy.goals = layout.goals.clone();
    }
    if let Some(board) = delta.board {
        out.set_dims(board);
    }

    out.normalize();
    Ok(out)
}

// =============================================================================
// COMPRESSOR
// =============================================================================

/// Delta compressor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Ratios kept for average and trend
    pub history_len: usize,
    /// Half-vs-half difference that counts as a trend
    pub trend_threshold: f32,
    /// Drop cosmetic fields when the ratio is below `quality_bar`
    pub optimize_low_priority: bool,
    /// Ratio below which the optimisation pass runs
    pub quality_bar: f32,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            history_len: 100,
            trend_threshold: 0.05,
            optimize_low_priority: false,
            quality_bar: 0.5,
        }
    }
}

/// Coarse direction of recent compression ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionTrend {
    /// Later ratios are higher
    Improving,
    /// Later ratios are lower
    Declining,
    /// No significant change
    Stable,
}

/// Stateful compressor tracking ratio history.
#[derive(Debug, Clone)]
pub struct DeltaCompressor {
    config: DeltaConfig,
    history: RollingHistory<f32>,
    deltas_emitted: u64,
}

impl DeltaCompressor {
    /// Create a compressor.
    pub fn new(config: DeltaConfig) -> Self {
        Self {
            history: RollingHistory::new(config.history_len),
            config,
            deltas_emitted: 0,
        }
    }

    /// Compute a delta and record its ratio.
    pub fn compress(&mut self, prev: &Snapshot, next: &Snapshot) -> Delta {
        let mut delta = compute_delta(prev, next);
        if self.config.optimize_low_priority && delta.compression_ratio < self.config.quality_bar {
            optimize_low_priority(&mut delta, next.encoded_len());
        }
        self.history.push(delta.compression_ratio);
        self.deltas_emitted += 1;
        delta
    }

    /// Mean ratio over the history, 0 when empty.
    pub fn average_ratio(&self) -> f32 {
        mean(self.history.iter()).unwrap_or(0.0)
    }

    /// Compare the first and second half of the history.
    pub fn trend(&self) -> CompressionTrend {
        let values: Vec<f32> = self.history.iter().copied().collect();
        if values.len() < 2 {
            return CompressionTrend::Stable;
        }
        let (first, second) = values.split_at(values.len() / 2);
        let diff = mean(second).unwrap_or(0.0) - mean(first).unwrap_or(0.0);
        if diff > self.config.trend_threshold {
            CompressionTrend::Improving
        } else if diff < -self.config.trend_threshold {
            CompressionTrend::Declining
        } else {
            CompressionTrend::Stable
        }
    }

    /// Ratios recorded, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &f32> {
        self.history.iter()
    }

    /// Deltas produced so far.
    pub fn deltas_emitted(&self) -> u64 {
        self.deltas_emitted
    }
}

/// Drop cosmetic fields from patches of existing players and entities, then
/// recompute the ratio. Patches left empty are removed.
pub fn optimize_low_priority(delta: &mut Delta, full_len: usize) {
    let players = std::mem::take(&mut delta.changed_players);
    let player_ids = std::mem::take(&mut delta.changed_player_ids);
    for (id, mut patch) in player_ids.into_iter().zip(players) {
        if !patch.is_new {
            patch.changed_fields.retain(|f| !f.is_cosmetic());
            patch.color = None;
            if patch.changed_fields.is_empty() {
                continue;
            }
        }
        delta.changed_player_ids.push(id);
        delta.changed_players.push(patch);
    }

    let entities = std::mem::take(&mut delta.changed_entities);
    let entity_ids = std::mem::take(&mut delta.changed_entity_ids);
    for (id, mut patch) in entity_ids.into_iter().zip(entities) {
        if !patch.is_new {
            patch.changed_fields.retain(|f| !f.is_cosmetic());
            patch.tint = None;
            if patch.changed_fields.is_empty() {
                continue;
            }
        }
        delta.changed_entity_ids.push(id);
        delta.changed_entities.push(patch);
    }

    delta.compression_ratio = compression_ratio(delta, full_len);
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec2::Vec2;
    use crate::game::state::{Arrow, CatData, Direction, Goal, MouseData};
    use proptest::prelude::*;

    fn board(players: u32, mice: u32) -> Snapshot {
        let mut s = Snapshot::new(20, 15);
        s.sequence = 10;
        s.timestamp = 1_700_000_000_000;
        s.strategy.name = "classic".into();
        for id in 1..=players {
            let mut p = PlayerState::new(id, format!("player-{}", id));
            p.color = 0xff00_0000 | id;
            p.cursor = Vec2::new(id as f32, 2.0);
            s.players.push(p);
            s.strategy.goals.push(Goal { x: id, y: 14, owner: id });
        }
        for id in 0..mice {
            s.strategy.mice.push(MovingEntity::new(
                100 + id,
                EntityKind::Mouse(MouseData::default()),
                Vec2::new(id as f32, 5.0),
                Direction::Right,
                0.25,
            ));
        }
        s.strategy.cats.push(MovingEntity::new(
            500,
            EntityKind::Cat(CatData::default()),
            Vec2::new(10.0, 10.0),
            Direction::Left,
            0.2,
        ));
        s
    }

    fn next_of(prev: &Snapshot) -> Snapshot {
        let mut next = prev.clone();
        next.sequence = prev.sequence + 1;
        next.timestamp = prev.timestamp + 50;
        next
    }

    #[test]
    fn test_one_score_change() {
        let base = board(10, 0);
        let mut next = next_of(&base);
        next.player_mut(4).unwrap().score = 3;

        let delta = compute_delta(&base, &next);
        assert_eq!(delta.changed_player_ids, vec![4]);
        assert_eq!(delta.changed_players[0].changed_fields, vec![PlayerField::Score]);
        assert!(delta.changed_entities.is_empty());
        assert!(delta.encoded_len() * 5 < base.encoded_len());
        assert!(delta.compression_ratio > 0.8);

        let rebuilt = apply_delta(&base, &delta).unwrap();
        assert_eq!(rebuilt, next);
    }

    #[test]
    fn test_deterministic() {
        let base = board(3, 4);
        let mut next = next_of(&base);
        next.strategy.mice[1].position = Vec2::new(1.25, 5.0);
        next.players[0].ready = true;

        let a = compute_delta(&base, &next);
        let b = compute_delta(&base, &next);
        assert_eq!(a.encode_to_vec(), b.encode_to_vec());
        assert_eq!(a.compression_ratio, b.compression_ratio);
    }

    #[test]
    fn test_new_and_removed() {
        let base = board(2, 2);
        let mut next = next_of(&base);
        next.players.retain(|p| p.id != 2);
        next.players.push(PlayerState::new(9, "late"));
        next.strategy.mice.retain(|e| e.id != 100);
        next.arrows.push(Arrow { id: 1, owner: 1, x: 3, y: 3, direction: Direction::Up, placed_at: 11, input_sequence: 1 });
        next.normalize();

        let delta = compute_delta(&base, &next);
        assert_eq!(delta.removed_player_ids, vec![2]);
        assert_eq!(delta.changed_player_ids, vec![9]);
        assert!(delta.changed_players[0].is_new);
        assert_eq!(delta.changed_players[0].changed_fields.len(), PlayerField::ALL.len());
        assert_eq!(delta.removed_entity_ids, vec![100]);
        assert_eq!(delta.new_arrows.len(), 1);

        assert_eq!(apply_delta(&base, &delta).unwrap(), next);
    }

    #[test]
    fn test_arrows_never_diffed() {
        let mut base = board(1, 0);
        base.arrows.push(Arrow { id: 1, owner: 1, x: 3, y: 3, ..Default::default() });
        let mut next = next_of(&base);
        next.arrows[0].placed_at = 99;

        let delta = compute_delta(&base, &next);
        assert!(delta.new_arrows.is_empty());
        assert!(delta.removed_arrow_ids.is_empty());
    }

    #[test]
    fn test_kind_change_moves_list() {
        let base = board(1, 1);
        let mut next = next_of(&base);
        let mut mouse = next.strategy.mice.remove(0);
        mouse.kind = EntityKind::Cat(CatData { bites: 0 });
        next.strategy.cats.push(mouse);
        next.normalize();

        let delta = compute_delta(&base, &next);
        assert_eq!(delta.changed_entities[0].changed_fields, vec![EntityField::Kind]);
        let rebuilt = apply_delta(&base, &delta).unwrap();
        assert_eq!(rebuilt.strategy.cats.len(), 2);
        assert_eq!(rebuilt, next);
    }

    #[test]
    fn test_baseline_mismatch() {
        let base = board(1, 0);
        let next = next_of(&base);
        let delta = compute_delta(&base, &next);
        assert_eq!(
            apply_delta(&next, &delta),
            Err(StateError::BaselineMismatch { expected: 10, actual: 11 })
        );
    }

    #[test]
    fn test_malformed_delta() {
        let base = board(1, 0);
        let mut delta = Delta { base_sequence: 10, ..Default::default() };
        delta.changed_player_ids.push(1);
        assert!(matches!(apply_delta(&base, &delta), Err(StateError::MalformedDelta(_))));

        // Field listed but value missing
        let mut delta = Delta { base_sequence: 10, ..Default::default() };
        delta.changed_player_ids.push(1);
        delta.changed_players.push(PlayerPatch { changed_fields: vec![PlayerField::Score], ..Default::default() });
        assert!(matches!(apply_delta(&base, &delta), Err(StateError::MalformedDelta(_))));
    }

    #[test]
    fn test_unknown_patch_skipped() {
        let base = board(1, 0);
        let mut delta = Delta { base_sequence: 10, delta_sequence: 11, ..Default::default() };
        delta.changed_player_ids.push(77);
        delta.changed_players.push(PlayerPatch {
            changed_fields: vec![PlayerField::Score],
            score: Some(5),
            ..Default::default()
        });
        let rebuilt = apply_delta(&base, &delta).unwrap();
        assert!(rebuilt.player(77).is_none());
        assert_eq!(rebuilt.sequence, 11);
    }

    #[test]
    fn test_layout_and_board_replacement() {
        let base = board(2, 0);
        let mut next = next_of(&base);
        next.strategy.goals.clear();
        next.set_dims(Snapshot::new(30, 20).dims());
        next.started = true;

        let delta = compute_delta(&base, &next);
        assert!(delta.layout.is_some());
        assert!(delta.board.is_some());
        assert_eq!(delta.started, Some(true));
        assert_eq!(delta.ready, None);
        assert_eq!(apply_delta(&base, &delta).unwrap(), next);
    }

    #[test]
    fn test_optimize_drops_cosmetic_fields() {
        let base = board(2, 2);
        let mut next = next_of(&base);
        for p in &mut next.players {
            p.color ^= 0x00ff_ffff;
        }
        for e in next.entities_mut() {
            e.tint = 7;
        }
        next.players[0].score = 1;

        let mut compressor = DeltaCompressor::new(DeltaConfig {
            optimize_low_priority: true,
            quality_bar: 1.0,
            ..Default::default()
        });
        let delta = compressor.compress(&base, &next);
        assert_eq!(delta.changed_player_ids, vec![1]);
        assert_eq!(delta.changed_players[0].changed_fields, vec![PlayerField::Score]);
        assert_eq!(delta.changed_players[0].color, None);
        assert!(delta.changed_entities.is_empty());
        assert!(delta.compression_ratio >= compute_delta(&base, &next).compression_ratio);
    }

    #[test]
    fn test_trend() {
        let mut compressor = DeltaCompressor::new(DeltaConfig::default());
        assert_eq!(compressor.trend(), CompressionTrend::Stable);
        assert_eq!(compressor.average_ratio(), 0.0);

        let base = board(4, 6);
        // Many changes first, then few
        let mut busy = next_of(&base);
        for e in busy.entities_mut() {
            e.position = e.position + Vec2::new(0.25, 0.0);
        }
        for p in &mut busy.players {
            p.cursor = Vec2::new(9.0, 9.0);
        }
        let mut quiet = next_of(&base);
        quiet.players[0].score = 1;

        for _ in 0..4 {
            compressor.compress(&base, &busy);
        }
        for _ in 0..4 {
            compressor.compress(&base, &quiet);
        }
        assert_eq!(compressor.trend(), CompressionTrend::Improving);
        assert_eq!(compressor.deltas_emitted(), 8);
        assert!(compressor.average_ratio() > 0.0);
    }

    #[test]
    fn test_empty_full_snapshot_ratio() {
        let delta = Delta::default();
        assert_eq!(compression_ratio(&delta, 0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_apply_reconstructs_and_fields_are_exact(
            scores in prop::collection::vec((1u32..=6, any::<u32>()), 0..6),
            moves in prop::collection::vec((0usize..8, -3.0f32..3.0), 0..8),
            remove_player in proptest::option::of(1u32..=6),
            toggle_ready in any::<bool>(),
            add_arrow in any::<bool>(),
        ) {
            let base = board(6, 7);
            let mut next = next_of(&base);
            for (id, score) in scores {
                if let Some(p) = next.player_mut(id) {
                    p.score = score;
                }
            }
            for (idx, dx) in moves {
                if let Some(e) = next.entities_mut().nth(idx) {
                    e.position = e.position + Vec2::new(dx, 0.0);
                }
            }
            if toggle_ready {
                next.players[0].ready = !next.players[0].ready;
            }
            if let Some(id) = remove_player {
                next.players.retain(|p| p.id != id);
            }
            if add_arrow {
                next.arrows.push(Arrow { id: 3, owner: 1, x: 4, y: 4, ..Default::default() });
            }

            let delta = compute_delta(&base, &next);
            prop_assert!((0.0..=1.0).contains(&delta.compression_ratio));
            prop_assert_eq!(apply_delta(&base, &delta).unwrap(), next.clone());

            for (id, patch) in delta.changed_player_ids.iter().zip(&delta.changed_players) {
                if let (Some(a), Some(b)) = (base.player(*id), next.player(*id)) {
                    prop_assert_eq!(&patch.changed_fields, &player_field_changes(a, b));
                    prop_assert!(!patch.changed_fields.is_empty());
                }
            }
            for player in &next.players {
                let listed = delta.changed_player_ids.contains(&player.id);
                let differs = base.player(player.id).map(|old| old != player).unwrap_or(true);
                prop_assert_eq!(listed, differs);
            }
            for (id, patch) in delta.changed_entity_ids.iter().zip(&delta.changed_entities) {
                if let (Some(a), Some(b)) = (base.entity(*id), next.entity(*id)) {
                    prop_assert_eq!(&patch.changed_fields, &entity_field_changes(a, b));
                }
            }
        }
    }
}
