//! Protocol Messages
//!
//! The fixed message catalogue and its tag-value encoding. Every message on
//! the wire is wrapped in an [`Envelope`] carrying exactly one payload.
//!
//! Tags are stable: new fields get new tags, old tags are never reused.

use bytes::Bytes;
use serde::{Serialize, Deserialize};

use crate::core::vec2::Vec2;
use crate::error::ParseError;
use crate::game::input::{ActionPayload, InputKind, MoveCursorPayload, PlaceArrowPayload, PredictiveInput};
use crate::game::state::{
    Arrow, BoardDims, CatData, Direction, EntityKind, EntityRef, EntityStatus, Goal, MouseData,
    MovingEntity, PlayerState, Snapshot, Strategy, Wall,
};
use crate::network::wire::{WireMessage, WireReader, WireResult, WireType, WireWriter};

fn read_direction(r: &mut WireReader<'_>, tag: u32, wt: WireType) -> WireResult<Direction> {
    let value = r.uint64(tag, wt)?;
    Direction::from_code(value).ok_or(ParseError::InvalidEnum { field: "direction", value })
}

fn read_status(r: &mut WireReader<'_>, tag: u32, wt: WireType) -> WireResult<EntityStatus> {
    let value = r.uint64(tag, wt)?;
    EntityStatus::from_code(value).ok_or(ParseError::InvalidEnum { field: "status", value })
}

// =============================================================================
// BOARD TYPES
// =============================================================================

impl WireMessage for Vec2 {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.float(1, self.x);
        w.float(2, self.y);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.x = r.float(tag, wt)?,
            2 => self.y = r.float(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for PlayerState {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.id);
        w.string(2, &self.name);
        w.uint32(3, self.color);
        w.uint32(4, self.score);
        if self.cursor != Vec2::ZERO {
            w.message(5, &self.cursor);
        }
        w.bool(6, self.ready);
        w.bool(7, self.connected);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.id = r.uint32(tag, wt, "player.id")?,
            2 => self.name = r.string(tag, wt)?,
            3 => self.color = r.uint32(tag, wt, "player.color")?,
            4 => self.score = r.uint32(tag, wt, "player.score")?,
            5 => self.cursor = r.message(tag, wt)?,
            6 => self.ready = r.bool(tag, wt)?,
            7 => self.connected = r.bool(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for MouseData {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.bool(1, self.golden);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.golden = r.bool(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for CatData {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.bites);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.bites = r.uint32(tag, wt, "cat.bites")?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Entity kind is a oneof: mouse at tag 8, cat at tag 9.
fn write_kind(w: &mut WireWriter, kind: &EntityKind) {
    match kind {
        EntityKind::Mouse(data) => w.message(8, data),
        EntityKind::Cat(data) => w.message(9, data),
    }
}

fn merge_kind(tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<Option<EntityKind>> {
    match tag {
        8 => Ok(Some(EntityKind::Mouse(r.message(tag, wt)?))),
        9 => Ok(Some(EntityKind::Cat(r.message(tag, wt)?))),
        _ => Ok(None),
    }
}

impl WireMessage for MovingEntity {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.id);
        if self.position != Vec2::ZERO {
            w.message(2, &self.position);
        }
        w.uint64(3, self.direction.code());
        w.float(4, self.speed);
        w.uint64(5, self.status.code());
        w.uint32(6, self.tint);
        write_kind(w, &self.kind);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.id = r.uint32(tag, wt, "entity.id")?,
            2 => self.position = r.message(tag, wt)?,
            3 => self.direction = read_direction(r, tag, wt)?,
            4 => self.speed = r.float(tag, wt)?,
            5 => self.status = read_status(r, tag, wt)?,
            6 => self.tint = r.uint32(tag, wt, "entity.tint")?,
            8 | 9 => {
                if let Some(kind) = merge_kind(tag, wt, r)? {
                    self.kind = kind;
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Arrow {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.id);
        w.uint32(2, self.owner);
        w.uint32(3, self.x);
        w.uint32(4, self.y);
        w.uint64(5, self.direction.code());
        w.uint64(6, self.placed_at);
        w.uint64(7, self.input_sequence);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.id = r.uint32(tag, wt, "arrow.id")?,
            2 => self.owner = r.uint32(tag, wt, "arrow.owner")?,
            3 => self.x = r.uint32(tag, wt, "arrow.x")?,
            4 => self.y = r.uint32(tag, wt, "arrow.y")?,
            5 => self.direction = read_direction(r, tag, wt)?,
            6 => self.placed_at = r.uint64(tag, wt)?,
            7 => self.input_sequence = r.uint64(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Wall {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.x);
        w.uint32(2, self.y);
        w.uint64(3, self.side.code());
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.x = r.uint32(tag, wt, "wall.x")?,
            2 => self.y = r.uint32(tag, wt, "wall.y")?,
            3 => self.side = read_direction(r, tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Goal {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.x);
        w.uint32(2, self.y);
        w.uint32(3, self.owner);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.x = r.uint32(tag, wt, "goal.x")?,
            2 => self.y = r.uint32(tag, wt, "goal.y")?,
            3 => self.owner = r.uint32(tag, wt, "goal.owner")?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Strategy {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.messages(1, &self.mice);
        w.messages(2, &self.cats);
        w.messages(3, &self.walls);
        w.messages(4, &self.goals);
        w.string(5, &self.name);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.mice.push(r.message(tag, wt)?),
            2 => self.cats.push(r.message(tag, wt)?),
            3 => self.walls.push(r.message(tag, wt)?),
            4 => self.goals.push(r.message(tag, wt)?),
            5 => self.name = r.string(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for BoardDims {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.width);
        w.uint32(2, self.height);
        w.uint32(3, self.cols);
        w.uint32(4, self.rows);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.width = r.uint32(tag, wt, "board.width")?,
            2 => self.height = r.uint32(tag, wt, "board.height")?,
            3 => self.cols = r.uint32(tag, wt, "board.cols")?,
            4 => self.rows = r.uint32(tag, wt, "board.rows")?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Snapshot {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.messages(1, &self.players);
        if self.strategy != Strategy::default() {
            w.message(2, &self.strategy);
        }
        w.uint32(3, self.width);
        w.uint32(4, self.height);
        w.bool(5, self.started);
        w.bool(6, self.ready);
        w.uint32(7, self.cols);
        w.uint32(8, self.rows);
        w.messages(9, &self.arrows);
        w.uint64(10, self.sequence);
        w.uint64(11, self.timestamp);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.players.push(r.message(tag, wt)?),
            2 => self.strategy = r.message(tag, wt)?,
            3 => self.width = r.uint32(tag, wt, "snapshot.width")?,
            4 => self.height = r.uint32(tag, wt, "snapshot.height")?,
            5 => self.started = r.bool(tag, wt)?,
            6 => self.ready = r.bool(tag, wt)?,
            7 => self.cols = r.uint32(tag, wt, "snapshot.cols")?,
            8 => self.rows = r.uint32(tag, wt, "snapshot.rows")?,
            9 => self.arrows.push(r.message(tag, wt)?),
            10 => self.sequence = r.uint64(tag, wt)?,
            11 => self.timestamp = r.uint64(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// INPUT MESSAGES
// =============================================================================

impl WireMessage for PlaceArrowPayload {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.sint32(1, self.x);
        w.sint32(2, self.y);
        w.uint64(3, self.direction.code());
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.x = r.sint32(tag, wt, "place.x")?,
            2 => self.y = r.sint32(tag, wt, "place.y")?,
            3 => self.direction = read_direction(r, tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for MoveCursorPayload {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.message(1, &self.target);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.target = r.message(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for ActionPayload {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.code);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.code = r.uint32(tag, wt, "action.code")?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for PredictiveInput {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.player_id);
        w.uint64(2, self.sequence);
        w.uint64(3, self.timestamp);
        w.uint32(4, self.input_type.code());
        w.bytes(5, &self.input_data);
        w.opt_float(6, self.prediction_confidence);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.player_id = r.uint32(tag, wt, "input.player_id")?,
            2 => self.sequence = r.uint64(tag, wt)?,
            3 => self.timestamp = r.uint64(tag, wt)?,
            4 => self.input_type = InputKind::from_code(r.uint32(tag, wt, "input.type")?),
            5 => self.input_data = r.bytes(tag, wt)?,
            6 => self.prediction_confidence = Some(r.float(tag, wt)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Server answer to every [`PredictiveInput`].
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct InputAcknowledgment {
    /// Player the input came from
    pub player_id: u32,
    /// Sequence being acknowledged
    pub acknowledged_sequence: u64,
    /// Server timestamp (ms)
    pub timestamp: u64,
    /// Server-side processing time
    pub processing_time_ms: f32,
    /// Accepted for the next tick
    pub accepted: bool,
    /// Why the input was rejected
    pub rejection_reason: Option<String>,
}

impl WireMessage for InputAcknowledgment {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint32(1, self.player_id);
        w.uint64(2, self.acknowledged_sequence);
        w.uint64(3, self.timestamp);
        w.float(4, self.processing_time_ms);
        w.bool(5, self.accepted);
        w.opt_string(6, self.rejection_reason.as_deref());
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.player_id = r.uint32(tag, wt, "ack.player_id")?,
            2 => self.acknowledged_sequence = r.uint64(tag, wt)?,
            3 => self.timestamp = r.uint64(tag, wt)?,
            4 => self.processing_time_ms = r.float(tag, wt)?,
            5 => self.accepted = r.bool(tag, wt)?,
            6 => self.rejection_reason = Some(r.string(tag, wt)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// DELTA
// =============================================================================

/// Tracked player fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PlayerField {
    /// Display name
    Name = 1,
    /// Colour (cosmetic)
    Color = 2,
    /// Score
    Score = 3,
    /// Cursor position
    Cursor = 4,
    /// Ready flag
    Ready = 5,
    /// Connected flag
    Connected = 6,
}

impl PlayerField {
    /// Every tracked field in wire order.
    pub const ALL: [PlayerField; 6] = [
        PlayerField::Name,
        PlayerField::Color,
        PlayerField::Score,
        PlayerField::Cursor,
        PlayerField::Ready,
        PlayerField::Connected,
    ];

    /// Parse from wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| *f as u32 == code)
    }

    /// Cosmetic fields may be dropped by the optimisation pass.
    pub fn is_cosmetic(self) -> bool {
        matches!(self, PlayerField::Color)
    }
}

/// Tracked moving-entity fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EntityField {
    /// Kind and kind data
    Kind = 1,
    /// Position
    Position = 2,
    /// Heading
    Direction = 3,
    /// Speed
    Speed = 4,
    /// Lifecycle status
    Status = 5,
    /// Tint (cosmetic)
    Tint = 6,
}

impl EntityField {
    /// Every tracked field in wire order.
    pub const ALL: [EntityField; 6] = [
        EntityField::Kind,
        EntityField::Position,
        EntityField::Direction,
        EntityField::Speed,
        EntityField::Status,
        EntityField::Tint,
    ];

    /// Parse from wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| *f as u32 == code)
    }

    /// Cosmetic fields may be dropped by the optimisation pass.
    pub fn is_cosmetic(self) -> bool {
        matches!(self, EntityField::Tint)
    }
}

fn read_field_codes<F>(
    r: &mut WireReader<'_>,
    tag: u32,
    wt: WireType,
    field: &'static str,
    parse: fn(u32) -> Option<F>,
    out: &mut Vec<F>,
) -> WireResult<()> {
    let mut codes = Vec::new();
    r.packed_uint32(tag, wt, field, &mut codes)?;
    for code in codes {
        out.push(parse(code).ok_or(ParseError::InvalidEnum { field, value: code as u64 })?);
    }
    Ok(())
}

/// Changed fields of one player.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PlayerPatch {
    /// Fields carried by this patch
    pub changed_fields: Vec<PlayerField>,
    /// Player did not exist in the base
    pub is_new: bool,
    /// New name
    pub name: Option<String>,
    /// New colour
    pub color: Option<u32>,
    /// New score
    pub score: Option<u32>,
    /// New cursor
    pub cursor: Option<Vec2>,
    /// New ready flag
    pub ready: Option<bool>,
    /// New connected flag
    pub connected: Option<bool>,
}

impl WireMessage for PlayerPatch {
    fn encode_fields(&self, w: &mut WireWriter) {
        let codes: Vec<u32> = self.changed_fields.iter().map(|f| *f as u32).collect();
        w.packed_uint32(1, &codes);
        w.bool(2, self.is_new);
        w.opt_string(3, self.name.as_deref());
        w.opt_uint32(4, self.color);
        w.opt_uint32(5, self.score);
        w.opt_message(6, self.cursor.as_ref());
        w.opt_bool(7, self.ready);
        w.opt_bool(8, self.connected);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => read_field_codes(r, tag, wt, "player_patch.fields", PlayerField::from_code, &mut self.changed_fields)?,
            2 => self.is_new = r.bool(tag, wt)?,
            3 => self.name = Some(r.string(tag, wt)?),
            4 => self.color = Some(r.uint32(tag, wt, "player_patch.color")?),
            5 => self.score = Some(r.uint32(tag, wt, "player_patch.score")?),
            6 => self.cursor = Some(r.message(tag, wt)?),
            7 => self.ready = Some(r.bool(tag, wt)?),
            8 => self.connected = Some(r.bool(tag, wt)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Changed fields of one moving entity.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct EntityPatch {
    /// Fields carried by this patch
    pub changed_fields: Vec<EntityField>,
    /// Entity did not exist in the base
    pub is_new: bool,
    /// New kind
    pub kind: Option<EntityKind>,
    /// New position
    pub position: Option<Vec2>,
    /// New heading
    pub direction: Option<Direction>,
    /// New speed
    pub speed: Option<f32>,
    /// New status
    pub status: Option<EntityStatus>,
    /// New tint
    pub tint: Option<u32>,
}

impl WireMessage for EntityPatch {
    fn encode_fields(&self, w: &mut WireWriter) {
        let codes: Vec<u32> = self.changed_fields.iter().map(|f| *f as u32).collect();
        w.packed_uint32(1, &codes);
        w.bool(2, self.is_new);
        w.opt_message(3, self.position.as_ref());
        w.opt_uint64(4, self.direction.map(Direction::code));
        w.opt_float(5, self.speed);
        w.opt_uint64(6, self.status.map(EntityStatus::code));
        w.opt_uint32(7, self.tint);
        if let Some(kind) = &self.kind {
            write_kind(w, kind);
        }
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => read_field_codes(r, tag, wt, "entity_patch.fields", EntityField::from_code, &mut self.changed_fields)?,
            2 => self.is_new = r.bool(tag, wt)?,
            3 => self.position = Some(r.message(tag, wt)?),
            4 => self.direction = Some(read_direction(r, tag, wt)?),
            5 => self.speed = Some(r.float(tag, wt)?),
            6 => self.status = Some(read_status(r, tag, wt)?),
            7 => self.tint = Some(r.uint32(tag, wt, "entity_patch.tint")?),
            8 | 9 => self.kind = merge_kind(tag, wt, r)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Full replacement of the static board layout.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LayoutPatch {
    /// Mode name
    pub name: String,
    /// Walls
    pub walls: Vec<Wall>,
    /// Goals
    pub goals: Vec<Goal>,
}

impl WireMessage for LayoutPatch {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.string(1, &self.name);
        w.messages(2, &self.walls);
        w.messages(3, &self.goals);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.name = r.string(tag, wt)?,
            2 => self.walls.push(r.message(tag, wt)?),
            3 => self.goals.push(r.message(tag, wt)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Described difference between two snapshots.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Delta {
    /// Sequence of the snapshot this applies to
    pub base_sequence: u64,
    /// Sequence of the snapshot this reconstructs
    pub delta_sequence: u64,
    /// Timestamp of the target snapshot
    pub timestamp: u64,
    /// Ids parallel to `changed_players`
    pub changed_player_ids: Vec<u32>,
    /// Player patches
    pub changed_players: Vec<PlayerPatch>,
    /// Ids parallel to `changed_entities`
    pub changed_entity_ids: Vec<u32>,
    /// Entity patches
    pub changed_entities: Vec<EntityPatch>,
    /// `1 - delta_len / full_len`, in [0, 1]
    pub compression_ratio: f32,
    /// Arrows absent from the base
    pub new_arrows: Vec<Arrow>,
    /// Players absent from the target
    pub removed_player_ids: Vec<u32>,
    /// Entities absent from the target
    pub removed_entity_ids: Vec<u32>,
    /// Arrows absent from the target
    pub removed_arrow_ids: Vec<u32>,
    /// Changed started flag
    pub started: Option<bool>,
    /// Changed ready flag
    pub ready: Option<bool>,
    /// Replaced layout
    pub layout: Option<LayoutPatch>,
    /// Replaced board dimensions
    pub board: Option<BoardDims>,
}

impl Delta {
    /// True when nothing but sequencing changed.
    pub fn is_empty(&self) -> bool {
        self.changed_players.is_empty()
            && self.changed_entities.is_empty()
            && self.new_arrows.is_empty()
            && self.removed_player_ids.is_empty()
            && self.removed_entity_ids.is_empty()
            && self.removed_arrow_ids.is_empty()
            && self.started.is_none()
            && self.ready.is_none()
            && self.layout.is_none()
            && self.board.is_none()
    }
}

impl WireMessage for Delta {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint64(1, self.base_sequence);
        w.uint64(2, self.delta_sequence);
        w.uint64(3, self.timestamp);
        w.packed_uint32(4, &self.changed_player_ids);
        w.messages(5, &self.changed_players);
        w.packed_uint32(6, &self.changed_entity_ids);
        w.messages(7, &self.changed_entities);
        w.float(8, self.compression_ratio);
        w.messages(9, &self.new_arrows);
        w.packed_uint32(10, &self.removed_player_ids);
        w.packed_uint32(11, &self.removed_entity_ids);
        w.packed_uint32(12, &self.removed_arrow_ids);
        w.opt_bool(13, self.started);
        w.opt_bool(14, self.ready);
        w.opt_message(15, self.layout.as_ref());
        w.opt_message(16, self.board.as_ref());
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.base_sequence = r.uint64(tag, wt)?,
            2 => self.delta_sequence = r.uint64(tag, wt)?,
            3 => self.timestamp = r.uint64(tag, wt)?,
            4 => r.packed_uint32(tag, wt, "delta.changed_player_ids", &mut self.changed_player_ids)?,
            5 => self.changed_players.push(r.message(tag, wt)?),
            6 => r.packed_uint32(tag, wt, "delta.changed_entity_ids", &mut self.changed_entity_ids)?,
            7 => self.changed_entities.push(r.message(tag, wt)?),
            8 => self.compression_ratio = r.float(tag, wt)?,
            9 => self.new_arrows.push(r.message(tag, wt)?),
            10 => r.packed_uint32(tag, wt, "delta.removed_player_ids", &mut self.removed_player_ids)?,
            11 => r.packed_uint32(tag, wt, "delta.removed_entity_ids", &mut self.removed_entity_ids)?,
            12 => r.packed_uint32(tag, wt, "delta.removed_arrow_ids", &mut self.removed_arrow_ids)?,
            13 => self.started = Some(r.bool(tag, wt)?),
            14 => self.ready = Some(r.bool(tag, wt)?),
            15 => self.layout = Some(r.message(tag, wt)?),
            16 => self.board = Some(r.message(tag, wt)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// ROLLBACK CORRECTION
// =============================================================================

/// Kind of a per-entity correction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CorrectionKind {
    /// Position moved
    #[default]
    Position = 0,
    /// Velocity changed
    Velocity = 1,
    /// Discrete state differs (direction, status)
    State = 2,
    /// Entity exists but was predicted absent
    Creation = 3,
    /// Entity was predicted but does not exist
    Deletion = 4,
}

impl CorrectionKind {
    /// Parse from wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(CorrectionKind::Position),
            1 => Some(CorrectionKind::Velocity),
            2 => Some(CorrectionKind::State),
            3 => Some(CorrectionKind::Creation),
            4 => Some(CorrectionKind::Deletion),
            _ => None,
        }
    }

    /// Whether the correction moves something continuously.
    pub fn is_positional(self) -> bool {
        matches!(self, CorrectionKind::Position | CorrectionKind::Velocity)
    }
}

/// One entity's correction on the wire.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CorrectionRecord {
    /// Corrected entity
    pub entity: EntityRef,
    /// Correction kind
    pub kind: CorrectionKind,
    /// Value the client held
    pub previous: Option<Vec2>,
    /// Authoritative value
    pub corrected: Option<Vec2>,
    /// Confidence in the corrected value
    pub confidence: f32,
}

impl WireMessage for CorrectionRecord {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint64(1, self.entity.kind_code());
        w.uint32(2, self.entity.id());
        w.uint64(3, self.kind as u64);
        w.opt_message(4, self.previous.as_ref());
        w.opt_message(5, self.corrected.as_ref());
        w.float(6, self.confidence);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => {
                let value = r.uint64(tag, wt)?;
                self.entity = EntityRef::from_parts(value, self.entity.id())
                    .ok_or(ParseError::InvalidEnum { field: "correction.target", value })?;
            }
            2 => {
                let id = r.uint32(tag, wt, "correction.id")?;
                self.entity = EntityRef::from_parts(self.entity.kind_code(), id)
                    .ok_or(ParseError::InvalidEnum { field: "correction.target", value: self.entity.kind_code() })?;
            }
            3 => {
                let value = r.uint64(tag, wt)?;
                self.kind = CorrectionKind::from_code(value)
                    .ok_or(ParseError::InvalidEnum { field: "correction.kind", value })?;
            }
            4 => self.previous = Some(r.message(tag, wt)?),
            5 => self.corrected = Some(r.message(tag, wt)?),
            6 => self.confidence = r.float(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Server- or client-originated correction batch.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RollbackCorrection {
    /// Correction identifier
    pub correction_id: u64,
    /// Authoritative sequence the correction targets
    pub rollback_to_sequence: u64,
    /// Timestamp (ms)
    pub timestamp: u64,
    /// Players whose predictions are affected
    pub affected_player_ids: Vec<u32>,
    /// Per-entity corrections
    pub corrections: Vec<CorrectionRecord>,
    /// Interpolation priority
    pub priority: u32,
    /// Smoothing duration
    pub smoothing_duration_ms: u32,
}

impl WireMessage for RollbackCorrection {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint64(1, self.correction_id);
        w.uint64(2, self.rollback_to_sequence);
        w.uint64(3, self.timestamp);
        w.packed_uint32(4, &self.affected_player_ids);
        w.messages(5, &self.corrections);
        w.uint32(6, self.priority);
        w.uint32(7, self.smoothing_duration_ms);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.correction_id = r.uint64(tag, wt)?,
            2 => self.rollback_to_sequence = r.uint64(tag, wt)?,
            3 => self.timestamp = r.uint64(tag, wt)?,
            4 => r.packed_uint32(tag, wt, "correction.affected", &mut self.affected_player_ids)?,
            5 => self.corrections.push(r.message(tag, wt)?),
            6 => self.priority = r.uint32(tag, wt, "correction.priority")?,
            7 => self.smoothing_duration_ms = r.uint32(tag, wt, "correction.smoothing")?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// PERFORMANCE METRICS
// =============================================================================

/// Composite telemetry sample.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Sample time (ms)
    pub timestamp: u64,
    /// Current tick rate (Hz)
    pub tick_rate: f32,
    /// Mean server tick duration
    pub avg_tick_ms: f32,
    /// Players in the match
    pub player_count: u32,
    /// Moving entities on the board
    pub entity_count: u32,
    /// Bytes broadcast so far
    pub bytes_sent: u64,
    /// Mean delta compression ratio
    pub compression_ratio_avg: f32,
    /// Fraction of predictions confirmed within threshold
    pub prediction_accuracy: f32,
    /// Corrections applied
    pub rollback_count: u64,
    /// Mean correction error
    pub avg_rollback_error: f32,
    /// Active interpolation tasks
    pub interpolation_tasks: u32,
    /// Snapshots buffered
    pub snapshot_buffer_len: u32,
    /// Estimated one-way latency
    pub latency_ms: f32,
    /// Last render frame time
    pub frame_time_ms: f32,
    /// Snapshots discarded as stale or evicted
    pub dropped_snapshots: u64,
    /// Simulation faults so far
    pub simulation_faults: u64,
}

impl WireMessage for PerformanceMetrics {
    fn encode_fields(&self, w: &mut WireWriter) {
        w.uint64(1, self.timestamp);
        w.float(2, self.tick_rate);
        w.float(3, self.avg_tick_ms);
        w.uint32(4, self.player_count);
        w.uint32(5, self.entity_count);
        w.uint64(6, self.bytes_sent);
        w.float(7, self.compression_ratio_avg);
        w.float(8, self.prediction_accuracy);
        w.uint64(9, self.rollback_count);
        w.float(10, self.avg_rollback_error);
        w.uint32(11, self.interpolation_tasks);
        w.uint32(12, self.snapshot_buffer_len);
        w.float(13, self.latency_ms);
        w.float(14, self.frame_time_ms);
        w.uint64(15, self.dropped_snapshots);
        w.uint64(16, self.simulation_faults);
    }

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        match tag {
            1 => self.timestamp = r.uint64(tag, wt)?,
            2 => self.tick_rate = r.float(tag, wt)?,
            3 => self.avg_tick_ms = r.float(tag, wt)?,
            4 => self.player_count = r.uint32(tag, wt, "metrics.player_count")?,
            5 => self.entity_count = r.uint32(tag, wt, "metrics.entity_count")?,
            6 => self.bytes_sent = r.uint64(tag, wt)?,
            7 => self.compression_ratio_avg = r.float(tag, wt)?,
            8 => self.prediction_accuracy = r.float(tag, wt)?,
            9 => self.rollback_count = r.uint64(tag, wt)?,
            10 => self.avg_rollback_error = r.float(tag, wt)?,
            11 => self.interpolation_tasks = r.uint32(tag, wt, "metrics.interpolation_tasks")?,
            12 => self.snapshot_buffer_len = r.uint32(tag, wt, "metrics.snapshot_buffer_len")?,
            13 => self.latency_ms = r.float(tag, wt)?,
            14 => self.frame_time_ms = r.float(tag, wt)?,
            15 => self.dropped_snapshots = r.uint64(tag, wt)?,
            16 => self.simulation_faults = r.uint64(tag, wt)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Envelope message type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Full snapshot
    Snapshot = 1,
    /// Delta against a keyframe
    Delta = 2,
    /// Client input
    PredictiveInput = 3,
    /// Correction batch
    RollbackCorrection = 4,
    /// Input acknowledgment
    InputAcknowledgment = 5,
    /// Telemetry
    PerformanceMetrics = 6,
}

impl MessageType {
    /// Field tag of this type's payload inside the envelope.
    pub fn payload_tag(self) -> u32 {
        9 + self as u32
    }
}

/// Exactly one message of the catalogue.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Full snapshot
    Snapshot(Snapshot),
    /// Delta
    Delta(Delta),
    /// Client input
    Input(PredictiveInput),
    /// Correction batch
    Correction(RollbackCorrection),
    /// Input acknowledgment
    Ack(InputAcknowledgment),
    /// Telemetry
    Metrics(PerformanceMetrics),
}

impl Payload {
    /// Message type of this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Snapshot(_) => MessageType::Snapshot,
            Payload::Delta(_) => MessageType::Delta,
            Payload::Input(_) => MessageType::PredictiveInput,
            Payload::Correction(_) => MessageType::RollbackCorrection,
            Payload::Ack(_) => MessageType::InputAcknowledgment,
            Payload::Metrics(_) => MessageType::PerformanceMetrics,
        }
    }
}

/// Top-level framed message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Producer sequence
    pub sequence: u64,
    /// Producer timestamp (ms)
    pub timestamp: u64,
    /// The message
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload.
    pub fn new(sequence: u64, timestamp: u64, payload: Payload) -> Self {
        Self { sequence, timestamp, payload }
    }

    /// Message type of the payload.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    fn encode_into(&self, w: &mut WireWriter) {
        let message_type = self.message_type();
        w.uint64(1, message_type as u64);
        w.uint64(2, self.sequence);
        w.uint64(3, self.timestamp);
        let tag = message_type.payload_tag();
        match &self.payload {
            Payload::Snapshot(m) => w.message(tag, m),
            Payload::Delta(m) => w.message(tag, m),
            Payload::Input(m) => w.message(tag, m),
            Payload::Correction(m) => w.message(tag, m),
            Payload::Ack(m) => w.message(tag, m),
            Payload::Metrics(m) => w.message(tag, m),
        }
    }

    /// Encode to a frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut w = WireWriter::new();
        self.encode_into(&mut w);
        w.into_bytes()
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut w = WireWriter::new();
        self.encode_into(&mut w);
        w.len()
    }

    /// Decode a frame. Fails unless exactly one payload matching the
    /// declared type is present.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let raw = RawEnvelope::decode(data)?;
        let payload = raw.payload.ok_or(ParseError::MissingPayload)?;
        if raw.message_type != payload.message_type() as u64 {
            return Err(ParseError::PayloadMismatch { declared: raw.message_type });
        }
        Ok(Self {
            sequence: raw.sequence,
            timestamp: raw.timestamp,
            payload,
        })
    }
}

#[derive(Default)]
struct RawEnvelope {
    message_type: u64,
    sequence: u64,
    timestamp: u64,
    payload: Option<Payload>,
}

impl WireMessage for RawEnvelope {
    fn encode_fields(&self, _w: &mut WireWriter) {}

    fn merge_field(&mut self, tag: u32, wt: WireType, r: &mut WireReader<'_>) -> WireResult<bool> {
        let payload = match tag {
            1 => {
                self.message_type = r.uint64(tag, wt)?;
                return Ok(true);
            }
            2 => {
                self.sequence = r.uint64(tag, wt)?;
                return Ok(true);
            }
            3 => {
                self.timestamp = r.uint64(tag, wt)?;
                return Ok(true);
            }
            10 => Payload::Snapshot(r.message(tag, wt)?),
            11 => Payload::Delta(r.message(tag, wt)?),
            12 => Payload::Input(r.message(tag, wt)?),
            13 => Payload::Correction(r.message(tag, wt)?),
            14 => Payload::Ack(r.message(tag, wt)?),
            15 => Payload::Metrics(r.message(tag, wt)?),
            _ => return Ok(false),
        };
        if self.payload.is_some() {
            return Err(ParseError::MultiplePayloads);
        }
        self.payload = Some(payload);
        Ok(true)
    }
}

// =============================================================================
// TESTS
// =============================================================================
