//! Game State Definitions
//!
//! The authoritative [`Snapshot`] and everything it contains. A snapshot is a
//! value: once stamped by the server it is never mutated, only replaced.
//! Lists are kept sorted by id so that equal worlds compare equal.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::vec2::Vec2;

/// Player identifier.
pub type PlayerId = u32;

/// Moving entity (mouse or cat) identifier.
pub type EntityId = u32;

/// Arrow identifier.
pub type ArrowId = u32;

/// Snapshot sequence number. Strictly increasing per producer.
pub type Sequence = u64;

// =============================================================================
// DIRECTION
// =============================================================================

/// Grid direction. Rows grow downward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Toward row 0
    #[default]
    Up = 0,
    /// Toward the last column
    Right = 1,
    /// Toward the last row
    Down = 2,
    /// Toward column 0
    Left = 3,
}

impl Direction {
    /// All directions, clockwise from Up.
    pub const ALL: [Direction; 4] = [Direction::Up, Direction::Right, Direction::Down, Direction::Left];

    /// Unit step for this direction.
    pub fn to_vec(self) -> Vec2 {
        match self {
            Direction::Up => Vec2::new(0.0, -1.0),
            Direction::Right => Vec2::new(1.0, 0.0),
            Direction::Down => Vec2::new(0.0, 1.0),
            Direction::Left => Vec2::new(-1.0, 0.0),
        }
    }

    /// Rotate 90 degrees clockwise.
    pub fn turn_right(self) -> Self {
        Self::ALL[(self as usize + 1) % 4]
    }

    /// Reverse direction.
    pub fn opposite(self) -> Self {
        Self::ALL[(self as usize + 2) % 4]
    }

    /// Wire code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Parse from wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0..=3 => Some(Self::ALL[code as usize]),
            _ => None,
        }
    }
}

// =============================================================================
// ENTITY REFERENCE
// =============================================================================

/// Identity of anything that can be predicted, corrected or interpolated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    /// A player's cursor
    Player(PlayerId),
    /// A mouse or cat
    Entity(EntityId),
    /// A placed arrow
    Arrow(ArrowId),
}

impl EntityRef {
    /// Wire code for the reference kind.
    pub fn kind_code(self) -> u64 {
        match self {
            EntityRef::Player(_) => 0,
            EntityRef::Entity(_) => 1,
            EntityRef::Arrow(_) => 2,
        }
    }

    /// Raw id regardless of kind.
    pub fn id(self) -> u32 {
        match self {
            EntityRef::Player(id) | EntityRef::Entity(id) | EntityRef::Arrow(id) => id,
        }
    }

    /// Build from wire code and id.
    pub fn from_parts(kind: u64, id: u32) -> Option<Self> {
        match kind {
            0 => Some(EntityRef::Player(id)),
            1 => Some(EntityRef::Entity(id)),
            2 => Some(EntityRef::Arrow(id)),
            _ => None,
        }
    }
}

impl Default for EntityRef {
    fn default() -> Self {
        EntityRef::Player(0)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Player(id) => write!(f, "player#{}", id),
            EntityRef::Entity(id) => write!(f, "entity#{}", id),
            EntityRef::Arrow(id) => write!(f, "arrow#{}", id),
        }
    }
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// State of a single player.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerState {
    /// Unique player ID
    pub id: PlayerId,
    /// Display name
    pub name: String,
    /// Cosmetic colour (RGBA)
    pub color: u32,
    /// Mice delivered minus cat penalties
    pub score: u32,
    /// Cursor position in board space
    pub cursor: Vec2,
    /// Ready in lobby
    pub ready: bool,
    /// Currently connected
    pub connected: bool,
}

impl PlayerState {
    /// Create a connected player with a name.
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            connected: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// MOVING ENTITIES
// =============================================================================

/// Mouse-specific data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MouseData {
    /// Golden mice are worth more
    pub golden: bool,
}

/// Cat-specific data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatData {
    /// Arrows this cat has destroyed
    pub bites: u32,
}

/// Entity kind with kind-specific data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    /// A mouse
    Mouse(MouseData),
    /// A cat
    Cat(CatData),
}

impl EntityKind {
    /// True for cats.
    pub fn is_cat(&self) -> bool {
        matches!(self, EntityKind::Cat(_))
    }
}

impl Default for EntityKind {
    fn default() -> Self {
        EntityKind::Mouse(MouseData::default())
    }
}

/// Entity lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityStatus {
    /// Walking the board
    #[default]
    Active = 0,
    /// Fell off the board
    Falling = 1,
    /// Reached a goal
    Captured = 2,
}

impl EntityStatus {
    /// Wire code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Parse from wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(EntityStatus::Active),
            1 => Some(EntityStatus::Falling),
            2 => Some(EntityStatus::Captured),
            _ => None,
        }
    }
}

/// A mouse or cat.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MovingEntity {
    /// Unique entity ID
    pub id: EntityId,
    /// Kind and kind-specific data
    pub kind: EntityKind,
    /// Board position
    pub position: Vec2,
    /// Heading
    pub direction: Direction,
    /// Cells per tick
    pub speed: f32,
    /// Lifecycle status
    pub status: EntityStatus,
    /// Cosmetic tint
    pub tint: u32,
}

impl MovingEntity {
    /// Create an active entity.
    pub fn new(id: EntityId, kind: EntityKind, position: Vec2, direction: Direction, speed: f32) -> Self {
        Self {
            id,
            kind,
            position,
            direction,
            speed,
            status: EntityStatus::Active,
            tint: 0,
        }
    }

    /// Velocity in cells per tick.
    pub fn velocity(&self) -> Vec2 {
        self.direction.to_vec().scale(self.speed)
    }
}

// =============================================================================
// STATIC BOARD ITEMS
// =============================================================================

/// Player-placed directional arrow.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Arrow {
    /// Unique arrow ID
    pub id: ArrowId,
    /// Owning player
    pub owner: PlayerId,
    /// Cell column
    pub x: u32,
    /// Cell row
    pub y: u32,
    /// Direction creatures are turned to
    pub direction: Direction,
    /// Tick the arrow was placed
    pub placed_at: u64,
    /// Sequence of the input that placed it
    pub input_sequence: u64,
}

impl Arrow {
    /// Cell position as a vector.
    pub fn position(&self) -> Vec2 {
        Vec2::from_cell(self.x, self.y)
    }
}

/// Wall on one side of a cell.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Wall {
    /// Cell column
    pub x: u32,
    /// Cell row
    pub y: u32,
    /// Blocked side
    pub side: Direction,
}

/// Goal cell owned by a player.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Goal {
    /// Cell column
    pub x: u32,
    /// Cell row
    pub y: u32,
    /// Owning player
    pub owner: PlayerId,
}

/// Board contents for the current mode.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Strategy {
    /// Mode name
    pub name: String,
    /// Mice on the board
    pub mice: Vec<MovingEntity>,
    /// Cats on the board
    pub cats: Vec<MovingEntity>,
    /// Walls
    pub walls: Vec<Wall>,
    /// Goals
    pub goals: Vec<Goal>,
}

/// Board dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoardDims {
    /// Pixel width
    pub width: u32,
    /// Pixel height
    pub height: u32,
    /// Cell columns
    pub cols: u32,
    /// Cell rows
    pub rows: u32,
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Complete authoritative state at one tick.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tick sequence number
    pub sequence: Sequence,
    /// Wall-clock stamp (ms)
    pub timestamp: u64,
    /// Pixel width
    pub width: u32,
    /// Pixel height
    pub height: u32,
    /// Cell columns
    pub cols: u32,
    /// Cell rows
    pub rows: u32,
    /// Match started
    pub started: bool,
    /// All players ready
    pub ready: bool,
    /// Players, sorted by id
    pub players: Vec<PlayerState>,
    /// Board contents
    pub strategy: Strategy,
    /// Placed arrows, sorted by id
    pub arrows: Vec<Arrow>,
}

impl Snapshot {
    /// Pixels per cell used for board dimensions.
    pub const CELL_PIXELS: u32 = 32;

    /// Create an empty board.
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            width: cols * Self::CELL_PIXELS,
            height: rows * Self::CELL_PIXELS,
            cols,
            rows,
            ..Default::default()
        }
    }

    /// Sort all id-keyed lists. Emitted snapshots are always normalized.
    pub fn normalize(&mut self) {
        self.players.sort_by_key(|p| p.id);
        self.strategy.mice.sort_by_key(|e| e.id);
        self.strategy.cats.sort_by_key(|e| e.id);
        self.arrows.sort_by_key(|a| a.id);
    }

    /// Board dimensions.
    pub fn dims(&self) -> BoardDims {
        BoardDims {
            width: self.width,
            height: self.height,
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Set board dimensions.
    pub fn set_dims(&mut self, dims: BoardDims) {
        self.width = dims.width;
        self.height = dims.height;
        self.cols = dims.cols;
        self.rows = dims.rows;
    }

    /// Lower and upper corners of the board in cell space.
    pub fn bounds(&self) -> (Vec2, Vec2) {
        let max_x = self.cols.saturating_sub(1) as f32;
        let max_y = self.rows.saturating_sub(1) as f32;
        (Vec2::ZERO, Vec2::new(max_x, max_y))
    }

    /// Check a signed cell coordinate is on the board.
    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.cols as i64 && y < self.rows as i64
    }

    /// Get player by ID.
    pub fn player(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Get mutable player by ID.
    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    /// All moving entities, mice first.
    pub fn entities(&self) -> impl Iterator<Item = &MovingEntity> {
        self.strategy.mice.iter().chain(self.strategy.cats.iter())
    }

    /// All moving entities, mutable.
    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut MovingEntity> {
        self.strategy.mice.iter_mut().chain(self.strategy.cats.iter_mut())
    }

    /// Get moving entity by ID.
    pub fn entity(&self, id: EntityId) -> Option<&MovingEntity> {
        self.entities().find(|e| e.id == id)
    }

    /// Get mutable moving entity by ID.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut MovingEntity> {
        self.entities_mut().find(|e| e.id == id)
    }

    /// Number of moving entities.
    pub fn entity_count(&self) -> usize {
        self.strategy.mice.len() + self.strategy.cats.len()
    }

    /// Get arrow by ID.
    pub fn arrow(&self, id: ArrowId) -> Option<&Arrow> {
        self.arrows.iter().find(|a| a.id == id)
    }

    /// Arrow occupying a cell.
    pub fn arrow_at(&self, x: u32, y: u32) -> Option<&Arrow> {
        self.arrows.iter().find(|a| a.x == x && a.y == y)
    }

    /// Goal occupying a cell.
    pub fn goal_at(&self, x: u32, y: u32) -> Option<&Goal> {
        self.strategy.goals.iter().find(|g| g.x == x && g.y == y)
    }

    /// Whether a wall blocks leaving cell (x, y) toward `side`.
    pub fn wall_blocks(&self, x: u32, y: u32, side: Direction) -> bool {
        let blocked_here = self.strategy.walls.iter().any(|w| w.x == x && w.y == y && w.side == side);
        if blocked_here {
            return true;
        }
        // The same wall seen from the neighbouring cell
        let step = side.to_vec();
        let nx = x as i64 + step.x as i64;
        let ny = y as i64 + step.y as i64;
        if nx < 0 || ny < 0 {
            return false;
        }
        let opposite = side.opposite();
        self.strategy.walls.iter().any(|w| w.x as i64 == nx && w.y as i64 == ny && w.side == opposite)
    }

    /// Whether a cell holds a wall segment of any side.
    pub fn has_wall(&self, x: u32, y: u32) -> bool {
        self.strategy.walls.iter().any(|w| w.x == x && w.y == y)
    }

    /// Whether a cell holds an arrow or a goal.
    pub fn is_occupied(&self, x: u32, y: u32) -> bool {
        self.arrow_at(x, y).is_some() || self.goal_at(x, y).is_some()
    }

    /// Position of any referenced thing.
    pub fn position_of(&self, entity: EntityRef) -> Option<Vec2> {
        match entity {
            EntityRef::Player(id) => self.player(id).map(|p| p.cursor),
            EntityRef::Entity(id) => self.entity(id).map(|e| e.position),
            EntityRef::Arrow(id) => self.arrow(id).map(Arrow::position),
        }
    }

    /// Overwrite the position of a referenced player cursor or entity.
    /// Arrows are cell-aligned and never moved. Returns false if absent.
    pub fn set_position(&mut self, entity: EntityRef, position: Vec2) -> bool {
        match entity {
            EntityRef::Player(id) => self.player_mut(id).map(|p| p.cursor = position).is_some(),
            EntityRef::Entity(id) => self.entity_mut(id).map(|e| e.position = position).is_some(),
            EntityRef::Arrow(_) => false,
        }
    }

    /// Whether a referenced thing exists in this snapshot.
    pub fn contains(&self, entity: EntityRef) -> bool {
        self.position_of(entity).is_some()
    }
}

// =============================================================================
// TESTS
// =============================================================================
