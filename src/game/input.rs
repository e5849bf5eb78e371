//! Player Input
//!
//! Inputs travel as [`PredictiveInput`] envelopes whose `input_data` carries a
//! typed payload sub-message. The payload is decoded lazily so that a server
//! can acknowledge (and reject) inputs it cannot interpret.

use bytes::Bytes;
use serde::{Serialize, Deserialize};

use crate::core::time::Millis;
use crate::core::vec2::Vec2;
use crate::error::ParseError;
use crate::game::state::{Direction, PlayerId};
use crate::network::wire::WireMessage;

// =============================================================================
// INPUT KINDS
// =============================================================================

/// Kind of a player input. Unknown codes are preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputKind {
    /// Place an arrow on a cell
    PlaceArrow,
    /// Move the player cursor
    MoveCursor,
    /// Phase action (ready, clear arrows, emote)
    Action,
    /// Unrecognised kind
    Other(u32),
}

impl InputKind {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            InputKind::PlaceArrow => 1,
            InputKind::MoveCursor => 2,
            InputKind::Action => 3,
            InputKind::Other(code) => code,
        }
    }

    /// Parse from wire code.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => InputKind::PlaceArrow,
            2 => InputKind::MoveCursor,
            3 => InputKind::Action,
            other => InputKind::Other(other),
        }
    }
}

impl Default for InputKind {
    fn default() -> Self {
        InputKind::Other(0)
    }
}

/// Well-known action codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ActionCode {
    /// Toggle ready in the lobby
    Ready = 1,
    /// Remove all of the player's arrows
    ClearArrows = 2,
    /// Cosmetic emote, allowed in any phase
    Emote = 3,
}

impl ActionCode {
    /// Parse from wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ActionCode::Ready),
            2 => Some(ActionCode::ClearArrows),
            3 => Some(ActionCode::Emote),
            _ => None,
        }
    }

    /// Whether the action is legal in the given phase.
    pub fn is_legal(self, started: bool) -> bool {
        match self {
            ActionCode::Ready => !started,
            ActionCode::ClearArrows => started,
            ActionCode::Emote => true,
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Arrow placement on a cell. Coordinates are signed so that off-board
/// requests survive decoding and can be rejected explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PlaceArrowPayload {
    /// Column
    pub x: i32,
    /// Row
    pub y: i32,
    /// Arrow direction
    pub direction: Direction,
}

/// Cursor move target.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MoveCursorPayload {
    /// Target position in board space
    pub target: Vec2,
}

/// Phase action. The raw code is kept so that unknown actions can be reported.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ActionPayload {
    /// Action code
    pub code: u32,
}

impl ActionPayload {
    /// Known action, if any.
    pub fn action(&self) -> Option<ActionCode> {
        ActionCode::from_code(self.code)
    }
}

/// Decoded input payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InputPayload {
    /// Arrow placement
    PlaceArrow(PlaceArrowPayload),
    /// Cursor movement
    MoveCursor(MoveCursorPayload),
    /// Phase action
    Action(ActionPayload),
}

// =============================================================================
// PREDICTIVE INPUT
// =============================================================================

/// A player input as sent to the server.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PredictiveInput {
    /// Sending player
    pub player_id: PlayerId,
    /// Per-player monotonic sequence
    pub sequence: u64,
    /// Client timestamp (ms)
    pub timestamp: Millis,
    /// Input kind
    pub input_type: InputKind,
    /// Encoded payload sub-message
    pub input_data: Bytes,
    /// Client-side prediction confidence
    pub prediction_confidence: Option<f32>,
}

impl PredictiveInput {
    /// Build an input from a typed payload.
    pub fn new(player_id: PlayerId, sequence: u64, timestamp: Millis, payload: &InputPayload) -> Self {
        let (input_type, input_data) = match payload {
            InputPayload::PlaceArrow(p) => (InputKind::PlaceArrow, p.encode_to_bytes()),
            InputPayload::MoveCursor(p) => (InputKind::MoveCursor, p.encode_to_bytes()),
            InputPayload::Action(p) => (InputKind::Action, p.encode_to_bytes()),
        };
        Self {
            player_id,
            sequence,
            timestamp,
            input_type,
            input_data,
            prediction_confidence: None,
        }
    }

    /// Arrow placement input.
    pub fn place_arrow(player_id: PlayerId, sequence: u64, timestamp: Millis, x: i32, y: i32, direction: Direction) -> Self {
        Self::new(
            player_id,
            sequence,
            timestamp,
            &InputPayload::PlaceArrow(PlaceArrowPayload { x, y, direction }),
        )
    }

    /// Cursor movement input.
    pub fn move_cursor(player_id: PlayerId, sequence: u64, timestamp: Millis, target: Vec2) -> Self {
        Self::new(
            player_id,
            sequence,
            timestamp,
            &InputPayload::MoveCursor(MoveCursorPayload { target }),
        )
    }

    /// Action input.
    pub fn action(player_id: PlayerId, sequence: u64, timestamp: Millis, code: u32) -> Self {
        Self::new(player_id, sequence, timestamp, &InputPayload::Action(ActionPayload { code }))
    }

    /// Decode the payload according to `input_type`.
    ///
    /// Returns `Ok(None)` for unknown kinds.
    pub fn payload(&self) -> Result<Option<InputPayload>, ParseError> {
        let payload = match self.input_type {
            InputKind::PlaceArrow => InputPayload::PlaceArrow(PlaceArrowPayload::decode(&self.input_data)?),
            InputKind::MoveCursor => InputPayload::MoveCursor(MoveCursorPayload::decode(&self.input_data)?),
            InputKind::Action => InputPayload::Action(ActionPayload::decode(&self.input_data)?),
            InputKind::Other(_) => return Ok(None),
        };
        Ok(Some(payload))
    }
}

// =============================================================================
// INPUT LOG
// =============================================================================

/// Bounded log of one player's inputs, ordered by sequence.
///
/// Used to pick the inputs to replay after a rollback.
#[derive(Clone, Debug)]
pub struct InputLog {
    /// Player identifier
    pub player_id: PlayerId,
    inputs: Vec<PredictiveInput>,
    capacity: usize,
}

impl InputLog {
    /// Create an empty log.
    pub fn new(player_id: PlayerId, capacity: usize) -> Self {
        Self {
            player_id,
            inputs: Vec::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    /// Record an input, keeping sequence order. Duplicates replace the
    /// previous entry.
    pub fn record(&mut self, input: PredictiveInput) {
        let idx = self.inputs.partition_point(|i| i.sequence < input.sequence);
        if self.inputs.get(idx).map(|i| i.sequence) == Some(input.sequence) {
            self.inputs[idx] = input;
        } else {
            self.inputs.insert(idx, input);
        }
        if self.inputs.len() > self.capacity {
            let excess = self.inputs.len() - self.capacity;
            self.inputs.drain(..excess);
        }
    }

    /// Remove an input by sequence.
    pub fn remove(&mut self, sequence: u64) -> Option<PredictiveInput> {
        let idx = self.inputs.partition_point(|i| i.sequence < sequence);
        if self.inputs.get(idx).map(|i| i.sequence) == Some(sequence) {
            Some(self.inputs.remove(idx))
        } else {
            None
        }
    }

    /// Drop every input with sequence at or below `sequence`.
    pub fn truncate_through(&mut self, sequence: u64) {
        let idx = self.inputs.partition_point(|i| i.sequence <= sequence);
        self.inputs.drain(..idx);
    }

    /// Inputs with sequence strictly greater than `sequence`.
    pub fn after(&self, sequence: u64) -> &[PredictiveInput] {
        let idx = self.inputs.partition_point(|i| i.sequence <= sequence);
        &self.inputs[idx..]
    }

    /// The most recent `n` inputs, oldest first.
    pub fn last_n(&self, n: usize) -> &[PredictiveInput] {
        let start = self.inputs.len().saturating_sub(n);
        &self.inputs[start..]
    }

    /// Highest recorded sequence.
    pub fn last_sequence(&self) -> Option<u64> {
        self.inputs.last().map(|i| i.sequence)
    }

    /// Number of inputs held.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Check if log is empty.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(InputKind::from_code(1), InputKind::PlaceArrow);
        assert_eq!(InputKind::from_code(42), InputKind::Other(42));
        assert_eq!(InputKind::Other(42).code(), 42);
    }

    #[test]
    fn test_payload_decodes_by_kind() {
        let input = PredictiveInput::place_arrow(1, 4, 100, 12, 8, Direction::Left);
        assert_eq!(input.input_type, InputKind::PlaceArrow);
        match input.payload().unwrap() {
            Some(InputPayload::PlaceArrow(p)) => {
                assert_eq!((p.x, p.y, p.direction), (12, 8, Direction::Left));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_has_no_payload() {
        let input = PredictiveInput {
            input_type: InputKind::Other(9),
            ..Default::default()
        };
        assert_eq!(input.payload().unwrap(), None);
    }

    #[test]
    fn test_malformed_payload() {
        let input = PredictiveInput {
            input_type: InputKind::MoveCursor,
            input_data: Bytes::from_static(&[0x0d, 0x00]),
            ..Default::default()
        };
        assert!(input.payload().is_err());
    }

    #[test]
    fn test_action_legality() {
        assert!(ActionCode::Ready.is_legal(false));
        assert!(!ActionCode::Ready.is_legal(true));
        assert!(ActionCode::ClearArrows.is_legal(true));
        assert!(ActionCode::Emote.is_legal(false));
    }

    #[test]
    fn test_input_log_order_and_capacity() {
        let mut log = InputLog::new(1, 3);
        for seq in [3u64, 1, 2, 5, 4] {
            log.record(PredictiveInput::action(1, seq, seq * 10, 3));
        }
        let seqs: Vec<_> = log.last_n(10).iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        assert_eq!(log.after(3).len(), 2);
        log.truncate_through(4);
        assert_eq!(log.last_sequence(), Some(5));
        assert_eq!(log.len(), 1);
        assert!(log.remove(5).is_some());
        assert!(log.is_empty());
    }
}
