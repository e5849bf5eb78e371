//! Input Intake
//!
//! Validates client inputs before they reach the simulation. Every input is
//! answered with an [`InputAcknowledgment`], accepted or not, so clients can
//! retract predictions for rejected inputs.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::time::Millis;
use crate::error::ValidationError;
use crate::game::events::{NetcodeEvent, SharedSink};
use crate::game::input::{InputKind, InputPayload, PredictiveInput};
use crate::game::state::{PlayerId, Snapshot};
use crate::network::protocol::InputAcknowledgment;

/// Intake configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Maximum players admitted.
    pub max_players: usize,
    /// Maximum inputs waiting for the next tick.
    pub max_queued_inputs: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_players: 16,
            max_queued_inputs: 256,
        }
    }
}

/// Player admission errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No room for another player
    #[error("Session is full")]
    SessionFull,
    /// Player already admitted
    #[error("Player {0} already in session")]
    AlreadyInSession(PlayerId),
}

/// Per-player intake state.
#[derive(Debug, Clone, Default)]
pub struct SessionPlayer {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Last accepted input sequence.
    pub last_sequence: u64,
    /// Inputs accepted so far.
    pub accepted: u64,
    /// Inputs rejected so far.
    pub rejected: u64,
}

/// Validates and queues inputs for the tick loop.
pub struct InputIntake {
    config: IntakeConfig,
    players: BTreeMap<PlayerId, SessionPlayer>,
    queue: Vec<PredictiveInput>,
    sink: SharedSink,
}

impl InputIntake {
    /// Create an intake.
    pub fn new(config: IntakeConfig, sink: SharedSink) -> Self {
        Self {
            config,
            players: BTreeMap::new(),
            queue: Vec::new(),
            sink,
        }
    }

    /// Admit a player.
    pub fn add_player(&mut self, player_id: PlayerId) -> Result<(), SessionError> {
        if self.players.contains_key(&player_id) {
            return Err(SessionError::AlreadyInSession(player_id));
        }
        if self.players.len() >= self.config.max_players {
            return Err(SessionError::SessionFull);
        }
        self.players.insert(
            player_id,
            SessionPlayer {
                player_id,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Remove a player and any inputs it has queued.
    pub fn remove_player(&mut self, player_id: PlayerId) -> bool {
        self.queue.retain(|i| i.player_id != player_id);
        self.players.remove(&player_id).is_some()
    }

    /// Intake state for a player.
    pub fn player(&self, player_id: PlayerId) -> Option<&SessionPlayer> {
        self.players.get(&player_id)
    }

    /// Number of admitted players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Check an input against the current board without side effects.
    pub fn validate(&self, input: &PredictiveInput, board: &Snapshot) -> Result<(), ValidationError> {
        let player = self
            .players
            .get(&input.player_id)
            .ok_or(ValidationError::UnknownPlayer(input.player_id))?;

        if input.sequence <= player.last_sequence {
            return Err(ValidationError::StaleSequence {
                last: player.last_sequence,
                got: input.sequence,
            });
        }

        if let InputKind::Other(code) = input.input_type {
            return Err(ValidationError::UnsupportedInput(code));
        }

        match input.payload()? {
            Some(InputPayload::PlaceArrow(place)) => {
                if !board.in_bounds(place.x as i64, place.y as i64) {
                    return Err(ValidationError::OutOfBounds {
                        x: place.x as i64,
                        y: place.y as i64,
                    });
                }
            }
            Some(InputPayload::MoveCursor(mv)) => {
                let (x, y) = mv.target.to_cell();
                if !mv.target.is_finite() || !board.in_bounds(x, y) {
                    return Err(ValidationError::OutOfBounds { x, y });
                }
            }
            Some(InputPayload::Action(action)) => {
                if action.action().is_none() {
                    return Err(ValidationError::UnsupportedAction(action.code));
                }
            }
            None => return Err(ValidationError::UnsupportedInput(input.input_type.code())),
        }

        if self.queue.len() >= self.config.max_queued_inputs {
            return Err(ValidationError::QueueFull);
        }
        Ok(())
    }

    /// Validate, queue if accepted, and build the acknowledgment.
    pub fn submit(&mut self, input: PredictiveInput, board: &Snapshot, now: Millis) -> InputAcknowledgment {
        let started = Instant::now();
        let verdict = self.validate(&input, board);

        let mut ack = InputAcknowledgment {
            player_id: input.player_id,
            acknowledged_sequence: input.sequence,
            timestamp: now,
            ..Default::default()
        };

        match verdict {
            Ok(()) => {
                if let Some(player) = self.players.get_mut(&input.player_id) {
                    player.last_sequence = input.sequence;
                    player.accepted += 1;
                }
                self.sink.emit(NetcodeEvent::InputAccepted {
                    player_id: input.player_id,
                    sequence: input.sequence,
                });
                ack.accepted = true;
                self.queue.push(input);
            }
            Err(err) => {
                if let Some(player) = self.players.get_mut(&input.player_id) {
                    player.rejected += 1;
                }
                let reason = err.to_string();
                self.sink.emit(NetcodeEvent::InputRejected {
                    player_id: input.player_id,
                    sequence: input.sequence,
                    reason: reason.clone(),
                });
                ack.rejection_reason = Some(reason);
            }
        }

        ack.processing_time_ms = started.elapsed().as_secs_f32() * 1000.0;
        ack
    }

    /// Take every queued input, in arrival order.
    pub fn drain(&mut self) -> Vec<PredictiveInput> {
        std::mem::take(&mut self.queue)
    }

    /// Drop every queued input. Returns the number dropped.
    pub fn discard_queued(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    /// Inputs waiting for the next tick.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use bytes::Bytes;
    use crate::core::vec2::Vec2;
    use crate::game::events::EventLog;
    use crate::game::state::Direction;

    fn intake() -> (InputIntake, EventLog) {
        let log = EventLog::new();
        let mut intake = InputIntake::new(IntakeConfig::default(), Arc::new(log.clone()));
        intake.add_player(1).unwrap();
        (intake, log)
    }

    fn board() -> Snapshot {
        Snapshot::new(20, 15)
    }

    #[test]
    fn test_add_player() {
        let (mut intake, _) = intake();
        assert_eq!(intake.add_player(1), Err(SessionError::AlreadyInSession(1)));

        let mut small = InputIntake::new(
            IntakeConfig { max_players: 1, ..Default::default() },
            Arc::new(EventLog::new()),
        );
        small.add_player(1).unwrap();
        assert_eq!(small.add_player(2), Err(SessionError::SessionFull));
        assert!(small.remove_player(1));
    }

    #[test]
    fn test_accepts_and_queues() {
        let (mut intake, log) = intake();
        let ack = intake.submit(PredictiveInput::place_arrow(1, 1, 10, 12, 8, Direction::Up), &board(), 500);
        assert!(ack.accepted);
        assert_eq!(ack.acknowledged_sequence, 1);
        assert_eq!(ack.timestamp, 500);
        assert!(ack.rejection_reason.is_none());
        assert!(ack.processing_time_ms >= 0.0);
        assert_eq!(intake.queued_len(), 1);
        assert_eq!(intake.player(1).unwrap().last_sequence, 1);
        assert_eq!(log.count("input_accepted"), 1);

        assert_eq!(intake.drain().len(), 1);
        assert_eq!(intake.queued_len(), 0);
    }

    #[test]
    fn test_rejections_are_acknowledged() {
        let (mut intake, log) = intake();
        let board = board();

        let unknown = intake.submit(PredictiveInput::action(9, 1, 0, 1), &board, 0);
        assert!(!unknown.accepted);
        assert_eq!(unknown.rejection_reason.as_deref(), Some("Unknown player 9"));

        let off_board = intake.submit(PredictiveInput::place_arrow(1, 1, 0, 40, 3, Direction::Up), &board, 0);
        assert!(!off_board.accepted);
        assert_eq!(off_board.rejection_reason.as_deref(), Some("Cell (40, 3) is out of bounds"));

        let far_cursor = intake.submit(PredictiveInput::move_cursor(1, 2, 0, Vec2::new(-5.0, 1.0)), &board, 0);
        assert!(!far_cursor.accepted);

        let odd_kind = PredictiveInput {
            player_id: 1,
            sequence: 3,
            input_type: InputKind::Other(77),
            ..Default::default()
        };
        assert_eq!(
            intake.submit(odd_kind, &board, 0).rejection_reason.as_deref(),
            Some("Unsupported input type 77")
        );

        let garbage = PredictiveInput {
            player_id: 1,
            sequence: 4,
            input_type: InputKind::PlaceArrow,
            input_data: Bytes::from_static(&[0x08]),
            ..Default::default()
        };
        assert!(!intake.submit(garbage, &board, 0).accepted);

        assert!(!intake.submit(PredictiveInput::action(1, 5, 0, 99), &board, 0).accepted);

        assert_eq!(intake.queued_len(), 0);
        assert_eq!(log.count("input_rejected"), 6);
        assert_eq!(intake.player(1).unwrap().rejected, 5);
        // Rejections do not advance the sequence
        assert_eq!(intake.player(1).unwrap().last_sequence, 0);
    }

    #[test]
    fn test_stale_sequence() {
        let (mut intake, _) = intake();
        let board = board();
        assert!(intake.submit(PredictiveInput::action(1, 5, 0, 3), &board, 0).accepted);
        let dup = intake.submit(PredictiveInput::action(1, 5, 0, 3), &board, 0);
        assert!(!dup.accepted);
        assert!(dup.rejection_reason.unwrap().contains("Stale"));
        assert!(intake.submit(PredictiveInput::action(1, 6, 0, 3), &board, 0).accepted);
    }

    #[test]
    fn test_queue_limit_and_discard() {
        let log = EventLog::new();
        let mut intake = InputIntake::new(
            IntakeConfig { max_queued_inputs: 2, ..Default::default() },
            Arc::new(log),
        );
        intake.add_player(1).unwrap();
        let board = board();
        for seq in 1..=3 {
            intake.submit(PredictiveInput::action(1, seq, 0, 3), &board, 0);
        }
        assert_eq!(intake.queued_len(), 2);
        assert_eq!(intake.discard_queued(), 2);
    }
}
