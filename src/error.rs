//! Error Taxonomy
//!
//! One error enum per concern. Boundary errors ([`ParseError`],
//! [`ValidationError`]) are handled where they arise and never reach the
//! prediction or rollback math.

use crate::game::state::{EntityRef, PlayerId, Sequence};

/// Malformed or truncated bytes. The message is rejected, the connection
/// stays alive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Input ended in the middle of a field
    #[error("Unexpected end of input")]
    UnexpectedEof,

    /// Varint longer than 10 bytes
    #[error("Varint overflow")]
    VarintOverflow,

    /// Field tag 0 is never valid
    #[error("Invalid field tag 0")]
    InvalidTag,

    /// Reserved or unsupported wire type
    #[error("Invalid wire type {0}")]
    InvalidWireType(u8),

    /// Known field carried the wrong wire type
    #[error("Field {tag} expected wire type {expected}, found {found}")]
    WireTypeMismatch {
        /// Field tag
        tag: u32,
        /// Wire type the field is declared with
        expected: u8,
        /// Wire type on the wire
        found: u8,
    },

    /// String field was not UTF-8
    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(u32),

    /// Enum field held an unknown value
    #[error("Invalid value {value} for {field}")]
    InvalidEnum {
        /// Field name
        field: &'static str,
        /// Raw value
        value: u64,
    },

    /// Value does not fit the field's integer width
    #[error("Value {value} out of range for {field}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Raw value
        value: u64,
    },

    /// Envelope carried no payload
    #[error("Envelope has no payload")]
    MissingPayload,

    /// Envelope carried more than one payload
    #[error("Envelope has more than one payload")]
    MultiplePayloads,

    /// Envelope type does not match its payload
    #[error("Envelope type {declared} does not match payload")]
    PayloadMismatch {
        /// Declared message type code
        declared: u64,
    },
}

/// Input rejected at the server boundary. Always answered with a negative
/// acknowledgment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Input from a player not in the match
    #[error("Unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// Sequence not greater than the last accepted one
    #[error("Stale input sequence {got} (last accepted {last})")]
    StaleSequence {
        /// Last accepted sequence
        last: u64,
        /// Received sequence
        got: u64,
    },

    /// Target cell off the board
    #[error("Cell ({x}, {y}) is out of bounds")]
    OutOfBounds {
        /// Column
        x: i64,
        /// Row
        y: i64,
    },

    /// Input kind the server does not handle
    #[error("Unsupported input type {0}")]
    UnsupportedInput(u32),

    /// Action code the server does not handle
    #[error("Unsupported action {0}")]
    UnsupportedAction(u32),

    /// Payload bytes did not decode
    #[error("Malformed input payload: {0}")]
    MalformedPayload(#[from] ParseError),

    /// Too many inputs queued for the next tick
    #[error("Input queue full")]
    QueueFull,
}

/// Operation on state that is missing or expired. The operation is dropped
/// and processing continues.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    /// Delta base does not match the snapshot it is applied to
    #[error("Delta base {expected} does not match snapshot {actual}")]
    BaselineMismatch {
        /// Delta's base sequence
        expected: Sequence,
        /// Sequence of the snapshot supplied
        actual: Sequence,
    },

    /// No snapshot with the delta's base sequence is held
    #[error("No baseline snapshot {0}")]
    MissingBaseline(Sequence),

    /// Delta is internally inconsistent
    #[error("Malformed delta: {0}")]
    MalformedDelta(&'static str),

    /// Referenced entity does not exist
    #[error("Entity {0} not found")]
    EntityNotFound(EntityRef),

    /// Referenced prediction does not exist
    #[error("Prediction {0} not found")]
    PredictionNotFound(u64),
}

/// Failure inside a simulation step. The tick is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationFault {
    /// Simulation returned an error
    #[error("Simulation failed: {0}")]
    Failed(String),

    /// Simulation panicked
    #[error("Simulation panicked: {0}")]
    Panicked(String),

    /// Simulation produced a state that cannot be emitted
    #[error("Simulation produced invalid state: {0}")]
    InvalidState(String),
}

/// Any netcode error.
#[derive(Debug, thiserror::Error)]
pub enum NetcodeError {
    /// Codec error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Input validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// State error
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Simulation fault
    #[error("Simulation fault: {0}")]
    Simulation(#[from] SimulationFault),

    /// Prediction error
    #[error("Prediction error: {0}")]
    Prediction(#[from] crate::client::prediction::PredictionError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] crate::network::server::ServerError),
}

/// Result alias using [`NetcodeError`].
pub type Result<T> = std::result::Result<T, NetcodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        let err: NetcodeError = ParseError::UnexpectedEof.into();
        assert!(matches!(err, NetcodeError::Parse(ParseError::UnexpectedEof)));

        let err: ValidationError = ParseError::InvalidTag.into();
        assert_eq!(err, ValidationError::MalformedPayload(ParseError::InvalidTag));
    }

    #[test]
    fn test_messages_are_readable() {
        let err = ValidationError::OutOfBounds { x: 40, y: -1 };
        assert_eq!(err.to_string(), "Cell (40, -1) is out of bounds");

        let err = StateError::EntityNotFound(EntityRef::Entity(3));
        assert_eq!(err.to_string(), "Entity entity#3 not found");
    }
}
