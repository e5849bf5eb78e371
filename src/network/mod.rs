//! Network Layer
//!
//! Wire codec, delta compression and the authoritative server.
//! Everything here moves bytes; game rules stay behind `game::Simulation`.

pub mod wire;
pub mod protocol;
pub mod delta;
pub mod session;
pub mod server;

pub use wire::{WireMessage, WireReader, WireType, WireWriter};
pub use protocol::{
    CorrectionKind, CorrectionRecord, Delta, EntityField, EntityPatch, Envelope,
    InputAcknowledgment, LayoutPatch, MessageType, Payload, PerformanceMetrics, PlayerField,
    PlayerPatch, RollbackCorrection,
};
pub use delta::{apply_delta, compute_delta, CompressionTrend, DeltaCompressor, DeltaConfig};
pub use session::{InputIntake, IntakeConfig, SessionError};
pub use server::{
    AuthoritativeServer, ServerConfig, ServerCore, ServerError, ServerHandle, ServerState,
    TickOutcome,
};
