//! Game Data Model
//!
//! Snapshots, inputs, the simulation collaborator and core events.

pub mod state;
pub mod input;
pub mod simulation;
pub mod events;

// Re-export main types
pub use state::{
    Arrow, ArrowId, BoardDims, Direction, EntityId, EntityKind, EntityRef, EntityStatus, Goal,
    MovingEntity, PlayerId, PlayerState, Sequence, Snapshot, Strategy, Wall,
};
pub use input::{ActionCode, InputKind, InputLog, InputPayload, PredictiveInput};
pub use simulation::{GridConfig, GridSimulation, Simulation, SpawnRule, SpawnTrigger};
pub use events::{EventLog, EventSink, NetcodeEvent, NullSink, SharedSink, TracingObserver};
