//! # Gridrush Netcode
//!
//! Hybrid predictive rendering and rollback netcode for Gridrush, a grid game
//! where player-placed arrows steer mice and cats.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    GRIDRUSH NETCODE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Primitives                             │
//! │  ├── vec2.rs        - 2D vector in cell units               │
//! │  ├── time.rs        - Clock abstraction                      │
//! │  ├── buffer.rs      - Time-ordered and rolling buffers       │
//! │  └── rng.rs         - Deterministic Xorshift128+ PRNG        │
//! │                                                              │
//! │  game/              - Data model                             │
//! │  ├── state.rs       - Snapshot, players, mice, cats, arrows  │
//! │  ├── input.rs       - Predictive inputs and input log        │
//! │  ├── simulation.rs  - Simulation trait, reference sim        │
//! │  └── events.rs      - Structured events and sinks            │
//! │                                                              │
//! │  network/           - Server side                            │
//! │  ├── wire.rs        - Tag-value wire primitives              │
//! │  ├── protocol.rs    - Message catalogue and envelope         │
//! │  ├── delta.rs       - Delta compression                      │
//! │  ├── session.rs     - Player admission, input validation     │
//! │  └── server.rs      - Authoritative tick loop                │
//! │                                                              │
//! │  client/            - Client side                            │
//! │  ├── state_manager  - Snapshot and prediction buffers        │
//! │  ├── prediction.rs  - Outcome prediction                     │
//! │  ├── interpolation  - Visual transitions                     │
//! │  ├── rollback.rs    - Corrections and replay                 │
//! │  └── inputs.rs      - Sequencing and acks                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! The server owns the only mutable simulation state. Clients predict the
//! outcome of their own inputs, render slightly in the past, and reconcile
//! with every authoritative snapshot:
//! - Errors below the correction threshold are left alone
//! - Larger errors are smoothed in over at most 50 ms
//! - Large errors also replay the most recent unacknowledged inputs

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod client;
pub mod telemetry;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use crate::core::vec2::Vec2;
pub use client::{ClientConfig, PredictiveClient, RenderFrame};
pub use config::NetcodeConfig;
pub use error::{NetcodeError, Result};
pub use game::input::{InputPayload, PredictiveInput};
pub use game::state::{EntityRef, PlayerId, Snapshot};
pub use network::protocol::{Envelope, Payload};
pub use network::server::{AuthoritativeServer, ServerCore, ServerHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
