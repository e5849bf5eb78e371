//! Core primitives.
//!
//! Vector math, time sources, bounded buffers and the deterministic RNG used
//! by the reference simulation.

pub mod vec2;
pub mod time;
pub mod buffer;
pub mod rng;

// Re-export core types
pub use vec2::Vec2;
pub use time::{Clock, ManualClock, Millis, SystemClock};
pub use buffer::{RollingHistory, TimedBuffer};
pub use rng::DeterministicRng;
