//! Cadence Time Engine - chain clock and epoch control
//!
//! This crate implements the timing core:
//! - SyncedClock: linear extrapolation of chain time between samples
//! - ClockSynchronizer: initial sync, one-shot refinement, per-second stream
//! - EpochCalculator: epoch number and commit/reveal phase boundaries
//! - Phase views used by player-facing countdowns

pub mod clock;
pub mod epoch;
pub mod phase;
pub mod source;
pub mod sync;

pub use clock::*;
pub use epoch::*;
pub use phase::*;
pub use source::*;
pub use sync::*;
