//! Cadence Test Harness - simulated chain and end-to-end scenarios
//!
//! This crate provides:
//! - SimulatedChain: node, wallet and game contract in one process, with
//!   injectable failures
//! - Chaos presets for unreliable chains
//! - Scenario harness running several game sessions against one chain

pub mod chain;
pub mod scenario;

pub use chain::*;
pub use scenario::*;
