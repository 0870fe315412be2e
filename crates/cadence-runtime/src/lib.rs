//! Cadence Runtime - the background half of the client
//!
//! This crate implements:
//! - AutoSubmitter: commits and reveals the player's actions on time
//! - OnchainPoller: keeps the on-chain snapshot of the visible zones fresh
//! - GasFeePoller: fee estimates from the recent fee history
//! - GameSession: every component of one deployment wired together
//! - Deployment config and tracing setup

pub mod config;
pub mod gas;
pub mod poller;
pub mod scheduler;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::*;
pub use gas::*;
pub use poller::*;
pub use scheduler::*;
pub use session::*;
pub use telemetry::*;
