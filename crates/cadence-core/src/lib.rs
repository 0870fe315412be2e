//! Cadence Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every Cadence crate:
//! - Identifiers (EntityId, Address, TxRef, Secret, Epoch)
//! - Time primitives (ChainTime, WallTime) and wall clocks
//! - Player actions and on-chain entity snapshots
//! - Observable stores and fetch state
//! - The error taxonomy

pub mod action;
pub mod entity;
pub mod error;
pub mod id;
pub mod loadable;
pub mod observable;
pub mod time;

pub use action::*;
pub use entity::*;
pub use error::*;
pub use id::*;
pub use loadable::*;
pub use observable::*;
pub use time::*;
