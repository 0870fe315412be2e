//! Cadence Chain - the game contract as seen from the client
//!
//! This crate defines:
//! - The collaborator traits the client core consumes (transactions,
//!   entity reads, fee history, message signing)
//! - Commitment hashing and commit secret derivation
//! - Zone math and coordinate packing used for region queries

pub mod commitment;
pub mod interfaces;
pub mod region;

pub use commitment::*;
pub use interfaces::*;
pub use region::*;
