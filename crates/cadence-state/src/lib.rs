//! Cadence State - what the player intends and what the screen shows
//!
//! This crate implements:
//! - LocalLedger: the persisted, offline-editable action log of the
//!   current epoch, with commit/reveal submission
//! - SubmissionStage: the commit → reveal lifecycle of one entity-epoch
//! - KeyValueStore backends for the ledger
//! - ViewReconciler: on-chain snapshot merged with the local trajectory

pub mod ledger;
pub mod persist;
pub mod submission;
pub mod view;

pub use ledger::*;
pub use persist::*;
pub use submission::*;
pub use view::*;
