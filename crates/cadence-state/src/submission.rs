//! Submission lifecycle of one entity-epoch
//!
//! ```text
//! NoSubmission ──BeginCommit──▶ Committing ──CommitConfirmed──▶ Committed
//!      ▲                            │                              │
//!      └────────CommitFailed────────┘                         BeginReveal
//!                                                                  ▼
//!                  Revealed ◀──RevealConfirmed── Revealing ──RevealFailed──▶ Committed
//! ```
//!
//! `EpochAdvanced` returns any stage to `NoSubmission`.

use serde::{Deserialize, Serialize};

use cadence_core::{Epoch, LocalAction, Secret, TxRef};

/// Commit half of a submission; immutable once recorded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub secret: Secret,
    pub epoch: Epoch,
    pub transaction_ref: TxRef,
    /// Snapshot of the actions the commitment hides
    pub actions: Vec<LocalAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRecord {
    pub epoch: Epoch,
    pub transaction_ref: TxRef,
}

/// A commit and, once sent, its reveal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub commit: CommitRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal: Option<RevealRecord>,
}

impl Submission {
    pub fn new(commit: CommitRecord) -> Self {
        Submission {
            commit,
            reveal: None,
        }
    }

    /// True when a reveal for `epoch` is already recorded
    pub fn is_revealed_for(&self, epoch: Epoch) -> bool {
        self.reveal.map_or(false, |r| r.epoch >= epoch)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SubmissionStage {
    #[default]
    NoSubmission,
    Committing,
    Committed,
    Revealing,
    Revealed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionEvent {
    BeginCommit,
    CommitConfirmed,
    CommitFailed,
    BeginReveal,
    RevealConfirmed,
    RevealFailed,
    EpochAdvanced,
}

impl SubmissionStage {
    /// Next stage, or `None` when `event` is not valid in this stage
    pub fn transition(self, event: SubmissionEvent) -> Option<SubmissionStage> {
        use SubmissionEvent::*;
        use SubmissionStage::*;

        match (self, event) {
            (_, EpochAdvanced) => Some(NoSubmission),
            (NoSubmission, BeginCommit) => Some(Committing),
            (Committing, CommitConfirmed) => Some(Committed),
            (Committing, CommitFailed) => Some(NoSubmission),
            (Committed, BeginReveal) => Some(Revealing),
            (Revealing, RevealConfirmed) => Some(Revealed),
            (Revealing, RevealFailed) => Some(Committed),
            _ => None,
        }
    }

    /// Stage implied by persisted data
    ///
    /// Receipts are not persisted, so after a reload a recorded commit or
    /// reveal is taken as landed.
    pub fn from_submission(submission: Option<&Submission>) -> Self {
        match submission {
            None => SubmissionStage::NoSubmission,
            Some(s) if s.reveal.is_some() => SubmissionStage::Revealed,
            Some(_) => SubmissionStage::Committed,
        }
    }

    /// Local actions can still be edited
    pub fn accepts_edits(&self) -> bool {
        *self == SubmissionStage::NoSubmission
    }

    pub fn is_terminal(&self) -> bool {
        *self == SubmissionStage::Revealed
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, SubmissionStage::Committing | SubmissionStage::Revealing)
    }
}
