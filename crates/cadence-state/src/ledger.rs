//! Local Action Ledger
//!
//! The single source of truth for what the player intends to do this
//! epoch and what has been submitted for it. Every mutation is persisted
//! under the signer's storage key and published on the `LocalState`
//! stream.
//!
//! Staleness rule: pending actions are only valid for the epoch they were
//! recorded in. Every operation first reconciles against the epoch it is
//! given (or the clock's epoch for commit/reveal); once the epoch moves
//! past the entity's, actions and submission are dropped.
//!
//! Commit and reveal are guarded by one in-flight flag each, so a commit
//! triggered by the scheduler and one triggered by the player collapse
//! into a single transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use cadence_chain::{
    derive_secret, MessageSigner, Receipt, SubmitOptions, TransactionLayer,
};
use cadence_core::{
    CadenceError, CadenceResult, EntityId, Epoch, LocalAction, Observable, Position, Signer,
    Subscription, TxRef,
};
use cadence_time::{EpochCalculator, SyncedClock};

use crate::{
    CommitRecord, KeyValueStore, RevealRecord, StorageScope, Submission, SubmissionEvent,
    SubmissionStage,
};

/// The player's entity as known locally
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntity {
    pub id: EntityId,
    pub actions: Vec<LocalAction>,
    /// Epoch the actions were recorded in
    pub epoch: Epoch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
    /// Set when the last commit contained an exit
    #[serde(default)]
    pub exiting: bool,
}

impl PendingEntity {
    /// Entity about to enter the world at `position`
    pub fn entering(id: EntityId, epoch: Epoch, position: Position) -> Self {
        PendingEntity {
            id,
            actions: vec![LocalAction::enter(position)],
            epoch,
            submission: None,
            exiting: false,
        }
    }

    /// First action is an `enter`; such an entity is not on-chain yet
    pub fn is_entering(&self) -> bool {
        self.actions.first().map_or(false, LocalAction::is_enter)
    }

    pub fn last_action(&self) -> Option<&LocalAction> {
        self.actions.last()
    }

    /// Drop actions and submission if `epoch` is past the recorded epoch
    fn advance_to(&mut self, epoch: Epoch) -> bool {
        if epoch <= self.epoch {
            return false;
        }
        self.actions.clear();
        self.submission = None;
        self.epoch = epoch;
        true
    }
}

/// Persisted state of a signed-in player
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInState {
    pub signer: Signer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<PendingEntity>,
    #[serde(default)]
    pub tutorial_seen: bool,
}

impl SignedInState {
    pub fn fresh(signer: Signer) -> Self {
        SignedInState {
            signer,
            entity: None,
            tutorial_seen: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LocalState {
    #[default]
    SignedOut,
    SignedIn(SignedInState),
}

impl LocalState {
    pub fn signer(&self) -> Option<&Signer> {
        match self {
            LocalState::SignedIn(s) => Some(&s.signer),
            LocalState::SignedOut => None,
        }
    }

    pub fn entity(&self) -> Option<&PendingEntity> {
        match self {
            LocalState::SignedIn(s) => s.entity.as_ref(),
            LocalState::SignedOut => None,
        }
    }

    pub fn signed_in(&self) -> Option<&SignedInState> {
        match self {
            LocalState::SignedIn(s) => Some(s),
            LocalState::SignedOut => None,
        }
    }

    fn signed_in_mut(&mut self) -> Option<&mut SignedInState> {
        match self {
            LocalState::SignedIn(s) => Some(s),
            LocalState::SignedOut => None,
        }
    }

    fn entity_mut(&mut self) -> Option<&mut PendingEntity> {
        self.signed_in_mut().and_then(|s| s.entity.as_mut())
    }

    /// Signed-in state with an entity, or the matching precondition error
    fn require_entity_mut(&mut self) -> CadenceResult<&mut PendingEntity> {
        self.signed_in_mut()
            .ok_or(CadenceError::NoSigner)?
            .entity
            .as_mut()
            .ok_or(CadenceError::NoEntity)
    }

    fn advance_to(&mut self, epoch: Epoch) -> bool {
        self.entity_mut().map_or(false, |e| e.advance_to(epoch))
    }
}

/// Why a commit or reveal call did nothing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Signed out, or no entity to act for
    NoEntity,
    /// Another call of the same kind is in flight
    AlreadyRunning,
    /// The entity's epoch is ahead of the clock
    NotInYet,
    /// Already committed (or revealed) for this epoch
    AlreadySubmitted,
    NothingToReveal,
    /// The commit receipt has not arrived yet
    CommitPending,
}

/// Result of a commit or reveal attempt
///
/// Reverts and transport failures are outcomes, not errors: the ledger has
/// already rolled the affected stage back when this is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Confirmed(Receipt),
    Reverted(Receipt),
    Failed(CadenceError),
    Skipped(SkipReason),
}

impl SubmissionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SubmissionOutcome::Confirmed(_))
    }
}

/// Clears an in-flight flag on drop
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlightGuard { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Collaborators of a ledger
#[derive(Clone)]
pub struct LedgerDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub transactions: Arc<dyn TransactionLayer>,
    pub message_signer: Arc<dyn MessageSigner>,
    pub clock: Arc<SyncedClock>,
    pub calculator: EpochCalculator,
}

/// Local Action Ledger
pub struct LocalLedger {
    scope: StorageScope,
    deps: LedgerDeps,
    state: Observable<LocalState>,
    stage: Mutex<SubmissionStage>,
    committing: AtomicBool,
    revealing: AtomicBool,
}

impl LocalLedger {
    /// Signed-out ledger
    pub fn new(scope: StorageScope, deps: LedgerDeps) -> Self {
        LocalLedger {
            scope,
            deps,
            state: Observable::new(LocalState::SignedOut),
            stage: Mutex::new(SubmissionStage::NoSubmission),
            committing: AtomicBool::new(false),
            revealing: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn snapshot(&self) -> LocalState {
        self.state.get()
    }

    /// The `LocalState` stream
    pub fn observable(&self) -> Observable<LocalState> {
        self.state.clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LocalState) + Send + Sync + 'static,
    {
        self.state.subscribe(callback)
    }

    pub fn stage(&self) -> SubmissionStage {
        *self.stage.lock()
    }

    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    pub fn is_revealing(&self) -> bool {
        self.revealing.load(Ordering::SeqCst)
    }

    /// Epoch according to the synced clock
    pub fn current_epoch(&self) -> Epoch {
        self.deps.calculator.epoch_number(self.deps.clock.now())
    }

    /// Switch to another signer
    ///
    /// Loads the stored state of the new owner, falling back to a fresh
    /// state when nothing readable is stored. `None` signs out.
    pub fn set_signer(&self, signer: Option<Signer>) {
        let current_owner = self.state.with(|s| s.signer().map(|s| s.owner));
        if current_owner == signer.map(|s| s.owner) {
            return;
        }

        let next = match signer {
            Some(signer) => LocalState::SignedIn(self.load(signer)),
            None => LocalState::SignedOut,
        };
        *self.stage.lock() = SubmissionStage::from_submission(
            next.entity().and_then(|e| e.submission.as_ref()),
        );
        info!(signer = ?next.signer().map(|s| s.owner), "local state switched");
        self.mutate(|state| {
            *state = next;
            (true, ())
        });
    }

    /// Reconcile against `epoch`; true when stale actions were dropped
    pub fn update(&self, epoch: Epoch) -> bool {
        let stale = self
            .state
            .with(|s| s.entity().map_or(false, |e| epoch > e.epoch));
        if !stale {
            return false;
        }
        let advanced = self.mutate(|state| {
            let advanced = state.advance_to(epoch);
            (advanced, advanced)
        });
        self.after_advance(advanced, epoch);
        advanced
    }

    /// Queue an action for `epoch`
    ///
    /// Fails without signer or entity, and once a submission exists or a
    /// commit is in flight. An entity whose first action is `enter` accepts
    /// nothing else; that case is a silent no-op.
    pub fn add_action(&self, epoch: Epoch, action: LocalAction) -> CadenceResult<()> {
        let committing = self.is_committing();
        let (advanced, result) = self.mutate(|state| {
            let advanced = state.advance_to(epoch);
            let result = state.require_entity_mut().and_then(|entity| {
                if entity.submission.is_some() || committing {
                    return Err(CadenceError::SubmissionInProgress);
                }
                if entity.is_entering() {
                    debug!(entity = %entity.id, "entering entity, action ignored");
                    return Ok(false);
                }
                entity.actions.push(action);
                Ok(true)
            });
            let changed = advanced || matches!(result, Ok(true));
            (changed, (advanced, result))
        });
        self.after_advance(advanced, epoch);
        result.map(|_| ())
    }

    /// Start a fresh entity whose first action enters the world at
    /// `position`; replaces any previous entity
    pub fn enter(&self, id: EntityId, epoch: Epoch, position: Position) -> CadenceResult<()> {
        self.mutate(|state| match state.signed_in_mut() {
            Some(signed_in) => {
                signed_in.entity = Some(PendingEntity::entering(id, epoch, position));
                (true, Ok(()))
            }
            None => (false, Err(CadenceError::NoSigner)),
        })?;
        *self.stage.lock() = SubmissionStage::NoSubmission;
        info!(entity = %id, epoch = %epoch, ?position, "entering");
        Ok(())
    }

    /// Undo the last queued action; true when one was removed
    ///
    /// The `enter` action cannot be undone, and neither can anything once a
    /// commit is in flight or recorded for the epoch.
    pub fn rewind(&self, epoch: Epoch) -> CadenceResult<bool> {
        let committing = self.is_committing();
        let (advanced, result) = self.mutate(|state| {
            let advanced = state.advance_to(epoch);
            let result = state.require_entity_mut().map(|entity| {
                if entity.submission.is_some() || committing {
                    debug!(entity = %entity.id, "submitted actions cannot be rewound");
                    return false;
                }
                let undoable = entity.actions.last().map_or(false, |last| !last.is_enter());
                undoable && entity.actions.pop().is_some()
            });
            let changed = advanced || matches!(result, Ok(true));
            (changed, (advanced, result))
        });
        self.after_advance(advanced, epoch);
        result
    }

    /// Forget the entity
    pub fn remove_entity(&self) -> CadenceResult<()> {
        self.mutate(|state| {
            let signed_in = match state.signed_in_mut() {
                Some(s) => s,
                None => return (false, Err(CadenceError::NoSigner)),
            };
            match signed_in.entity.take() {
                Some(entity) => {
                    info!(entity = %entity.id, "entity removed");
                    (true, Ok(()))
                }
                None => (false, Err(CadenceError::NoEntity)),
            }
        })?;
        *self.stage.lock() = SubmissionStage::NoSubmission;
        Ok(())
    }

    /// Clear actions and submission, keeping the entity's epoch
    pub fn reset(&self) {
        let reset = self.mutate(|state| match state.entity_mut() {
            Some(entity) => {
                entity.actions.clear();
                entity.submission = None;
                (true, true)
            }
            None => (false, false),
        });
        if reset {
            debug!("pending actions reset");
            *self.stage.lock() = SubmissionStage::NoSubmission;
        }
    }

    pub fn mark_tutorial_seen(&self) {
        self.mutate(|state| match state.signed_in_mut() {
            Some(s) if !s.tutorial_seen => {
                s.tutorial_seen = true;
                (true, ())
            }
            _ => (false, ()),
        });
    }

    /// Commit the queued actions for the current epoch
    ///
    /// The action list is snapshotted into the submission. A reverted or
    /// failed commit removes the submission again; the actions stay queued
    /// so the commit can be retried.
    pub async fn commit(&self, options: SubmitOptions) -> CadenceResult<SubmissionOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.committing) else {
            info!("already committing");
            return Ok(SubmissionOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let (signer, entity) = self.require_entity()?;
        let epoch = self.current_epoch();
        if entity.epoch > epoch {
            info!(entity_epoch = %entity.epoch, epoch = %epoch, "not in yet");
            return Ok(SubmissionOutcome::Skipped(SkipReason::NotInYet));
        }
        self.update(epoch);

        let (_, entity) = self.require_entity()?;
        if entity.submission.is_some() {
            debug!(epoch = %epoch, "already committed for this epoch");
            return Ok(SubmissionOutcome::Skipped(SkipReason::AlreadySubmitted));
        }

        let actions = entity.actions.clone();
        self.transition(SubmissionEvent::BeginCommit);
        info!(epoch = %epoch, entity = %entity.id, actions = actions.len(), "committing");

        let secret = match derive_secret(
            self.deps.message_signer.as_ref(),
            &signer.address,
            self.scope.chain_id,
            &self.scope.contract,
            epoch,
        )
        .await
        {
            Ok(secret) => secret,
            Err(err) => return Ok(self.commit_not_sent(err)),
        };

        let pending = match self
            .deps
            .transactions
            .commit_actions(entity.id, secret, &actions, options)
            .await
        {
            Ok(pending) => pending,
            Err(err) => return Ok(self.commit_not_sent(err)),
        };
        let transaction_ref = pending.transaction_ref;

        let exiting = actions.iter().any(LocalAction::is_exit);
        let record = CommitRecord {
            secret,
            epoch,
            transaction_ref,
            actions,
        };
        let previous_exiting = self.mutate(|state| match state.entity_mut() {
            Some(e) if e.id == entity.id && e.epoch == epoch && e.submission.is_none() => {
                let previous = e.exiting;
                e.submission = Some(Submission::new(record));
                e.exiting = exiting;
                (true, Some(previous))
            }
            _ => (false, None),
        });
        let Some(previous_exiting) = previous_exiting else {
            warn!(tx = %transaction_ref, "entity changed while committing, commit not recorded");
            self.transition(SubmissionEvent::CommitFailed);
            return Ok(SubmissionOutcome::Failed(CadenceError::NoEntity));
        };

        debug!(tx = %transaction_ref, "waiting for commit receipt");
        match pending.wait().await {
            Ok(receipt) if !receipt.is_reverted() => {
                info!(tx = %transaction_ref, block = receipt.block_number, "commit confirmed");
                self.transition(SubmissionEvent::CommitConfirmed);
                Ok(SubmissionOutcome::Confirmed(receipt))
            }
            Ok(receipt) => {
                error!(tx = %transaction_ref, epoch = %epoch, "commit reverted");
                self.retract_commit(entity.id, transaction_ref, previous_exiting);
                Ok(SubmissionOutcome::Reverted(receipt))
            }
            Err(err) => {
                error!(tx = %transaction_ref, error = %err, "commit receipt unavailable");
                self.retract_commit(entity.id, transaction_ref, previous_exiting);
                Ok(SubmissionOutcome::Failed(err))
            }
        }
    }

    /// Reveal the committed actions
    ///
    /// A reverted or failed reveal clears only the reveal record; the
    /// commit stays so the reveal can be retried against it. Without signer
    /// or entity there is nothing to reveal and the call is skipped.
    pub async fn reveal(&self, options: SubmitOptions) -> CadenceResult<SubmissionOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.revealing) else {
            info!("already revealing");
            return Ok(SubmissionOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let epoch = self.current_epoch();
        self.update(epoch);

        let Ok((_, entity)) = self.require_entity() else {
            debug!("no entity, nothing to reveal");
            return Ok(SubmissionOutcome::Skipped(SkipReason::NoEntity));
        };
        let Some(submission) = entity.submission else {
            return Ok(SubmissionOutcome::Skipped(SkipReason::NothingToReveal));
        };
        if self.stage() == SubmissionStage::Committing {
            debug!("commit receipt pending, reveal postponed");
            return Ok(SubmissionOutcome::Skipped(SkipReason::CommitPending));
        }
        if submission.is_revealed_for(epoch) {
            return Ok(SubmissionOutcome::Skipped(SkipReason::AlreadySubmitted));
        }

        let commit = submission.commit;
        self.transition(SubmissionEvent::BeginReveal);
        info!(epoch = %epoch, entity = %entity.id, commit_tx = %commit.transaction_ref, "revealing");

        let pending = match self
            .deps
            .transactions
            .reveal_actions(entity.id, commit.secret, &commit.actions, options)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "reveal not sent");
                self.transition(SubmissionEvent::RevealFailed);
                return Ok(SubmissionOutcome::Failed(err));
            }
        };
        let transaction_ref = pending.transaction_ref;

        self.mutate(|state| match matching_submission(state, entity.id, commit.transaction_ref) {
            Some(s) => {
                s.reveal = Some(RevealRecord {
                    epoch,
                    transaction_ref,
                });
                (true, ())
            }
            None => (false, ()),
        });

        debug!(tx = %transaction_ref, "waiting for reveal receipt");
        let outcome = match pending.wait().await {
            Ok(receipt) if !receipt.is_reverted() => {
                info!(tx = %transaction_ref, block = receipt.block_number, "reveal confirmed");
                self.transition(SubmissionEvent::RevealConfirmed);
                return Ok(SubmissionOutcome::Confirmed(receipt));
            }
            Ok(receipt) => {
                error!(tx = %transaction_ref, epoch = %epoch, "reveal reverted");
                SubmissionOutcome::Reverted(receipt)
            }
            Err(err) => {
                error!(tx = %transaction_ref, error = %err, "reveal receipt unavailable");
                SubmissionOutcome::Failed(err)
            }
        };
        self.mutate(|state| match matching_submission(state, entity.id, commit.transaction_ref) {
            Some(s) if s.reveal.map(|r| r.transaction_ref) == Some(transaction_ref) => {
                s.reveal = None;
                (true, ())
            }
            _ => (false, ()),
        });
        self.transition(SubmissionEvent::RevealFailed);
        Ok(outcome)
    }

    fn require_entity(&self) -> CadenceResult<(Signer, PendingEntity)> {
        self.state.with(|state| match state {
            LocalState::SignedOut => Err(CadenceError::NoSigner),
            LocalState::SignedIn(s) => s
                .entity
                .clone()
                .map(|e| (s.signer, e))
                .ok_or(CadenceError::NoEntity),
        })
    }

    fn commit_not_sent(&self, err: CadenceError) -> SubmissionOutcome {
        error!(error = %err, "commit not sent");
        self.transition(SubmissionEvent::CommitFailed);
        SubmissionOutcome::Failed(err)
    }

    /// Undo a recorded commit, provided it is still the one we sent
    fn retract_commit(&self, id: EntityId, transaction_ref: TxRef, previous_exiting: bool) {
        self.mutate(|state| match state.entity_mut() {
            Some(e)
                if e.id == id
                    && e.submission.as_ref().map(|s| s.commit.transaction_ref)
                        == Some(transaction_ref) =>
            {
                e.submission = None;
                e.exiting = previous_exiting;
                (true, ())
            }
            _ => (false, ()),
        });
        self.transition(SubmissionEvent::CommitFailed);
    }

    fn after_advance(&self, advanced: bool, epoch: Epoch) {
        if advanced {
            info!(epoch = %epoch, "new epoch, pending actions reset");
            self.transition(SubmissionEvent::EpochAdvanced);
        }
    }

    fn transition(&self, event: SubmissionEvent) {
        let mut stage = self.stage.lock();
        match stage.transition(event) {
            Some(next) => {
                debug!(from = ?*stage, to = ?next, ?event, "submission stage");
                *stage = next;
            }
            None => debug!(stage = ?*stage, ?event, "submission event ignored"),
        }
    }

    /// Mutate, persist when changed, then notify
    fn mutate<R>(&self, f: impl FnOnce(&mut LocalState) -> (bool, R)) -> R {
        self.state.update_if(|state| {
            let (changed, result) = f(state);
            if changed {
                self.persist(state);
            }
            (changed, result)
        })
    }

    fn persist(&self, state: &LocalState) {
        let LocalState::SignedIn(signed_in) = state else {
            return;
        };
        let key = self.scope.key(&signed_in.signer.owner);
        let written = serde_json::to_string(signed_in)
            .map_err(|e| CadenceError::Serialization(e.to_string()))
            .and_then(|json| self.deps.store.set(&key, &json));
        if let Err(err) = written {
            error!(error = %err, key = %key, "failed to persist local state");
        }
    }

    fn load(&self, signer: Signer) -> SignedInState {
        let key = self.scope.key(&signer.owner);
        match self.deps.store.get(&key) {
            Ok(Some(json)) => match serde_json::from_str::<SignedInState>(&json) {
                Ok(mut stored) => {
                    stored.signer = signer;
                    stored
                }
                Err(err) => {
                    warn!(error = %err, key = %key, "stored local state unreadable, starting fresh");
                    SignedInState::fresh(signer)
                }
            },
            Ok(None) => SignedInState::fresh(signer),
            Err(err) => {
                warn!(error = %err, key = %key, "failed to read local state, starting fresh");
                SignedInState::fresh(signer)
            }
        }
    }
}

fn matching_submission(
    state: &mut LocalState,
    id: EntityId,
    commit_ref: TxRef,
) -> Option<&mut Submission> {
    state
        .entity_mut()
        .filter(|e| e.id == id)
        .and_then(|e| e.submission.as_mut())
        .filter(|s| s.commit.transaction_ref == commit_ref)
}

impl std::fmt::Debug for LocalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLedger")
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("stage", &self.stage())
            .finish()
    }
}
