//! Game Session - one player's client core for one deployment
//!
//! Owns every background component and wires their streams together:
//!
//! ```text
//! TimeSource ─► ClockSynchronizer ─► time ─┬─► AutoSubmitter ─► LocalLedger ─┐
//!                                          ├─► OnchainPoller ─► onchain ─────┼─► ViewReconciler ─► view
//!                                          └─► epoch_info                    │
//! viewport ──────────────────────────────────► OnchainPoller                 │
//! player input ─────────────────────────────────────────────► LocalLedger ──┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use cadence_chain::{
    EntityReader, FeeReader, MessageSigner, SubmitOptions, TransactionLayer, Viewport,
};
use cadence_core::{
    CadenceResult, ChainTime, EntityId, Epoch, LocalAction, Loadable, Observable, OnchainState,
    Position, Signer, Subscription, WallClock,
};
use cadence_state::{
    KeyValueStore, LedgerDeps, LocalLedger, LocalState, SubmissionOutcome, ViewReconciler,
    ViewState,
};
use cadence_time::{
    ClockSynchronizer, EpochCalculator, EpochInfo, SyncedClock, SyncedTime, TimeSource,
    TwoPhaseKind,
};

use crate::{AutoSubmitter, GameConfig, GasFee, GasFeePoller, OnchainPoller, RuntimeConfig};

/// External collaborators of a session
#[derive(Clone)]
pub struct SessionDeps {
    pub time_source: Arc<dyn TimeSource>,
    pub entities: Arc<dyn EntityReader>,
    pub fees: Arc<dyn FeeReader>,
    pub transactions: Arc<dyn TransactionLayer>,
    pub message_signer: Arc<dyn MessageSigner>,
    pub store: Arc<dyn KeyValueStore>,
    pub wall: Arc<dyn WallClock>,
}

pub struct GameSession {
    config: GameConfig,
    calculator: EpochCalculator,
    synchronizer: Arc<ClockSynchronizer>,
    ledger: Arc<LocalLedger>,
    scheduler: Arc<AutoSubmitter>,
    poller: Arc<OnchainPoller>,
    gas: Arc<GasFeePoller>,
    reconciler: Arc<ViewReconciler>,
    viewport: Observable<Viewport>,
    epoch_info: Observable<EpochInfo>,
    epoch_subscription: Mutex<Option<Subscription>>,
}

impl GameSession {
    /// Build every component; nothing runs until `start`
    pub fn new(config: GameConfig, runtime: RuntimeConfig, deps: SessionDeps) -> CadenceResult<Self> {
        let calculator = config.calculator()?;
        let synchronizer = Arc::new(ClockSynchronizer::new(
            deps.time_source,
            deps.wall,
            config.clock_config(&runtime.clock),
        ));
        let clock = synchronizer.clock();
        let time = synchronizer.time();

        let ledger = Arc::new(LocalLedger::new(
            config.scope(),
            LedgerDeps {
                store: deps.store,
                transactions: deps.transactions,
                message_signer: deps.message_signer,
                clock: clock.clone(),
                calculator,
            },
        ));
        let scheduler = Arc::new(AutoSubmitter::new(
            ledger.clone(),
            clock.clone(),
            time.clone(),
            calculator,
            runtime.scheduler,
        ));
        let viewport = Observable::new(Viewport::default());
        let poller = Arc::new(OnchainPoller::new(
            deps.entities,
            clock.clone(),
            time,
            viewport.clone(),
            calculator,
            runtime.poller,
        ));
        let gas = Arc::new(GasFeePoller::new(deps.fees, runtime.gas));
        let reconciler = Arc::new(ViewReconciler::new(
            poller.state(),
            ledger.observable(),
            clock.clone(),
            calculator,
        ));
        let epoch_info = Observable::new(calculator.epoch_info(clock.now()));

        Ok(GameSession {
            config,
            calculator,
            synchronizer,
            ledger,
            scheduler,
            poller,
            gas,
            reconciler,
            viewport,
            epoch_info,
            epoch_subscription: Mutex::new(None),
        })
    }

    /// Start every background component; no-op if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut subscription = self.epoch_subscription.lock();
            if subscription.is_some() {
                return;
            }
            let calculator = self.calculator;
            let epoch_info = self.epoch_info.clone();
            *subscription = Some(self.synchronizer.time().subscribe(move |time: &SyncedTime| {
                epoch_info.set(calculator.epoch_info(time.value));
            }));
        }
        info!(
            chain_id = %self.config.chain.id,
            contract = %self.config.game.address,
            "session starting"
        );
        self.reconciler.start();
        self.poller.start();
        self.gas.start();
        self.scheduler.start();
        self.synchronizer.start();
    }

    /// Stop every background component
    ///
    /// Transactions already sent keep being awaited by their own tasks.
    pub fn stop(&self) {
        if self.epoch_subscription.lock().take().is_none() {
            return;
        }
        self.synchronizer.stop();
        self.scheduler.stop();
        self.gas.stop();
        self.poller.stop();
        self.reconciler.stop();
        info!("session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.epoch_subscription.lock().is_some()
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn calculator(&self) -> EpochCalculator {
        self.calculator
    }

    pub fn clock(&self) -> Arc<SyncedClock> {
        self.synchronizer.clock()
    }

    pub fn now(&self) -> ChainTime {
        self.synchronizer.now()
    }

    pub fn ledger(&self) -> &Arc<LocalLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Arc<AutoSubmitter> {
        &self.scheduler
    }

    pub fn poller(&self) -> &Arc<OnchainPoller> {
        &self.poller
    }

    pub fn time(&self) -> Observable<SyncedTime> {
        self.synchronizer.time()
    }

    pub fn epoch_info(&self) -> Observable<EpochInfo> {
        self.epoch_info.clone()
    }

    pub fn local_state(&self) -> Observable<LocalState> {
        self.ledger.observable()
    }

    pub fn onchain_state(&self) -> Observable<OnchainState> {
        self.poller.state()
    }

    pub fn view_state(&self) -> Observable<ViewState> {
        self.reconciler.view()
    }

    pub fn gas_fee(&self) -> Observable<Loadable<GasFee>> {
        self.gas.state()
    }

    pub fn viewport(&self) -> Observable<Viewport> {
        self.viewport.clone()
    }

    fn current_info(&self) -> EpochInfo {
        self.calculator.epoch_info(self.synchronizer.now())
    }

    pub fn set_signer(&self, signer: Option<Signer>) {
        self.ledger.set_signer(signer);
    }

    /// Move the visible area; the poller refetches if the zones changed
    pub fn set_viewport(&self, viewport: Viewport) {
        self.viewport.set(viewport);
    }

    pub fn mark_tutorial_seen(&self) {
        self.ledger.mark_tutorial_seen();
    }

    /// Queue an entity to enter the world
    ///
    /// Once play time of the current epoch is over the entity enters in the
    /// next one. Returns the epoch it enters in.
    pub fn enter(&self, id: EntityId, position: Position) -> CadenceResult<Epoch> {
        let info = self.current_info();
        let epoch = match self.calculator.two_phase(&info).phase {
            TwoPhaseKind::Play => info.current_epoch,
            TwoPhaseKind::Wait => info.current_epoch.next(),
        };
        self.ledger.enter(id, epoch, position)?;
        Ok(epoch)
    }

    /// Queue an action for the current epoch
    pub fn add_action(&self, action: LocalAction) -> CadenceResult<()> {
        self.ledger
            .add_action(self.current_info().current_epoch, action)
    }

    /// Queue an action if there is still time to commit it
    ///
    /// Returns false, leaving the ledger untouched, once play time is up.
    pub fn play(&self, action: LocalAction) -> CadenceResult<bool> {
        let info = self.current_info();
        if self.calculator.is_time_up(&info) {
            debug!(epoch = %info.current_epoch, "time is up, action dropped");
            return Ok(false);
        }
        self.ledger.add_action(info.current_epoch, action)?;
        Ok(true)
    }

    /// Undo the last action queued for the current epoch; true when one
    /// was removed
    pub fn rewind(&self) -> CadenceResult<bool> {
        self.ledger.rewind(self.current_info().current_epoch)
    }

    pub fn remove_entity(&self) -> CadenceResult<()> {
        self.ledger.remove_entity()
    }

    /// Commit now instead of waiting for the scheduler
    pub async fn commit(&self) -> CadenceResult<SubmissionOutcome> {
        self.ledger.commit(self.submit_options()).await
    }

    /// Reveal now instead of waiting for the scheduler
    pub async fn reveal(&self) -> CadenceResult<SubmissionOutcome> {
        self.ledger.reveal(self.submit_options()).await
    }

    fn submit_options(&self) -> SubmitOptions {
        self.scheduler.submit_options()
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for GameSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSession")
            .field("chain_id", &self.config.chain.id)
            .field("contract", &self.config.game.address)
            .field("running", &self.is_running())
            .finish()
    }
}
