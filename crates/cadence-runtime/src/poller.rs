//! On-chain state poller
//!
//! Reads the entities of the zones on screen, then the actions they
//! revealed for the previous epoch, and publishes the result as one
//! `OnchainState`. Each success replaces the snapshot wholesale.
//!
//! Refetch triggers:
//! - the periodic refresh (`refresh_interval`, `retry_interval` on failure)
//! - the clock entering a new epoch
//! - the on-chain epoch lagging the local one, when no fetch is in flight
//! - the viewport moving to a different set of zones
//!
//! A refetch aborts the fetch in flight and restarts the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use cadence_chain::{
    decode_avatar_action, unpack_xy, visible_zones, EntityReader, RegionSnapshot,
    RevealedCommitment, Viewport, ZoneId,
};
use cadence_core::{
    CadenceError, CadenceResult, EntityId, EntitySnapshot, Epoch, LocalAction, Observable,
    OnchainState, Subscription,
};
use cadence_time::{EpochCalculator, LastSync, SyncedClock, SyncedTime};

use crate::telemetry::display_duration;

#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
    /// `NotSynced` is only reported as an error after this long
    pub sync_grace: Duration,
    /// Reveal events are searched over `factor` epochs worth of blocks
    pub event_look_back_factor: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            refresh_interval: Duration::from_secs(15),
            retry_interval: Duration::from_secs(1),
            sync_grace: Duration::from_secs(2),
            event_look_back_factor: 4,
        }
    }
}

/// Merge region entities with the actions they revealed
///
/// Undecodable events are skipped; a later event for the same entity wins.
pub fn assemble_state(snapshot: RegionSnapshot, events: &[RevealedCommitment]) -> OnchainState {
    let mut revealed: HashMap<EntityId, Vec<LocalAction>> = HashMap::new();
    for event in events {
        match event
            .actions
            .iter()
            .map(decode_avatar_action)
            .collect::<CadenceResult<Vec<_>>>()
        {
            Ok(actions) => {
                revealed.insert(event.entity, actions);
            }
            Err(err) => {
                warn!(entity = %event.entity, epoch = %event.epoch, error = %err, "revealed actions skipped");
            }
        }
    }

    let mut state = OnchainState {
        entities: Default::default(),
        epoch: snapshot.epoch,
    };
    for raw in snapshot.entities {
        let actions = revealed.remove(&raw.id).unwrap_or_default();
        state.insert(EntitySnapshot {
            id: raw.id,
            owner: raw.owner,
            kind: raw.kind,
            position: unpack_xy(raw.position),
            life: raw.life,
            last_epoch: raw.last_epoch,
            actions,
        });
    }
    state
}

/// Marks a fetch as in flight until dropped
struct InFlight<'a> {
    slot: &'a AtomicU64,
    generation: u64,
}

impl<'a> InFlight<'a> {
    fn enter(slot: &'a AtomicU64, generation: u64) -> Self {
        slot.store(generation, Ordering::SeqCst);
        InFlight { slot, generation }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // An aborted loop must not clear the flag of its replacement
        let _ = self
            .slot
            .compare_exchange(self.generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PollerInner {
    task: Option<JoinHandle<()>>,
    generation: u64,
    last_zones: Option<Vec<ZoneId>>,
    last_epoch: Option<Epoch>,
    started_at: Option<Instant>,
}

/// Keeps an `OnchainState` stream fresh
pub struct OnchainPoller {
    reader: Arc<dyn EntityReader>,
    clock: Arc<SyncedClock>,
    calculator: EpochCalculator,
    config: PollerConfig,
    state: Observable<OnchainState>,
    viewport: Observable<Viewport>,
    time: Observable<SyncedTime>,
    inner: Mutex<PollerInner>,
    /// Generation of the fetch in flight, 0 when idle
    in_flight: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl OnchainPoller {
    pub fn new(
        reader: Arc<dyn EntityReader>,
        clock: Arc<SyncedClock>,
        time: Observable<SyncedTime>,
        viewport: Observable<Viewport>,
        calculator: EpochCalculator,
        config: PollerConfig,
    ) -> Self {
        OnchainPoller {
            reader,
            clock,
            calculator,
            config,
            state: Observable::new(OnchainState::default()),
            viewport,
            time,
            inner: Mutex::new(PollerInner::default()),
            in_flight: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// The `OnchainState` stream
    pub fn state(&self) -> Observable<OnchainState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) != 0
    }

    /// Follow the viewport and the clock; no-op if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        self.inner.lock().started_at = Some(Instant::now());

        let weak = Arc::downgrade(self);
        subscriptions.push(self.viewport.subscribe(move |viewport: &Viewport| {
            if let Some(this) = weak.upgrade() {
                this.on_viewport(viewport);
            }
        }));
        let weak = Arc::downgrade(self);
        subscriptions.push(self.time.subscribe(move |time: &SyncedTime| {
            if let Some(this) = weak.upgrade() {
                this.on_time(time);
            }
        }));
    }

    /// Cancel everything and reset the state to its default
    pub fn stop(&self) {
        self.subscriptions.lock().clear();
        {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.last_zones = None;
            inner.last_epoch = None;
            inner.started_at = None;
        }
        self.in_flight.store(0, Ordering::SeqCst);
        self.state.set(OnchainState::default());
    }

    /// Abort the fetch in flight and fetch again now
    pub fn refetch(self: &Arc<Self>, from_viewport: bool) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.task = Some(tokio::spawn(Self::run(
            Arc::downgrade(self),
            generation,
            from_viewport,
        )));
    }

    /// One fetch; `Ok(false)` when there was nothing to publish
    ///
    /// A viewport-triggered fetch returns early when the zone set is the one
    /// already loaded. A result whose zone set no longer matches the
    /// viewport is dropped.
    pub async fn fetch(&self, from_viewport: bool) -> CadenceResult<bool> {
        let last_sync = self.clock.last_sync().ok_or(CadenceError::NotSynced)?;
        let zones = visible_zones(&self.viewport.get());
        if from_viewport && self.inner.lock().last_zones.as_ref() == Some(&zones) {
            return Ok(false);
        }

        let snapshot = self.reader.entities_in_regions(&zones).await?;
        if visible_zones(&self.viewport.get()) != zones {
            debug!("viewport moved during fetch, result dropped");
            return Ok(false);
        }

        let current_block = self.reader.block_number().await?;
        let from_block = current_block.saturating_sub(self.event_look_back(&last_sync));
        let events = self
            .reader
            .revealed_commitments(snapshot.epoch.previous(), &zones, from_block, current_block)
            .await?;

        let state = assemble_state(snapshot, &events);
        trace!(
            entities = state.len(),
            events = events.len(),
            epoch = %state.epoch,
            from_block,
            "on-chain state fetched"
        );
        self.inner.lock().last_zones = Some(zones);
        self.state.set(state);
        Ok(true)
    }

    /// Blocks covering `event_look_back_factor` epochs
    fn event_look_back(&self, last_sync: &LastSync) -> u64 {
        let span = self.calculator.epoch_duration().as_millis() as u64
            * u64::from(self.config.event_look_back_factor);
        span.checked_div(last_sync.average_interval.as_millis() as u64)
            .unwrap_or(u64::MAX)
    }

    fn on_viewport(self: &Arc<Self>, viewport: &Viewport) {
        let zones = visible_zones(viewport);
        if self.inner.lock().last_zones.as_ref() == Some(&zones) {
            return;
        }
        self.refetch(true);
    }

    fn on_time(self: &Arc<Self>, time: &SyncedTime) {
        let epoch = self.calculator.epoch_number(time.value);
        let epoch_changed = {
            let mut inner = self.inner.lock();
            let changed = inner.last_epoch != Some(epoch);
            inner.last_epoch = Some(epoch);
            changed
        };
        let lagging = self.state.with(|state| state.epoch < epoch) && !self.is_fetching();
        if epoch_changed || lagging {
            debug!(epoch = %epoch, epoch_changed, lagging, "refetching on-chain state");
            self.refetch(false);
        }
    }

    fn next_delay(&self, result: CadenceResult<bool>) -> Duration {
        match result {
            Ok(_) => self.config.refresh_interval,
            Err(CadenceError::NotSynced) => {
                let elapsed = self
                    .inner
                    .lock()
                    .started_at
                    .map_or(Duration::ZERO, |started| started.elapsed());
                if elapsed > self.config.sync_grace {
                    error!(waited = %display_duration(elapsed), "clock still not synced, cannot read on-chain state");
                } else {
                    debug!("clock not synced yet");
                }
                self.config.retry_interval
            }
            Err(err) => {
                warn!(error = %err, "fetching on-chain state failed");
                self.config.retry_interval
            }
        }
    }

    async fn run(weak: Weak<Self>, generation: u64, from_viewport: bool) {
        let mut from_viewport = from_viewport;
        loop {
            let delay = {
                let Some(this) = weak.upgrade() else { return };
                let result = {
                    let _flight = InFlight::enter(&this.in_flight, generation);
                    this.fetch(from_viewport).await
                };
                this.next_delay(result)
            };
            from_viewport = false;
            tokio::time::sleep(delay).await;
        }
    }
}

impl Drop for OnchainPoller {
    fn drop(&mut self) {
        if let Some(task) = self.inner.get_mut().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_chain::{avatar_codes, pack_xy, ContractAction, RawEntity};
    use cadence_core::{Address, ChainTime, EntityKind, Position, WallTime};
    use cadence_time::{ClockSample, TokioWallClock};
    use std::sync::atomic::AtomicBool;

    /// Entity reader over a fixed world
    #[derive(Default)]
    struct World {
        entities: Mutex<Vec<RawEntity>>,
        epoch: Mutex<Epoch>,
        events: Mutex<Vec<RevealedCommitment>>,
        fail: AtomicBool,
        region_reads: Mutex<Vec<Vec<ZoneId>>>,
        event_ranges: Mutex<Vec<(Epoch, u64, u64)>>,
        /// Viewport moved by the next region read, as a player would
        pan_during_read: Mutex<Option<(Observable<Viewport>, Viewport)>>,
    }

    #[async_trait]
    impl EntityReader for World {
        async fn entities_in_regions(&self, zones: &[ZoneId]) -> CadenceResult<RegionSnapshot> {
            self.region_reads.lock().push(zones.to_vec());
            let pan = self.pan_during_read.lock().take();
            if let Some((viewport, moved)) = pan {
                viewport.set(moved);
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CadenceError::Network("connection refused".into()));
            }
            Ok(RegionSnapshot {
                entities: self.entities.lock().clone(),
                epoch: *self.epoch.lock(),
            })
        }

        async fn revealed_commitments(
            &self,
            epoch: Epoch,
            _zones: &[ZoneId],
            from_block: u64,
            to_block: u64,
        ) -> CadenceResult<Vec<RevealedCommitment>> {
            self.event_ranges.lock().push((epoch, from_block, to_block));
            Ok(self.events.lock().clone())
        }

        async fn block_number(&self) -> CadenceResult<u64> {
            Ok(500)
        }
    }

    fn raw(id: u128, x: i64, y: i64) -> RawEntity {
        RawEntity {
            id: EntityId::from_u128(id),
            owner: Address([id as u8; 20]),
            kind: EntityKind::Avatar,
            position: pack_xy(x, y),
            life: 1,
            last_epoch: Epoch(4),
        }
    }

    struct Fixture {
        poller: Arc<OnchainPoller>,
        world: Arc<World>,
        clock: Arc<SyncedClock>,
        viewport: Observable<Viewport>,
        time: Observable<SyncedTime>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(SyncedClock::new(Arc::new(TokioWallClock::starting_at(
            WallTime(0),
        ))));
        let world = Arc::new(World::default());
        *world.epoch.lock() = Epoch(2);
        let time = Observable::new(clock.snapshot());
        let viewport = Observable::new(Viewport::new(-4, -4, 8, 8));
        let poller = Arc::new(OnchainPoller::new(
            world.clone(),
            clock.clone(),
            time.clone(),
            viewport.clone(),
            EpochCalculator::new(Duration::from_secs(20), Duration::from_secs(3), ChainTime::ZERO)
                .unwrap(),
            PollerConfig::default(),
        ));
        Fixture {
            poller,
            world,
            clock,
            viewport,
            time,
        }
    }

    fn sync(clock: &SyncedClock) {
        clock.apply(ClockSample {
            observed: ChainTime::ZERO,
            captured_at: WallTime(0),
            height: 10,
            average_interval: Duration::from_secs(2),
        });
    }

    #[test]
    fn test_assemble_attaches_revealed_actions() {
        let snapshot = RegionSnapshot {
            entities: vec![raw(1, 3, -2), raw(2, 0, 0)],
            epoch: Epoch(5),
        };
        let events = vec![
            RevealedCommitment {
                entity: EntityId::from_u128(1),
                epoch: Epoch(4),
                zone: ZoneId::containing(Position::new(3, -2)),
                actions: vec![ContractAction {
                    action_type: avatar_codes::MOVE,
                    data: pack_xy(3, -2),
                }],
            },
            RevealedCommitment {
                entity: EntityId::from_u128(2),
                epoch: Epoch(4),
                zone: ZoneId::containing(Position::new(0, 0)),
                actions: vec![ContractAction {
                    action_type: 9,
                    data: 0,
                }],
            },
        ];

        let state = assemble_state(snapshot, &events);
        assert_eq!(state.epoch, Epoch(5));
        let first = state.get(&EntityId::from_u128(1)).unwrap();
        assert_eq!(first.position, Position::new(3, -2));
        assert_eq!(first.actions, vec![LocalAction::move_to(Position::new(3, -2))]);
        assert!(state.get(&EntityId::from_u128(2)).unwrap().actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_requires_sync() {
        let f = fixture();
        assert_eq!(f.poller.fetch(false).await, Err(CadenceError::NotSynced));
        assert!(f.world.region_reads.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_reads_previous_epoch_events() {
        let f = fixture();
        sync(&f.clock);
        *f.world.epoch.lock() = Epoch(6);
        f.world.entities.lock().push(raw(1, 1, 1));

        assert_eq!(f.poller.fetch(false).await, Ok(true));
        let state = f.poller.state().get();
        assert_eq!(state.epoch, Epoch(6));
        assert_eq!(state.len(), 1);
        // 4 epochs of 23s at 2s per block
        assert_eq!(*f.world.event_ranges.lock(), vec![(Epoch(5), 454, 500)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewport_fetch_skips_same_zones() {
        let f = fixture();
        sync(&f.clock);
        assert_eq!(f.poller.fetch(true).await, Ok(true));
        assert_eq!(f.poller.fetch(true).await, Ok(false));
        assert_eq!(f.world.region_reads.lock().len(), 1);
        // Periodic refreshes always read
        assert_eq!(f.poller.fetch(false).await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_dropped_when_viewport_moves_during_fetch() {
        let f = fixture();
        sync(&f.clock);
        f.world.entities.lock().push(raw(1, 0, 0));
        let moved = Viewport::new(100, 100, 8, 8);
        *f.world.pan_during_read.lock() = Some((f.viewport.clone(), moved));

        assert_eq!(f.poller.fetch(false).await, Ok(false));
        assert_eq!(f.poller.state().get(), OnchainState::default());
        assert!(f.world.event_ranges.lock().is_empty());

        // The zones of the new viewport are still unloaded
        assert_eq!(f.poller.fetch(true).await, Ok(true));
        assert_eq!(f.world.region_reads.lock().last(), Some(&visible_zones(&moved)));
        assert_eq!(f.poller.state().get().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_schedule() {
        let f = fixture();
        f.poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.world.region_reads.lock().is_empty());

        // Not synced: retried every second
        sync(&f.clock);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.world.region_reads.lock().len(), 1);
        assert_eq!(f.poller.state().get().epoch, Epoch(2));

        // Success: next read after the refresh interval
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(f.world.region_reads.lock().len(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.world.region_reads.lock().len(), 2);

        // Failure: retried after one second
        f.world.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(15)).await;
        let reads = f.world.region_reads.lock().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.world.region_reads.lock().len(), reads + 1);

        f.poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewport_change_refetches_on_new_zones() {
        let f = fixture();
        sync(&f.clock);
        f.poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reads = f.world.region_reads.lock().len();
        assert!(reads >= 1);

        // Same zones
        f.viewport.set(Viewport::new(-3, -3, 6, 6));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.world.region_reads.lock().len(), reads);

        f.viewport.set(Viewport::new(100, 100, 8, 8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let region_reads = f.world.region_reads.lock();
        assert_eq!(region_reads.len(), reads + 1);
        assert_eq!(
            region_reads.last().unwrap(),
            &visible_zones(&Viewport::new(100, 100, 8, 8))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_chain_epoch_refetches() {
        let f = fixture();
        sync(&f.clock);
        f.poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reads = f.world.region_reads.lock().len();

        // The clock says epoch 3, the chain still reports 2
        tokio::time::advance(Duration::from_secs(24)).await;
        f.time.set(f.clock.snapshot());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_epoch_change = f.world.region_reads.lock().len();
        assert!(after_epoch_change > reads);

        f.time.set(f.clock.snapshot());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.world.region_reads.lock().len(), after_epoch_change + 1);

        // Caught up: ticks no longer refetch
        *f.world.epoch.lock() = Epoch(3);
        f.poller.refetch(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let caught_up = f.world.region_reads.lock().len();
        f.time.set(f.clock.snapshot());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.world.region_reads.lock().len(), caught_up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_resets_state() {
        let f = fixture();
        sync(&f.clock);
        f.world.entities.lock().push(raw(1, 0, 0));
        f.poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.poller.state().get().len(), 1);

        f.poller.stop();
        assert!(!f.poller.is_running());
        assert_eq!(f.poller.state().get(), OnchainState::default());
        let reads = f.world.region_reads.lock().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.world.region_reads.lock().len(), reads);
    }
}
