//! Clock Synchronizer - keeps the chain clock aligned with the chain
//!
//! Lifecycle:
//! 1. Initial sync: read the latest block and one `look_back` blocks older
//!    to estimate the average block interval. Retried every `retry_delay`
//!    until it succeeds.
//! 2. Refinement: poll the latest block quickly until a new height shows
//!    up, which pins `captured_at` to within one polling interval of block
//!    production. Stops for good after that one new height.
//! 3. Every `tick_interval` the current estimate is published.
//!
//! There is no continuous re-sync: later corrections would make the clock
//! jump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use cadence_core::{CadenceError, CadenceResult, ChainTime, Observable, WallClock};

use crate::{BlockTag, ClockSample, LastSync, SyncedClock, SyncedTime, TimeSource};

/// Clock synchronizer configuration
#[derive(Clone, Debug)]
pub struct ClockConfig {
    /// Blocks between the two samples of the initial sync
    pub look_back: u64,
    /// Delay before retrying a failed initial sync
    pub retry_delay: Duration,
    /// Floor for the refinement polling interval
    pub min_polling_interval: Duration,
    /// Refinement polls `average_interval / refinement_divisor`
    pub refinement_divisor: u32,
    /// Interval of the published clock stream
    pub tick_interval: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            look_back: 64,
            retry_delay: Duration::from_secs(1),
            min_polling_interval: Duration::from_millis(100),
            refinement_divisor: 100,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Drives a `SyncedClock` from a `TimeSource` and publishes `SyncedTime`
pub struct ClockSynchronizer {
    clock: Arc<SyncedClock>,
    source: Arc<dyn TimeSource>,
    config: ClockConfig,
    time: Observable<SyncedTime>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    refined: AtomicBool,
}

impl ClockSynchronizer {
    pub fn new(source: Arc<dyn TimeSource>, wall: Arc<dyn WallClock>, config: ClockConfig) -> Self {
        let clock = Arc::new(SyncedClock::new(wall));
        let time = Observable::new(clock.snapshot());
        ClockSynchronizer {
            clock,
            source,
            config,
            time,
            tasks: Mutex::new(Vec::new()),
            refined: AtomicBool::new(false),
        }
    }

    /// The clock this synchronizer feeds
    pub fn clock(&self) -> Arc<SyncedClock> {
        Arc::clone(&self.clock)
    }

    /// Current chain time estimate
    pub fn now(&self) -> ChainTime {
        self.clock.now()
    }

    /// Stream of clock values, one per `tick_interval`
    pub fn time(&self) -> Observable<SyncedTime> {
        self.time.clone()
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// True once refinement caught a fresh block
    pub fn is_refined(&self) -> bool {
        self.refined.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Spawn the tick and sync tasks; no-op if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let tick_interval = self.config.tick_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.publish();
            }
        }));

        tasks.push(tokio::spawn(Self::run_sync(Arc::downgrade(self))));
    }

    /// Cancel every task; the last estimate stays readable
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// One initial-sync attempt
    pub async fn sync_once(&self) -> CadenceResult<LastSync> {
        let wall = self.clock.wall();
        let before = wall.now();
        let latest = self.source.block(BlockTag::Latest).await?;
        let captured_at = before.midpoint(wall.now());

        let sample_size = latest.height.min(self.config.look_back);
        let from = latest.height - sample_size;
        let older = self.source.block(BlockTag::Number(from)).await?;

        let average_interval = if sample_size > 0 {
            let span = latest.timestamp.millis_since(older.timestamp).max(0) as u64;
            Duration::from_millis(span / sample_size)
        } else {
            Duration::ZERO
        };

        let applied = self.clock.apply(ClockSample {
            observed: latest.timestamp,
            captured_at,
            height: latest.height,
            average_interval,
        });
        debug!(
            height = latest.height,
            block_time = ?latest.timestamp,
            average_interval = ?average_interval,
            applied,
            "initial clock sample"
        );
        self.publish();

        // A refused sample means a newer one is already in place
        self.clock.last_sync().ok_or(CadenceError::NotSynced)
    }

    /// One refinement poll; true when a new height was applied
    pub async fn refine_once(&self, last: &LastSync) -> CadenceResult<bool> {
        let wall = self.clock.wall();
        let before = wall.now();
        let latest = self.source.block(BlockTag::Latest).await?;
        if latest.height <= last.height {
            return Ok(false);
        }
        let captured_at = before.midpoint(wall.now());
        let applied = self.clock.apply(ClockSample {
            observed: latest.timestamp,
            captured_at,
            height: latest.height,
            average_interval: last.average_interval,
        });
        if applied {
            self.refined.store(true, Ordering::SeqCst);
            self.publish();
        }
        Ok(applied)
    }

    /// Refinement polling interval for a given sync
    pub fn polling_interval(&self, last: &LastSync) -> Duration {
        let divisor = self.config.refinement_divisor.max(1);
        (last.average_interval / divisor).max(self.config.min_polling_interval)
    }

    fn publish(&self) {
        self.time.set(self.clock.snapshot());
    }

    async fn run_sync(weak: Weak<Self>) {
        let last = loop {
            let delay = {
                let Some(this) = weak.upgrade() else { return };
                let result = this.sync_once().await;
                match result {
                    Ok(last) => break last,
                    Err(err) => {
                        warn!(error = %err, "initial clock sync failed, retrying");
                        this.config.retry_delay
                    }
                }
            };
            tokio::time::sleep(delay).await;
        };

        let interval = match weak.upgrade() {
            Some(this) => this.polling_interval(&last),
            None => return,
        };
        info!(
            height = last.height,
            average_interval = ?last.average_interval,
            polling = ?interval,
            "clock synced, waiting for next block"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the block we just read is still latest
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(this) = weak.upgrade() else { return };
            match this.refine_once(&last).await {
                Ok(true) => {
                    debug!(now = ?this.now(), "clock refined on new block");
                    return;
                }
                Ok(false) => {}
                Err(err) => debug!(error = %err, "block polling failed"),
            }
        }
    }
}

impl Drop for ClockSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
