//! Autonomous Scheduler
//!
//! Sends the commit and the reveal on the player's behalf at the last safe
//! moment before each deadline. Two tiers:
//!
//! 1. Every clock tick a coarse check decides whether a deadline falls
//!    within `arming_horizon`. If so it arms one timer.
//! 2. The armed timer wakes just past the deadline and re-validates the
//!    preconditions every `reveal_phase_duration / high_frequency_divisor`
//!    until the transaction is sent or the preconditions stop holding.
//!
//! At most one timer is armed at any time. A tick on which neither the
//! commit nor the reveal condition holds cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use cadence_chain::SubmitOptions;
use cadence_core::{Epoch, Observable, Subscription};
use cadence_state::{LocalLedger, LocalState, PendingEntity};
use cadence_time::{EpochCalculator, EpochInfo, SyncedClock, SyncedTime};

use crate::telemetry::display_duration;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How close a deadline must be for the coarse tick to arm a timer
    pub arming_horizon: Duration,
    /// High-frequency interval is `reveal_phase_duration / divisor`
    pub high_frequency_divisor: u32,
    /// Added to the arming delay so the first check lands past the deadline
    pub check_delay_margin: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            arming_horizon: Duration::from_secs(1),
            high_frequency_divisor: 30,
            check_delay_margin: Duration::from_millis(100),
        }
    }
}

impl SchedulerConfig {
    pub fn high_frequency_interval(&self, reveal_phase_duration: Duration) -> Duration {
        (reveal_phase_duration / self.high_frequency_divisor.max(1)).max(Duration::from_millis(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArmKind {
    Commit,
    Reveal,
}

/// What the coarse tick decided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickDecision {
    /// Nothing due; any armed timer is cancelled
    Disarm,
    /// A deadline is within the horizon; check again after `delay`
    Arm { kind: ArmKind, delay: Duration },
    /// The commit window closed on an uncommitted `enter` or `exit`
    Forfeit,
}

/// Result of one high-frequency check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CheckOutcome {
    Fired,
    Wait,
    Stop,
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

fn from_millis(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

/// The entity loses a pending enter or exit it never committed
fn forfeits(entity: &PendingEntity, info: &EpochInfo, committing: bool) -> bool {
    info.is_reveal_phase()
        && entity.epoch == info.current_epoch
        && entity.submission.is_none()
        && !committing
        && entity
            .last_action()
            .map_or(false, |action| action.is_enter() || action.is_exit())
}

/// Coarse tick decision for `local` at `info`
///
/// `allowance` is the time the commit needs to land before the commit
/// phase ends (`EpochCalculator::commit_time_allowance`).
pub fn plan_tick(
    info: &EpochInfo,
    local: &LocalState,
    committing: bool,
    allowance: Duration,
    config: &SchedulerConfig,
) -> TickDecision {
    let Some(entity) = local.entity() else {
        return TickDecision::Disarm;
    };
    let epoch = info.current_epoch;
    let horizon = millis(config.arming_horizon);
    let margin = millis(config.check_delay_margin);
    let left_for_commit_end = millis(info.time_left_for_commit_end);
    let time_to_commit = left_for_commit_end - millis(allowance);

    let should_commit = info.is_commit_phase
        && entity.submission.is_none()
        && entity.epoch == epoch
        && !(entity.exiting && entity.actions.is_empty())
        && time_to_commit <= horizon;
    if should_commit {
        return TickDecision::Arm {
            kind: ArmKind::Commit,
            delay: from_millis(time_to_commit + margin),
        };
    }

    let should_reveal = entity
        .submission
        .as_ref()
        .map_or(false, |s| s.commit.epoch == epoch && !s.is_revealed_for(epoch))
        && (!info.is_commit_phase || left_for_commit_end <= horizon);
    if should_reveal {
        let delay = if info.is_commit_phase {
            left_for_commit_end + margin
        } else {
            margin
        };
        return TickDecision::Arm {
            kind: ArmKind::Reveal,
            delay: from_millis(delay),
        };
    }

    if forfeits(entity, info, committing) {
        return TickDecision::Forfeit;
    }
    TickDecision::Disarm
}

struct ArmedTimer {
    kind: ArmKind,
    generation: u64,
    task: JoinHandle<()>,
}

/// Autonomous Scheduler
pub struct AutoSubmitter {
    ledger: Arc<LocalLedger>,
    clock: Arc<SyncedClock>,
    time: Observable<SyncedTime>,
    calculator: EpochCalculator,
    config: SchedulerConfig,
    armed: Mutex<Option<ArmedTimer>>,
    generation: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl AutoSubmitter {
    pub fn new(
        ledger: Arc<LocalLedger>,
        clock: Arc<SyncedClock>,
        time: Observable<SyncedTime>,
        calculator: EpochCalculator,
        config: SchedulerConfig,
    ) -> Self {
        AutoSubmitter {
            ledger,
            clock,
            time,
            calculator,
            config,
            armed: Mutex::new(None),
            generation: AtomicU64::new(0),
            subscription: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn high_frequency_interval(&self) -> Duration {
        self.config
            .high_frequency_interval(self.calculator.reveal_phase_duration())
    }

    /// Options for transactions sent by the scheduler: receipts are polled
    /// at the high-frequency interval
    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions::polling(self.high_frequency_interval())
    }

    /// Number of armed timers, zero or one
    pub fn active_timers(&self) -> usize {
        usize::from(self.armed.lock().is_some())
    }

    pub fn armed_kind(&self) -> Option<ArmKind> {
        self.armed.lock().as_ref().map(|armed| armed.kind)
    }

    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Run the coarse check on every clock tick; no-op if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *subscription = Some(self.time.subscribe(move |_: &SyncedTime| {
            if let Some(this) = weak.upgrade() {
                this.tick();
            }
        }));
    }

    /// Unsubscribe and cancel the armed timer
    ///
    /// A transaction already handed to the ledger still completes.
    pub fn stop(&self) {
        self.subscription.lock().take();
        self.disarm();
    }

    /// Coarse check against the current clock
    pub fn tick(self: &Arc<Self>) -> TickDecision {
        if !self.clock.is_synced() {
            self.disarm();
            return TickDecision::Disarm;
        }
        let info = self.calculator.epoch_info(self.clock.now());
        self.ledger.update(info.current_epoch);
        let local = self.ledger.snapshot();
        let decision = plan_tick(
            &info,
            &local,
            self.ledger.is_committing(),
            self.calculator.commit_time_allowance(),
            &self.config,
        );

        match decision {
            TickDecision::Disarm => self.disarm(),
            TickDecision::Arm { kind, delay } => self.arm(kind, delay),
            TickDecision::Forfeit => {
                self.disarm();
                self.forfeit(info.current_epoch);
            }
        }
        decision
    }

    fn arm(self: &Arc<Self>, kind: ArmKind, delay: Duration) {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.high_frequency_interval();
        debug!(?kind, delay = %display_duration(delay), "timer armed");
        let task = tokio::spawn(Self::run_timer(
            Arc::downgrade(self),
            kind,
            delay,
            interval,
            generation,
        ));
        *armed = Some(ArmedTimer {
            kind,
            generation,
            task,
        });
    }

    fn disarm(&self) {
        if let Some(armed) = self.armed.lock().take() {
            debug!(kind = ?armed.kind, "timer cancelled");
            armed.task.abort();
        }
    }

    /// Clear the slot once the timer with `generation` is done
    fn release(&self, generation: u64) {
        let mut armed = self.armed.lock();
        if armed.as_ref().map_or(false, |a| a.generation == generation) {
            *armed = None;
        }
    }

    async fn run_timer(
        weak: Weak<Self>,
        kind: ArmKind,
        delay: Duration,
        interval: Duration,
        generation: u64,
    ) {
        tokio::time::sleep(delay).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(this) = weak.upgrade() else { return };
            match this.check(kind) {
                CheckOutcome::Wait => {}
                CheckOutcome::Fired | CheckOutcome::Stop => {
                    this.release(generation);
                    return;
                }
            }
        }
    }

    /// High-frequency re-validation
    fn check(&self, kind: ArmKind) -> CheckOutcome {
        let info = self.calculator.epoch_info(self.clock.now());
        let epoch = info.current_epoch;
        self.ledger.update(epoch);
        let local = self.ledger.snapshot();
        let Some(entity) = local.entity() else {
            return CheckOutcome::Stop;
        };

        match kind {
            ArmKind::Commit => {
                // Woke up after the commit phase closed
                if forfeits(entity, &info, self.ledger.is_committing()) {
                    self.forfeit(epoch);
                    return CheckOutcome::Stop;
                }
                let due = info.is_commit_phase
                    && entity.submission.is_none()
                    && entity.epoch == epoch
                    && !(entity.exiting && entity.actions.is_empty());
                if !due {
                    return CheckOutcome::Stop;
                }
                if info.time_left_for_commit_end > self.calculator.commit_time_allowance() {
                    return CheckOutcome::Wait;
                }
                self.fire(ArmKind::Commit, epoch);
                CheckOutcome::Fired
            }
            ArmKind::Reveal => {
                if info.is_commit_phase {
                    return CheckOutcome::Wait;
                }
                match &entity.submission {
                    Some(s) if s.commit.epoch == epoch => {
                        if s.is_revealed_for(epoch) {
                            return CheckOutcome::Stop;
                        }
                        self.fire(ArmKind::Reveal, epoch);
                        CheckOutcome::Fired
                    }
                    _ => {
                        if forfeits(entity, &info, self.ledger.is_committing()) {
                            self.forfeit(epoch);
                        }
                        CheckOutcome::Stop
                    }
                }
            }
        }
    }

    fn fire(&self, kind: ArmKind, epoch: Epoch) {
        let ledger = Arc::clone(&self.ledger);
        let options = self.submit_options();
        info!(?kind, epoch = %epoch, "auto-submitting");
        tokio::spawn(async move {
            let result = match kind {
                ArmKind::Commit => ledger.commit(options).await,
                ArmKind::Reveal => ledger.reveal(options).await,
            };
            match result {
                Ok(outcome) => debug!(?kind, ?outcome, "auto-submission finished"),
                Err(err) => warn!(?kind, error = %err, "auto-submission failed"),
            }
        });
    }

    fn forfeit(&self, epoch: Epoch) {
        info!(epoch = %epoch, "commit window missed, pending entry or exit forfeited");
        if let Err(err) = self.ledger.remove_entity() {
            debug!(error = %err, "nothing to forfeit");
        }
    }
}

impl Drop for AutoSubmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AutoSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSubmitter")
            .field("config", &self.config)
            .field("armed", &self.armed_kind())
            .field("running", &self.is_running())
            .finish()
    }
}
