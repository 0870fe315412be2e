//! Chain clock extrapolated from block samples

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use cadence_core::{ChainTime, SystemWallClock, WallClock, WallTime};

/// One reading of the chain clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockSample {
    /// Block timestamp
    pub observed: ChainTime,
    /// Local wall time the block was read at
    pub captured_at: WallTime,
    /// Block height
    pub height: u64,
    /// Average time between blocks
    pub average_interval: Duration,
}

/// Metadata of the sample currently driving the clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastSync {
    pub captured_at: WallTime,
    pub height: u64,
    pub average_interval: Duration,
}

/// Value published on the clock stream
///
/// `last_sync` is `None` until the first successful sync, so consumers can
/// tell "not synced yet" apart from "synced at T".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncedTime {
    pub value: ChainTime,
    pub last_sync: Option<LastSync>,
}

#[derive(Debug)]
struct ClockState {
    observed: ChainTime,
    captured_at: WallTime,
    last_sync: Option<LastSync>,
}

/// Chain clock: `now = observed + (wall_now - captured_at)`
///
/// INVARIANT: once synced, `now()` never returns a value lower than one it
/// returned before. A sample whose extrapolation lands behind the previous
/// estimate holds the clock until it catches up.
pub struct SyncedClock {
    wall: Arc<dyn WallClock>,
    state: RwLock<ClockState>,
    /// Highest value handed out since the first sync
    floor: AtomicI64,
}

impl SyncedClock {
    /// Unsynced clock that follows the local wall clock, truncated to seconds
    pub fn new(wall: Arc<dyn WallClock>) -> Self {
        let now = wall.now();
        SyncedClock {
            wall,
            state: RwLock::new(ClockState {
                observed: ChainTime::from_millis(now.as_millis().div_euclid(1000) * 1000),
                captured_at: now,
                last_sync: None,
            }),
            floor: AtomicI64::new(i64::MIN),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemWallClock))
    }

    /// Current chain time estimate; cheap, no I/O
    pub fn now(&self) -> ChainTime {
        let (extrapolated, synced) = {
            let state = self.state.read();
            let elapsed = self.wall.now().millis_since(state.captured_at);
            (state.observed.offset_millis(elapsed), state.last_sync.is_some())
        };
        if !synced {
            return extrapolated;
        }
        let previous = self.floor.fetch_max(extrapolated.as_millis(), Ordering::SeqCst);
        ChainTime::from_millis(previous.max(extrapolated.as_millis()))
    }

    /// Apply a new sample
    ///
    /// Returns false when the sample's height is not strictly above the
    /// last applied one; such samples are ignored.
    pub fn apply(&self, sample: ClockSample) -> bool {
        let mut state = self.state.write();
        if let Some(last) = state.last_sync {
            if sample.height <= last.height {
                return false;
            }
        }
        let first = state.last_sync.is_none();
        state.observed = sample.observed;
        state.captured_at = sample.captured_at;
        state.last_sync = Some(LastSync {
            captured_at: sample.captured_at,
            height: sample.height,
            average_interval: sample.average_interval,
        });
        if first {
            // The pre-sync estimate came from the local clock; drop it
            self.floor.store(i64::MIN, Ordering::SeqCst);
        }
        true
    }

    pub fn last_sync(&self) -> Option<LastSync> {
        self.state.read().last_sync
    }

    pub fn is_synced(&self) -> bool {
        self.state.read().last_sync.is_some()
    }

    pub fn snapshot(&self) -> SyncedTime {
        SyncedTime {
            value: self.now(),
            last_sync: self.last_sync(),
        }
    }

    pub fn wall(&self) -> &Arc<dyn WallClock> {
        &self.wall
    }
}

impl std::fmt::Debug for SyncedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedClock")
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Wall clock that follows tokio's clock
///
/// Anchored to the system clock at creation; afterwards it advances with
/// `tokio::time::Instant`, so paused-time tests drive it deterministically.
#[derive(Debug, Clone)]
pub struct TokioWallClock {
    origin: tokio::time::Instant,
    origin_wall: WallTime,
}

impl TokioWallClock {
    pub fn new() -> Self {
        Self::starting_at(SystemWallClock.now())
    }

    pub fn starting_at(origin_wall: WallTime) -> Self {
        TokioWallClock {
            origin: tokio::time::Instant::now(),
            origin_wall,
        }
    }
}

impl Default for TokioWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for TokioWallClock {
    fn now(&self) -> WallTime {
        self.origin_wall + self.origin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ManualWallClock;
    use proptest::prelude::*;

    fn manual_clock(start_ms: i64) -> (Arc<ManualWallClock>, SyncedClock) {
        let wall = Arc::new(ManualWallClock::new(WallTime(start_ms)));
        let clock = SyncedClock::new(wall.clone());
        (wall, clock)
    }

    fn sample(observed_ms: i64, captured_ms: i64, height: u64) -> ClockSample {
        ClockSample {
            observed: ChainTime(observed_ms),
            captured_at: WallTime(captured_ms),
            height,
            average_interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_unsynced_clock_follows_wall_clock() {
        let (wall, clock) = manual_clock(10_500);
        assert_eq!(clock.now(), ChainTime(10_000));
        wall.advance(Duration::from_millis(700));
        assert_eq!(clock.now(), ChainTime(10_700));
        assert!(!clock.is_synced());
        assert_eq!(clock.snapshot().last_sync, None);
    }

    #[test]
    fn test_linear_extrapolation() {
        let (wall, clock) = manual_clock(1_000);
        assert!(clock.apply(sample(500_000, 1_000, 10)));
        wall.advance(Duration::from_millis(1_250));
        assert_eq!(clock.now(), ChainTime(501_250));
    }

    #[test]
    fn test_stale_height_rejected() {
        let (_wall, clock) = manual_clock(0);
        assert!(clock.apply(sample(100_000, 0, 10)));
        assert!(!clock.apply(sample(200_000, 0, 10)));
        assert!(!clock.apply(sample(200_000, 0, 9)));
        assert_eq!(clock.last_sync().unwrap().height, 10);
        assert_eq!(clock.now(), ChainTime(100_000));
    }

    #[test]
    fn test_first_sync_may_move_backwards() {
        // Local clock far ahead of the chain: the first sample wins
        let (_wall, clock) = manual_clock(900_000);
        clock.now();
        assert!(clock.apply(sample(100_000, 900_000, 1)));
        assert_eq!(clock.now(), ChainTime(100_000));
    }

    #[test]
    fn test_backward_sample_holds_clock() {
        let (wall, clock) = manual_clock(0);
        clock.apply(sample(100_000, 0, 1));
        wall.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), ChainTime(103_000));

        // Next block says it is only 102s at capture time
        clock.apply(sample(102_000, 3_000, 2));
        assert_eq!(clock.now(), ChainTime(103_000));
        wall.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), ChainTime(104_000));
    }

    proptest! {
        #[test]
        fn prop_now_never_goes_backwards(
            steps in proptest::collection::vec((0i64..5_000, -3_000i64..3_000), 1..40)
        ) {
            let (wall, clock) = manual_clock(0);
            clock.apply(sample(1_000_000, 0, 1));
            let mut last = clock.now();
            let mut height = 1;
            let mut wall_ms = 0;
            for (advance, skew) in steps {
                wall_ms += advance;
                wall.set(WallTime(wall_ms));
                height += 1;
                let observed = 1_000_000 + wall_ms + skew;
                clock.apply(sample(observed, wall_ms, height));
                let now = clock.now();
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
