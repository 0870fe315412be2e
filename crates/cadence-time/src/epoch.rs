//! Epoch Calculator
//!
//! An epoch is one commit phase followed by one reveal phase. Both
//! durations and the genesis start time are fixed for a deployment, so
//! everything here is a pure function of a chain time value: the smoothed
//! `SyncedClock::now()` and an exact block timestamp give the same answer
//! for the same input.
//!
//! Epoch numbering starts at `Epoch::FIRST` (2); 0 and 1 are reserved by
//! the game contract.

use std::time::Duration;

use cadence_core::{CadenceError, CadenceResult, ChainTime, Epoch};

/// Margin added to the reveal duration when deciding that the commit
/// transaction must be sent now
pub const COMMIT_ALLOWANCE_MARGIN: Duration = Duration::from_millis(100);

/// Epoch and phase position of one instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochInfo {
    pub current_epoch: Epoch,
    /// Time elapsed since the current epoch started
    pub time_in_cycle: Duration,
    pub time_left_in_epoch: Duration,
    pub is_commit_phase: bool,
    pub time_left_in_phase: Duration,
    /// Zero once the commit phase is over
    pub time_left_for_commit_end: Duration,
    pub time_left_for_reveal_end: Duration,
    pub commit_phase_duration: Duration,
    pub reveal_phase_duration: Duration,
    pub current_phase_duration: Duration,
}

impl EpochInfo {
    #[inline]
    pub fn is_reveal_phase(&self) -> bool {
        !self.is_commit_phase
    }
}

/// Maps chain time to epochs and phases
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochCalculator {
    commit_phase_duration: Duration,
    reveal_phase_duration: Duration,
    start_time: ChainTime,
}

impl EpochCalculator {
    /// Both durations must be non-zero and whole milliseconds are used
    pub fn new(
        commit_phase_duration: Duration,
        reveal_phase_duration: Duration,
        start_time: ChainTime,
    ) -> CadenceResult<Self> {
        if commit_phase_duration.as_millis() == 0 {
            return Err(CadenceError::InvalidConfig(
                "commit phase duration must be positive".into(),
            ));
        }
        if reveal_phase_duration.as_millis() == 0 {
            return Err(CadenceError::InvalidConfig(
                "reveal phase duration must be positive".into(),
            ));
        }
        Ok(EpochCalculator {
            commit_phase_duration,
            reveal_phase_duration,
            start_time,
        })
    }

    pub fn commit_phase_duration(&self) -> Duration {
        self.commit_phase_duration
    }

    pub fn reveal_phase_duration(&self) -> Duration {
        self.reveal_phase_duration
    }

    pub fn start_time(&self) -> ChainTime {
        self.start_time
    }

    /// Length of one full commit + reveal cycle
    pub fn epoch_duration(&self) -> Duration {
        self.commit_phase_duration + self.reveal_phase_duration
    }

    /// Time needed after the commit deadline check for the commit
    /// transaction to land: the reveal duration plus a small margin
    pub fn commit_time_allowance(&self) -> Duration {
        self.reveal_phase_duration + COMMIT_ALLOWANCE_MARGIN
    }

    fn cycle_millis(&self) -> i64 {
        self.epoch_duration().as_millis() as i64
    }

    /// Milliseconds since genesis; instants before genesis count as genesis
    fn elapsed_millis(&self, time: ChainTime) -> i64 {
        time.millis_since(self.start_time).max(0)
    }

    pub fn epoch_number(&self, time: ChainTime) -> Epoch {
        let cycles = self.elapsed_millis(time) / self.cycle_millis();
        Epoch::new(cycles as u64 + Epoch::FIRST.value())
    }

    /// First instant of `epoch`; epochs below `Epoch::FIRST` map to genesis
    pub fn epoch_start(&self, epoch: Epoch) -> ChainTime {
        let index = epoch.value().saturating_sub(Epoch::FIRST.value()) as i64;
        self.start_time
            .offset_millis(index.saturating_mul(self.cycle_millis()))
    }

    /// Instant the commit phase of `epoch` closes
    pub fn commit_end(&self, epoch: Epoch) -> ChainTime {
        self.epoch_start(epoch) + self.commit_phase_duration
    }

    pub fn epoch_info(&self, time: ChainTime) -> EpochInfo {
        let cycle = self.cycle_millis();
        let elapsed = self.elapsed_millis(time);
        let in_cycle = elapsed % cycle;
        let commit = self.commit_phase_duration.as_millis() as i64;

        let is_commit_phase = in_cycle < commit;
        let time_left_in_epoch = cycle - in_cycle;
        let time_left_for_commit_end = (commit - in_cycle).max(0);
        let (time_left_in_phase, current_phase_duration) = if is_commit_phase {
            (commit - in_cycle, self.commit_phase_duration)
        } else {
            (time_left_in_epoch, self.reveal_phase_duration)
        };

        EpochInfo {
            current_epoch: Epoch::new((elapsed / cycle) as u64 + Epoch::FIRST.value()),
            time_in_cycle: millis(in_cycle),
            time_left_in_epoch: millis(time_left_in_epoch),
            is_commit_phase,
            time_left_in_phase: millis(time_left_in_phase),
            time_left_for_commit_end: millis(time_left_for_commit_end),
            time_left_for_reveal_end: millis(time_left_in_epoch),
            commit_phase_duration: self.commit_phase_duration,
            reveal_phase_duration: self.reveal_phase_duration,
            current_phase_duration,
        }
    }
}

#[inline]
fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calculator(commit: u64, reveal: u64, start: i64) -> EpochCalculator {
        EpochCalculator::new(
            Duration::from_secs(commit),
            Duration::from_secs(reveal),
            ChainTime::from_millis(start),
        )
        .unwrap()
    }

    #[test]
    fn test_reveal_then_next_commit() {
        let calc = calculator(20, 3, 0);

        let info = calc.epoch_info(ChainTime::from_secs(21));
        assert_eq!(info.current_epoch, Epoch(2));
        assert!(!info.is_commit_phase);
        assert_eq!(info.time_left_in_phase, Duration::from_secs(2));
        assert_eq!(info.time_left_for_commit_end, Duration::ZERO);
        assert_eq!(info.current_phase_duration, Duration::from_secs(3));

        let info = calc.epoch_info(ChainTime::from_secs(23));
        assert_eq!(info.current_epoch, Epoch(3));
        assert!(info.is_commit_phase);
        assert_eq!(info.time_left_in_phase, Duration::from_secs(20));
        assert_eq!(info.time_left_for_reveal_end, Duration::from_secs(23));
    }

    #[test]
    fn test_phase_boundary_is_exclusive() {
        let calc = calculator(20, 3, 0);
        assert!(calc.epoch_info(ChainTime::from_millis(19_999)).is_commit_phase);
        assert!(calc.epoch_info(ChainTime::from_secs(20)).is_reveal_phase());
    }

    #[test]
    fn test_before_genesis_is_first_epoch() {
        let calc = calculator(20, 3, 1_000_000);
        let info = calc.epoch_info(ChainTime::from_millis(5));
        assert_eq!(info.current_epoch, Epoch::FIRST);
        assert!(info.is_commit_phase);
        assert_eq!(info.time_left_in_phase, Duration::from_secs(20));
    }

    #[test]
    fn test_epoch_boundaries() {
        let calc = calculator(20, 3, 1_000);
        assert_eq!(calc.epoch_start(Epoch(2)), ChainTime::from_millis(1_000));
        assert_eq!(calc.epoch_start(Epoch(4)), ChainTime::from_millis(47_000));
        assert_eq!(calc.commit_end(Epoch(3)), ChainTime::from_millis(44_000));
        assert_eq!(calc.epoch_number(calc.epoch_start(Epoch(7))), Epoch(7));
        assert_eq!(calc.commit_time_allowance(), Duration::from_millis(3_100));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let err = EpochCalculator::new(Duration::ZERO, Duration::from_secs(3), ChainTime::ZERO);
        assert!(matches!(err, Err(CadenceError::InvalidConfig(_))));
        let err = EpochCalculator::new(Duration::from_secs(3), Duration::ZERO, ChainTime::ZERO);
        assert!(matches!(err, Err(CadenceError::InvalidConfig(_))));
    }

    proptest! {
        #[test]
        fn prop_epoch_non_decreasing(
            commit in 1u64..100_000,
            reveal in 1u64..100_000,
            start in -1_000_000i64..1_000_000,
            t1 in -2_000_000i64..10_000_000,
            delta in 0i64..10_000_000,
        ) {
            let calc = EpochCalculator::new(
                Duration::from_millis(commit),
                Duration::from_millis(reveal),
                ChainTime::from_millis(start),
            ).unwrap();
            let e1 = calc.epoch_number(ChainTime::from_millis(t1));
            let e2 = calc.epoch_number(ChainTime::from_millis(t1 + delta));
            prop_assert!(e1 <= e2);
            prop_assert!(e1 >= Epoch::FIRST);
        }

        #[test]
        fn prop_phase_fields_consistent(
            commit in 1u64..100_000,
            reveal in 1u64..100_000,
            t in 0i64..50_000_000,
        ) {
            let calc = EpochCalculator::new(
                Duration::from_millis(commit),
                Duration::from_millis(reveal),
                ChainTime::ZERO,
            ).unwrap();
            let info = calc.epoch_info(ChainTime::from_millis(t));
            prop_assert_eq!(info.current_epoch, calc.epoch_number(ChainTime::from_millis(t)));
            prop_assert_eq!(info.is_commit_phase, info.time_in_cycle < info.commit_phase_duration);
            prop_assert_eq!(info.time_in_cycle + info.time_left_in_epoch, calc.epoch_duration());
            prop_assert!(info.time_left_in_phase > Duration::ZERO);
            prop_assert!(info.time_left_in_phase <= info.current_phase_duration);
            if info.is_commit_phase {
                prop_assert_eq!(info.time_left_for_commit_end, info.time_left_in_phase);
            } else {
                prop_assert_eq!(info.time_left_for_commit_end, Duration::ZERO);
            }
        }
    }
}
