//! Player-facing phase views
//!
//! The contract only knows commit and reveal. Players see the commit phase
//! split in two: `Play`, while edits are still accepted, and `Commit`, the
//! last `commit_time_allowance` of the phase when the commitment is being
//! sent. The two-phase view folds everything that is not `Play` into
//! `Wait`.

use std::time::Duration;

use crate::{EpochCalculator, EpochInfo};

/// Margin under the allowance after which edits are refused
pub const EDIT_CUTOFF_MARGIN: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreePhaseKind {
    Play,
    Commit,
    Reveal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreePhase {
    pub phase: ThreePhaseKind,
    pub time_left: Duration,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TwoPhaseKind {
    Play,
    Wait,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TwoPhase {
    pub phase: TwoPhaseKind,
    pub time_left: Duration,
    pub duration: Duration,
}

pub fn three_phase(info: &EpochInfo, allowance: Duration) -> ThreePhase {
    if !info.is_commit_phase {
        return ThreePhase {
            phase: ThreePhaseKind::Reveal,
            time_left: info.time_left_in_phase,
            duration: info.current_phase_duration,
        };
    }
    if info.time_left_in_phase < allowance {
        ThreePhase {
            phase: ThreePhaseKind::Commit,
            time_left: info.time_left_in_phase,
            duration: allowance,
        }
    } else {
        ThreePhase {
            phase: ThreePhaseKind::Play,
            time_left: info.time_left_in_phase - allowance,
            duration: info.current_phase_duration.saturating_sub(allowance),
        }
    }
}

pub fn two_phase(three: &ThreePhase, reveal_phase_duration: Duration, allowance: Duration) -> TwoPhase {
    match three.phase {
        ThreePhaseKind::Play => TwoPhase {
            phase: TwoPhaseKind::Play,
            time_left: three.time_left,
            duration: three.duration,
        },
        ThreePhaseKind::Commit => TwoPhase {
            phase: TwoPhaseKind::Wait,
            time_left: three.time_left + reveal_phase_duration,
            duration: three.duration + reveal_phase_duration,
        },
        ThreePhaseKind::Reveal => TwoPhase {
            phase: TwoPhaseKind::Wait,
            time_left: three.time_left,
            duration: three.duration + allowance,
        },
    }
}

/// True when user edits for the current epoch are no longer accepted
pub fn is_time_up(info: &EpochInfo, allowance: Duration) -> bool {
    !info.is_commit_phase || info.time_left_in_phase < allowance.saturating_sub(EDIT_CUTOFF_MARGIN)
}

impl EpochCalculator {
    pub fn three_phase(&self, info: &EpochInfo) -> ThreePhase {
        three_phase(info, self.commit_time_allowance())
    }

    pub fn two_phase(&self, info: &EpochInfo) -> TwoPhase {
        two_phase(
            &self.three_phase(info),
            self.reveal_phase_duration(),
            self.commit_time_allowance(),
        )
    }

    pub fn is_time_up(&self, info: &EpochInfo) -> bool {
        is_time_up(info, self.commit_time_allowance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ChainTime;

    fn calc() -> EpochCalculator {
        EpochCalculator::new(Duration::from_secs(20), Duration::from_secs(3), ChainTime::ZERO).unwrap()
    }

    #[test]
    fn test_play_phase_excludes_allowance() {
        let calc = calc();
        let info = calc.epoch_info(ChainTime::from_secs(5));
        let view = calc.three_phase(&info);
        assert_eq!(view.phase, ThreePhaseKind::Play);
        assert_eq!(view.time_left, Duration::from_millis(11_900));
        assert_eq!(view.duration, Duration::from_millis(16_900));
    }

    #[test]
    fn test_commit_phase_tail() {
        let calc = calc();
        let info = calc.epoch_info(ChainTime::from_secs(18));
        let view = calc.three_phase(&info);
        assert_eq!(view.phase, ThreePhaseKind::Commit);
        assert_eq!(view.duration, Duration::from_millis(3_100));

        let two = calc.two_phase(&info);
        assert_eq!(two.phase, TwoPhaseKind::Wait);
        assert_eq!(two.time_left, Duration::from_secs(5));
        assert_eq!(two.duration, Duration::from_millis(6_100));
    }

    #[test]
    fn test_reveal_maps_to_wait() {
        let calc = calc();
        let info = calc.epoch_info(ChainTime::from_secs(21));
        assert_eq!(calc.three_phase(&info).phase, ThreePhaseKind::Reveal);
        let two = calc.two_phase(&info);
        assert_eq!(two.phase, TwoPhaseKind::Wait);
        assert_eq!(two.time_left, Duration::from_secs(2));
        assert_eq!(two.duration, Duration::from_millis(6_100));
    }

    #[test]
    fn test_time_up() {
        let calc = calc();
        // 2.9s cutoff before the end of the commit phase
        assert!(!calc.is_time_up(&calc.epoch_info(ChainTime::from_millis(17_000))));
        assert!(!calc.is_time_up(&calc.epoch_info(ChainTime::from_millis(17_100))));
        assert!(calc.is_time_up(&calc.epoch_info(ChainTime::from_millis(17_101))));
        assert!(calc.is_time_up(&calc.epoch_info(ChainTime::from_secs(21))));
    }
}
