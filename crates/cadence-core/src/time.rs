//! Time primitives for Cadence
//!
//! Two time axes are kept apart:
//! - ChainTime: the authoritative clock of the blockchain (block timestamps)
//! - WallTime: the local machine clock used to extrapolate between samples
//!
//! Both are millisecond counts since the unix epoch.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Authoritative chain time, milliseconds since unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainTime(pub i64);

impl ChainTime {
    pub const ZERO: ChainTime = ChainTime(0);

    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        ChainTime(millis)
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        ChainTime((secs as i64).saturating_mul(1000))
    }

    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        ChainTime((secs * 1000.0) as i64)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Signed distance `self - earlier` in milliseconds
    #[inline]
    pub fn millis_since(self, earlier: ChainTime) -> i64 {
        self.0 - earlier.0
    }

    #[inline]
    pub fn saturating_add(self, duration: Duration) -> Self {
        ChainTime(self.0.saturating_add(duration.as_millis() as i64))
    }

    #[inline]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        ChainTime(self.0.saturating_sub(duration.as_millis() as i64))
    }

    #[inline]
    pub fn offset_millis(self, millis: i64) -> Self {
        ChainTime(self.0.saturating_add(millis))
    }
}

impl Add<Duration> for ChainTime {
    type Output = ChainTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl Sub<Duration> for ChainTime {
    type Output = ChainTime;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl Sub<ChainTime> for ChainTime {
    type Output = Duration;

    /// Saturates at zero when `rhs` is later
    #[inline]
    fn sub(self, rhs: ChainTime) -> Self::Output {
        let diff = self.0 - rhs.0;
        if diff >= 0 {
            Duration::from_millis(diff as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl fmt::Debug for ChainTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain({:.3}s)", self.as_secs_f64())
    }
}

/// Local wall-clock time, milliseconds since unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WallTime(pub i64);

impl WallTime {
    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        WallTime(millis)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Signed distance `self - earlier` in milliseconds
    #[inline]
    pub fn millis_since(self, earlier: WallTime) -> i64 {
        self.0 - earlier.0
    }

    /// Midpoint of two readings, used to estimate when a remote read landed
    #[inline]
    pub fn midpoint(self, other: WallTime) -> WallTime {
        WallTime(self.0 + (other.0 - self.0) / 2)
    }
}

impl Add<Duration> for WallTime {
    type Output = WallTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        WallTime(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl Sub<WallTime> for WallTime {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: WallTime) -> Self::Output {
        Duration::from_millis(self.0.saturating_sub(rhs.0).max(0) as u64)
    }
}

impl fmt::Debug for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wall({:.3}s)", self.0 as f64 / 1000.0)
    }
}

/// Source of local wall-clock readings
pub trait WallClock: Send + Sync {
    fn now(&self) -> WallTime;
}

/// Wall clock backed by the operating system
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now(&self) -> WallTime {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        WallTime(millis)
    }
}

/// Manually driven wall clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualWallClock {
    millis: AtomicI64,
}

impl ManualWallClock {
    pub fn new(start: WallTime) -> Self {
        ManualWallClock {
            millis: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, time: WallTime) {
        self.millis.store(time.0, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now(&self) -> WallTime {
        WallTime(self.millis.load(Ordering::SeqCst))
    }
}
