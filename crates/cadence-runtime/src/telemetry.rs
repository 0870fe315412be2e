//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. Binaries and tests call
//! `init_tracing` once to print them; `RUST_LOG` overrides the default
//! level.

use std::time::Duration;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cadence_core::{CadenceError, CadenceResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Level used when `RUST_LOG` is unset or unparsable
    pub default_level: LevelFilter,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            default_level: LevelFilter::INFO,
            format: LogFormat::Text,
            ansi: true,
        }
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> CadenceResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.default_level.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    result.map_err(|e| CadenceError::InvalidConfig(format!("tracing: {e}")))
}

/// Human-readable duration for log fields, e.g. `1s 33ms`
///
/// Sub-millisecond precision is dropped.
pub fn display_duration(duration: Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_millis(duration.as_millis() as u64))
}
