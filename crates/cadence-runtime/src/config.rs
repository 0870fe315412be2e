//! Deployment and runtime configuration
//!
//! `GameConfig` describes one deployment of the game contract and is read
//! from the JSON written at deploy time. Runtime tunables live next to the
//! component they tune (`ClockConfig`, `SchedulerConfig`, `PollerConfig`,
//! `GasFeeConfig`) and are gathered in `RuntimeConfig`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cadence_core::{Address, CadenceError, CadenceResult, ChainId, ChainTime, GenesisHash};
use cadence_state::StorageScope;
use cadence_time::{ClockConfig, EpochCalculator};

use crate::{GasFeeConfig, PollerConfig, SchedulerConfig};

fn default_min_polling_interval() -> u64 {
    100
}

/// Chain the game is deployed on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub id: ChainId,
    pub genesis_hash: GenesisHash,
    /// Floor of the clock refinement polling interval, milliseconds
    #[serde(default = "default_min_polling_interval")]
    pub min_polling_interval: u64,
}

/// Game contract parameters, durations in seconds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameContractConfig {
    pub address: Address,
    pub commit_phase_duration: u64,
    pub reveal_phase_duration: u64,
    /// Unix seconds of the first epoch
    pub start_time: u64,
}

/// One deployment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameConfig {
    pub chain: ChainConfig,
    pub game: GameContractConfig,
}

impl GameConfig {
    /// Parse and validate
    pub fn from_json(json: &str) -> CadenceResult<Self> {
        let config: GameConfig = serde_json::from_str(json)
            .map_err(|e| CadenceError::InvalidConfig(format!("deployment json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CadenceResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            CadenceError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> CadenceResult<()> {
        self.calculator().map(|_| ())
    }

    pub fn commit_phase_duration(&self) -> Duration {
        Duration::from_secs(self.game.commit_phase_duration)
    }

    pub fn reveal_phase_duration(&self) -> Duration {
        Duration::from_secs(self.game.reveal_phase_duration)
    }

    pub fn start_time(&self) -> ChainTime {
        ChainTime::from_secs(self.game.start_time)
    }

    pub fn calculator(&self) -> CadenceResult<EpochCalculator> {
        EpochCalculator::new(
            self.commit_phase_duration(),
            self.reveal_phase_duration(),
            self.start_time(),
        )
    }

    /// Storage scope of the local ledger for this deployment
    pub fn scope(&self) -> StorageScope {
        StorageScope::new(self.chain.id, self.chain.genesis_hash, self.game.address)
    }

    /// `base` with the deployment's polling floor applied
    pub fn clock_config(&self, base: &ClockConfig) -> ClockConfig {
        ClockConfig {
            min_polling_interval: Duration::from_millis(self.chain.min_polling_interval),
            ..base.clone()
        }
    }
}

/// Tunables of every background component
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub clock: ClockConfig,
    pub scheduler: SchedulerConfig,
    pub poller: PollerConfig,
    pub gas: GasFeeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
        "chain": {
            "id": 31337,
            "genesisHash": "0x1111111111111111111111111111111111111111111111111111111111111111"
        },
        "game": {
            "address": "0x2222222222222222222222222222222222222222",
            "commitPhaseDuration": 20,
            "revealPhaseDuration": 3,
            "startTime": 1700000000
        }
    }"#;

    #[test]
    fn test_parse_deployment() {
        let config = GameConfig::from_json(DEPLOYMENT).unwrap();
        assert_eq!(config.chain.id, ChainId(31337));
        assert_eq!(config.chain.min_polling_interval, 100);
        assert_eq!(config.reveal_phase_duration(), Duration::from_secs(3));

        let calculator = config.calculator().unwrap();
        assert_eq!(calculator.epoch_duration(), Duration::from_secs(23));
        assert_eq!(calculator.start_time(), ChainTime::from_secs(1_700_000_000));
    }

    #[test]
    fn test_zero_phase_rejected() {
        let json = DEPLOYMENT.replace("\"revealPhaseDuration\": 3", "\"revealPhaseDuration\": 0");
        assert!(matches!(
            GameConfig::from_json(&json),
            Err(CadenceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_address_rejected() {
        let json = DEPLOYMENT.replace("0x2222222222222222222222222222222222222222", "0x22");
        assert!(matches!(
            GameConfig::from_json(&json),
            Err(CadenceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_scope_and_clock_config() {
        let config = GameConfig::from_json(DEPLOYMENT).unwrap();
        let scope = config.scope();
        assert_eq!(scope.contract, Address([0x22; 20]));
        assert_eq!(scope.genesis_hash, GenesisHash([0x11; 32]));

        let mut chain = config.chain.clone();
        chain.min_polling_interval = 250;
        let config = GameConfig { chain, ..config };
        let clock = config.clock_config(&ClockConfig::default());
        assert_eq!(clock.min_polling_interval, Duration::from_millis(250));
        assert_eq!(clock.look_back, 64);
    }
}
