//! Gas fee poller
//!
//! Estimates EIP-1559 fees from the recent fee history: the priority fee
//! of each reward percentile averaged over the sampled blocks, plus the
//! latest base fee.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cadence_chain::{FeeHistory, FeeReader};
use cadence_core::{CadenceError, CadenceResult, FetchError, LoadStep, Loadable, Observable};

#[derive(Clone, Debug)]
pub struct GasFeeConfig {
    pub fetch_interval: Duration,
    pub retry_interval: Duration,
    pub block_count: u64,
    /// Reward percentiles for slow, average and fast
    pub percentiles: [f64; 3],
}

impl Default for GasFeeConfig {
    fn default() -> Self {
        GasFeeConfig {
            fetch_interval: Duration::from_secs(60),
            retry_interval: Duration::from_millis(500),
            block_count: 20,
            percentiles: [10.0, 50.0, 80.0],
        }
    }
}

/// Fee parameters of one transaction, in wei
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasPrice {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasFee {
    pub slow: GasPrice,
    pub average: GasPrice,
    pub fast: GasPrice,
}

/// Estimate from a fee history sampled at three percentiles
pub fn estimate_fees(history: &FeeHistory) -> CadenceResult<GasFee> {
    let base_fee = *history
        .base_fee_per_gas
        .last()
        .ok_or_else(|| CadenceError::Network("fee history without base fee".into()))?;
    if history.reward.is_empty() {
        return Err(CadenceError::Network("fee history without rewards".into()));
    }

    let mut prices = [GasPrice::default(); 3];
    for (percentile, price) in prices.iter_mut().enumerate() {
        let mut sum: u128 = 0;
        for block in &history.reward {
            let reward = block.get(percentile).ok_or_else(|| {
                CadenceError::Network(format!("fee history misses percentile {percentile}"))
            })?;
            sum = sum.saturating_add(*reward);
        }
        let priority = sum / history.reward.len() as u128;
        *price = GasPrice {
            max_fee_per_gas: priority.saturating_add(base_fee),
            max_priority_fee_per_gas: priority,
        };
    }
    let [slow, average, fast] = prices;
    Ok(GasFee {
        slow,
        average,
        fast,
    })
}

/// Keeps a `Loadable<GasFee>` stream fresh
pub struct GasFeePoller {
    reader: Arc<dyn FeeReader>,
    config: GasFeeConfig,
    state: Observable<Loadable<GasFee>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GasFeePoller {
    pub fn new(reader: Arc<dyn FeeReader>, config: GasFeeConfig) -> Self {
        GasFeePoller {
            reader,
            config,
            state: Observable::new(Loadable::idle()),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Observable<Loadable<GasFee>> {
        self.state.clone()
    }

    /// Latest estimate, if one has loaded
    pub fn current(&self) -> Option<GasFee> {
        self.state.with(|state| state.value().copied())
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Spawn the fetch loop; no-op if already running
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Self::run(Arc::downgrade(self))));
    }

    /// Cancel the loop and go back to `Idle`
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.set(Loadable::idle());
    }

    /// One fetch; true on success
    ///
    /// A failure keeps the last loaded estimate and attaches an error.
    pub async fn fetch_once(&self) -> bool {
        if !self.state.with(Loadable::is_loaded) {
            self.state.set(Loadable::loading());
        }
        let result = self
            .reader
            .fee_history(self.config.block_count, &self.config.percentiles)
            .await
            .and_then(|history| estimate_fees(&history));

        match result {
            Ok(fee) => {
                debug!(
                    average_max_fee = fee.average.max_fee_per_gas,
                    average_priority_fee = fee.average.max_priority_fee_per_gas,
                    "gas fee estimated"
                );
                self.state.set(Loadable::loaded(fee));
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch fee history");
                self.state.update(|state| {
                    if matches!(state.step, LoadStep::Idle) {
                        state.step = LoadStep::Loading;
                    }
                    state.error = Some(FetchError {
                        message: err.to_string(),
                    });
                });
                false
            }
        }
    }

    async fn run(weak: Weak<Self>) {
        loop {
            let delay = {
                let Some(this) = weak.upgrade() else { return };
                if this.fetch_once().await {
                    this.config.fetch_interval
                } else {
                    this.config.retry_interval
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

impl Drop for GasFeePoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FeeFeed {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    fn history() -> FeeHistory {
        FeeHistory {
            oldest_block: 100,
            base_fee_per_gas: vec![7, 8, 10],
            reward: vec![vec![1, 4, 9], vec![3, 6, 11]],
        }
    }

    #[async_trait]
    impl FeeReader for FeeFeed {
        async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> CadenceResult<FeeHistory> {
            assert_eq!(block_count, 20);
            assert_eq!(percentiles, &[10.0, 50.0, 80.0]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CadenceError::Network("503".into()));
            }
            Ok(history())
        }
    }

    #[test]
    fn test_estimate_averages_percentiles() {
        let fee = estimate_fees(&history()).unwrap();
        assert_eq!(
            fee.slow,
            GasPrice {
                max_fee_per_gas: 12,
                max_priority_fee_per_gas: 2,
            }
        );
        assert_eq!(fee.average.max_priority_fee_per_gas, 5);
        assert_eq!(fee.fast.max_fee_per_gas, 20);
    }

    #[test]
    fn test_estimate_rejects_incomplete_history() {
        let mut partial = history();
        partial.reward[1].truncate(2);
        assert!(estimate_fees(&partial).is_err());
        assert!(estimate_fees(&FeeHistory::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_loaded_value() {
        let feed = Arc::new(FeeFeed::default());
        let poller = GasFeePoller::new(feed.clone(), GasFeeConfig::default());
        assert!(poller.fetch_once().await);
        let loaded = poller.current().unwrap();

        feed.fail.store(true, Ordering::SeqCst);
        assert!(!poller.fetch_once().await);
        let state = poller.state().get();
        assert_eq!(state.value(), Some(&loaded));
        assert_eq!(state.error.unwrap().message, "Network error: 503");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_is_loading_with_error() {
        let feed = Arc::new(FeeFeed::default());
        feed.fail.store(true, Ordering::SeqCst);
        let poller = GasFeePoller::new(feed, GasFeeConfig::default());
        assert!(!poller.fetch_once().await);
        let state = poller.state().get();
        assert_eq!(state.step, LoadStep::Loading);
        assert_eq!(state.error.unwrap().message, "Network error: 503");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_and_stop() {
        let feed = Arc::new(FeeFeed::default());
        feed.fail.store(true, Ordering::SeqCst);
        let poller = Arc::new(GasFeePoller::new(feed.clone(), GasFeeConfig::default()));
        poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        // Retry after 500ms, then the regular minute
        feed.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
        assert!(poller.current().is_some());
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);

        poller.stop();
        assert!(!poller.is_running());
        assert_eq!(poller.state().get(), Loadable::idle());
    }
}
