//! Simulated chain for end-to-end testing
//!
//! One process-local model of the node, the wallet and the game contract:
//! - Blocks every `block_interval`, timestamps read from a wall clock
//! - Commit and reveal with commitment verification
//! - Entities moved by revealed actions, `CommitmentRevealed` events
//! - Synthetic fee history
//!
//! Failures are injected explicitly (`set_failing_reads`, `revert_next`)
//! or at random through a seeded `ChaosConfig`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use cadence_chain::{
    commitment_hash, encode_action, keccak256, pack_position, unpack_xy, CommitmentHash,
    EntityReader, FeeHistory, FeeReader, MessageSigner, PendingTransaction, RawEntity, Receipt,
    ReceiptStatus, RegionSnapshot, RevealedCommitment, SubmitOptions, TransactionLayer, ZoneId,
};
use cadence_core::{
    Address, CadenceError, CadenceResult, ChainId, ChainTime, EntityId, EntityKind, Epoch,
    GenesisHash, LocalAction, Secret, TxRef, WallClock,
};
use cadence_runtime::{ChainConfig, GameConfig, GameContractConfig};
use cadence_time::{BlockInfo, BlockTag, EpochCalculator, TimeSource};

/// Random failure rates
#[derive(Clone, Debug, PartialEq)]
pub struct ChaosConfig {
    /// Probability that a read (blocks, entities, events, fees) fails
    pub read_failure_rate: f64,
    /// Probability that a transaction reverts
    pub revert_rate: f64,
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl ChaosConfig {
    /// Nothing fails
    pub fn none() -> Self {
        ChaosConfig {
            read_failure_rate: 0.0,
            revert_rate: 0.0,
            seed: 0,
        }
    }

    /// Occasional read failures
    pub fn good() -> Self {
        ChaosConfig {
            read_failure_rate: 0.02,
            revert_rate: 0.0,
            seed: 1,
        }
    }

    /// Unreliable node, some reverts
    pub fn flaky() -> Self {
        ChaosConfig {
            read_failure_rate: 0.2,
            revert_rate: 0.1,
            seed: 2,
        }
    }

    /// Most calls fail
    pub fn hostile() -> Self {
        ChaosConfig {
            read_failure_rate: 0.5,
            revert_rate: 0.3,
            seed: 3,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn is_calm(&self) -> bool {
        self.read_failure_rate <= 0.0 && self.revert_rate <= 0.0
    }
}

/// Chain and contract parameters
#[derive(Clone, Debug)]
pub struct SimChainConfig {
    pub chain_id: ChainId,
    pub contract: Address,
    /// Timestamp of `genesis_height`, also the start of the first epoch
    pub genesis_time: ChainTime,
    pub genesis_height: u64,
    pub block_interval: Duration,
    pub commit_phase_duration: Duration,
    pub reveal_phase_duration: Duration,
    /// Base fee of every block, in wei
    pub base_fee: u128,
    pub chaos: ChaosConfig,
}

impl Default for SimChainConfig {
    fn default() -> Self {
        SimChainConfig {
            chain_id: ChainId(31337),
            contract: Address([0xca; 20]),
            genesis_time: ChainTime(0),
            genesis_height: 1_000,
            block_interval: Duration::from_secs(2),
            commit_phase_duration: Duration::from_secs(20),
            reveal_phase_duration: Duration::from_secs(3),
            base_fee: 1_000_000_000,
            chaos: ChaosConfig::none(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Commit,
    Reveal,
}

/// One transaction as the chain saw it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub transaction_ref: TxRef,
    pub kind: TransactionKind,
    pub entity: EntityId,
    pub epoch: Epoch,
    pub status: ReceiptStatus,
    pub block_number: u64,
}

/// Counters for scenario checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub commits: u64,
    pub reveals: u64,
    pub reverted: u64,
    /// Reveals that did not match a stored commitment
    pub rejected_reveals: u64,
    pub failed_reads: u64,
}

#[derive(Default)]
struct World {
    entities: BTreeMap<EntityId, RawEntity>,
    commitments: HashMap<(EntityId, Epoch), CommitmentHash>,
    events: Vec<(u64, RevealedCommitment)>,
    transactions: Vec<SentTransaction>,
    stats: ChainStats,
    nonce: u64,
    failing_reads: bool,
    forced_reverts: usize,
}

pub struct SimulatedChain {
    config: SimChainConfig,
    calculator: EpochCalculator,
    wall: Arc<dyn WallClock>,
    world: Mutex<World>,
    rng: Mutex<StdRng>,
}

impl SimulatedChain {
    /// Chain whose clock is `wall`; chain time equals wall time
    pub fn new(config: SimChainConfig, wall: Arc<dyn WallClock>) -> CadenceResult<Self> {
        let calculator = EpochCalculator::new(
            config.commit_phase_duration,
            config.reveal_phase_duration,
            config.genesis_time,
        )?;
        let rng = StdRng::seed_from_u64(config.chaos.seed);
        Ok(SimulatedChain {
            config,
            calculator,
            wall,
            world: Mutex::new(World::default()),
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &SimChainConfig {
        &self.config
    }

    pub fn calculator(&self) -> EpochCalculator {
        self.calculator
    }

    /// Deployment description a client would be configured with
    pub fn game_config(&self) -> GameConfig {
        GameConfig {
            chain: ChainConfig {
                id: self.config.chain_id,
                genesis_hash: GenesisHash::from_bytes(keccak256(
                    &self.config.chain_id.0.to_be_bytes(),
                )),
                min_polling_interval: 100,
            },
            game: GameContractConfig {
                address: self.config.contract,
                commit_phase_duration: self.config.commit_phase_duration.as_secs(),
                reveal_phase_duration: self.config.reveal_phase_duration.as_secs(),
                start_time: self.config.genesis_time.as_millis().max(0) as u64 / 1_000,
            },
        }
    }

    pub fn now(&self) -> ChainTime {
        ChainTime(self.wall.now().0)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.calculator.epoch_number(self.now())
    }

    pub fn latest_height(&self) -> u64 {
        let elapsed = self.now().millis_since(self.config.genesis_time).max(0);
        let interval = self.config.block_interval.as_millis().max(1) as i64;
        self.config.genesis_height + (elapsed / interval) as u64
    }

    fn block_timestamp(&self, height: u64) -> ChainTime {
        let offset = height as i64 - self.config.genesis_height as i64;
        self.config
            .genesis_time
            .offset_millis(offset * self.config.block_interval.as_millis() as i64)
    }

    /// Make every read fail until turned off again
    pub fn set_failing_reads(&self, failing: bool) {
        self.world.lock().failing_reads = failing;
    }

    /// Revert the next `count` transactions
    pub fn revert_next(&self, count: usize) {
        self.world.lock().forced_reverts += count;
    }

    pub fn stats(&self) -> ChainStats {
        self.world.lock().stats
    }

    pub fn transactions(&self) -> Vec<SentTransaction> {
        self.world.lock().transactions.clone()
    }

    pub fn entity(&self, id: &EntityId) -> Option<RawEntity> {
        self.world.lock().entities.get(id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.world.lock().entities.len()
    }

    /// Place an entity directly, bypassing commit and reveal
    pub fn spawn_entity(&self, entity: RawEntity) {
        self.world.lock().entities.insert(entity.id, entity);
    }

    fn check_read(&self, what: &str) -> CadenceResult<()> {
        let random = self.roll(self.config.chaos.read_failure_rate);
        let mut world = self.world.lock();
        if world.failing_reads || random {
            world.stats.failed_reads += 1;
            debug!(read = what, "injected read failure");
            return Err(CadenceError::Network(format!("{what}: connection reset")));
        }
        Ok(())
    }

    fn roll(&self, rate: f64) -> bool {
        rate > 0.0 && self.rng.lock().gen_bool(rate.min(1.0))
    }

    fn should_revert(&self, world: &mut World) -> bool {
        if world.forced_reverts > 0 {
            world.forced_reverts -= 1;
            return true;
        }
        self.roll(self.config.chaos.revert_rate)
    }

    fn next_transaction_ref(world: &mut World) -> TxRef {
        world.nonce += 1;
        TxRef::from_bytes(keccak256(&world.nonce.to_be_bytes()))
    }

    /// Record the transaction and hand out its receipt
    ///
    /// Effects apply at submission; the receipt shows up one polling
    /// interval later.
    fn finish(
        &self,
        world: &mut World,
        kind: TransactionKind,
        entity: EntityId,
        epoch: Epoch,
        status: ReceiptStatus,
        options: SubmitOptions,
    ) -> PendingTransaction {
        let transaction_ref = Self::next_transaction_ref(world);
        let block_number = self.latest_height();
        match kind {
            TransactionKind::Commit => world.stats.commits += 1,
            TransactionKind::Reveal => world.stats.reveals += 1,
        }
        if status == ReceiptStatus::Reverted {
            world.stats.reverted += 1;
        }
        world.transactions.push(SentTransaction {
            transaction_ref,
            kind,
            entity,
            epoch,
            status,
            block_number,
        });

        let delay = options
            .polling_interval
            .unwrap_or(self.config.block_interval);
        PendingTransaction::new(transaction_ref, async move {
            tokio::time::sleep(delay).await;
            Ok(Receipt {
                transaction_ref,
                status,
                block_number,
            })
        })
    }

    fn apply_reveal(
        &self,
        world: &mut World,
        id: EntityId,
        epoch: Epoch,
        actions: &[LocalAction],
    ) -> Result<(), &'static str> {
        let mut entity = match (world.entities.get(&id), actions.first()) {
            (Some(entity), _) => entity.clone(),
            (None, Some(LocalAction::Enter { .. })) => RawEntity {
                id,
                owner: id.owner(),
                kind: EntityKind::Avatar,
                position: 0,
                life: 1,
                last_epoch: epoch,
            },
            (None, _) => return Err("unknown entity"),
        };

        let mut exited = false;
        for action in actions {
            match action {
                LocalAction::Enter { .. } | LocalAction::Move { .. } => {
                    entity.position = pack_position(action.target());
                }
                LocalAction::Exit { .. } => {
                    entity.position = pack_position(action.target());
                    exited = true;
                }
                LocalAction::Acquire { .. } | LocalAction::SendFleet { .. } => {
                    return Err("not an avatar action");
                }
            }
        }
        entity.last_epoch = epoch;

        let zone = ZoneId::containing(unpack_xy(entity.position));
        let block = self.latest_height();
        world.events.push((
            block,
            RevealedCommitment {
                entity: id,
                epoch,
                zone,
                actions: actions.iter().map(encode_action).collect(),
            },
        ));
        if exited {
            world.entities.remove(&id);
        } else {
            world.entities.insert(id, entity);
        }
        Ok(())
    }
}

#[async_trait]
impl TimeSource for SimulatedChain {
    async fn block(&self, tag: BlockTag) -> CadenceResult<BlockInfo> {
        self.check_read("block")?;
        let latest = self.latest_height();
        let height = match tag {
            BlockTag::Latest => latest,
            BlockTag::Number(height) if height <= latest => height,
            BlockTag::Number(height) => {
                return Err(CadenceError::Network(format!("unknown block {height}")))
            }
        };
        Ok(BlockInfo {
            height,
            timestamp: self.block_timestamp(height),
        })
    }
}

#[async_trait]
impl EntityReader for SimulatedChain {
    async fn entities_in_regions(&self, zones: &[ZoneId]) -> CadenceResult<RegionSnapshot> {
        self.check_read("entities")?;
        let world = self.world.lock();
        let entities = world
            .entities
            .values()
            .filter(|e| zones.contains(&ZoneId::containing(unpack_xy(e.position))))
            .cloned()
            .collect();
        Ok(RegionSnapshot {
            entities,
            epoch: self.current_epoch(),
        })
    }

    async fn revealed_commitments(
        &self,
        epoch: Epoch,
        zones: &[ZoneId],
        from_block: u64,
        to_block: u64,
    ) -> CadenceResult<Vec<RevealedCommitment>> {
        self.check_read("events")?;
        let world = self.world.lock();
        Ok(world
            .events
            .iter()
            .filter(|(block, event)| {
                (from_block..=to_block).contains(block)
                    && event.epoch == epoch
                    && zones.contains(&event.zone)
            })
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn block_number(&self) -> CadenceResult<u64> {
        self.check_read("block number")?;
        Ok(self.latest_height())
    }
}

#[async_trait]
impl FeeReader for SimulatedChain {
    async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> CadenceResult<FeeHistory> {
        self.check_read("fee history")?;
        let latest = self.latest_height();
        let base_fee = self.config.base_fee;
        // Priority fee grows with the percentile: 1% of the base fee per 10th
        let reward: Vec<u128> = percentiles
            .iter()
            .map(|p| base_fee / 1_000 * (*p as u128))
            .collect();
        Ok(FeeHistory {
            oldest_block: latest.saturating_sub(block_count.saturating_sub(1)),
            base_fee_per_gas: vec![base_fee; block_count as usize + 1],
            reward: vec![reward; block_count as usize],
        })
    }
}

#[async_trait]
impl MessageSigner for SimulatedChain {
    async fn sign_message(&self, signer: &Address, message: &str) -> CadenceResult<Vec<u8>> {
        let mut payload = signer.as_bytes().to_vec();
        payload.extend_from_slice(message.as_bytes());
        Ok(keccak256(&payload).to_vec())
    }
}

#[async_trait]
impl TransactionLayer for SimulatedChain {
    async fn commit_actions(
        &self,
        entity: EntityId,
        secret: Secret,
        actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction> {
        let info = self.calculator.epoch_info(self.now());
        let epoch = info.current_epoch;
        let mut world = self.world.lock();

        let status = if !info.is_commit_phase {
            warn!(entity = %entity, epoch = %epoch, "commit outside the commit phase");
            ReceiptStatus::Reverted
        } else if world.commitments.contains_key(&(entity, epoch)) {
            warn!(entity = %entity, epoch = %epoch, "already committed");
            ReceiptStatus::Reverted
        } else if self.should_revert(&mut world) {
            ReceiptStatus::Reverted
        } else {
            let hash = commitment_hash(&secret, actions);
            debug!(entity = %entity, epoch = %epoch, commitment = %hash, "commitment stored");
            world.commitments.insert((entity, epoch), hash);
            ReceiptStatus::Confirmed
        };
        Ok(self.finish(&mut world, TransactionKind::Commit, entity, epoch, status, options))
    }

    async fn reveal_actions(
        &self,
        entity: EntityId,
        secret: Secret,
        actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction> {
        let info = self.calculator.epoch_info(self.now());
        let epoch = info.current_epoch;
        let mut world = self.world.lock();

        let stored = world.commitments.get(&(entity, epoch)).copied();
        let status = match stored {
            _ if info.is_commit_phase => {
                warn!(entity = %entity, epoch = %epoch, "reveal during the commit phase");
                ReceiptStatus::Reverted
            }
            Some(stored) if stored == commitment_hash(&secret, actions) => {
                if self.should_revert(&mut world) {
                    ReceiptStatus::Reverted
                } else {
                    match self.apply_reveal(&mut world, entity, epoch, actions) {
                        Ok(()) => {
                            world.commitments.remove(&(entity, epoch));
                            info!(entity = %entity, epoch = %epoch, actions = actions.len(), "revealed");
                            ReceiptStatus::Confirmed
                        }
                        Err(reason) => {
                            warn!(entity = %entity, epoch = %epoch, reason, "reveal rejected");
                            ReceiptStatus::Reverted
                        }
                    }
                }
            }
            _ => {
                warn!(entity = %entity, epoch = %epoch, "reveal does not match any commitment");
                world.stats.rejected_reveals += 1;
                ReceiptStatus::Reverted
            }
        };
        Ok(self.finish(&mut world, TransactionKind::Reveal, entity, epoch, status, options))
    }
}

impl std::fmt::Debug for SimulatedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChain")
            .field("chain_id", &self.config.chain_id)
            .field("height", &self.latest_height())
            .finish()
    }
}
