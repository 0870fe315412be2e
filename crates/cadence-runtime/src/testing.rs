//! Test doubles shared by the unit tests of this crate

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use cadence_chain::{
    EntityReader, FeeHistory, FeeReader, MessageSigner, PendingTransaction, Receipt,
    ReceiptStatus, RegionSnapshot, RevealedCommitment, SubmitOptions, TransactionLayer, ZoneId,
};
use cadence_core::{
    Address, CadenceResult, ChainTime, EntityId, Epoch, LocalAction, Secret, Signer, TxRef,
};
use cadence_time::{BlockInfo, BlockTag, TimeSource};

/// Block interval of `RecordingChain`
pub const BLOCK_MILLIS: i64 = 2_000;
/// Height of the block stamped at chain time zero
pub const GENESIS_HEIGHT: u64 = 100;

pub const PLAYER: Signer = Signer {
    owner: Address([0x11; 20]),
    address: Address([0x22; 20]),
};

/// Chain whose transactions confirm immediately
///
/// Blocks come every `BLOCK_MILLIS` of tokio time, starting at chain time
/// zero when the chain is created. The world is empty.
pub struct RecordingChain {
    origin: Instant,
    sent: Mutex<Vec<&'static str>>,
    options: Mutex<Vec<SubmitOptions>>,
}

impl Default for RecordingChain {
    fn default() -> Self {
        RecordingChain {
            origin: Instant::now(),
            sent: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingChain {
    pub fn sent(&self) -> Vec<&'static str> {
        self.sent.lock().clone()
    }

    pub fn options(&self) -> Vec<SubmitOptions> {
        self.options.lock().clone()
    }

    fn send(&self, kind: &'static str, options: SubmitOptions) -> PendingTransaction {
        let mut sent = self.sent.lock();
        sent.push(kind);
        self.options.lock().push(options);
        let tx = TxRef::from_bytes([sent.len() as u8; 32]);
        PendingTransaction::new(tx, async move {
            Ok(Receipt {
                transaction_ref: tx,
                status: ReceiptStatus::Confirmed,
                block_number: 1,
            })
        })
    }
}

#[async_trait]
impl TransactionLayer for RecordingChain {
    async fn commit_actions(
        &self,
        _entity: EntityId,
        _secret: Secret,
        _actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction> {
        Ok(self.send("commit", options))
    }

    async fn reveal_actions(
        &self,
        _entity: EntityId,
        _secret: Secret,
        _actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction> {
        Ok(self.send("reveal", options))
    }
}

#[async_trait]
impl MessageSigner for RecordingChain {
    async fn sign_message(&self, _signer: &Address, message: &str) -> CadenceResult<Vec<u8>> {
        Ok(message.as_bytes().to_vec())
    }
}

#[async_trait]
impl TimeSource for RecordingChain {
    async fn block(&self, tag: BlockTag) -> CadenceResult<BlockInfo> {
        let height = match tag {
            BlockTag::Latest => {
                GENESIS_HEIGHT + (self.origin.elapsed().as_millis() as i64 / BLOCK_MILLIS) as u64
            }
            BlockTag::Number(height) => height,
        };
        Ok(BlockInfo {
            height,
            timestamp: ChainTime::from_millis((height as i64 - GENESIS_HEIGHT as i64) * BLOCK_MILLIS),
        })
    }
}

#[async_trait]
impl EntityReader for RecordingChain {
    async fn entities_in_regions(&self, _zones: &[ZoneId]) -> CadenceResult<RegionSnapshot> {
        Ok(RegionSnapshot {
            entities: Vec::new(),
            epoch: Epoch::FIRST,
        })
    }

    async fn revealed_commitments(
        &self,
        _epoch: Epoch,
        _zones: &[ZoneId],
        _from_block: u64,
        _to_block: u64,
    ) -> CadenceResult<Vec<RevealedCommitment>> {
        Ok(Vec::new())
    }

    async fn block_number(&self) -> CadenceResult<u64> {
        Ok(GENESIS_HEIGHT)
    }
}

#[async_trait]
impl FeeReader for RecordingChain {
    async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> CadenceResult<FeeHistory> {
        Ok(FeeHistory {
            oldest_block: GENESIS_HEIGHT,
            base_fee_per_gas: vec![1_000; block_count as usize + 1],
            reward: vec![vec![10; percentiles.len()]; block_count as usize],
        })
    }
}
