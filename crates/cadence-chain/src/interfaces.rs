//! External collaborators
//!
//! The client core never talks to a node or a wallet directly. Everything
//! it needs from the outside goes through these traits; the node client,
//! wallet and transaction relayer implement them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cadence_core::{Address, CadenceResult, EntityId, EntityKind, Epoch, LocalAction, Secret, TxRef};

use crate::{ContractAction, ZoneId};

/// Outcome of a mined transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptStatus {
    Confirmed,
    Reverted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_ref: TxRef,
    pub status: ReceiptStatus,
    pub block_number: u64,
}

impl Receipt {
    #[inline]
    pub fn is_reverted(&self) -> bool {
        self.status == ReceiptStatus::Reverted
    }
}

pub type ReceiptFuture = Pin<Box<dyn Future<Output = CadenceResult<Receipt>> + Send>>;

/// A broadcast transaction whose receipt has not been awaited yet
pub struct PendingTransaction {
    pub transaction_ref: TxRef,
    receipt: ReceiptFuture,
}

impl PendingTransaction {
    pub fn new<F>(transaction_ref: TxRef, receipt: F) -> Self
    where
        F: Future<Output = CadenceResult<Receipt>> + Send + 'static,
    {
        PendingTransaction {
            transaction_ref,
            receipt: Box::pin(receipt),
        }
    }

    /// Wait for the receipt
    ///
    /// A reverted transaction resolves to `Ok` with `ReceiptStatus::Reverted`;
    /// `Err` means the receipt could not be obtained.
    pub async fn wait(self) -> CadenceResult<Receipt> {
        self.receipt.await
    }
}

impl fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("transaction_ref", &self.transaction_ref)
            .finish()
    }
}

/// Options forwarded to receipt polling
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub polling_interval: Option<Duration>,
}

impl SubmitOptions {
    pub fn polling(interval: Duration) -> Self {
        SubmitOptions {
            polling_interval: Some(interval),
        }
    }
}

/// Sends commit and reveal transactions to the game contract
///
/// Implementations compute the commitment hash with
/// [`commitment_hash`](crate::commitment_hash) so that it matches what the
/// reveal later proves.
#[async_trait]
pub trait TransactionLayer: Send + Sync {
    async fn commit_actions(
        &self,
        entity: EntityId,
        secret: Secret,
        actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction>;

    async fn reveal_actions(
        &self,
        entity: EntityId,
        secret: Secret,
        actions: &[LocalAction],
        options: SubmitOptions,
    ) -> CadenceResult<PendingTransaction>;
}

/// Entity as returned by the contract, position still packed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntity {
    pub id: EntityId,
    pub owner: Address,
    pub kind: EntityKind,
    pub position: u128,
    pub life: u64,
    pub last_epoch: Epoch,
}

/// Entities of a set of zones together with the contract's epoch, read in
/// one call so both come from the same block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub entities: Vec<RawEntity>,
    pub epoch: Epoch,
}

/// One `CommitmentRevealed` event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevealedCommitment {
    pub entity: EntityId,
    pub epoch: Epoch,
    pub zone: ZoneId,
    pub actions: Vec<ContractAction>,
}

/// Reads game state from the contract
#[async_trait]
pub trait EntityReader: Send + Sync {
    async fn entities_in_regions(&self, zones: &[ZoneId]) -> CadenceResult<RegionSnapshot>;

    /// Reveal events of `epoch` in `zones`, within `from_block..=to_block`
    async fn revealed_commitments(
        &self,
        epoch: Epoch,
        zones: &[ZoneId],
        from_block: u64,
        to_block: u64,
    ) -> CadenceResult<Vec<RevealedCommitment>>;

    async fn block_number(&self) -> CadenceResult<u64>;
}

/// `eth_feeHistory` result
///
/// `reward[i][p]` is the priority fee at percentile `p` in block
/// `oldest_block + i`. `base_fee_per_gas` has one more entry than `reward`:
/// the base fee of the next block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeeHistory {
    pub oldest_block: u64,
    pub base_fee_per_gas: Vec<u128>,
    pub reward: Vec<Vec<u128>>,
}

#[async_trait]
pub trait FeeReader: Send + Sync {
    async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> CadenceResult<FeeHistory>;
}

/// Signs personal messages with the player's session key
#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign_message(&self, signer: &Address, message: &str) -> CadenceResult<Vec<u8>>;
}
