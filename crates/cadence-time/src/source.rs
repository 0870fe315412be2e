//! Remote time source: the chain's blocks

use async_trait::async_trait;

use cadence_core::{CadenceResult, ChainTime};

/// Which block to read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

/// Height and timestamp of one block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub timestamp: ChainTime,
}

/// Reads block headers from the chain
///
/// Failures are reported as `CadenceError::Network` and are always retried
/// by the caller.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn block(&self, tag: BlockTag) -> CadenceResult<BlockInfo>;
}
