//! Capability interface to the endorsing and endorsed chains.

use crate::{Bytes, MiningInstruction, MiningOperation, PayoutInfo};
use async_trait::async_trait;
use pop_chain::Digest32;
use thiserror::Error;

/// Adapter failure, classified by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network hiccup, node busy, not yet available.
    #[error("{0}")]
    Transient(String),

    /// Rejected outright; retrying will not change the answer.
    #[error("{0}")]
    Fatal(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Where the endorsement transaction currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndorsementStatus {
    /// Known to the network, not yet in a block.
    Pending,
    /// Included in `block_hash`, `depth` blocks deep.
    Confirmed { block_hash: Digest32, depth: u32 },
    /// Evicted from the network; it has to be submitted again.
    Dropped,
}

/// Everything a pipeline needs from the outside world.
///
/// One adapter serves one endorsed chain. Implementations own transport,
/// signing and wallet concerns.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Identifier of the endorsed chain.
    fn chain_id(&self) -> &str;

    /// Ask the endorsed chain what to publish. `None` means its current tip.
    async fn build_instruction(&self, height: Option<u64>) -> AdapterResult<MiningInstruction>;

    /// Publish the endorsement transaction; returns its id.
    async fn submit_endorsement(&self, instruction: &MiningInstruction) -> AdapterResult<String>;

    async fn endorsement_status(&self, transaction_id: &str) -> AdapterResult<EndorsementStatus>;

    /// Block of proof for a confirmed endorsement.
    async fn locate_proof(
        &self,
        transaction_id: &str,
        endorsement_block: &Digest32,
    ) -> AdapterResult<Digest32>;

    async fn build_merkle_proof(
        &self,
        transaction_id: &str,
        block_of_proof: &Digest32,
    ) -> AdapterResult<Bytes>;

    /// Hand the finished proof to the endorsed chain; returns a submission id.
    async fn submit_proof(&self, operation: &MiningOperation) -> AdapterResult<String>;

    /// `None` until the reward shows up.
    async fn detect_payout(&self, operation: &MiningOperation) -> AdapterResult<Option<PayoutInfo>>;
}
