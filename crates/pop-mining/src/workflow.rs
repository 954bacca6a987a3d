//! Operation pipeline: the ordered stages from instruction to payout.

use crate::{
    ChainAdapter, EndorsementStatus, MiningConfig, MiningInstruction,
    MiningOperation, OperationState, Stage, StageError, StageOutcome, TaskEngine,
};
use parking_lot::Mutex;
use pop_chain::{Digest32, HeaderChain};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const RETRIEVE_INSTRUCTION: &str = "retrieve mining instruction";
pub const SUBMIT_ENDORSEMENT: &str = "submit endorsement transaction";
pub const CONFIRM_ENDORSEMENT: &str = "confirm endorsement transaction";
pub const LOCATE_BLOCK_OF_PROOF: &str = "locate block of proof";
pub const BUILD_MERKLE_PROOF: &str = "build merkle proof";
pub const SUBMIT_PROOF: &str = "submit proof";
pub const DETECT_PAYOUT: &str = "detect payout";
pub const COMPLETE: &str = "complete";

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed(String),
    /// Stopped by its token; the persisted state is whatever was last saved.
    Cancelled,
    /// Failed, but the failure could not be saved. The stored record still
    /// shows the operation active, so a restart resumes it.
    NotPersisted(String),
}

/// Confirmed endorsement, possibly under a resubmitted transaction id.
struct Confirmation {
    transaction_id: String,
    block_hash: Digest32,
}

/// Runs an operation's stages in order.
pub struct Pipeline {
    engine: TaskEngine,
    adapter: Arc<dyn ChainAdapter>,
    chain: Arc<HeaderChain>,
    config: Arc<MiningConfig>,
}

impl Pipeline {
    pub fn new(
        engine: TaskEngine,
        adapter: Arc<dyn ChainAdapter>,
        chain: Arc<HeaderChain>,
        config: Arc<MiningConfig>,
    ) -> Self {
        Self {
            engine,
            adapter,
            chain,
            config,
        }
    }

    /// Drive `operation` until it completes, fails or `cancel` fires.
    /// Stages the operation already passed are skipped.
    pub async fn run(&self, operation: &mut MiningOperation, cancel: &CancellationToken) -> PipelineOutcome {
        match operation.state {
            OperationState::Completed => return PipelineOutcome::Completed,
            OperationState::Failed => {
                return PipelineOutcome::Failed(operation.failure_reason.clone().unwrap_or_default())
            }
            _ => {}
        }

        info!(
            id = %operation.id,
            chain = %operation.chain_id,
            state = %operation.state,
            "Running mining operation"
        );

        match self.run_stages(operation, cancel).await {
            Ok(()) => {
                info!(id = %operation.id, "Mining operation completed");
                PipelineOutcome::Completed
            }
            Err(StageError::Cancelled { stage }) => {
                debug!(id = %operation.id, stage, "Mining operation cancelled");
                PipelineOutcome::Cancelled
            }
            Err(e @ StageError::NotPersisted { .. }) => PipelineOutcome::NotPersisted(e.to_string()),
            Err(e) => PipelineOutcome::Failed(e.to_string()),
        }
    }

    async fn run_stages(&self, op: &mut MiningOperation, cancel: &CancellationToken) -> Result<(), StageError> {
        let timeouts = &self.config.timeouts;
        let engine = &self.engine;

        engine
            .run_stage(
                op,
                &Stage::new(RETRIEVE_INSTRUCTION, OperationState::InstructionReceived, timeouts.instruction),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    async move {
                        StageOutcome::from(adapter.build_instruction(ctx.operation().endorsed_height).await)
                    }
                },
                |op, instruction: MiningInstruction| {
                    op.endorsed_height = Some(instruction.endorsed_height);
                    op.endorsed_block_hash = Some(instruction.endorsed_block_hash.clone());
                    op.info(format!(
                        "endorsing block {} at height {}",
                        instruction.endorsed_block_hash, instruction.endorsed_height
                    ));
                    op.instruction = Some(instruction);
                },
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(SUBMIT_ENDORSEMENT, OperationState::EndorsementSubmitted, timeouts.endorsement),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    async move {
                        let Some(instruction) = ctx.operation().instruction.clone() else {
                            return StageOutcome::Fatal("no mining instruction".into());
                        };
                        StageOutcome::from(adapter.submit_endorsement(&instruction).await)
                    }
                },
                |op, transaction_id: String| {
                    op.info(format!("endorsement transaction {transaction_id} submitted"));
                    op.transaction_id = Some(transaction_id);
                },
            )
            .await?;

        // A resubmitted transaction id must survive a retried attempt.
        let resubmitted: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        engine
            .run_stage(
                op,
                &Stage::new(CONFIRM_ENDORSEMENT, OperationState::EndorsementConfirmed, timeouts.confirmation),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    let chain = Arc::clone(&self.chain);
                    let resubmitted = Arc::clone(&resubmitted);
                    let required = self.config.required_confirmations;
                    let poll = self.config.confirmation_poll;
                    async move {
                        let op = ctx.operation();
                        let (Some(instruction), Some(submitted)) = (&op.instruction, &op.transaction_id) else {
                            return StageOutcome::Fatal("no endorsement transaction".into());
                        };
                        let mut transaction_id = resubmitted.lock().clone().unwrap_or_else(|| submitted.clone());

                        loop {
                            match adapter.endorsement_status(&transaction_id).await {
                                Ok(EndorsementStatus::Confirmed { block_hash, depth }) if depth >= required => {
                                    // A block we do not follow cannot anchor the proof;
                                    // wait for the source to report the new one.
                                    if chain.is_on_best_chain(&block_hash) {
                                        return StageOutcome::Success(Confirmation {
                                            transaction_id,
                                            block_hash,
                                        });
                                    }
                                    debug!(id = %op.id, block = %block_hash, "Endorsement block is not on the best chain");
                                }
                                Ok(EndorsementStatus::Confirmed { .. }) | Ok(EndorsementStatus::Pending) => {}
                                Ok(EndorsementStatus::Dropped) => {
                                    warn!(id = %op.id, tx = %transaction_id, "Endorsement dropped, resubmitting");
                                    match adapter.submit_endorsement(instruction).await {
                                        Ok(id) => {
                                            *resubmitted.lock() = Some(id.clone());
                                            transaction_id = id;
                                        }
                                        Err(e) => return StageOutcome::from(e),
                                    }
                                }
                                Err(e) => return StageOutcome::from(e),
                            }
                            tokio::time::sleep(poll).await;
                        }
                    }
                },
                |op, confirmation: Confirmation| {
                    if op.transaction_id.as_deref() != Some(confirmation.transaction_id.as_str()) {
                        op.info(format!("endorsement resubmitted as {}", confirmation.transaction_id));
                        op.transaction_id = Some(confirmation.transaction_id);
                    }
                    op.info(format!("endorsement confirmed in {}", confirmation.block_hash));
                    op.endorsement_block_hash = Some(confirmation.block_hash);
                },
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(LOCATE_BLOCK_OF_PROOF, OperationState::BlockOfProofFound, timeouts.block_of_proof),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    let chain = Arc::clone(&self.chain);
                    async move {
                        let op = ctx.operation();
                        let (Some(transaction_id), Some(endorsement_block)) =
                            (op.transaction_id.as_deref(), op.endorsement_block_hash)
                        else {
                            return StageOutcome::Fatal("endorsement is not confirmed".into());
                        };
                        let block = match adapter.locate_proof(transaction_id, &endorsement_block).await {
                            Ok(block) => block,
                            Err(e) => return StageOutcome::from(e),
                        };
                        if !chain.is_on_best_chain(&block) {
                            return StageOutcome::Retryable(format!(
                                "block of proof {block} is not on the best chain"
                            ));
                        }
                        if let Ok(reference) = transaction_id.parse::<Digest32>() {
                            if let Err(e) = chain.set_proof_reference(&block, reference) {
                                return StageOutcome::Retryable(format!("could not mark block of proof: {e}"));
                            }
                        }
                        StageOutcome::Success(block)
                    }
                },
                |op, block: Digest32| {
                    op.info(format!("block of proof {block}"));
                    op.block_of_proof_hash = Some(block);
                },
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(BUILD_MERKLE_PROOF, OperationState::ProofBuilt, timeouts.merkle_proof),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    async move {
                        let op = ctx.operation();
                        let (Some(transaction_id), Some(block)) = (op.transaction_id.as_deref(), op.block_of_proof_hash)
                        else {
                            return StageOutcome::Fatal("block of proof is unknown".into());
                        };
                        StageOutcome::from(adapter.build_merkle_proof(transaction_id, &block).await)
                    }
                },
                |op, proof| op.merkle_proof = Some(proof),
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(SUBMIT_PROOF, OperationState::ProofSubmitted, timeouts.proof_submission),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    async move { StageOutcome::from(adapter.submit_proof(ctx.operation()).await) }
                },
                |op, submission_id: String| {
                    op.info(format!("proof submitted as {submission_id}"));
                    op.proof_submission_id = Some(submission_id);
                },
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(DETECT_PAYOUT, OperationState::PayoutDetected, timeouts.payout),
                cancel,
                |ctx| {
                    let adapter = Arc::clone(&self.adapter);
                    let poll = self.config.payout_poll;
                    async move {
                        loop {
                            match adapter.detect_payout(ctx.operation()).await {
                                Ok(Some(payout)) => return StageOutcome::Success(payout),
                                Ok(None) => tokio::time::sleep(poll).await,
                                Err(e) => return StageOutcome::from(e),
                            }
                        }
                    }
                },
                |op, payout| {
                    op.info(format!("paid {} in {}", payout.amount, payout.payout_block_hash));
                    op.payout = Some(payout);
                },
            )
            .await?;

        engine
            .run_stage(
                op,
                &Stage::new(COMPLETE, OperationState::Completed, timeouts.payout),
                cancel,
                |_| async { StageOutcome::Success(()) },
                |_, ()| {},
            )
            .await?;

        Ok(())
    }
}
