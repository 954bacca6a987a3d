//! # pop-mining
//!
//! Mining operations for the PoP mining client.
//!
//! This crate provides:
//! - The mining operation record and its lifecycle states
//! - A task engine running pipeline stages with retry, backoff and timeout
//! - The operation pipeline, from mining instruction to payout
//! - An operation manager owning running pipelines and reacting to reorgs
//! - The automine rule engine deciding which heights to endorse
//!
//! Everything that talks to a network goes through [`ChainAdapter`].

mod adapter;
mod automine;
mod config;
mod error;
mod manager;
mod operation;
mod store;
mod task;
mod workflow;

pub use adapter::{AdapterError, AdapterResult, ChainAdapter, EndorsementStatus};
pub use automine::{new_heights, AutoMineConfig, AutoMiner, MineTrigger, Round, KEYSTONE_INTERVAL};
pub use config::{ConfigHandle, MiningConfig, StageTimeouts, DEFAULT_MAX_ATTEMPTS};
pub use error::{MiningError, MiningResult};
pub use manager::{MiningStats, OperationManager, CANCELLED_BY_USER};
pub use operation::{
    Bytes, LogEntry, LogLevel, MiningInstruction, MiningOperation, OperationId, OperationState,
    PayoutInfo, MAX_LOG_ENTRIES,
};
pub use store::{OperationRepository, OperationStore};
pub use task::{RetryPolicy, Stage, StageContext, StageError, StageOutcome, StageReport, TaskEngine};
pub use workflow::{Pipeline, PipelineOutcome};

/// Names of the pipeline stages, as they appear in failure reasons.
pub mod stages {
    pub use crate::workflow::{
        BUILD_MERKLE_PROOF, COMPLETE, CONFIRM_ENDORSEMENT, DETECT_PAYOUT, LOCATE_BLOCK_OF_PROOF,
        RETRIEVE_INSTRUCTION, SUBMIT_ENDORSEMENT, SUBMIT_PROOF,
    };
}
