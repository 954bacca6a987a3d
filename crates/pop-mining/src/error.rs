//! Mining error types.

use crate::OperationId;
use thiserror::Error;

/// Mining errors.
///
/// Stage failures are not listed here: the task engine turns them into a
/// failed operation instead of an error.
#[derive(Error, Debug)]
pub enum MiningError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] pop_storage::StorageError),

    /// Chain tracker error.
    #[error("Chain error: {0}")]
    Chain(#[from] pop_chain::ChainError),

    /// A persisted operation could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No adapter is registered for the chain.
    #[error("No adapter registered for chain '{0}'")]
    UnknownChain(String),

    /// Operation not found.
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    /// The operation already has a running pipeline.
    #[error("Operation {0} is already running")]
    AlreadyRunning(OperationId),

    /// The operation cannot be acted on in its current state.
    #[error("Operation {id} is {state}")]
    InvalidState { id: OperationId, state: String },

    /// Every freshly drawn operation id was already in use.
    #[error("No unused operation id after {0} attempts")]
    IdsExhausted(usize),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for MiningError {
    fn from(e: serde_json::Error) -> Self {
        MiningError::Serialization(e.to_string())
    }
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;
