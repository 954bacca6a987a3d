//! Error types for chain tracking.

use crate::{Digest32, RejectReason};
use thiserror::Error;

/// Chain tracking errors.
///
/// Ordinary header rejections are not errors: they are reported through
/// [`IngestOutcome::Rejected`](crate::IngestOutcome::Rejected). Everything
/// here is unexpected and must reach the caller.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] pop_storage::StorageError),

    /// The checkpoint header could not be decoded.
    #[error("Invalid checkpoint header: {0}")]
    InvalidCheckpoint(String),

    /// The configured checkpoint differs from the one the database was seeded with.
    #[error("Checkpoint mismatch: database has {stored}, configured {configured}")]
    CheckpointMismatch {
        stored: Digest32,
        configured: Digest32,
    },

    /// A header referenced by the index is missing.
    #[error("Header not found: {0}")]
    HeaderNotFound(Digest32),

    /// Persisted data is inconsistent.
    #[error("Corrupted header store: {0}")]
    Corrupted(String),

    /// Cumulative work does not fit the fixed-width record field.
    #[error("Cumulative work of {0} exceeds the record width")]
    WorkOverflow(Digest32),

    /// The header source failed.
    #[error("Header source error: {0}")]
    Source(String),

    /// The header source served a header the tracker refused.
    #[error("Header {hash} rejected: {reason}")]
    Rejected { hash: String, reason: RejectReason },
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
