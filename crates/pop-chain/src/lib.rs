//! # pop-chain
//!
//! Header chain tracking for the PoP mining client.
//!
//! This crate provides:
//! - `HeaderChain`: best-work tip selection over ingested headers, with
//!   reorganization detection
//! - `EventBus`: ordered in-process publish/subscribe for chain events
//! - `HeaderFollower`: pulls headers from a trusted `HeaderSource` and
//!   ingests them ancestors-first
//!
//! ## Architecture
//!
//! Headers are opaque blobs owned by the upstream chain. A `HeaderCodec`
//! collaborator extracts the hash, parent hash, height and work from each
//! blob; the tracker never interprets the bytes itself. Every accepted
//! header is persisted as a fixed-size record (see [`record`]).

mod chain;
mod digest;
mod error;
mod events;
mod follower;
mod header;
pub mod record;

#[cfg(test)]
mod testing;

pub use chain::{AcceptedHeader, HeaderChain, IngestOutcome, RejectReason, TipSummary};
pub use digest::{Digest32, DIGEST_SIZE};
pub use error::{ChainError, ChainResult};
pub use events::{ChainEvent, EventBus};
pub use follower::{FollowerConfig, HeaderFollower, HeaderSource, SyncReport};
pub use header::{HeaderCodec, HeaderFields, StoredHeader};

/// Chain-related column families.
pub mod columns {
    use pop_storage::ColumnFamily;

    /// Header records keyed by hash.
    pub const HEADERS: ColumnFamily = ColumnFamily::Headers;
    /// Tracker metadata.
    pub const METADATA: ColumnFamily = ColumnFamily::Metadata;

    /// Metadata key holding the best header hash.
    pub const BEST_HEADER_KEY: &[u8] = b"best_header";
    /// Metadata key holding the best header height (big-endian u64).
    pub const BEST_HEIGHT_KEY: &[u8] = b"best_height";
    /// Metadata key holding the checkpoint hash.
    pub const CHECKPOINT_KEY: &[u8] = b"checkpoint";
}
