//! Fixed-size on-disk header record.
//!
//! ```text
//! +-----------+------------------------+-------------------+----------------+
//! | hash (32) | cumulative work (32 BE)| proof ref (32)    | raw header (N) |
//! +-----------+------------------------+-------------------+----------------+
//! ```
//!
//! `N` is the codec's `header_size`, so every record of a store has the same
//! length and can be addressed by offset.

use crate::{ChainError, ChainResult, Digest32, StoredHeader, DIGEST_SIZE};
use num_bigint::BigUint;

/// Width of the big-endian cumulative work field.
pub const WORK_SIZE: usize = 32;

/// Bytes preceding the raw header in a record.
pub const RECORD_PREFIX_SIZE: usize = DIGEST_SIZE + WORK_SIZE + DIGEST_SIZE;

/// Total record size for a chain whose headers are `header_size` bytes.
pub fn record_size(header_size: usize) -> usize {
    RECORD_PREFIX_SIZE + header_size
}

/// Decoded record contents. Parent hash and height come from the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub hash: Digest32,
    pub cumulative_work: BigUint,
    pub proof_reference: Digest32,
    pub raw: Vec<u8>,
}

/// Encode a header into its fixed-size record.
pub fn encode(header: &StoredHeader, header_size: usize) -> ChainResult<Vec<u8>> {
    if header.raw.len() != header_size {
        return Err(ChainError::Corrupted(format!(
            "header {} is {} bytes, expected {}",
            header.hash,
            header.raw.len(),
            header_size
        )));
    }

    let work = header.cumulative_work.to_bytes_be();
    if work.len() > WORK_SIZE {
        return Err(ChainError::WorkOverflow(header.hash));
    }

    let mut bytes = Vec::with_capacity(record_size(header_size));
    bytes.extend_from_slice(header.hash.as_bytes());
    bytes.resize(DIGEST_SIZE + WORK_SIZE - work.len(), 0);
    bytes.extend_from_slice(&work);
    bytes.extend_from_slice(header.proof_reference.as_bytes());
    bytes.extend_from_slice(&header.raw);
    Ok(bytes)
}

/// Decode a fixed-size record.
pub fn decode(bytes: &[u8], header_size: usize) -> ChainResult<HeaderRecord> {
    if bytes.len() != record_size(header_size) {
        return Err(ChainError::Corrupted(format!(
            "record is {} bytes, expected {}",
            bytes.len(),
            record_size(header_size)
        )));
    }

    let (hash, rest) = bytes.split_at(DIGEST_SIZE);
    let (work, rest) = rest.split_at(WORK_SIZE);
    let (proof_reference, raw) = rest.split_at(DIGEST_SIZE);

    Ok(HeaderRecord {
        hash: Digest32::from_slice(hash)
            .ok_or_else(|| ChainError::Corrupted("bad hash field".into()))?,
        cumulative_work: BigUint::from_bytes_be(work),
        proof_reference: Digest32::from_slice(proof_reference)
            .ok_or_else(|| ChainError::Corrupted("bad proof reference field".into()))?,
        raw: raw.to_vec(),
    })
}
