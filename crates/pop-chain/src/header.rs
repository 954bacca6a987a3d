//! Header types and the codec collaborator.

use crate::Digest32;
use num_bigint::BigUint;

/// Fields the tracker needs from an opaque serialized header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    /// Content hash of the header.
    pub hash: Digest32,
    /// Hash of the parent header.
    pub previous_hash: Digest32,
    /// Height of the header.
    pub height: u64,
    /// Work contributed by this header, derived from its difficulty field.
    pub work: BigUint,
}

/// Decodes raw headers of the followed chain.
///
/// The serialization format is owned by the upstream chain; implementations
/// live next to the transport that delivers the bytes.
pub trait HeaderCodec: Send + Sync {
    /// Serialized size of every header of this chain.
    fn header_size(&self) -> usize;

    /// Extract the tracking fields from a serialized header.
    fn decode(&self, raw: &[u8]) -> Result<HeaderFields, String>;
}

/// One header plus chain-tracking metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHeader {
    /// Block hash.
    pub hash: Digest32,
    /// Parent hash, extracted from `raw`.
    pub previous_hash: Digest32,
    /// Block height.
    pub height: u64,
    /// Total work from the checkpoint up to and including this header.
    pub cumulative_work: BigUint,
    /// Transaction or block this header is known to carry proof for.
    /// `Digest32::ZERO` when unset.
    pub proof_reference: Digest32,
    /// Serialized header, immutable.
    pub raw: Vec<u8>,
}

impl StoredHeader {
    /// Build a stored header from decoded fields.
    pub fn new(fields: HeaderFields, cumulative_work: BigUint, raw: Vec<u8>) -> Self {
        Self {
            hash: fields.hash,
            previous_hash: fields.previous_hash,
            height: fields.height,
            cumulative_work,
            proof_reference: Digest32::ZERO,
            raw,
        }
    }

    /// Whether a proof reference has been recorded for this header.
    pub fn has_proof_reference(&self) -> bool {
        !self.proof_reference.is_zero()
    }
}
