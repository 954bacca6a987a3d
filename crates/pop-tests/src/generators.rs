//! Test data generators.
//!
//! A synthetic chain whose headers are `previous(32) | height(8) | work(8) |
//! nonce(8)`, hashed with Blake2b-256.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;
use pop_chain::{Digest32, HeaderChain, HeaderCodec, HeaderFields, IngestOutcome};

/// Serialized size of a test header.
pub const TEST_HEADER_SIZE: usize = 56;

/// Codec for the synthetic chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestCodec;

impl HeaderCodec for TestCodec {
    fn header_size(&self) -> usize {
        TEST_HEADER_SIZE
    }

    fn decode(&self, raw: &[u8]) -> Result<HeaderFields, String> {
        if raw.len() != TEST_HEADER_SIZE {
            return Err(format!("expected {TEST_HEADER_SIZE} bytes, got {}", raw.len()));
        }
        let previous_hash = Digest32::from_slice(&raw[..32]).ok_or("bad previous hash")?;
        let height = u64::from_be_bytes(raw[32..40].try_into().map_err(|_| "bad height")?);
        let work = u64::from_be_bytes(raw[40..48].try_into().map_err(|_| "bad work")?);

        Ok(HeaderFields {
            hash: hash_header(raw),
            previous_hash,
            height,
            work: BigUint::from(work),
        })
    }
}

/// Blake2b-256 of a raw header.
pub fn hash_header(raw: &[u8]) -> Digest32 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(raw);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Digest32(out)
}

/// Builds unique raw headers. Siblings differ by nonce.
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    seed: u64,
    nonce: u64,
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Builders with different seeds produce different checkpoints.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed, nonce: 0 }
    }

    /// Height-0 header with work 1.
    pub fn checkpoint(&self) -> Vec<u8> {
        encode(&Digest32::ZERO, 0, 1, self.seed << 32)
    }

    pub fn child(&mut self, parent: &Digest32, height: u64, work: u64) -> Vec<u8> {
        self.nonce += 1;
        encode(parent, height, work, (self.seed << 32) | self.nonce)
    }

    /// `count` linked headers after `parent` (at `parent_height`), each with
    /// `work`.
    pub fn branch(&mut self, parent: &Digest32, parent_height: u64, count: u64, work: u64) -> Vec<Vec<u8>> {
        let mut previous = *parent;
        (1..=count)
            .map(|i| {
                let raw = self.child(&previous, parent_height + i, work);
                previous = hash_header(&raw);
                raw
            })
            .collect()
    }

    /// Build and ingest a branch; returns the hashes in height order.
    pub fn extend(
        &mut self,
        chain: &HeaderChain,
        parent: &Digest32,
        parent_height: u64,
        count: u64,
        work: u64,
    ) -> Vec<Digest32> {
        self.branch(parent, parent_height, count, work)
            .into_iter()
            .map(|raw| match chain.ingest(&raw) {
                Ok(IngestOutcome::Accepted(a)) => a.hash,
                other => panic!("header not accepted: {other:?}"),
            })
            .collect()
    }
}

fn encode(previous: &Digest32, height: u64, work: u64, nonce: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(TEST_HEADER_SIZE);
    raw.extend_from_slice(previous.as_bytes());
    raw.extend_from_slice(&height.to_be_bytes());
    raw.extend_from_slice(&work.to_be_bytes());
    raw.extend_from_slice(&nonce.to_be_bytes());
    raw
}

/// Deterministic digest for a seed.
pub fn test_digest(seed: u8) -> Digest32 {
    let mut d = [0u8; 32];
    d[0] = seed;
    d[31] = seed.wrapping_mul(7);
    Digest32(d)
}

/// Transaction id in the 64-hex-char form the chain can use as a proof
/// reference.
pub fn test_tx_id(n: u64) -> String {
    format!("{:064x}", 0xAA00_0000_0000_0000u64 | n)
}
