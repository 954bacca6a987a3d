//! Test codec and header generator shared by this crate's unit tests.

use crate::{Digest32, HeaderCodec, HeaderFields};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;

/// previous(32) | height(8) | work(8) | nonce(8)
pub const HEADER_SIZE: usize = 56;

pub struct TestCodec;

impl HeaderCodec for TestCodec {
    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn decode(&self, raw: &[u8]) -> Result<HeaderFields, String> {
        if raw.len() != HEADER_SIZE {
            return Err(format!("expected {HEADER_SIZE} bytes, got {}", raw.len()));
        }
        let previous_hash = Digest32::from_slice(&raw[..32]).ok_or("bad previous hash")?;
        let height = u64::from_be_bytes(raw[32..40].try_into().map_err(|_| "bad height")?);
        let work = u64::from_be_bytes(raw[40..48].try_into().map_err(|_| "bad work")?);

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(raw);
        let hash = Digest32::from_slice(&hasher.finalize()).ok_or("bad hash")?;

        Ok(HeaderFields {
            hash,
            previous_hash,
            height,
            work: BigUint::from(work),
        })
    }
}

/// Builds unique raw headers; the nonce keeps siblings distinct.
pub struct HeaderBuilder {
    seed: u64,
    nonce: u64,
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { seed, nonce: 0 }
    }

    pub fn checkpoint(&self) -> Vec<u8> {
        encode(&Digest32::ZERO, 0, 1, self.seed << 32)
    }

    pub fn child(&mut self, parent: &Digest32, height: u64, work: u64) -> Vec<u8> {
        self.nonce += 1;
        encode(parent, height, work, (self.seed << 32) | self.nonce)
    }
}

fn encode(previous: &Digest32, height: u64, work: u64, nonce: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_SIZE);
    raw.extend_from_slice(previous.as_bytes());
    raw.extend_from_slice(&height.to_be_bytes());
    raw.extend_from_slice(&work.to_be_bytes());
    raw.extend_from_slice(&nonce.to_be_bytes());
    raw
}
