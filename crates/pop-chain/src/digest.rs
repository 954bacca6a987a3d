//! Fixed-width digests used as block hashes and proof references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size in bytes of every digest handled by the tracker.
pub const DIGEST_SIZE: usize = 32;

/// A 32-byte digest, displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest32(pub [u8; DIGEST_SIZE]);

impl Digest32 {
    /// The all-zero sentinel ("no proof reference").
    pub const ZERO: Digest32 = Digest32([0u8; DIGEST_SIZE]);

    /// Build a digest from a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl FromStr for Digest32 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex digest: {e}"))?;
        Self::from_slice(&bytes)
            .ok_or_else(|| format!("digest must be {DIGEST_SIZE} bytes, got {}", bytes.len()))
    }
}

impl From<Digest32> for String {
    fn from(d: Digest32) -> Self {
        d.to_hex()
    }
}

impl TryFrom<String> for Digest32 {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
