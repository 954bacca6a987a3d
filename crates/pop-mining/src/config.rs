//! Mining configuration and hot-swappable config snapshots.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum attempts of a retryable stage.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Per-stage attempt timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTimeouts {
    pub instruction: Duration,
    pub endorsement: Duration,
    pub confirmation: Duration,
    pub block_of_proof: Duration,
    pub merkle_proof: Duration,
    pub proof_submission: Duration,
    pub payout: Duration,
}

impl StageTimeouts {
    fn named(&self) -> [(&'static str, Duration); 7] {
        [
            ("instruction", self.instruction),
            ("endorsement", self.endorsement),
            ("confirmation", self.confirmation),
            ("block_of_proof", self.block_of_proof),
            ("merkle_proof", self.merkle_proof),
            ("proof_submission", self.proof_submission),
            ("payout", self.payout),
        ]
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            instruction: Duration::from_secs(120),
            endorsement: Duration::from_secs(120),
            confirmation: Duration::from_secs(2 * 60 * 60),
            block_of_proof: Duration::from_secs(10 * 60),
            merkle_proof: Duration::from_secs(10 * 60),
            proof_submission: Duration::from_secs(10 * 60),
            payout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Settings for operation pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningConfig {
    /// Attempts of a retryable stage before the operation fails.
    pub max_attempts: u32,
    /// Attempt `n` waits `n * n * 10` units before retrying.
    pub backoff_unit: Duration,
    /// Depth the endorsement transaction needs before it counts as confirmed.
    pub required_confirmations: u32,
    /// Delay between endorsement status polls.
    pub confirmation_poll: Duration,
    /// Delay between payout polls.
    pub payout_poll: Duration,
    pub timeouts: StageTimeouts,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: Duration::from_secs(1),
            required_confirmations: 1,
            confirmation_poll: Duration::from_secs(10),
            payout_poll: Duration::from_secs(60),
            timeouts: StageTimeouts::default(),
        }
    }
}

impl MiningConfig {
    /// Check the settings are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.confirmation_poll.is_zero() || self.payout_poll.is_zero() {
            return Err("poll intervals must be non-zero".into());
        }
        if let Some((stage, _)) = self.timeouts.named().into_iter().find(|(_, t)| t.is_zero()) {
            return Err(format!("{stage} timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Shared, replaceable configuration snapshot.
///
/// Readers take an `Arc` snapshot and keep using it for the whole evaluation;
/// a reload swaps the pointer for subsequent readers.
pub struct ConfigHandle<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> ConfigHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the configuration.
    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
