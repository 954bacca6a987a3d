//! Mining operation model.

use pop_chain::Digest32;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Entries kept in an operation's log before the oldest are dropped.
pub const MAX_LOG_ENTRIES: usize = 64;

/// Short random operation identifier (8 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 4]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Lifecycle state of an operation.
///
/// Variants are declared in pipeline order; a stage whose target is at or
/// below the current state is already done. `Failed` sorts last so a failed
/// operation never re-runs a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Initial,
    InstructionReceived,
    EndorsementSubmitted,
    EndorsementConfirmed,
    BlockOfProofFound,
    ProofBuilt,
    ProofSubmitted,
    PayoutDetected,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::InstructionReceived => "INSTRUCTION_RECEIVED",
            Self::EndorsementSubmitted => "ENDORSEMENT_SUBMITTED",
            Self::EndorsementConfirmed => "ENDORSEMENT_CONFIRMED",
            Self::BlockOfProofFound => "BLOCK_OF_PROOF_FOUND",
            Self::ProofBuilt => "PROOF_BUILT",
            Self::ProofSubmitted => "PROOF_SUBMITTED",
            Self::PayoutDetected => "PAYOUT_DETECTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Opaque byte payload, stored as hex.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Bytes(pub Vec<u8>);

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({})", hex::encode(&self.0))
    }
}

impl From<Bytes> for String {
    fn from(b: Bytes) -> Self {
        hex::encode(b.0)
    }
}

impl TryFrom<String> for Bytes {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        hex::decode(s).map(Bytes)
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

/// What the chain's node tells us to endorse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningInstruction {
    pub endorsed_height: u64,
    pub endorsed_block_hash: String,
    pub publication_data: Bytes,
    pub endorsed_header: Bytes,
    /// Endorsing-chain headers the proof has to connect to.
    #[serde(default)]
    pub context_headers: Vec<Bytes>,
    pub payout_address: String,
}

/// Reward observed on the endorsed chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutInfo {
    pub payout_block_hash: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

/// One attempt to produce and prove an endorsement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningOperation {
    pub id: OperationId,
    pub chain_id: String,
    /// Height requested by the trigger; `None` lets the node pick.
    pub endorsed_height: Option<u64>,
    pub endorsed_block_hash: Option<String>,
    pub state: OperationState,
    pub instruction: Option<MiningInstruction>,
    pub transaction_id: Option<String>,
    /// Block that confirmed the endorsement transaction.
    pub endorsement_block_hash: Option<Digest32>,
    pub block_of_proof_hash: Option<Digest32>,
    pub merkle_proof: Option<Bytes>,
    pub proof_submission_id: Option<String>,
    pub payout: Option<PayoutInfo>,
    pub failure_reason: Option<String>,
    /// Attempts each completed stage needed, keyed by the state it reached.
    #[serde(default)]
    pub stage_attempts: BTreeMap<OperationState, u32>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl MiningOperation {
    pub fn new(chain_id: impl Into<String>, endorsed_height: Option<u64>) -> Self {
        let now = now_millis();
        let mut op = Self {
            id: OperationId::generate(),
            chain_id: chain_id.into(),
            endorsed_height,
            endorsed_block_hash: None,
            state: OperationState::Initial,
            instruction: None,
            transaction_id: None,
            endorsement_block_hash: None,
            block_of_proof_hash: None,
            merkle_proof: None,
            proof_submission_id: None,
            payout: None,
            failure_reason: None,
            stage_attempts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            log: Vec::new(),
        };
        let message = match endorsed_height {
            Some(h) => format!("created for {} at height {h}", op.chain_id),
            None => format!("created for {}", op.chain_id),
        };
        op.info(message);
        op
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move forward to `state`, recording how many attempts it took.
    pub fn advance(&mut self, state: OperationState, attempts: u32) {
        debug_assert!(state > self.state || self.state == state);
        self.state = state;
        self.stage_attempts.insert(state, attempts);
        self.touch();
        self.info(format!("reached {state}"));
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state = OperationState::Failed;
        self.error(format!("failed: {reason}"));
        self.failure_reason = Some(reason);
        self.touch();
    }

    /// Move back to `state` after the chain dropped work this operation
    /// depended on. Result fields stay as they are and are overwritten when
    /// the stages run again.
    pub fn roll_back(&mut self, state: OperationState, reason: &str) {
        let from = self.state;
        self.state = state;
        self.stage_attempts.retain(|s, _| *s <= state);
        self.touch();
        self.warn(format!("rolled back from {from} to {state}: {reason}"));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message.into());
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if self.log.len() >= MAX_LOG_ENTRIES {
            let excess = self.log.len() + 1 - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
        self.log.push(LogEntry {
            timestamp: now_millis(),
            level,
            message,
        });
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_follows_pipeline() {
        use OperationState::*;
        let order = [
            Initial,
            InstructionReceived,
            EndorsementSubmitted,
            EndorsementConfirmed,
            BlockOfProofFound,
            ProofBuilt,
            ProofSubmitted,
            PayoutDetected,
            Completed,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(Failed > Completed);
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!PayoutDetected.is_terminal());
    }

    #[test]
    fn test_new_operation() {
        let op = MiningOperation::new("test-chain", Some(120));
        assert_eq!(op.id.as_str().len(), 8);
        assert_eq!(op.state, OperationState::Initial);
        assert_eq!(op.endorsed_height, Some(120));
        assert_eq!(op.log.len(), 1);
    }

    #[test]
    fn test_advance_records_attempts() {
        let mut op = MiningOperation::new("test-chain", None);
        op.advance(OperationState::InstructionReceived, 3);
        assert_eq!(op.state, OperationState::InstructionReceived);
        assert_eq!(op.stage_attempts[&OperationState::InstructionReceived], 3);
    }

    #[test]
    fn test_fail_keeps_reason() {
        let mut op = MiningOperation::new("test-chain", None);
        op.fail("boom");
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.failure_reason.as_deref(), Some("boom"));
        assert_eq!(op.log.last().unwrap().level, LogLevel::Error);
    }

    #[test]
    fn test_roll_back_forgets_later_stages() {
        let mut op = MiningOperation::new("test-chain", None);
        op.advance(OperationState::InstructionReceived, 1);
        op.advance(OperationState::EndorsementSubmitted, 1);
        op.endorsement_block_hash = Some(Digest32([1; 32]));
        op.advance(OperationState::EndorsementConfirmed, 1);
        op.block_of_proof_hash = Some(Digest32([1; 32]));
        op.advance(OperationState::BlockOfProofFound, 2);

        op.roll_back(OperationState::EndorsementSubmitted, "reorg");

        assert_eq!(op.state, OperationState::EndorsementSubmitted);
        assert_eq!(op.endorsement_block_hash, Some(Digest32([1; 32])));
        assert!(!op.stage_attempts.contains_key(&OperationState::BlockOfProofFound));
        assert!(op.stage_attempts.contains_key(&OperationState::EndorsementSubmitted));
    }

    #[test]
    fn test_log_is_bounded() {
        let mut op = MiningOperation::new("test-chain", None);
        for i in 0..200 {
            op.info(format!("entry {i}"));
        }
        assert_eq!(op.log.len(), MAX_LOG_ENTRIES);
        assert_eq!(op.log.last().unwrap().message, "entry 199");
    }

    #[test]
    fn test_json_shape() {
        let mut op = MiningOperation::new("test-chain", Some(7));
        op.advance(OperationState::InstructionReceived, 1);
        op.merkle_proof = Some(Bytes(vec![0xab, 0xcd]));

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["state"], "INSTRUCTION_RECEIVED");
        assert_eq!(json["merkle_proof"], "abcd");
        assert_eq!(json["stage_attempts"]["INSTRUCTION_RECEIVED"], 1);

        let back: MiningOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
