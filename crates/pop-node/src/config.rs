//! Node configuration.

use anyhow::{bail, Context, Result};
use pop_chain::FollowerConfig;
use pop_mining::{AutoMineConfig, MiningConfig, StageTimeouts};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Followed chain.
    #[serde(default)]
    pub chain: ChainSettings,
    /// Operation pipeline settings.
    #[serde(default)]
    pub mining: MiningSettings,
    /// One entry per chain mined automatically.
    #[serde(default)]
    pub automine: Vec<AutoMineConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chain: ChainSettings::default(),
            mining: MiningSettings::default(),
            automine: Vec::new(),
        }
    }
}

/// Followed chain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// Serialized checkpoint header, hex.
    pub checkpoint_header: String,
    /// Serialized size of every header.
    pub header_size: usize,
    /// Seconds between header source polls.
    pub poll_interval_secs: u64,
    /// Headers requested per round trip.
    pub batch_size: usize,
    /// How far back missing parents are fetched.
    pub max_orphan_depth: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        let follower = FollowerConfig::default();
        Self {
            checkpoint_header: String::new(),
            header_size: 80,
            poll_interval_secs: follower.poll_interval.as_secs(),
            batch_size: follower.batch_size,
            max_orphan_depth: follower.max_orphan_depth,
        }
    }
}

impl ChainSettings {
    /// Decoded checkpoint header.
    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>> {
        if self.checkpoint_header.is_empty() {
            bail!("chain.checkpoint_header is not set");
        }
        let bytes = hex::decode(&self.checkpoint_header).context("chain.checkpoint_header is not hex")?;
        if bytes.len() != self.header_size {
            bail!(
                "chain.checkpoint_header is {} bytes, header_size is {}",
                bytes.len(),
                self.header_size
            );
        }
        Ok(bytes)
    }

    pub fn follower_config(&self) -> FollowerConfig {
        FollowerConfig {
            batch_size: self.batch_size,
            max_orphan_depth: self.max_orphan_depth,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

/// Operation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSettings {
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * n * 10` units.
    pub backoff_unit_ms: u64,
    pub required_confirmations: u32,
    pub confirmation_poll_ms: u64,
    pub payout_poll_ms: u64,
    pub timeouts: TimeoutSettings,
}

impl Default for MiningSettings {
    fn default() -> Self {
        let defaults = MiningConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff_unit_ms: millis(defaults.backoff_unit),
            required_confirmations: defaults.required_confirmations,
            confirmation_poll_ms: millis(defaults.confirmation_poll),
            payout_poll_ms: millis(defaults.payout_poll),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl MiningSettings {
    pub fn to_mining_config(&self) -> MiningConfig {
        MiningConfig {
            max_attempts: self.max_attempts,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
            required_confirmations: self.required_confirmations,
            confirmation_poll: Duration::from_millis(self.confirmation_poll_ms),
            payout_poll: Duration::from_millis(self.payout_poll_ms),
            timeouts: self.timeouts.to_stage_timeouts(),
        }
    }
}

/// Per-stage attempt timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub instruction_secs: u64,
    pub endorsement_secs: u64,
    pub confirmation_secs: u64,
    pub block_of_proof_secs: u64,
    pub merkle_proof_secs: u64,
    pub proof_submission_secs: u64,
    pub payout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let t = StageTimeouts::default();
        Self {
            instruction_secs: t.instruction.as_secs(),
            endorsement_secs: t.endorsement.as_secs(),
            confirmation_secs: t.confirmation.as_secs(),
            block_of_proof_secs: t.block_of_proof.as_secs(),
            merkle_proof_secs: t.merkle_proof.as_secs(),
            proof_submission_secs: t.proof_submission.as_secs(),
            payout_secs: t.payout.as_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn to_stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            instruction: Duration::from_secs(self.instruction_secs),
            endorsement: Duration::from_secs(self.endorsement_secs),
            confirmation: Duration::from_secs(self.confirmation_secs),
            block_of_proof: Duration::from_secs(self.block_of_proof_secs),
            merkle_proof: Duration::from_secs(self.merkle_proof_secs),
            proof_submission: Duration::from_secs(self.proof_submission_secs),
            payout: Duration::from_secs(self.payout_secs),
        }
    }

    fn all(&self) -> [(&'static str, u64); 7] {
        [
            ("instruction_secs", self.instruction_secs),
            ("endorsement_secs", self.endorsement_secs),
            ("confirmation_secs", self.confirmation_secs),
            ("block_of_proof_secs", self.block_of_proof_secs),
            ("merkle_proof_secs", self.merkle_proof_secs),
            ("proof_submission_secs", self.proof_submission_secs),
            ("payout_secs", self.payout_secs),
        ]
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
}

impl NodeConfig {
    /// Load configuration from file (defaults when it does not exist) and
    /// apply command line overrides.
    pub fn load(config_path: &Path, overrides: &Overrides) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        if let Some(ref data_dir) = overrides.data_dir {
            config.data_dir = data_dir.clone();
        }

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Check values the types cannot express.
    ///
    /// The checkpoint is only required by [`Node`](crate::Node); inspection
    /// commands run without one.
    pub fn validate(&self) -> Result<()> {
        if self.chain.header_size == 0 {
            bail!("chain.header_size must be positive");
        }
        if self.chain.batch_size == 0 {
            bail!("chain.batch_size must be positive");
        }
        if self.chain.poll_interval_secs == 0 {
            bail!("chain.poll_interval_secs must be positive");
        }
        if !self.chain.checkpoint_header.is_empty() {
            self.chain.checkpoint_bytes()?;
        }

        for (name, secs) in self.mining.timeouts.all() {
            if secs == 0 {
                bail!("mining.timeouts.{name} must be positive");
            }
        }
        self.mining
            .to_mining_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("mining: {e}"))?;

        let mut seen = HashSet::new();
        for (i, rule) in self.automine.iter().enumerate() {
            rule.validate().map_err(|e| anyhow::anyhow!("automine[{i}]: {e}"))?;
            if !seen.insert(rule.chain_id.as_str()) {
                bail!("automine[{i}]: chain '{}' configured twice", rule.chain_id);
            }
        }
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Where the database lives.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.mining.max_attempts, 10);
        assert_eq!(config.mining.backoff_unit_ms, 1000);
        assert!(config.automine.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let config = NodeConfig::from_toml(
            r#"
            data_dir = "/var/lib/pop"

            [chain]
            checkpoint_header = "00010203"
            header_size = 4
            poll_interval_secs = 2

            [mining]
            max_attempts = 5
            backoff_unit_ms = 250

            [mining.timeouts]
            payout_secs = 60

            [[automine]]
            chain_id = "alt"
            keystone = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pop"));
        assert_eq!(config.chain.checkpoint_bytes().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(config.chain.batch_size, 500);

        let mining = config.mining.to_mining_config();
        assert_eq!(mining.max_attempts, 5);
        assert_eq!(mining.backoff_unit, Duration::from_millis(250));
        assert_eq!(mining.timeouts.payout, Duration::from_secs(60));
        assert_eq!(mining.timeouts.instruction, StageTimeouts::default().instruction);

        assert_eq!(config.automine.len(), 1);
        assert!(config.automine[0].keystone && !config.automine[0].round1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.chain.checkpoint_header = "zz".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.chain.header_size = 4;
        config.chain.checkpoint_header = "0001".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.mining.timeouts.payout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.automine.push(AutoMineConfig::default());
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        let rule = AutoMineConfig {
            chain_id: "alt".into(),
            keystone: true,
            ..Default::default()
        };
        config.automine = vec![rule.clone(), rule];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_applies_overrides_and_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pop-node.toml");

        let missing = NodeConfig::load(&path, &Overrides::default()).unwrap();
        assert_eq!(missing, NodeConfig::default());

        let mut config = NodeConfig::default();
        config.mining.required_confirmations = 3;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(
            &path,
            &Overrides {
                data_dir: Some(tmp.path().join("elsewhere")),
            },
        )
        .unwrap();
        assert_eq!(loaded.mining.required_confirmations, 3);
        assert_eq!(loaded.data_dir, tmp.path().join("elsewhere"));
    }
}
