//! Automine rule engine: decides which new heights to endorse.
//!
//! Heights are classified into rounds by their position in a 20-block
//! keystone interval. A round is mined only when its flag is set.

use crate::{ConfigHandle, MiningResult, OperationId};
use pop_chain::ChainEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Blocks per keystone interval.
pub const KEYSTONE_INTERVAL: u64 = 20;

/// Round of a height within its keystone interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Round {
    Round1,
    Round2,
    Round3,
    Keystone,
}

impl Round {
    /// Classify `height`. Multiples of the keystone interval are keystones;
    /// other heights cycle through rounds 1, 2, 3 by their offset mod 3.
    pub fn of(height: u64) -> Round {
        let offset = height % KEYSTONE_INTERVAL;
        if offset == 0 {
            return Round::Keystone;
        }
        match offset % 3 {
            1 => Round::Round1,
            2 => Round::Round2,
            _ => Round::Round3,
        }
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Round::Round1 => f.write_str("round 1"),
            Round::Round2 => f.write_str("round 2"),
            Round::Round3 => f.write_str("round 3"),
            Round::Keystone => f.write_str("keystone"),
        }
    }
}

/// Which rounds to mine, and for which chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoMineConfig {
    pub chain_id: String,
    pub round1: bool,
    pub round2: bool,
    pub round3: bool,
    pub keystone: bool,
}

impl AutoMineConfig {
    pub fn is_enabled(&self, round: Round) -> bool {
        match round {
            Round::Round1 => self.round1,
            Round::Round2 => self.round2,
            Round::Round3 => self.round3,
            Round::Keystone => self.keystone,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.round1 || self.round2 || self.round3 || self.keystone
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chain_id.trim().is_empty() {
            return Err("automine chain_id must not be empty".into());
        }
        Ok(())
    }
}

/// Starts a mining operation at a height.
pub trait MineTrigger: Send + Sync {
    fn mine(&self, chain_id: &str, height: u64) -> MiningResult<OperationId>;
}

/// Heights that became new best-chain heights with `event`.
///
/// A new best block covers every height after the previous tip; a reorg
/// covers the heights above the old tip. Empty when the new tip is not
/// higher than the old one.
pub fn new_heights(event: &ChainEvent) -> Option<RangeInclusive<u64>> {
    let (start, end) = match event {
        ChainEvent::NewBestBlock { previous, latest } => (
            previous.as_ref().map_or(latest.height, |p| p.height + 1),
            latest.height,
        ),
        ChainEvent::Reorg { removed, added } => {
            let (Some(old_tip), Some(new_tip)) = (removed.last(), added.last()) else {
                return None;
            };
            (old_tip.height + 1, new_tip.height)
        }
    };
    (start <= end).then_some(start..=end)
}

/// Applies the automine rules to chain events.
pub struct AutoMiner {
    config: ConfigHandle<AutoMineConfig>,
    trigger: Arc<dyn MineTrigger>,
}

impl AutoMiner {
    pub fn new(config: ConfigHandle<AutoMineConfig>, trigger: Arc<dyn MineTrigger>) -> Self {
        Self { config, trigger }
    }

    /// Evaluate one event; returns the heights an operation was started for.
    pub fn handle_event(&self, event: &ChainEvent) -> Vec<u64> {
        match new_heights(event) {
            Some(heights) => self.evaluate(heights),
            None => Vec::new(),
        }
    }

    /// Start operations for every enabled height in `heights`. A failed
    /// trigger is logged and does not stop the remaining heights.
    pub fn evaluate(&self, heights: RangeInclusive<u64>) -> Vec<u64> {
        // One snapshot for the whole evaluation.
        let config = self.config.load();
        if !config.any_enabled() {
            return Vec::new();
        }
        if let Err(e) = config.validate() {
            warn!(error = %e, "Skipping automine evaluation");
            return Vec::new();
        }

        let mut triggered = Vec::new();
        for height in heights {
            let round = Round::of(height);
            if !config.is_enabled(round) {
                continue;
            }
            match self.trigger.mine(&config.chain_id, height) {
                Ok(id) => {
                    info!(%id, height, %round, chain = %config.chain_id, "Automine started operation");
                    triggered.push(height);
                }
                Err(e) => warn!(height, %round, error = %e, "Automine could not start operation"),
            }
        }
        triggered
    }

    /// Evaluate events in arrival order until the channel closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ChainEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(&event);
        }
        debug!("Automine event loop stopped");
    }
}
