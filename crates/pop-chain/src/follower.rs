//! Header follower: pulls headers from a trusted source into the tracker.

use crate::{ChainError, ChainResult, Digest32, HeaderChain, IngestOutcome, RejectReason};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Trusted supplier of serialized headers (full node, explorer, ...).
///
/// Errors are plain strings; the transport owns their meaning.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Height of the source's best header.
    async fn best_height(&self) -> Result<u64, String>;

    /// Up to `max` best-chain headers following the first locator hash the
    /// source knows, in ascending height order.
    async fn headers_after(&self, locator: &[Digest32], max: usize)
        -> Result<Vec<Vec<u8>>, String>;

    /// A single header by hash.
    async fn header_by_hash(&self, hash: &Digest32) -> Result<Option<Vec<u8>>, String>;
}

/// Follower configuration.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Headers requested per round trip.
    pub batch_size: usize,
    /// How far back missing parents are fetched before giving up.
    pub max_orphan_depth: usize,
    /// Delay between polls once caught up.
    pub poll_interval: Duration,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_orphan_depth: 100,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one sync round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub tip_height: u64,
    /// Best height the source reported when the round started.
    pub source_height: u64,
}

impl SyncReport {
    /// Headers the source claimed to have beyond our tip at the end of the
    /// round.
    pub fn lag(&self) -> u64 {
        self.source_height.saturating_sub(self.tip_height)
    }
}

/// Polls a [`HeaderSource`] and feeds the [`HeaderChain`].
pub struct HeaderFollower {
    chain: Arc<HeaderChain>,
    source: Arc<dyn HeaderSource>,
    config: FollowerConfig,
}

impl HeaderFollower {
    pub fn new(chain: Arc<HeaderChain>, source: Arc<dyn HeaderSource>, config: FollowerConfig) -> Self {
        Self {
            chain,
            source,
            config,
        }
    }

    /// Fetch and ingest everything the source has beyond our locator,
    /// one batch at a time, until a batch comes back empty.
    pub async fn sync_once(&self) -> ChainResult<SyncReport> {
        let mut report = SyncReport {
            source_height: self.source.best_height().await.map_err(ChainError::Source)?,
            ..Default::default()
        };

        loop {
            let locator = self.chain.locator();
            let batch = self
                .source
                .headers_after(&locator, self.config.batch_size)
                .await
                .map_err(ChainError::Source)?;

            let mut progressed = false;
            for raw in batch {
                if self.ingest_with_ancestors(raw, &mut report).await? {
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }

        report.tip_height = self.chain.best_height();
        if report.lag() > 0 {
            debug!(
                tip_height = report.tip_height,
                source_height = report.source_height,
                "Source reports headers beyond our tip"
            );
        }
        Ok(report)
    }

    /// Ingest a header, first pulling any unknown ancestors from the source.
    /// Returns whether anything new was accepted.
    async fn ingest_with_ancestors(&self, raw: Vec<u8>, report: &mut SyncReport) -> ChainResult<bool> {
        let missing = match self.chain.ingest(&raw)? {
            IngestOutcome::Accepted(_) => {
                report.accepted += 1;
                return Ok(true);
            }
            IngestOutcome::Duplicate => {
                report.duplicates += 1;
                return Ok(false);
            }
            IngestOutcome::Rejected(RejectReason::Orphan { previous }) => previous,
            IngestOutcome::Rejected(reason) => {
                return Err(ChainError::Rejected {
                    hash: describe(&self.chain, &raw),
                    reason,
                })
            }
        };

        debug!(%missing, "Fetching missing ancestors");
        let mut pending = vec![raw];
        let mut cursor = missing;
        let mut resolved = false;

        for _ in 0..self.config.max_orphan_depth {
            let parent = self
                .source
                .header_by_hash(&cursor)
                .await
                .map_err(ChainError::Source)?
                .ok_or_else(|| ChainError::Source(format!("source does not know header {cursor}")))?;
            let fields = self.chain.codec().decode(&parent).map_err(|reason| ChainError::Rejected {
                hash: cursor.to_hex(),
                reason: RejectReason::Malformed(reason),
            })?;
            pending.push(parent);

            if self.chain.contains(&fields.previous_hash) {
                resolved = true;
                break;
            }
            cursor = fields.previous_hash;
        }

        if !resolved {
            return Err(ChainError::Source(format!(
                "no known ancestor within {} headers of {missing}",
                self.config.max_orphan_depth
            )));
        }

        for raw in pending.into_iter().rev() {
            match self.chain.ingest(&raw)? {
                IngestOutcome::Accepted(_) => report.accepted += 1,
                IngestOutcome::Duplicate => report.duplicates += 1,
                IngestOutcome::Rejected(reason) => {
                    return Err(ChainError::Rejected {
                        hash: describe(&self.chain, &raw),
                        reason,
                    })
                }
            }
        }
        Ok(true)
    }

    /// Poll the source until `cancel` fires. Failed rounds are logged and
    /// retried at the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Header follower started"
        );

        loop {
            match self.sync_once().await {
                Ok(report) if report.accepted > 0 => {
                    info!(
                        accepted = report.accepted,
                        tip_height = report.tip_height,
                        source_height = report.source_height,
                        "Headers synced"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Header sync round failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Header follower stopped");
    }
}

fn describe(chain: &HeaderChain, raw: &[u8]) -> String {
    chain
        .codec()
        .decode(raw)
        .map(|f| f.hash.to_hex())
        .unwrap_or_else(|_| "<undecodable>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HeaderBuilder, TestCodec};
    use crate::{EventBus, HeaderCodec};
    use parking_lot::Mutex;
    use pop_storage::MemoryStorage;

    /// Source serving a fixed best chain.
    struct ScriptedSource {
        chain: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedSource {
        fn hashes(&self) -> Vec<Digest32> {
            self.chain
                .lock()
                .iter()
                .map(|raw| TestCodec.decode(raw).unwrap().hash)
                .collect()
        }
    }

    #[async_trait]
    impl HeaderSource for ScriptedSource {
        async fn best_height(&self) -> Result<u64, String> {
            Ok(self.chain.lock().len() as u64)
        }

        async fn headers_after(
            &self,
            locator: &[Digest32],
            max: usize,
        ) -> Result<Vec<Vec<u8>>, String> {
            let hashes = self.hashes();
            let start = locator
                .iter()
                .find_map(|l| hashes.iter().position(|h| h == l))
                .map(|p| p + 1)
                .unwrap_or(0);
            Ok(self.chain.lock().iter().skip(start).take(max).cloned().collect())
        }

        async fn header_by_hash(&self, hash: &Digest32) -> Result<Option<Vec<u8>>, String> {
            let hashes = self.hashes();
            Ok(hashes
                .iter()
                .position(|h| h == hash)
                .map(|p| self.chain.lock()[p].clone()))
        }
    }

    fn setup(length: u64) -> (Arc<HeaderChain>, Arc<ScriptedSource>) {
        let mut builder = HeaderBuilder::new();
        let checkpoint = builder.checkpoint();
        let chain = Arc::new(
            HeaderChain::open(
                Arc::new(MemoryStorage::new()),
                Arc::new(TestCodec),
                &checkpoint,
                EventBus::new(),
            )
            .unwrap(),
        );

        let mut parent = chain.tip().hash;
        let mut headers = Vec::new();
        for height in 1..=length {
            let raw = builder.child(&parent, height, 10);
            parent = TestCodec.decode(&raw).unwrap().hash;
            headers.push(raw);
        }
        let source = Arc::new(ScriptedSource {
            chain: Mutex::new(headers),
        });
        (chain, source)
    }

    #[tokio::test]
    async fn test_sync_once_catches_up_in_batches() {
        let (chain, source) = setup(25);
        let follower = HeaderFollower::new(
            Arc::clone(&chain),
            source,
            FollowerConfig {
                batch_size: 10,
                ..Default::default()
            },
        );

        let report = follower.sync_once().await.unwrap();
        assert_eq!(report.accepted, 25);
        assert_eq!(report.tip_height, 25);
        assert_eq!(report.source_height, 25);
        assert_eq!(report.lag(), 0);
        assert_eq!(chain.best_height(), 25);

        let again = follower.sync_once().await.unwrap();
        assert_eq!(again.accepted, 0);
    }

    #[tokio::test]
    async fn test_report_shows_lag_behind_source() {
        let (chain, source) = setup(5);
        let follower = HeaderFollower::new(Arc::clone(&chain), source.clone(), FollowerConfig::default());
        follower.sync_once().await.unwrap();

        // The source announces a height it cannot serve yet.
        struct Ahead(Arc<ScriptedSource>);

        #[async_trait]
        impl HeaderSource for Ahead {
            async fn best_height(&self) -> Result<u64, String> {
                Ok(self.0.best_height().await? + 3)
            }
            async fn headers_after(&self, locator: &[Digest32], max: usize) -> Result<Vec<Vec<u8>>, String> {
                self.0.headers_after(locator, max).await
            }
            async fn header_by_hash(&self, hash: &Digest32) -> Result<Option<Vec<u8>>, String> {
                self.0.header_by_hash(hash).await
            }
        }

        let follower = HeaderFollower::new(Arc::clone(&chain), Arc::new(Ahead(source)), FollowerConfig::default());
        let report = follower.sync_once().await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.source_height, 8);
        assert_eq!(report.lag(), 3);
    }

    #[tokio::test]
    async fn test_orphan_pulls_missing_ancestors() {
        let (chain, source) = setup(6);
        // Hand the tracker only the last header; its parents must be fetched.
        let last = source.chain.lock().last().unwrap().clone();
        let follower = HeaderFollower::new(Arc::clone(&chain), source, FollowerConfig::default());

        let mut report = SyncReport::default();
        assert!(follower.ingest_with_ancestors(last, &mut report).await.unwrap());
        assert_eq!(report.accepted, 6);
        assert_eq!(chain.best_height(), 6);
    }

    #[tokio::test]
    async fn test_orphan_depth_limit() {
        let (chain, source) = setup(6);
        let last = source.chain.lock().last().unwrap().clone();
        let follower = HeaderFollower::new(
            Arc::clone(&chain),
            source,
            FollowerConfig {
                max_orphan_depth: 2,
                ..Default::default()
            },
        );

        let mut report = SyncReport::default();
        let result = follower.ingest_with_ancestors(last, &mut report).await;
        assert!(matches!(result, Err(ChainError::Source(_))));
        assert_eq!(chain.best_height(), 0);
    }
}
