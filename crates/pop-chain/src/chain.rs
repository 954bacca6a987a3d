//! Best-chain tracking.
//!
//! Tracks every ingested header, selects the tip with the most cumulative
//! work and reports tip switches as [`ChainEvent`]s.

use crate::columns::{BEST_HEADER_KEY, BEST_HEIGHT_KEY, CHECKPOINT_KEY, HEADERS, METADATA};
use crate::{
    record, ChainError, ChainEvent, ChainResult, Digest32, EventBus, HeaderCodec, StoredHeader,
};
use num_bigint::BigUint;
use parking_lot::RwLock;
use pop_storage::{Storage, WriteBatch};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Why a header was refused. Rejections never mutate the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The raw bytes could not be decoded.
    Malformed(String),
    /// The parent header is unknown; ingest ancestors first.
    Orphan { previous: Digest32 },
    /// The height does not follow the parent's height.
    InvalidHeight { expected: u64, actual: u64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed(reason) => write!(f, "malformed header: {reason}"),
            RejectReason::Orphan { previous } => write!(f, "unknown previous header {previous}"),
            RejectReason::InvalidHeight { expected, actual } => {
                write!(f, "height {actual} does not follow parent (expected {expected})")
            }
        }
    }
}

/// Summary of an accepted header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedHeader {
    pub hash: Digest32,
    pub height: u64,
    /// Whether the header became the new tip.
    pub new_tip: bool,
}

/// Result of [`HeaderChain::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Header stored; it may or may not have become the tip.
    Accepted(AcceptedHeader),
    /// Header already known; nothing changed.
    Duplicate,
    /// Header refused; nothing changed.
    Rejected(RejectReason),
}

/// In-memory view of the header tree.
struct ChainIndex {
    headers: HashMap<Digest32, StoredHeader>,
    /// Best chain hashes, `best_chain[i]` is at height `base_height + i`.
    best_chain: Vec<Digest32>,
    base_height: u64,
    tip: Digest32,
    checkpoint: Digest32,
}

impl ChainIndex {
    fn get(&self, hash: &Digest32) -> ChainResult<&StoredHeader> {
        self.headers
            .get(hash)
            .ok_or(ChainError::HeaderNotFound(*hash))
    }

    fn tip(&self) -> ChainResult<&StoredHeader> {
        self.get(&self.tip)
    }

    fn best_hash_at(&self, height: u64) -> Option<&Digest32> {
        let offset = height.checked_sub(self.base_height)?;
        self.best_chain.get(usize::try_from(offset).ok()?)
    }

    /// Walk back from both headers to their common ancestor.
    ///
    /// Returns `(removed, added)`, each ordered from the fork point outward
    /// and excluding the fork point.
    fn fork_branches(
        &self,
        old_tip: &Digest32,
        new_tip: &Digest32,
    ) -> ChainResult<(Vec<StoredHeader>, Vec<StoredHeader>)> {
        let mut old = self.get(old_tip)?;
        let mut new = self.get(new_tip)?;
        let mut removed = Vec::new();
        let mut added = Vec::new();

        while new.height > old.height {
            added.push(new.clone());
            new = self.get(&new.previous_hash)?;
        }
        while old.height > new.height {
            removed.push(old.clone());
            old = self.get(&old.previous_hash)?;
        }
        while old.hash != new.hash {
            if old.hash == self.checkpoint || new.hash == self.checkpoint {
                return Err(ChainError::Corrupted(format!(
                    "no common ancestor between {old_tip} and {new_tip}"
                )));
            }
            removed.push(old.clone());
            added.push(new.clone());
            old = self.get(&old.previous_hash)?;
            new = self.get(&new.previous_hash)?;
        }

        removed.reverse();
        added.reverse();
        Ok((removed, added))
    }

    /// Rebuild the best-chain height index from the tip down to the checkpoint.
    fn rebuild_best_chain(&mut self) -> ChainResult<()> {
        let mut chain = Vec::new();
        let mut cursor = self.tip()?;
        loop {
            chain.push(cursor.hash);
            if cursor.hash == self.checkpoint {
                break;
            }
            cursor = self.get(&cursor.previous_hash)?;
        }
        chain.reverse();
        self.best_chain = chain;
        Ok(())
    }
}

/// Best tip as persisted, readable without a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipSummary {
    pub hash: Digest32,
    pub height: u64,
    pub cumulative_work: BigUint,
    pub proof_reference: Digest32,
    pub checkpoint: Digest32,
}

/// Header chain tracker.
///
/// All mutation goes through [`ingest`](Self::ingest) (and the narrow
/// [`set_proof_reference`](Self::set_proof_reference)) under one write lock;
/// queries take the read lock and may run concurrently.
pub struct HeaderChain {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn HeaderCodec>,
    index: RwLock<ChainIndex>,
    events: EventBus<ChainEvent>,
}

impl HeaderChain {
    /// Open the tracker over `storage`.
    ///
    /// An empty store is seeded with the checkpoint header. A populated store
    /// must have been seeded with the same checkpoint.
    pub fn open(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn HeaderCodec>,
        checkpoint_raw: &[u8],
        events: EventBus<ChainEvent>,
    ) -> ChainResult<Self> {
        let header_size = codec.header_size();
        if checkpoint_raw.len() != header_size {
            return Err(ChainError::InvalidCheckpoint(format!(
                "checkpoint is {} bytes, expected {header_size}",
                checkpoint_raw.len()
            )));
        }
        let fields = codec
            .decode(checkpoint_raw)
            .map_err(ChainError::InvalidCheckpoint)?;
        let checkpoint = fields.hash;

        match storage.get(METADATA, CHECKPOINT_KEY)? {
            Some(bytes) => {
                let stored = Digest32::from_slice(&bytes)
                    .ok_or_else(|| ChainError::Corrupted("bad checkpoint key".into()))?;
                if stored != checkpoint {
                    return Err(ChainError::CheckpointMismatch {
                        stored,
                        configured: checkpoint,
                    });
                }
            }
            None => {
                let work = fields.work.clone();
                let header = StoredHeader::new(fields, work, checkpoint_raw.to_vec());
                let mut batch = WriteBatch::new();
                batch
                    .put(HEADERS, checkpoint.0, record::encode(&header, header_size)?)
                    .put(METADATA, CHECKPOINT_KEY, checkpoint.0)
                    .put(METADATA, BEST_HEADER_KEY, checkpoint.0)
                    .put(METADATA, BEST_HEIGHT_KEY, header.height.to_be_bytes());
                storage.write_batch(batch)?;
                info!(height = header.height, %checkpoint, "Seeded header store with checkpoint");
            }
        }

        let mut headers = HashMap::new();
        for (key, value) in storage.iter(HEADERS)? {
            let rec = record::decode(&value, header_size)?;
            let fields = codec.decode(&rec.raw).map_err(|e| {
                ChainError::Corrupted(format!("stored header {} undecodable: {e}", rec.hash))
            })?;
            if fields.hash != rec.hash || key != rec.hash.0 {
                return Err(ChainError::Corrupted(format!(
                    "record {} does not match its content hash",
                    rec.hash
                )));
            }
            let mut header = StoredHeader::new(fields, rec.cumulative_work, rec.raw);
            header.proof_reference = rec.proof_reference;
            headers.insert(header.hash, header);
        }

        let tip = storage
            .get(METADATA, BEST_HEADER_KEY)?
            .and_then(|bytes| Digest32::from_slice(&bytes))
            .ok_or_else(|| ChainError::Corrupted("best header key missing".into()))?;

        let base_height = headers
            .get(&checkpoint)
            .map(|h| h.height)
            .ok_or(ChainError::HeaderNotFound(checkpoint))?;

        let mut index = ChainIndex {
            headers,
            best_chain: Vec::new(),
            base_height,
            tip,
            checkpoint,
        };
        index.rebuild_best_chain()?;

        let chain = Self {
            storage,
            codec,
            index: RwLock::new(index),
            events,
        };

        info!(
            headers = chain.header_count(),
            best_height = chain.best_height(),
            best_work = %chain.best_cumulative_work(),
            "Header chain initialized from storage"
        );

        Ok(chain)
    }

    /// Read the persisted tip straight from `storage`, for inspecting a
    /// store without the chain's codec. `None` when nothing was seeded yet.
    pub fn read_tip(storage: &dyn Storage, header_size: usize) -> ChainResult<Option<TipSummary>> {
        let Some(hash) = storage.get(METADATA, BEST_HEADER_KEY)? else {
            return Ok(None);
        };
        let hash = Digest32::from_slice(&hash)
            .ok_or_else(|| ChainError::Corrupted("bad best header key".into()))?;
        let height = storage
            .get(METADATA, BEST_HEIGHT_KEY)?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| ChainError::Corrupted("best height key missing".into()))?;
        let checkpoint = storage
            .get(METADATA, CHECKPOINT_KEY)?
            .and_then(|bytes| Digest32::from_slice(&bytes))
            .ok_or_else(|| ChainError::Corrupted("checkpoint key missing".into()))?;
        let bytes = storage
            .get(HEADERS, &hash.0)?
            .ok_or(ChainError::HeaderNotFound(hash))?;
        let rec = record::decode(&bytes, header_size)?;

        Ok(Some(TipSummary {
            hash,
            height,
            cumulative_work: rec.cumulative_work,
            proof_reference: rec.proof_reference,
            checkpoint,
        }))
    }

    /// The codec used to decode headers of this chain.
    pub fn codec(&self) -> &Arc<dyn HeaderCodec> {
        &self.codec
    }

    /// The bus tip changes are published on.
    pub fn events(&self) -> &EventBus<ChainEvent> {
        &self.events
    }

    /// Ingest one serialized header.
    ///
    /// Storage is written before the in-memory index changes, so a failed
    /// write leaves the tracker untouched. Tip-change events are published
    /// before the write lock is released.
    #[instrument(skip(self, raw), fields(len = raw.len()))]
    pub fn ingest(&self, raw: &[u8]) -> ChainResult<IngestOutcome> {
        let header_size = self.codec.header_size();
        if raw.len() != header_size {
            return Ok(IngestOutcome::Rejected(RejectReason::Malformed(format!(
                "header is {} bytes, expected {header_size}",
                raw.len()
            ))));
        }
        let fields = match self.codec.decode(raw) {
            Ok(fields) => fields,
            Err(reason) => {
                debug!(%reason, "Malformed header rejected");
                return Ok(IngestOutcome::Rejected(RejectReason::Malformed(reason)));
            }
        };

        let mut index = self.index.write();

        if index.headers.contains_key(&fields.hash) {
            debug!(height = fields.height, hash = %fields.hash, "Header already known");
            return Ok(IngestOutcome::Duplicate);
        }

        let Some(parent) = index.headers.get(&fields.previous_hash) else {
            debug!(height = fields.height, previous = %fields.previous_hash, "Orphan header rejected");
            return Ok(IngestOutcome::Rejected(RejectReason::Orphan {
                previous: fields.previous_hash,
            }));
        };

        if fields.height != parent.height + 1 {
            return Ok(IngestOutcome::Rejected(RejectReason::InvalidHeight {
                expected: parent.height + 1,
                actual: fields.height,
            }));
        }

        let cumulative_work = &parent.cumulative_work + &fields.work;
        let header = StoredHeader::new(fields, cumulative_work, raw.to_vec());
        let hash = header.hash;
        let height = header.height;

        let previous_tip = index.tip;
        let new_tip = header.cumulative_work > index.tip()?.cumulative_work;

        let mut batch = WriteBatch::new();
        batch.put(HEADERS, hash.0, record::encode(&header, header_size)?);
        if new_tip {
            batch.put(METADATA, BEST_HEADER_KEY, hash.0);
            batch.put(METADATA, BEST_HEIGHT_KEY, height.to_be_bytes());
        }
        self.storage.write_batch(batch)?;

        index.headers.insert(hash, header);

        let event = if new_tip {
            let (removed, added) = index.fork_branches(&previous_tip, &hash)?;
            let fork_height = height - added.len() as u64;
            let keep = usize::try_from(fork_height - index.base_height + 1)
                .map_err(|_| ChainError::Corrupted("fork height out of range".into()))?;
            index.best_chain.truncate(keep);
            index.best_chain.extend(added.iter().map(|h| h.hash));
            index.tip = hash;

            let latest = index.tip()?.clone();
            if removed.is_empty() {
                info!(height, %hash, cumulative_work = %latest.cumulative_work, "New best header");
                let previous = index.headers.get(&previous_tip).cloned();
                Some(ChainEvent::NewBestBlock { previous, latest })
            } else {
                warn!(
                    height,
                    fork_height,
                    removed = removed.len(),
                    added = added.len(),
                    cumulative_work = %latest.cumulative_work,
                    "Chain reorganization due to higher cumulative work"
                );
                Some(ChainEvent::Reorg { removed, added })
            }
        } else {
            debug!(height, %hash, "Header on chain with less or equal work");
            None
        };

        // Published under the write lock so concurrent ingests emit in the
        // order their tip changes were applied. Unbounded sends never block.
        if let Some(event) = event {
            self.events.publish(event);
        }
        drop(index);

        Ok(IngestOutcome::Accepted(AcceptedHeader {
            hash,
            height,
            new_tip,
        }))
    }

    /// Record that a header carries proof for `reference`.
    ///
    /// Returns `false` when the header is unknown.
    pub fn set_proof_reference(&self, hash: &Digest32, reference: Digest32) -> ChainResult<bool> {
        let mut index = self.index.write();
        let Some(header) = index.headers.get(hash) else {
            return Ok(false);
        };
        let mut updated = header.clone();
        updated.proof_reference = reference;

        self.storage.put(
            HEADERS,
            &hash.0,
            &record::encode(&updated, self.codec.header_size())?,
        )?;
        index.headers.insert(*hash, updated);
        debug!(%hash, %reference, "Proof reference recorded");
        Ok(true)
    }

    /// Current best header.
    pub fn tip(&self) -> StoredHeader {
        let index = self.index.read();
        // The tip is always present: it is inserted before it is selected.
        index.headers[&index.tip].clone()
    }

    /// Height of the current best header.
    pub fn best_height(&self) -> u64 {
        let index = self.index.read();
        index.headers[&index.tip].height
    }

    /// Cumulative work of the current best header.
    pub fn best_cumulative_work(&self) -> BigUint {
        let index = self.index.read();
        index.headers[&index.tip].cumulative_work.clone()
    }

    /// Hash of the checkpoint the chain is rooted at.
    pub fn checkpoint(&self) -> Digest32 {
        self.index.read().checkpoint
    }

    /// Get a header by hash.
    pub fn get(&self, hash: &Digest32) -> Option<StoredHeader> {
        self.index.read().headers.get(hash).cloned()
    }

    /// Check if a header is known.
    pub fn contains(&self, hash: &Digest32) -> bool {
        self.index.read().headers.contains_key(hash)
    }

    /// Number of known headers, side branches included.
    pub fn header_count(&self) -> usize {
        self.index.read().headers.len()
    }

    /// Best-chain header at `height`.
    pub fn header_at(&self, height: u64) -> Option<StoredHeader> {
        let index = self.index.read();
        let hash = index.best_hash_at(height)?;
        index.headers.get(hash).cloned()
    }

    /// Whether `hash` is on the current best chain.
    pub fn is_on_best_chain(&self, hash: &Digest32) -> bool {
        let index = self.index.read();
        match index.headers.get(hash) {
            Some(header) => index.best_hash_at(header.height) == Some(hash),
            None => false,
        }
    }

    /// Exponentially spaced best-chain hashes from the tip back to the
    /// checkpoint, for asking a header source what we are missing.
    pub fn locator(&self) -> Vec<Digest32> {
        let index = self.index.read();
        let mut locator = Vec::new();
        let mut step = 1usize;
        let mut position = index.best_chain.len();

        while position > 0 {
            position -= 1;
            locator.push(index.best_chain[position]);
            if position == 0 {
                break;
            }
            if locator.len() > 10 {
                step *= 2;
            }
            position = position.saturating_sub(step - 1).max(1);
        }

        if locator.last() != Some(&index.checkpoint) {
            locator.push(index.checkpoint);
        }
        locator
    }
}
