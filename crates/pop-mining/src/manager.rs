//! Operation manager: creates, runs, cancels and reorg-adjusts operations.

use crate::{
    ChainAdapter, ConfigHandle, MineTrigger, MiningConfig, MiningError, MiningOperation,
    MiningResult, OperationId, OperationRepository, OperationState, Pipeline, PipelineOutcome,
    RetryPolicy, TaskEngine,
};
use parking_lot::{Mutex, RwLock};
use pop_chain::{ChainEvent, Digest32, HeaderChain};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reason recorded when a user cancels an operation.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Fresh ids drawn before `mine` gives up on finding an unused one.
const ID_ATTEMPTS: usize = 16;

/// Counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub reorg_resubmissions: u64,
}

struct RunningOperation {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every operation pipeline in the process.
///
/// At most one pipeline runs per operation id. Every state change a pipeline
/// makes is persisted before it is acted upon, so the repository is the
/// source of truth for queries.
pub struct OperationManager {
    this: Weak<OperationManager>,
    repository: Arc<dyn OperationRepository>,
    chain: Arc<HeaderChain>,
    adapters: RwLock<HashMap<String, Arc<dyn ChainAdapter>>>,
    config: ConfigHandle<MiningConfig>,
    running: Mutex<HashMap<OperationId, RunningOperation>>,
    /// Serializes id allocation with the first save.
    creating: Mutex<()>,
    next_generation: Mutex<u64>,
    stats: RwLock<MiningStats>,
    shutdown: CancellationToken,
}

impl OperationManager {
    pub fn new(
        repository: Arc<dyn OperationRepository>,
        chain: Arc<HeaderChain>,
        config: ConfigHandle<MiningConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            repository,
            chain,
            adapters: RwLock::new(HashMap::new()),
            config,
            running: Mutex::new(HashMap::new()),
            creating: Mutex::new(()),
            next_generation: Mutex::new(0),
            stats: RwLock::new(MiningStats::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the adapter serving `adapter.chain_id()`.
    pub fn register_adapter(&self, adapter: Arc<dyn ChainAdapter>) {
        let chain_id = adapter.chain_id().to_string();
        info!(chain = %chain_id, "Registered chain adapter");
        self.adapters.write().insert(chain_id, adapter);
    }

    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a new operation endorsing `height` (or the chain's tip).
    pub fn mine(&self, chain_id: &str, height: Option<u64>) -> MiningResult<OperationId> {
        if !self.adapters.read().contains_key(chain_id) {
            return Err(MiningError::UnknownChain(chain_id.to_string()));
        }

        let mut operation = MiningOperation::new(chain_id, height);
        {
            let _creating = self.creating.lock();
            operation.id = unused_id(self.repository.as_ref(), OperationId::generate)?;
            self.repository.save(&operation)?;
        }
        let id = operation.id.clone();
        info!(%id, chain = chain_id, ?height, "Created mining operation");

        self.spawn(operation)?;
        Ok(id)
    }

    /// Spawn a pipeline for every persisted non-terminal operation.
    /// Returns how many were resumed.
    pub fn resume_active(&self) -> MiningResult<usize> {
        let mut resumed = 0;
        for operation in self.repository.list_active()? {
            if self.is_running(&operation.id) {
                continue;
            }
            let id = operation.id.clone();
            let state = operation.state;
            match self.spawn(operation) {
                Ok(()) => {
                    info!(%id, %state, "Resumed mining operation");
                    resumed += 1;
                }
                Err(e) => warn!(%id, error = %e, "Could not resume mining operation"),
            }
        }
        Ok(resumed)
    }

    /// Stop the operation and mark it failed.
    pub async fn cancel(&self, id: &OperationId) -> MiningResult<MiningOperation> {
        self.stop(id).await;

        let mut operation = self
            .repository
            .load(id)?
            .ok_or_else(|| MiningError::OperationNotFound(id.clone()))?;
        if operation.is_terminal() {
            return Err(MiningError::InvalidState {
                id: id.clone(),
                state: operation.state.to_string(),
            });
        }

        operation.fail(CANCELLED_BY_USER);
        self.repository.save(&operation)?;
        self.stats.write().failed += 1;
        info!(%id, "Mining operation cancelled by user");
        Ok(operation)
    }

    /// Replace pipeline settings after validating them. Pipelines started
    /// afterwards, including resumed and reorg-restarted ones, use the new
    /// settings; running ones keep the snapshot they started with.
    pub fn reload_config(&self, config: MiningConfig) -> MiningResult<()> {
        config.validate().map_err(MiningError::Config)?;
        info!(
            max_attempts = config.max_attempts,
            backoff_unit_ms = config.backoff_unit.as_millis() as u64,
            "Mining settings reloaded"
        );
        self.config.store(config);
        Ok(())
    }

    /// Settings new pipelines start with.
    pub fn config(&self) -> Arc<MiningConfig> {
        self.config.load()
    }

    pub fn get(&self, id: &OperationId) -> MiningResult<Option<MiningOperation>> {
        self.repository.load(id)
    }

    /// Persisted operations, oldest first; terminal ones only when asked.
    pub fn list(&self, include_terminal: bool) -> MiningResult<Vec<MiningOperation>> {
        if include_terminal {
            self.repository.list_all()
        } else {
            self.repository.list_active()
        }
    }

    pub fn is_running(&self, id: &OperationId) -> bool {
        self.running.lock().contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn stats(&self) -> MiningStats {
        self.stats.read().clone()
    }

    /// React to a tracker event.
    ///
    /// On a reorg, operations whose endorsement was confirmed in a removed
    /// block, and which have not yet submitted their proof, go back to
    /// `EndorsementSubmitted` and are restarted.
    pub async fn handle_chain_event(&self, event: &ChainEvent) -> MiningResult<()> {
        let ChainEvent::Reorg { removed, added } = event else {
            return Ok(());
        };

        let removed: HashSet<Digest32> = removed.iter().map(|h| h.hash).collect();
        debug!(removed = removed.len(), added = added.len(), "Checking operations against reorg");

        for operation in self.repository.list_active()? {
            if !affected_by_reorg(&operation, &removed) {
                continue;
            }
            let id = operation.id.clone();

            // Let the pipeline stop before touching the record it writes.
            self.stop(&id).await;
            let Some(mut operation) = self.repository.load(&id)? else {
                continue;
            };
            if !affected_by_reorg(&operation, &removed) {
                continue;
            }

            let block = operation
                .endorsement_block_hash
                .map(|h| h.to_hex())
                .unwrap_or_default();
            operation.roll_back(
                OperationState::EndorsementSubmitted,
                &format!("endorsement block {block} left the best chain"),
            );
            self.repository.save(&operation)?;
            self.stats.write().reorg_resubmissions += 1;
            info!(%id, %block, "Endorsement reorganized away, resubmitting operation");

            self.spawn(operation)?;
        }
        Ok(())
    }

    /// Process tracker events in arrival order until the channel closes or
    /// the manager shuts down.
    pub async fn run_chain_events(&self, mut events: mpsc::UnboundedReceiver<ChainEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = self.handle_chain_event(&event).await {
                error!(error = %e, "Failed to apply chain event to operations");
            }
        }
        debug!("Operation manager event loop stopped");
    }

    /// Cancel every running pipeline and wait for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let running: Vec<_> = self.running.lock().drain().map(|(_, r)| r).collect();
        for r in running {
            r.cancel.cancel();
            let _ = r.handle.await;
        }
        info!("Operation manager stopped");
    }

    fn spawn(&self, operation: MiningOperation) -> MiningResult<()> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| MiningError::Config("operation manager dropped".into()))?;
        let adapter = self
            .adapters
            .read()
            .get(&operation.chain_id)
            .cloned()
            .ok_or_else(|| MiningError::UnknownChain(operation.chain_id.clone()))?;

        let config = self.config.load();
        let engine = TaskEngine::new(
            Arc::clone(&self.repository),
            RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_unit: config.backoff_unit,
            },
        );
        let pipeline = Pipeline::new(engine, adapter, Arc::clone(&self.chain), config);

        let mut running = self.running.lock();
        if running.contains_key(&operation.id) {
            return Err(MiningError::AlreadyRunning(operation.id));
        }

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let id = operation.id.clone();
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut operation = operation;
            let outcome = pipeline.run(&mut operation, &token).await;
            this.finished(&operation.id, generation, outcome);
        });

        running.insert(
            id,
            RunningOperation {
                generation,
                cancel,
                handle,
            },
        );
        self.stats.write().started += 1;
        Ok(())
    }

    fn finished(&self, id: &OperationId, generation: u64, outcome: PipelineOutcome) {
        {
            let mut running = self.running.lock();
            if running.get(id).map(|r| r.generation) == Some(generation) {
                running.remove(id);
            }
        }

        match outcome {
            PipelineOutcome::Completed => self.stats.write().completed += 1,
            PipelineOutcome::Failed(reason) => {
                self.stats.write().failed += 1;
                warn!(%id, %reason, "Mining operation failed");
            }
            PipelineOutcome::NotPersisted(reason) => {
                self.stats.write().failed += 1;
                error!(%id, %reason, "Mining operation failed but its record still shows it active");
            }
            PipelineOutcome::Cancelled => {}
        }
    }

    /// Cancel the running pipeline for `id`, if any, and wait for it.
    async fn stop(&self, id: &OperationId) {
        let entry = self.running.lock().remove(id);
        if let Some(r) = entry {
            r.cancel.cancel();
            if let Err(e) = r.handle.await {
                error!(%id, error = %e, "Operation task ended abnormally");
            }
        }
    }
}

impl MineTrigger for OperationManager {
    fn mine(&self, chain_id: &str, height: u64) -> MiningResult<OperationId> {
        OperationManager::mine(self, chain_id, Some(height))
    }
}

/// Draw ids from `generate` until one is not in `repository`.
fn unused_id(
    repository: &dyn OperationRepository,
    mut generate: impl FnMut() -> OperationId,
) -> MiningResult<OperationId> {
    for _ in 0..ID_ATTEMPTS {
        let id = generate();
        if repository.load(&id)?.is_none() {
            return Ok(id);
        }
        debug!(%id, "Operation id already taken");
    }
    Err(MiningError::IdsExhausted(ID_ATTEMPTS))
}

fn affected_by_reorg(operation: &MiningOperation, removed: &HashSet<Digest32>) -> bool {
    operation.state >= OperationState::EndorsementConfirmed
        && operation.state < OperationState::ProofSubmitted
        && operation
            .endorsement_block_hash
            .map_or(false, |h| removed.contains(&h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationStore;
    use pop_storage::MemoryStorage;

    fn store_with(ids: &[&str]) -> OperationStore {
        let store = OperationStore::new(Arc::new(MemoryStorage::new()));
        for id in ids {
            let mut op = MiningOperation::new("test-chain", Some(1));
            op.id = OperationId::from(*id);
            op.fail("done");
            store.save(&op).unwrap();
        }
        store
    }

    #[test]
    fn test_taken_ids_are_skipped() {
        let store = store_with(&["0000aaaa", "0000bbbb"]);
        let mut draws = ["0000aaaa", "0000bbbb", "0000cccc"].into_iter();

        let id = unused_id(&store, || OperationId::from(draws.next().unwrap())).unwrap();

        assert_eq!(id, OperationId::from("0000cccc"));
        // The finished record is untouched.
        let kept = store.load(&OperationId::from("0000aaaa")).unwrap().unwrap();
        assert_eq!(kept.state, OperationState::Failed);
    }

    #[test]
    fn test_gives_up_when_every_draw_is_taken() {
        let store = store_with(&["0000aaaa"]);
        let mut draws = 0;

        let result = unused_id(&store, || {
            draws += 1;
            OperationId::from("0000aaaa")
        });

        assert!(matches!(result, Err(MiningError::IdsExhausted(n)) if n == ID_ATTEMPTS));
        assert_eq!(draws, ID_ATTEMPTS);
    }
}
