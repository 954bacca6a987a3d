//! Node implementation.

use crate::config::{MiningSettings, NodeConfig};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use pop_chain::{ChainEvent, EventBus, HeaderChain, HeaderCodec, HeaderFollower, HeaderSource};
use pop_mining::{
    AutoMineConfig, AutoMiner, ChainAdapter, ConfigHandle, MineTrigger, OperationManager,
    OperationStore,
};
use pop_storage::{Database, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The main node struct coordinating all components.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,
    /// Storage database.
    storage: Arc<Database>,
    /// Header tracker.
    chain: Arc<HeaderChain>,
    /// Running and persisted mining operations.
    manager: Arc<OperationManager>,
    /// Automine rules by chain id.
    automine: HashMap<String, ConfigHandle<AutoMineConfig>>,
    /// Shutdown signal.
    shutdown: CancellationToken,
    /// Background event loops.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open the store and build every component.
    pub fn open(config: NodeConfig, codec: Arc<dyn HeaderCodec>) -> Result<Arc<Self>> {
        config.validate()?;
        if codec.header_size() != config.chain.header_size {
            anyhow::bail!(
                "codec header size {} does not match chain.header_size {}",
                codec.header_size(),
                config.chain.header_size
            );
        }
        let checkpoint = config.chain.checkpoint_bytes()?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;
        let db_path = config.db_path();
        info!("Opening database at {:?}", db_path);
        let storage = Arc::new(Database::open(&db_path)?);

        let chain = Arc::new(HeaderChain::open(
            Arc::clone(&storage) as Arc<dyn Storage>,
            codec,
            &checkpoint,
            EventBus::new(),
        )?);

        let repository = Arc::new(OperationStore::new(Arc::clone(&storage) as Arc<dyn Storage>));
        let manager = OperationManager::new(
            repository,
            Arc::clone(&chain),
            ConfigHandle::new(config.mining.to_mining_config()),
        );

        let automine = config
            .automine
            .iter()
            .map(|rule| (rule.chain_id.clone(), ConfigHandle::new(rule.clone())))
            .collect();

        Ok(Arc::new(Self {
            config,
            storage,
            chain,
            manager,
            automine,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<HeaderChain> {
        &self.chain
    }

    pub fn manager(&self) -> &Arc<OperationManager> {
        &self.manager
    }

    pub fn events(&self) -> &EventBus<ChainEvent> {
        self.chain.events()
    }

    /// Make `adapter.chain_id()` mineable.
    pub fn register_adapter(&self, adapter: Arc<dyn ChainAdapter>) {
        if !self.automine.contains_key(adapter.chain_id()) {
            info!(chain = adapter.chain_id(), "No automine rule for chain; manual mining only");
        }
        self.manager.register_adapter(adapter);
    }

    /// Replace automine rules. Rules take effect from the next evaluation;
    /// chains without a rule at startup need a restart.
    pub fn reload_automine(&self, rules: Vec<AutoMineConfig>) -> Result<()> {
        let mut seen = Vec::new();
        for rule in rules {
            rule.validate().map_err(anyhow::Error::msg)?;
            match self.automine.get(&rule.chain_id) {
                Some(handle) => {
                    seen.push(rule.chain_id.clone());
                    handle.store(rule);
                }
                None => warn!(chain = %rule.chain_id, "New automine rule ignored until restart"),
            }
        }
        for (chain_id, handle) in &self.automine {
            if !seen.contains(chain_id) {
                handle.store(AutoMineConfig {
                    chain_id: chain_id.clone(),
                    ..Default::default()
                });
            }
        }
        info!(rules = seen.len(), "Automine rules reloaded");
        Ok(())
    }

    /// Replace the pipeline settings. Operations started afterwards use them.
    pub fn reload_mining(&self, settings: &MiningSettings) -> Result<()> {
        self.manager
            .reload_config(settings.to_mining_config())
            .context("Invalid mining settings")
    }

    /// Start event consumers, resume persisted operations and follow
    /// `source` until shutdown.
    pub async fn run(self: &Arc<Self>, source: Arc<dyn HeaderSource>) -> Result<()> {
        // Subscribe before the follower can publish anything.
        let mut tasks = Vec::new();

        let manager = Arc::clone(&self.manager);
        let events = self.events().subscribe();
        tasks.push(tokio::spawn(async move {
            manager.run_chain_events(events).await;
        }));

        let trigger: Arc<dyn MineTrigger> = self.manager.clone();
        for (chain_id, handle) in &self.automine {
            let miner = AutoMiner::new(handle.clone(), Arc::clone(&trigger));
            let events = self.events().subscribe();
            info!(chain = %chain_id, "Automine enabled");
            tasks.push(tokio::spawn(async move {
                miner.run(events).await;
            }));
        }
        self.tasks.lock().extend(tasks);

        let resumed = self.manager.resume_active()?;
        info!(resumed, "Resumed persisted operations");

        let follower = HeaderFollower::new(
            Arc::clone(&self.chain),
            source,
            self.config.chain.follower_config(),
        );
        follower.run(self.shutdown.clone()).await;
        Ok(())
    }

    /// Stop following, stop every pipeline and flush the store.
    pub async fn shutdown(&self) {
        info!("Shutting down node");
        self.shutdown.cancel();
        self.manager.shutdown().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "Failed to flush database");
        }
    }
}
