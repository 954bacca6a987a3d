//! Test harness for integration tests.
//!
//! Provides temporary databases, a scripted chain adapter, a scripted header
//! source and a ready-wired mining fixture.

use crate::generators::{hash_header, test_tx_id, HeaderBuilder, TestCodec};
use async_trait::async_trait;
use parking_lot::Mutex;
use pop_chain::{ChainEvent, Digest32, EventBus, HeaderChain, HeaderSource};
use pop_mining::{
    AdapterError, AdapterResult, Bytes, ChainAdapter, ConfigHandle, EndorsementStatus,
    MiningConfig, MiningInstruction, MiningOperation, OperationId, OperationManager,
    OperationRepository, OperationStore, PayoutInfo,
};
use pop_storage::{Database, Storage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// Chain id served by [`ScriptedAdapter::new`] in fixtures.
pub const TEST_CHAIN: &str = "test-chain";

/// Test database wrapper that cleans up on drop.
pub struct TestDatabase {
    db: Database,
    _temp_dir: TempDir,
}

impl TestDatabase {
    /// Create a new test database in a temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(temp_dir.path()).expect("Failed to open database");
        Self {
            db,
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self) -> PathBuf {
        self._temp_dir.path().to_path_buf()
    }

    /// Shared handle to the database.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::new(self.db.clone())
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Pipeline settings with millisecond delays for tests.
pub fn fast_mining_config() -> MiningConfig {
    MiningConfig {
        max_attempts: 10,
        backoff_unit: Duration::from_millis(10),
        required_confirmations: 1,
        confirmation_poll: Duration::from_millis(10),
        payout_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Adapter method names, for scripting.
pub mod calls {
    pub const BUILD_INSTRUCTION: &str = "build_instruction";
    pub const SUBMIT_ENDORSEMENT: &str = "submit_endorsement";
    pub const ENDORSEMENT_STATUS: &str = "endorsement_status";
    pub const LOCATE_PROOF: &str = "locate_proof";
    pub const BUILD_MERKLE_PROOF: &str = "build_merkle_proof";
    pub const SUBMIT_PROOF: &str = "submit_proof";
    pub const DETECT_PAYOUT: &str = "detect_payout";
}

/// Chain adapter answering from a script.
///
/// By default every call succeeds: endorsements confirm in
/// [`set_confirmation_block`](Self::set_confirmation_block) at depth 6, the
/// block of proof is the confirmation block and the payout is found on the
/// first poll.
pub struct ScriptedAdapter {
    chain_id: String,
    failures: Mutex<HashMap<&'static str, VecDeque<AdapterError>>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    stalled: Mutex<HashSet<&'static str>>,
    statuses: Mutex<VecDeque<EndorsementStatus>>,
    confirmation_block: Mutex<Digest32>,
    proof_block: Mutex<Option<Digest32>>,
    payout_polls: Mutex<u32>,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
            statuses: Mutex::new(VecDeque::new()),
            confirmation_block: Mutex::new(Digest32::ZERO),
            proof_block: Mutex::new(None),
            payout_polls: Mutex::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `method` fail with `error`.
    pub fn fail_next(&self, method: &'static str, error: AdapterError) {
        self.failures.lock().entry(method).or_default().push_back(error);
    }

    /// Calls of `method` never return until [`resume`](Self::resume).
    pub fn stall(&self, method: &'static str) {
        self.stalled.lock().insert(method);
    }

    pub fn resume(&self, method: &'static str) {
        self.stalled.lock().remove(method);
    }

    /// Answers for the next status polls, before the default confirmation.
    pub fn push_status(&self, status: EndorsementStatus) {
        self.statuses.lock().push_back(status);
    }

    pub fn set_confirmation_block(&self, block: Digest32) {
        *self.confirmation_block.lock() = block;
    }

    pub fn set_proof_block(&self, block: Option<Digest32>) {
        *self.proof_block.lock() = block;
    }

    /// Payout polls answered with "not yet".
    pub fn set_payout_polls(&self, polls: u32) {
        *self.payout_polls.lock() = polls;
    }

    pub fn calls(&self, method: &str) -> u32 {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Endorsement transaction ids handed out, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }

    async fn enter(&self, method: &'static str) -> AdapterResult<()> {
        *self.calls.lock().entry(method).or_default() += 1;
        if self.stalled.lock().contains(method) {
            std::future::pending::<()>().await;
        }
        let failure = self.failures.lock().get_mut(method).and_then(|q| q.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainAdapter for ScriptedAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn build_instruction(&self, height: Option<u64>) -> AdapterResult<MiningInstruction> {
        self.enter(calls::BUILD_INSTRUCTION).await?;
        let height = height.unwrap_or(1_000);
        Ok(MiningInstruction {
            endorsed_height: height,
            endorsed_block_hash: format!("{height:064x}"),
            publication_data: Bytes(height.to_be_bytes().to_vec()),
            endorsed_header: Bytes(vec![0xE0; 8]),
            context_headers: Vec::new(),
            payout_address: "payout-address".into(),
        })
    }

    async fn submit_endorsement(&self, _instruction: &MiningInstruction) -> AdapterResult<String> {
        self.enter(calls::SUBMIT_ENDORSEMENT).await?;
        let mut submitted = self.submitted.lock();
        let id = test_tx_id(submitted.len() as u64 + 1);
        submitted.push(id.clone());
        Ok(id)
    }

    async fn endorsement_status(&self, _transaction_id: &str) -> AdapterResult<EndorsementStatus> {
        self.enter(calls::ENDORSEMENT_STATUS).await?;
        let scripted = self.statuses.lock().pop_front();
        Ok(scripted.unwrap_or_else(|| EndorsementStatus::Confirmed {
            block_hash: *self.confirmation_block.lock(),
            depth: 6,
        }))
    }

    async fn locate_proof(
        &self,
        _transaction_id: &str,
        endorsement_block: &Digest32,
    ) -> AdapterResult<Digest32> {
        self.enter(calls::LOCATE_PROOF).await?;
        let proof_block = *self.proof_block.lock();
        Ok(proof_block.unwrap_or(*endorsement_block))
    }

    async fn build_merkle_proof(&self, transaction_id: &str, block_of_proof: &Digest32) -> AdapterResult<Bytes> {
        self.enter(calls::BUILD_MERKLE_PROOF).await?;
        let mut proof = transaction_id.as_bytes().to_vec();
        proof.extend_from_slice(block_of_proof.as_bytes());
        Ok(Bytes(proof))
    }

    async fn submit_proof(&self, operation: &MiningOperation) -> AdapterResult<String> {
        self.enter(calls::SUBMIT_PROOF).await?;
        if operation.merkle_proof.is_none() {
            return Err(AdapterError::Fatal("no merkle proof".into()));
        }
        Ok(format!("proof-{}", operation.id))
    }

    async fn detect_payout(&self, operation: &MiningOperation) -> AdapterResult<Option<PayoutInfo>> {
        self.enter(calls::DETECT_PAYOUT).await?;
        let mut polls = self.payout_polls.lock();
        if *polls > 0 {
            *polls -= 1;
            return Ok(None);
        }
        Ok(Some(PayoutInfo {
            payout_block_hash: format!("payout-{}", operation.id),
            amount: 1_000,
        }))
    }
}

/// Header source serving a fixed best chain.
pub struct ScriptedSource {
    headers: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedSource {
    pub fn new(headers: Vec<Vec<u8>>) -> Self {
        Self {
            headers: Mutex::new(headers),
        }
    }

    /// Append headers to the served chain.
    pub fn extend(&self, headers: Vec<Vec<u8>>) {
        self.headers.lock().extend(headers);
    }
}

#[async_trait]
impl HeaderSource for ScriptedSource {
    async fn best_height(&self) -> Result<u64, String> {
        Ok(self.headers.lock().len() as u64)
    }

    async fn headers_after(&self, locator: &[Digest32], max: usize) -> Result<Vec<Vec<u8>>, String> {
        let headers = self.headers.lock();
        let hashes: Vec<Digest32> = headers.iter().map(|raw| hash_header(raw)).collect();
        let start = locator
            .iter()
            .find_map(|l| hashes.iter().position(|h| h == l))
            .map(|p| p + 1)
            .unwrap_or(0);
        Ok(headers.iter().skip(start).take(max).cloned().collect())
    }

    async fn header_by_hash(&self, hash: &Digest32) -> Result<Option<Vec<u8>>, String> {
        Ok(self
            .headers
            .lock()
            .iter()
            .find(|raw| hash_header(raw) == *hash)
            .cloned())
    }
}

/// Tracker over a temporary RocksDB database, with a subscribed receiver.
pub struct TestChain {
    pub db: TestDatabase,
    pub chain: Arc<HeaderChain>,
    pub events: UnboundedReceiver<ChainEvent>,
    pub builder: HeaderBuilder,
}

impl TestChain {
    pub fn new() -> Self {
        let db = TestDatabase::new();
        let builder = HeaderBuilder::new();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let chain = HeaderChain::open(db.storage(), Arc::new(TestCodec), &builder.checkpoint(), bus)
            .expect("Failed to open header chain");
        Self {
            db,
            chain: Arc::new(chain),
            events,
            builder,
        }
    }

    /// Ingest `count` headers on top of the current tip.
    pub fn grow(&mut self, count: u64, work: u64) -> Vec<Digest32> {
        let tip = self.chain.tip();
        self.builder.extend(&self.chain, &tip.hash, tip.height, count, work)
    }

    /// Ingest a branch forking off `parent`.
    pub fn fork(&mut self, parent: &Digest32, count: u64, work: u64) -> Vec<Digest32> {
        let height = self.chain.get(parent).expect("unknown fork parent").height;
        self.builder.extend(&self.chain, parent, height, count, work)
    }

    /// Events published so far.
    pub fn drain_events(&mut self) -> Vec<ChainEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracker, store, adapter and manager wired together.
pub struct MiningFixture {
    pub chain: TestChain,
    pub store: Arc<OperationStore>,
    pub adapter: Arc<ScriptedAdapter>,
    pub manager: Arc<OperationManager>,
}

impl MiningFixture {
    pub fn new(config: MiningConfig) -> Self {
        let chain = TestChain::new();
        let store = Arc::new(OperationStore::new(chain.db.storage()));
        let adapter = Arc::new(ScriptedAdapter::new(TEST_CHAIN));
        let manager = OperationManager::new(store.clone(), Arc::clone(&chain.chain), ConfigHandle::new(config));
        manager.register_adapter(adapter.clone());
        Self {
            chain,
            store,
            adapter,
            manager,
        }
    }

    /// Poll the persisted record until `done` holds.
    pub async fn wait_for(
        &self,
        id: &OperationId,
        done: impl Fn(&MiningOperation) -> bool,
    ) -> MiningOperation {
        for _ in 0..10_000 {
            if let Some(op) = self.store.load(id).expect("store readable") {
                if done(&op) {
                    return op;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {id} never reached the expected state");
    }
}
