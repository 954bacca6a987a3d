//! Operation manager tests.
//!
//! These tests verify:
//! - Starting, listing and cancelling operations
//! - Resuming persisted operations after a restart
//! - Rolling operations back when their endorsement is reorganized away
//! - Reloading pipeline settings

use crate::harness::{calls, fast_mining_config, MiningFixture, ScriptedAdapter, TEST_CHAIN};
use pop_chain::ChainEvent;
use pop_mining::{
    AdapterError, ConfigHandle, LogLevel, MiningConfig, MiningError, OperationId, OperationManager,
    OperationRepository, OperationState, CANCELLED_BY_USER,
};
use std::sync::Arc;
use std::time::Duration;

async fn wait_until_idle(manager: &OperationManager, id: &OperationId) {
    while manager.is_running(id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn reorg_of(events: Vec<ChainEvent>) -> ChainEvent {
    events
        .into_iter()
        .find(|e| matches!(e, ChainEvent::Reorg { .. }))
        .expect("reorg event")
}

#[tokio::test(start_paused = true)]
async fn test_unknown_chain_is_refused() {
    let fixture = MiningFixture::new(fast_mining_config());

    let result = fixture.manager.mine("unknown-chain", None);

    assert!(matches!(result, Err(MiningError::UnknownChain(ref c)) if c == "unknown-chain"));
    assert!(fixture.manager.list(true).unwrap().is_empty());
    assert_eq!(fixture.manager.chain_ids(), vec![TEST_CHAIN.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_mined_operation_completes() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let blocks = fixture.chain.grow(3, 10);
    fixture.adapter.set_confirmation_block(blocks[2]);

    let id = fixture.manager.mine(TEST_CHAIN, Some(7)).unwrap();
    // Persisted before the pipeline runs.
    assert!(fixture.manager.get(&id).unwrap().is_some());

    let op = fixture.wait_for(&id, |op| op.is_terminal()).await;
    wait_until_idle(&fixture.manager, &id).await;

    assert_eq!(op.state, OperationState::Completed);
    assert_eq!(op.endorsed_height, Some(7));
    assert!(fixture.manager.list(false).unwrap().is_empty());
    assert_eq!(fixture.manager.list(true).unwrap().len(), 1);

    let stats = fixture.manager.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_marks_operation_failed() {
    let fixture = MiningFixture::new(fast_mining_config());
    fixture.adapter.stall(calls::SUBMIT_ENDORSEMENT);

    let id = fixture.manager.mine(TEST_CHAIN, None).unwrap();
    fixture
        .wait_for(&id, |op| op.state == OperationState::InstructionReceived)
        .await;
    assert!(fixture.manager.is_running(&id));

    let op = fixture.manager.cancel(&id).await.unwrap();

    assert_eq!(op.state, OperationState::Failed);
    assert_eq!(op.failure_reason.as_deref(), Some(CANCELLED_BY_USER));
    assert!(!fixture.manager.is_running(&id));
    assert_eq!(fixture.manager.get(&id).unwrap(), Some(op));
    assert_eq!(fixture.manager.stats().failed, 1);

    // A finished operation cannot be cancelled again.
    assert!(matches!(
        fixture.manager.cancel(&id).await,
        Err(MiningError::InvalidState { .. })
    ));
    assert!(matches!(
        fixture.manager.cancel(&OperationId::from("deadbeef")).await,
        Err(MiningError::OperationNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_active_operations() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let blocks = fixture.chain.grow(3, 10);
    fixture.adapter.set_confirmation_block(blocks[0]);
    fixture.adapter.stall(calls::SUBMIT_PROOF);

    let id = fixture.manager.mine(TEST_CHAIN, Some(11)).unwrap();
    fixture
        .wait_for(&id, |op| op.state == OperationState::ProofBuilt)
        .await;
    fixture.manager.shutdown().await;
    assert_eq!(fixture.manager.running_count(), 0);
    assert_eq!(fixture.store.load(&id).unwrap().unwrap().state, OperationState::ProofBuilt);

    // A new process over the same store.
    let adapter = Arc::new(ScriptedAdapter::new(TEST_CHAIN));
    adapter.set_confirmation_block(blocks[0]);
    let manager = OperationManager::new(
        fixture.store.clone(),
        Arc::clone(&fixture.chain.chain),
        ConfigHandle::new(fast_mining_config()),
    );
    manager.register_adapter(adapter.clone());

    assert_eq!(manager.resume_active().unwrap(), 1);
    let op = fixture.wait_for(&id, |op| op.is_terminal()).await;

    assert_eq!(op.state, OperationState::Completed);
    assert_eq!(adapter.calls(calls::BUILD_INSTRUCTION), 0);
    assert_eq!(adapter.calls(calls::SUBMIT_ENDORSEMENT), 0);
    assert_eq!(adapter.calls(calls::SUBMIT_PROOF), 1);
    assert_eq!(op.stage_attempts[&OperationState::ProofSubmitted], 1);

    // Nothing left to resume.
    wait_until_idle(&manager, &id).await;
    assert_eq!(manager.resume_active().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reorg_rolls_back_confirmed_endorsement() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let main = fixture.chain.grow(3, 10);
    fixture.adapter.set_confirmation_block(main[2]);
    fixture.adapter.stall(calls::LOCATE_PROOF);

    let id = fixture.manager.mine(TEST_CHAIN, None).unwrap();
    fixture
        .wait_for(&id, |op| op.state == OperationState::EndorsementConfirmed)
        .await;
    fixture.chain.drain_events();

    // A heavier branch replaces the block holding the endorsement.
    let side = fixture.chain.fork(&main[1], 2, 10);
    let reorg = reorg_of(fixture.chain.drain_events());
    fixture.adapter.resume(calls::LOCATE_PROOF);
    fixture.adapter.set_confirmation_block(side[0]);

    fixture.manager.handle_chain_event(&reorg).await.unwrap();

    // The rollback is persisted before the pipeline restarts.
    let op = fixture.store.load(&id).unwrap().unwrap();
    assert_eq!(op.state, OperationState::EndorsementSubmitted);
    assert_eq!(op.endorsement_block_hash, Some(main[2]));
    assert!(op
        .log
        .iter()
        .any(|e| e.level == LogLevel::Warn && e.message.contains("rolled back")));
    assert!(fixture.manager.is_running(&id));
    assert_eq!(fixture.manager.stats().reorg_resubmissions, 1);

    let op = fixture.wait_for(&id, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Completed);
    assert_eq!(op.endorsement_block_hash, Some(side[0]));
    assert_eq!(op.block_of_proof_hash, Some(side[0]));
    // Still the original transaction; only its confirmation was redone.
    assert_eq!(fixture.adapter.submitted().len(), 1);
    assert!(fixture.chain.chain.get(&side[0]).unwrap().has_proof_reference());
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_off_best_chain_keeps_polling() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let main = fixture.chain.grow(3, 10);
    fixture.adapter.set_confirmation_block(main[2]);

    let id = fixture.manager.mine(TEST_CHAIN, None).unwrap();

    // The reorg lands before the endorsement confirms, so nothing is rolled
    // back, and the adapter keeps reporting the block that left the chain.
    let side = fixture.chain.fork(&main[1], 2, 10);
    let reorg = reorg_of(fixture.chain.drain_events());
    fixture.manager.handle_chain_event(&reorg).await.unwrap();
    assert_eq!(fixture.manager.stats().reorg_resubmissions, 0);

    fixture
        .wait_for(&id, |op| op.state == OperationState::EndorsementSubmitted)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let op = fixture.store.load(&id).unwrap().unwrap();
    assert_eq!(op.state, OperationState::EndorsementSubmitted);
    assert!(fixture.adapter.calls(calls::ENDORSEMENT_STATUS) > 1);
    assert_eq!(fixture.adapter.calls(calls::LOCATE_PROOF), 0);

    fixture.adapter.set_confirmation_block(side[0]);
    let op = fixture.wait_for(&id, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Completed);
    assert_eq!(op.endorsement_block_hash, Some(side[0]));
    assert_eq!(op.block_of_proof_hash, Some(side[0]));
    assert_eq!(fixture.adapter.submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reorg_leaves_unaffected_operations() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let main = fixture.chain.grow(3, 10);

    // Past proof submission: immune to reorgs.
    fixture.adapter.set_confirmation_block(main[2]);
    fixture.adapter.stall(calls::DETECT_PAYOUT);
    let submitted = fixture.manager.mine(TEST_CHAIN, None).unwrap();
    fixture
        .wait_for(&submitted, |op| op.state == OperationState::ProofSubmitted)
        .await;

    // Confirmed in a block that survives the reorg.
    fixture.adapter.set_confirmation_block(main[0]);
    fixture.adapter.stall(calls::LOCATE_PROOF);
    let surviving = fixture.manager.mine(TEST_CHAIN, None).unwrap();
    fixture
        .wait_for(&surviving, |op| op.state == OperationState::EndorsementConfirmed)
        .await;
    fixture.chain.drain_events();

    fixture.chain.fork(&main[1], 2, 10);
    let reorg = reorg_of(fixture.chain.drain_events());
    fixture.manager.handle_chain_event(&reorg).await.unwrap();

    let op = fixture.store.load(&submitted).unwrap().unwrap();
    assert_eq!(op.state, OperationState::ProofSubmitted);
    let op = fixture.store.load(&surviving).unwrap().unwrap();
    assert_eq!(op.state, OperationState::EndorsementConfirmed);
    assert!(fixture.manager.is_running(&submitted));
    assert!(fixture.manager.is_running(&surviving));
    assert_eq!(fixture.manager.stats().reorg_resubmissions, 0);

    fixture.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_loop_applies_reorgs() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let main = fixture.chain.grow(2, 10);
    fixture.adapter.set_confirmation_block(main[1]);
    fixture.adapter.stall(calls::BUILD_MERKLE_PROOF);

    let events = fixture.chain.chain.events().subscribe();
    let manager = Arc::clone(&fixture.manager);
    let event_loop = tokio::spawn(async move { manager.run_chain_events(events).await });

    let id = fixture.manager.mine(TEST_CHAIN, None).unwrap();
    fixture
        .wait_for(&id, |op| op.state == OperationState::BlockOfProofFound)
        .await;

    let side = fixture.chain.fork(&main[0], 2, 10);
    fixture.adapter.resume(calls::BUILD_MERKLE_PROOF);
    fixture.adapter.set_confirmation_block(side[1]);

    let op = fixture.wait_for(&id, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Completed);
    assert_eq!(op.block_of_proof_hash, Some(side[1]));
    assert_eq!(fixture.manager.stats().reorg_resubmissions, 1);

    fixture.manager.shutdown().await;
    event_loop.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reloaded_settings_apply_to_new_operations() {
    let fixture = MiningFixture::new(fast_mining_config());

    let invalid = MiningConfig {
        max_attempts: 0,
        ..fast_mining_config()
    };
    assert!(matches!(fixture.manager.reload_config(invalid), Err(MiningError::Config(_))));
    assert_eq!(fixture.manager.config().max_attempts, 10);

    let mut reloaded = MiningConfig {
        max_attempts: 2,
        ..fast_mining_config()
    };
    reloaded.timeouts.endorsement = Duration::from_millis(50);
    fixture.manager.reload_config(reloaded).unwrap();

    // Two attempts instead of ten.
    for _ in 0..2 {
        fixture
            .adapter
            .fail_next(calls::BUILD_INSTRUCTION, AdapterError::Transient("node busy".into()));
    }
    let retried = fixture.manager.mine(TEST_CHAIN, Some(3)).unwrap();
    let op = fixture.wait_for(&retried, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.failure_reason.unwrap().contains("after 2 attempt(s)"));
    assert_eq!(fixture.adapter.calls(calls::BUILD_INSTRUCTION), 2);

    // The shortened endorsement timeout.
    fixture.adapter.stall(calls::SUBMIT_ENDORSEMENT);
    let stalled = fixture.manager.mine(TEST_CHAIN, Some(4)).unwrap();
    let op = fixture.wait_for(&stalled, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.failure_reason.unwrap().contains("took too long"));
}
