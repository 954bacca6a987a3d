//! Automine tests against a real tracker and operation manager.

use crate::harness::{fast_mining_config, MiningFixture, TEST_CHAIN};
use pop_mining::{AutoMineConfig, AutoMiner, ConfigHandle, MineTrigger, OperationState};
use std::sync::Arc;
use std::time::Duration;

fn automine(fixture: &MiningFixture, config: AutoMineConfig) -> (AutoMiner, ConfigHandle<AutoMineConfig>) {
    let handle = ConfigHandle::new(config);
    let trigger: Arc<dyn MineTrigger> = fixture.manager.clone();
    (AutoMiner::new(handle.clone(), trigger), handle)
}

#[tokio::test(start_paused = true)]
async fn test_keystone_only_mines_height_twenty() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let (miner, _) = automine(
        &fixture,
        AutoMineConfig {
            chain_id: TEST_CHAIN.into(),
            keystone: true,
            ..Default::default()
        },
    );

    let blocks = fixture.chain.grow(20, 5);
    fixture.adapter.set_confirmation_block(blocks[19]);

    let mut triggered = Vec::new();
    for event in fixture.chain.drain_events() {
        triggered.extend(miner.handle_event(&event));
    }
    assert_eq!(triggered, vec![20]);

    let ops = fixture.manager.list(true).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].endorsed_height, Some(20));

    let op = fixture.wait_for(&ops[0].id, |op| op.is_terminal()).await;
    assert_eq!(op.state, OperationState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_covers_every_skipped_height() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let (miner, _) = automine(
        &fixture,
        AutoMineConfig {
            chain_id: TEST_CHAIN.into(),
            round1: true,
            round2: true,
            round3: true,
            keystone: false,
        },
    );

    fixture.chain.grow(100, 10);
    fixture.chain.drain_events();

    // Four zero-work headers never become the tip; the fifth does.
    let tip = fixture.chain.chain.tip();
    let pending = fixture.chain.builder.extend(&fixture.chain.chain, &tip.hash, 100, 4, 0);
    assert_eq!(fixture.chain.chain.best_height(), 100);
    fixture
        .chain
        .builder
        .extend(&fixture.chain.chain, &pending[3], 104, 1, 10);

    let events = fixture.chain.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(miner.handle_event(&events[0]), vec![101, 102, 103, 104, 105]);

    let mut heights: Vec<_> = fixture
        .manager
        .list(true)
        .unwrap()
        .into_iter()
        .filter_map(|op| op.endorsed_height)
        .collect();
    heights.sort_unstable();
    assert_eq!(heights, vec![101, 102, 103, 104, 105]);

    fixture.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_loop_follows_config_reload() {
    let mut fixture = MiningFixture::new(fast_mining_config());
    let (miner, handle) = automine(
        &fixture,
        AutoMineConfig {
            chain_id: TEST_CHAIN.into(),
            ..Default::default()
        },
    );
    let events = fixture.chain.chain.events().subscribe();
    let event_loop = tokio::spawn(async move { miner.run(events).await });

    // Nothing enabled yet.
    fixture.chain.grow(3, 1);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(fixture.manager.list(true).unwrap().is_empty());

    handle.store(AutoMineConfig {
        chain_id: TEST_CHAIN.into(),
        round1: true,
        ..Default::default()
    });
    // Heights 4 and 5: 4 % 3 == 1 is a round 1 height.
    fixture.chain.grow(2, 1);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let ops = fixture.manager.list(true).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].endorsed_height, Some(4));

    event_loop.abort();
    fixture.manager.shutdown().await;
}
