//! End-to-end synchronization scenarios.
//!
//! Every test runs on a paused clock, so timeouts and the QoS machinery
//! execute against deterministic virtual time.

use crate::harness::{ChainData, PeerOptions, TestEnv};
use pyrite_sync::{ChainStore, PeerId, SyncConfig, SyncError, SyncMode};
use std::sync::atomic::Ordering;
use std::time::Duration;

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_light_sync_to_advertised_head() {
    let data = ChainData::build(1000);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("master", data.clone(), PeerOptions::default());

    let (head, td) = data.head(1000);
    env.sync
        .start(&peer.id, head, td, SyncMode::Light)
        .await
        .expect("light sync succeeds");

    assert_eq!(env.chain.header_head(), 1000);
    assert_eq!(
        env.chain.canonical_hash(1000),
        Some(data.header_at(1000).unwrap().hash())
    );
    // Header-only sync must never touch content retrieval.
    assert_eq!(peer.counters.body_requests.load(Ordering::SeqCst), 0);
    assert_eq!(peer.counters.receipt_requests.load(Ordering::SeqCst), 0);
    assert_eq!(peer.counters.node_requests.load(Ordering::SeqCst), 0);

    let progress = env.sync.progress();
    assert_eq!(progress.current_block, 1000);
    assert_eq!(progress.highest_block, 1000);
    assert!(!env.sync.syncing());
}

#[tokio::test(start_paused = true)]
async fn test_light_sync_through_light_peer_wrapper() {
    let data = ChainData::build(300);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_light_peer("wrapped", data.clone(), PeerOptions::default());

    let (head, td) = data.head(300);
    env.sync
        .start(&peer.id, head, td, SyncMode::Light)
        .await
        .expect("light sync over a light peer succeeds");
    assert_eq!(env.chain.header_head(), 300);
}

#[tokio::test(start_paused = true)]
async fn test_full_sync_executes_every_block() {
    let data = ChainData::build(500);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("master", data.clone(), PeerOptions::default());

    let (head, td) = data.head(500);
    env.sync
        .start(&peer.id, head, td, SyncMode::Full)
        .await
        .expect("full sync succeeds");

    for number in [1u64, 250, 499, 500] {
        let hash = data.header_at(number).unwrap().hash();
        assert!(
            env.chain.has_block_and_state(&hash),
            "block {number} must be executed"
        );
    }
    assert_eq!(env.sync.progress().current_block, 500);
    assert!(peer.counters.body_requests.load(Ordering::SeqCst) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_fast_sync_commits_pivot() {
    let data = ChainData::build(10_000);
    let config = SyncConfig {
        // Collapse the pivot randomization window so the pivot lands at
        // exactly head - min_full_blocks.
        pivot_interval: 1,
        ..SyncConfig::default()
    };
    let env = TestEnv::with_config(data.genesis.clone(), config);
    let peer = env.add_peer("master", data.clone(), PeerOptions::default());

    let (head, td) = data.head(10_000);
    env.sync
        .start(&peer.id, head, td, SyncMode::Fast)
        .await
        .expect("fast sync succeeds");

    let pivot = data.header_at(9_936).unwrap();
    assert_eq!(&*env.chain.commit_heads.lock(), &vec![pivot.hash()]);

    // Everything at or below the pivot arrived through the receipt chain.
    for number in [1u64, 5_000, 9_935, 9_936] {
        let hash = data.header_at(number).unwrap().hash();
        assert!(
            env.chain.has_receipts(&hash),
            "block {number} must carry imported receipts"
        );
    }
    // Everything above it was fully executed.
    for number in [9_937u64, 9_970, 10_000] {
        let hash = data.header_at(number).unwrap().hash();
        assert!(
            env.chain.has_block_and_state(&hash),
            "block {number} must be executed"
        );
        assert!(!env.chain.has_receipts(&hash));
    }
    // The pivot's state trie was downloaded.
    assert!(pyrite_sync::StateDb::contains(
        &*env.chain,
        &pivot.state_root
    ));

    let progress = env.sync.progress();
    assert_eq!(progress.current_block, 10_000);
    assert!(progress.pulled_states > 0);
    assert_eq!(progress.pulled_states, progress.known_states);
}

#[tokio::test(start_paused = true)]
async fn test_empty_sync_when_already_at_peer_head() {
    let data = ChainData::build(300);
    let env = TestEnv::new(data.genesis.clone());
    env.chain.preload(&data, 300, true);
    let peer = env.add_peer("equal", data.clone(), PeerOptions::default());

    let (head, td) = data.head(300);
    env.sync
        .start(&peer.id, head, td, SyncMode::Full)
        .await
        .expect("empty sync succeeds");

    assert_eq!(peer.counters.body_requests.load(Ordering::SeqCst), 0);
    assert!(env.dropped.lock().is_empty());
}

// ============================================================================
// Adversarial peers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lying_peer_is_detected_as_stalling() {
    // The peer claims its head is at 500, but the probe window walks right
    // past that height on a chain we already know in full.
    let data = ChainData::build(700);
    let env = TestEnv::new(data.genesis.clone());
    env.chain.preload(&data, 700, true);
    let peer = env.add_peer("liar", data.clone(), PeerOptions {
        claimed_height: Some(500),
        ..PeerOptions::default()
    });

    let (head, td) = data.head(500);
    let err = env
        .sync
        .start(&peer.id, head, td, SyncMode::Full)
        .await
        .expect_err("lying peer must fail the sync");
    assert_eq!(err, SyncError::StallingPeer);
    assert!(env.dropped.lock().contains(&peer.id));
    assert!(!env.sync.syncing());
}

#[tokio::test(start_paused = true)]
async fn test_reorg_ancestor_found_by_binary_search() {
    let main = ChainData::build(1000);
    let fork = ChainData::fork(&main, 400, 1000);

    let env = TestEnv::new(main.genesis.clone());
    env.chain.preload(&main, 1000, true);
    let peer = env.add_peer("forker", fork.clone(), PeerOptions::default());

    let (head, td) = fork.head(1000);
    env.sync
        .start(&peer.id, head, td, SyncMode::Full)
        .await
        .expect("reorg sync succeeds");

    // The fork won: blocks past the common ancestor are the peer's.
    assert_eq!(
        env.chain.canonical_hash(401),
        Some(fork.header_at(401).unwrap().hash())
    );
    assert_eq!(
        env.chain.canonical_hash(1000),
        Some(fork.header_at(1000).unwrap().hash())
    );
    assert!(env
        .chain
        .has_block_and_state(&fork.header_at(1000).unwrap().hash()));
    // The shared prefix stayed untouched.
    assert_eq!(
        env.chain.canonical_hash(400),
        Some(main.header_at(400).unwrap().hash())
    );
}

#[tokio::test(start_paused = true)]
async fn test_skeleton_timeout_drops_master() {
    let data = ChainData::build(500);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("mute", data.clone(), PeerOptions {
        mute_skeleton: true,
        ..PeerOptions::default()
    });

    let (head, td) = data.head(500);
    let err = env
        .sync
        .start(&peer.id, head, td, SyncMode::Light)
        .await
        .expect_err("a mute master must fail the sync");
    assert_eq!(err, SyncError::BadPeer);
    assert!(env.dropped.lock().contains(&peer.id));
    assert!(!env.sync.syncing());
}

// ============================================================================
// Pivot safety
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pivot_lock_survives_retry() {
    let data = ChainData::build(2000);
    let config = SyncConfig {
        pivot_interval: 1,
        ..SyncConfig::default()
    };
    let env = TestEnv::with_config(data.genesis.clone(), config);
    let peer = env.add_peer("first", data.clone(), PeerOptions::default());

    // Make header insertion fail past the pivot (2000 - 64 = 1936), which
    // rolls the chain back and pins the pivot header.
    *env.chain.fail_header_insert_at.lock() = Some(1950);

    let (head, td) = data.head(2000);
    let err = env
        .sync
        .start(&peer.id, head, td, SyncMode::Fast)
        .await
        .expect_err("injected failure must fail the sync");
    assert_eq!(err, SyncError::InvalidChain);

    let pivot = data.header_at(1936).unwrap();
    let locked = env.sync.locked_pivot().expect("pivot must be locked in");
    assert_eq!(locked.hash(), pivot.hash());
    assert_eq!(env.sync.pivot_failures(), 1);

    // Retry against a healthy peer: the locked pivot is reused and ends up
    // as the committed head.
    *env.chain.fail_header_insert_at.lock() = None;
    let peer2 = env.add_peer("second", data.clone(), PeerOptions::default());
    env.sync
        .start(&peer2.id, head, td, SyncMode::Fast)
        .await
        .expect("retry succeeds");

    assert_eq!(&*env.chain.commit_heads.lock(), &vec![locked.hash()]);
    assert_eq!(env.sync.progress().current_block, 2000);
}

#[tokio::test(start_paused = true)]
async fn test_fast_sync_degrades_to_full_after_critical_trials() {
    let data = ChainData::build(2000);
    let config = SyncConfig {
        pivot_interval: 1,
        critical_trials: 1,
        ..SyncConfig::default()
    };
    let env = TestEnv::with_config(data.genesis.clone(), config);
    let peer = env.add_peer("first", data.clone(), PeerOptions::default());

    *env.chain.fail_header_insert_at.lock() = Some(1950);
    let (head, td) = data.head(2000);
    let _ = env
        .sync
        .start(&peer.id, head, td, SyncMode::Fast)
        .await
        .expect_err("injected failure must fail the sync");
    assert_eq!(env.sync.pivot_failures(), 1);

    // The trial budget is exhausted: a fast start now runs as a full sync,
    // with no pivot commit and every block executed.
    *env.chain.fail_header_insert_at.lock() = None;
    let peer2 = env.add_peer("second", data.clone(), PeerOptions::default());
    env.sync
        .start(&peer2.id, head, td, SyncMode::Fast)
        .await
        .expect("degraded sync succeeds");

    assert!(env.chain.commit_heads.lock().is_empty());
    let head_hash = data.header_at(2000).unwrap().hash();
    assert!(env.chain.has_block_and_state(&head_hash));
    assert_eq!(env.sync.progress().current_block, 2000);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_returns_busy() {
    let data = ChainData::build(100);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("slow", data.clone(), PeerOptions {
        delay: Duration::from_secs(5),
        ..PeerOptions::default()
    });

    let (head, td) = data.head(100);
    let first = {
        let sync = env.sync.clone();
        let id = peer.id.clone();
        tokio::spawn(async move { sync.start(&id, head, td, SyncMode::Light).await })
    };
    // Give the first session a chance to claim the busy flag.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(env.sync.syncing());

    let err = env
        .sync
        .start(&peer.id, head, td, SyncMode::Light)
        .await
        .expect_err("second start must be rejected");
    assert_eq!(err, SyncError::Busy);

    first.await.unwrap().expect("first sync still succeeds");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_workers_promptly() {
    let data = ChainData::build(100);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("slow", data.clone(), PeerOptions {
        delay: Duration::from_secs(10),
        ..PeerOptions::default()
    });

    let (head, td) = data.head(100);
    let session = {
        let sync = env.sync.clone();
        let id = peer.id.clone();
        tokio::spawn(async move { sync.start(&id, head, td, SyncMode::Full).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    env.sync.cancel();

    let result = tokio::time::timeout(Duration::from_millis(200), session)
        .await
        .expect("cancel must unwind within one scheduler tick")
        .unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled(_))));
    assert!(!env.sync.syncing());
    // The peer did nothing wrong.
    assert!(env.dropped.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unregistering_master_cancels_session() {
    let data = ChainData::build(100);
    let env = TestEnv::new(data.genesis.clone());
    let peer = env.add_peer("slow", data.clone(), PeerOptions {
        delay: Duration::from_secs(10),
        ..PeerOptions::default()
    });

    let (head, td) = data.head(100);
    let session = {
        let sync = env.sync.clone();
        let id = peer.id.clone();
        tokio::spawn(async move { sync.start(&id, head, td, SyncMode::Full).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    env.sync.unregister_peer(&peer.id).unwrap();

    let result = tokio::time::timeout(Duration::from_millis(200), session)
        .await
        .expect("master drop must unwind the session")
        .unwrap();
    assert!(result.is_err());
    assert!(!env.sync.syncing());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_and_terminate_are_idempotent() {
    let data = ChainData::build(10);
    let env = TestEnv::new(data.genesis.clone());

    // Nothing running: both are no-ops.
    env.sync.cancel();
    env.sync.cancel();
    env.sync.terminate();
    env.sync.terminate();
    assert!(!env.sync.syncing());
}

#[tokio::test(start_paused = true)]
async fn test_start_with_unknown_peer() {
    let data = ChainData::build(10);
    let env = TestEnv::new(data.genesis.clone());

    let (head, td) = data.head(10);
    let err = env
        .sync
        .start(&PeerId::from("ghost"), head, td, SyncMode::Full)
        .await
        .expect_err("unknown peer cannot drive a sync");
    assert!(matches!(err, SyncError::UnknownPeer(_)));
    // Transient failure: nobody gets dropped.
    assert!(env.dropped.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delivery_without_session_is_rejected() {
    let data = ChainData::build(10);
    let env = TestEnv::new(data.genesis.clone());

    let err = env
        .sync
        .deliver_headers(&PeerId::from("nobody"), Vec::new())
        .await
        .expect_err("no session is active");
    assert_eq!(err, SyncError::NoSyncActive);

    let err = env
        .sync
        .deliver_node_data(&PeerId::from("nobody"), Vec::new())
        .await
        .expect_err("no session is active");
    assert_eq!(err, SyncError::NoSyncActive);
}

#[tokio::test(start_paused = true)]
async fn test_low_protocol_version_is_rejected() {
    let data = ChainData::build(50);
    let config = SyncConfig {
        min_protocol_version: 2,
        ..SyncConfig::default()
    };
    let env = TestEnv::with_config(data.genesis.clone(), config);
    // The harness registers peers at version 1.
    let peer = env.add_peer("old", data.clone(), PeerOptions::default());

    let (head, td) = data.head(50);
    let err = env
        .sync
        .start(&peer.id, head, td, SyncMode::Full)
        .await
        .expect_err("old protocol must be rejected");
    assert_eq!(err, SyncError::ProtocolTooOld { got: 1, min: 2 });
    assert!(env.dropped.lock().contains(&peer.id));
}

#[tokio::test(start_paused = true)]
async fn test_multi_peer_full_sync() {
    let data = ChainData::build(800);
    let env = TestEnv::new(data.genesis.clone());
    let master = env.add_peer("master", data.clone(), PeerOptions::default());
    let helper_a = env.add_peer("helper-a", data.clone(), PeerOptions::default());
    let helper_b = env.add_peer("helper-b", data.clone(), PeerOptions::default());

    let (head, td) = data.head(800);
    env.sync
        .start(&master.id, head, td, SyncMode::Full)
        .await
        .expect("multi-peer sync succeeds");

    assert!(env
        .chain
        .has_block_and_state(&data.header_at(800).unwrap().hash()));
    // Work was spread beyond the master peer.
    let helper_requests = helper_a.counters.header_requests.load(Ordering::SeqCst)
        + helper_a.counters.body_requests.load(Ordering::SeqCst)
        + helper_b.counters.header_requests.load(Ordering::SeqCst)
        + helper_b.counters.body_requests.load(Ordering::SeqCst);
    assert!(helper_requests > 0, "helpers must be assigned work");
}
