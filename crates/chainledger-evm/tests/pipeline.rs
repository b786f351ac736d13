//! End-to-end ingestion scenarios against a scripted chain.
//!
//! Each test wires an `Indexer` to a `MockChain` and drives it with
//! `Indexer::tick`, so the watcher always runs before the subscriptions.

use std::sync::Arc;

use chainledger_core::checkpoint::{BlockWindow, CheckpointSettings, CheckpointStatus};
use chainledger_core::events::{EventQuery, EventStatus};
use chainledger_core::source::EventDecoder;
use chainledger_core::testing::MockChain;
use chainledger_core::{BlockLedger, CheckpointStore, DivergenceLog, EventStore, IndexerError, Storage};
use chainledger_evm::{AbiEventDecoder, ChainHealth, Indexer, IndexerBuilder, SubscriptionWorker};
use chainledger_storage::{MemoryStore, SqliteStorage};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";
const PING: &str = "event Ping(uint256 n)";

fn ping_topic() -> String {
    AbiEventDecoder::new(PING).unwrap().topic().to_string()
}

/// Attach a `Ping(n)` log at `block`.
fn ping(chain: &MockChain, block: u64, tx: &str, n: u64) {
    chain.add_log_with(block, CONTRACT, vec![ping_topic()], &format!("0x{n:064x}"), tx, 0);
}

fn indexer(chain: Arc<MockChain>, store: Arc<dyn Storage>, threshold: u64, start: u64, batch: u64) -> Indexer {
    IndexerBuilder::new()
        .chain_id(1)
        .confirmation_threshold(threshold)
        .ledger_retention(64)
        .batch_size(batch)
        .subscribe(CONTRACT, start, [PING])
        .reader(chain)
        .store(store)
        .build()
        .unwrap()
}

async fn all_events(store: &dyn Storage) -> Vec<chainledger_core::EventRecord> {
    store.query_events(&EventQuery::chain(1)).await.unwrap()
}

// ─── Reorg round trip ─────────────────────────────────────────────────────────

#[tokio::test]
async fn reorg_orphans_then_reconfirms_event() {
    let chain = Arc::new(MockChain::with_blocks(5));
    ping(&chain, 3, "0x03", 42);
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = indexer(chain.clone(), store.clone(), 1, 1, 10);

    idx.tick().await.unwrap();
    let events = all_events(store.as_ref()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].block_hash, "0xa-3");
    assert_eq!(events[0].status, EventStatus::Confirmed);
    assert!(idx.store().mark_processed(&events[0].id).await.unwrap());

    // Blocks 3..5 are replaced; the transaction lands in block 4 instead.
    chain.reorg(2, 6, "b");
    ping(&chain, 4, "0x03", 42);

    let report = idx.tick().await.unwrap();
    let watcher = report.watcher.unwrap();
    assert_eq!(watcher.divergences.len(), 1);
    assert_eq!(watcher.divergences[0].fork_point, 2);
    assert_eq!(watcher.divergences[0].orphaned.len(), 1);

    let events = all_events(store.as_ref()).await;
    assert_eq!(events.len(), 1, "the orphaned row is reused, never duplicated");
    let event = &events[0];
    assert_eq!(event.status, EventStatus::Confirmed);
    assert_eq!(event.block_number, 4);
    assert_eq!(event.block_hash, "0xb-4");
    assert!(event.finalized);
    assert!(!event.processed, "orphaning clears the consumer acknowledgement");

    let records = store.divergences(1).await.unwrap();
    assert_eq!(records[0].reconciled, vec![event.id.clone()]);

    let report = idx.check_consistency().await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.mismatches);
    assert_eq!(report.orphaned_in_store, 0);
}

#[tokio::test]
async fn reorg_dropping_a_log_leaves_it_orphaned() {
    let chain = Arc::new(MockChain::with_blocks(5));
    ping(&chain, 3, "0x03", 1);
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = indexer(chain.clone(), store.clone(), 1, 1, 10);
    idx.tick().await.unwrap();

    chain.reorg(2, 6, "b");
    idx.tick().await.unwrap();
    idx.tick().await.unwrap();

    let orphaned = store
        .query_events(&EventQuery::chain(1).status(EventStatus::Orphaned))
        .await
        .unwrap();
    assert_eq!(orphaned.len(), 1);
    assert!(!orphaned[0].finalized);

    let finalized = store.query_events(&EventQuery::chain(1).finalized(true)).await.unwrap();
    assert!(finalized.is_empty());
    assert!(idx.check_consistency().await.unwrap().is_consistent());
}

// ─── Concurrent overlapping ingestion ─────────────────────────────────────────

async fn overlapping_windows_leave_no_duplicates(store: Arc<dyn Storage>) {
    let chain = Arc::new(MockChain::with_blocks(140));
    for block in 100..=115 {
        ping(&chain, block, &format!("0x{block:x}"), block);
    }
    let settings = CheckpointSettings { batch_size: 11, confirmation_threshold: 12, retry_limit: 3 };
    let health = Arc::new(ChainHealth::new());
    let worker = |store: Arc<dyn Storage>| {
        Arc::new(SubscriptionWorker::new(
            1,
            CONTRACT,
            100,
            settings,
            Arc::new(AbiEventDecoder::new(PING).unwrap()),
            chain.clone(),
            store,
            health.clone(),
        ))
    };
    let a = worker(store.clone());
    let b = worker(store.clone());
    a.checkpoint().await.unwrap();

    let ta = tokio::spawn(async move { a.ingest_window(BlockWindow { from: 100, to: 110 }, 140).await });
    let tb = tokio::spawn(async move { b.ingest_window(BlockWindow { from: 105, to: 115 }, 140).await });
    let sa = ta.await.unwrap().unwrap();
    let sb = tb.await.unwrap().unwrap();

    assert_eq!(sa.inserted + sb.inserted, 16);
    assert_eq!(sa.duplicates + sb.duplicates, 6);
    assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 16);

    let key = chainledger_core::SubscriptionKey::new(1, CONTRACT, "Ping");
    let cp = store.load_checkpoint(&key).await.unwrap().unwrap();
    assert_eq!(cp.total_events, 16);
    assert_eq!(cp.processed_events, 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlap_memory() {
    overlapping_windows_leave_no_duplicates(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlap_sqlite() {
    overlapping_windows_leave_no_duplicates(Arc::new(SqliteStorage::in_memory().await.unwrap())).await;
}

// ─── Idempotency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn replaying_a_window_is_a_no_op() {
    let chain = Arc::new(MockChain::with_blocks(130));
    ping(&chain, 100, "0x01", 1);
    ping(&chain, 101, "0x02", 2);
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let worker = SubscriptionWorker::new(
        1,
        CONTRACT,
        100,
        CheckpointSettings { batch_size: 10, confirmation_threshold: 12, retry_limit: 3 },
        Arc::new(AbiEventDecoder::new(PING).unwrap()),
        chain,
        store.clone(),
        Arc::new(ChainHealth::new()),
    );
    worker.checkpoint().await.unwrap();

    let window = BlockWindow { from: 100, to: 109 };
    for _ in 0..3 {
        worker.ingest_window(window, 130).await.unwrap();
    }
    assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 2);
    let cp = store.load_checkpoint(worker.key()).await.unwrap().unwrap();
    assert_eq!(cp.total_events, 2);
}

// ─── Backfill ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn backfill_rewinds_and_refetches_without_duplicates() {
    let chain = Arc::new(MockChain::with_blocks(150_100));
    ping(&chain, 100_500, "0x01", 1);
    ping(&chain, 150_010, "0x02", 2);
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = indexer(chain, store.clone(), 12, 150_000, 1_000);

    idx.tick().await.unwrap();
    assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 1);

    let rewound = idx.backfill(&CONTRACT.to_ascii_uppercase().replace("0X", "0x"), 100_000).await.unwrap();
    assert_eq!(rewound.len(), 1);
    assert_eq!(rewound[0].last_processed_block, Some(99_999));
    assert_eq!(rewound[0].status, CheckpointStatus::Backfilling);

    let key = idx.subscriptions()[0].clone();
    let mut ticks = 0;
    loop {
        idx.tick().await.unwrap();
        ticks += 1;
        let cp = store.load_checkpoint(&key).await.unwrap().unwrap();
        if cp.status == CheckpointStatus::Idle {
            assert_eq!(cp.last_processed_block, Some(150_088));
            break;
        }
        assert_eq!(cp.status, CheckpointStatus::Backfilling);
        assert!(ticks < 100, "backfill did not finish");
    }

    assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 2);
    let cp = store.load_checkpoint(&key).await.unwrap().unwrap();
    assert_eq!(cp.total_events, 2);
    assert!(idx.check_consistency().await.unwrap().is_consistent());
}

#[tokio::test]
async fn backfill_of_unknown_contract_is_not_found() {
    let chain = Arc::new(MockChain::with_blocks(10));
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = indexer(chain, store, 1, 0, 10);
    idx.ensure_checkpoints().await.unwrap();
    let err = idx
        .backfill("0x00000000000000000000000000000000000000bb", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::NotFound(_)));
}

// ─── Unresolvable divergence ──────────────────────────────────────────────────

#[tokio::test]
async fn unresolvable_divergence_halts_until_backfill() {
    let chain = Arc::new(MockChain::with_blocks(100));
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = IndexerBuilder::new()
        .chain_id(1)
        .confirmation_threshold(2)
        .ledger_retention(5)
        .batch_size(10)
        .subscribe(CONTRACT, 90, [PING])
        .reader(chain.clone())
        .store(store.clone())
        .build()
        .unwrap();
    idx.tick().await.unwrap();

    // Ledger holds 95..=100; the fork is at 50.
    chain.reorg(50, 101, "b");
    let err = idx.tick().await.unwrap_err();
    assert!(err.is_unresolvable());

    let status = idx.status().await.unwrap();
    assert!(status.halted);
    assert_eq!(status.subscriptions[0].status, CheckpointStatus::Error);

    // Halted: subscriptions do not move.
    let before = status.subscriptions[0].last_processed_block;
    let report = idx.tick().await.unwrap();
    assert!(report.watcher.is_none());
    let status = idx.status().await.unwrap();
    assert_eq!(status.subscriptions[0].last_processed_block, before);

    idx.backfill(CONTRACT, 50).await.unwrap();
    assert!(!idx.status().await.unwrap().halted);
    assert!(store.ledger_tip(1).await.unwrap().is_none());

    idx.tick().await.unwrap();
    let status = idx.status().await.unwrap();
    assert_eq!(status.subscriptions[0].last_processed_block, Some(59));
}

async fn backfill_abandons_events_of_the_dropped_fork(store: Arc<dyn Storage>) {
    let chain = Arc::new(MockChain::with_blocks(100));
    ping(&chain, 95, "0xaa01", 1);
    let idx = IndexerBuilder::new()
        .chain_id(1)
        .confirmation_threshold(2)
        .ledger_retention(5)
        .batch_size(10)
        .subscribe(CONTRACT, 90, [PING])
        .reader(chain.clone())
        .store(store.clone())
        .build()
        .unwrap();
    idx.tick().await.unwrap();
    assert_eq!(all_events(store.as_ref()).await[0].status, EventStatus::Confirmed);

    // A competing log takes the same (block, logIndex) slot on the new fork.
    chain.reorg(50, 101, "b");
    ping(&chain, 95, "0xbb02", 2);
    assert!(idx.tick().await.unwrap_err().is_unresolvable());

    idx.backfill(CONTRACT, 50).await.unwrap();
    for _ in 0..5 {
        let report = idx.tick().await.unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
    }

    let events = all_events(store.as_ref()).await;
    assert_eq!(events.len(), 2);
    let old = events.iter().find(|e| e.id.tx_hash == "0xaa01").unwrap();
    assert_eq!(old.status, EventStatus::Orphaned);
    assert!(!old.finalized);
    let new = events.iter().find(|e| e.id.tx_hash == "0xbb02").unwrap();
    assert_eq!(new.status, EventStatus::Confirmed);
    assert!(new.finalized);
    assert_eq!(new.block_hash, "0xb-95");

    let status = idx.status().await.unwrap();
    assert!(!status.halted);
    assert_eq!(status.subscriptions[0].last_processed_block, Some(99));
    assert_eq!(status.subscriptions[0].status, CheckpointStatus::Idle);
    assert!(idx.check_consistency().await.unwrap().is_consistent());
}

#[tokio::test]
async fn backfill_after_halt_abandons_dropped_fork_memory() {
    backfill_abandons_events_of_the_dropped_fork(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn backfill_after_halt_abandons_dropped_fork_sqlite() {
    backfill_abandons_events_of_the_dropped_fork(Arc::new(SqliteStorage::in_memory().await.unwrap())).await;
}

// ─── Service lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn start_and_stop_run_cycles_in_the_background() {
    let chain = Arc::new(MockChain::with_blocks(60));
    ping(&chain, 20, "0x01", 1);
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let idx = IndexerBuilder::new()
        .chain_id(1)
        .confirmation_threshold(12)
        .poll_interval_ms(10)
        .subscribe(CONTRACT, 0, [PING])
        .reader(chain)
        .store(store.clone())
        .build()
        .unwrap();

    idx.start().await.unwrap();
    assert!(idx.is_running().await);
    for _ in 0..200 {
        if store.count_events(&EventQuery::chain(1)).await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    idx.restart().await.unwrap();
    idx.stop().await;
    assert!(!idx.is_running().await);

    let status = idx.status().await.unwrap();
    assert!(!status.running);
    assert_eq!(status.head, Some(60));
    assert_eq!(status.subscriptions[0].last_processed_block, Some(48));
    assert_eq!(status.subscriptions[0].total_events, 1);
}
