//! The ingestion loop: one worker per `(contract, event type)` subscription.
//!
//! Each cycle:
//! 1. Load (or create) the checkpoint and read the node's head.
//! 2. Compute the next window below `head - confirmationThreshold`.
//! 3. Fetch logs, decode and persist each one, bump the counters.
//! 4. Advance the checkpoint with a compare-and-set, or record the failure.
//! 5. Retry decodes of stored events that failed fewer than `retryLimit` times.
//!
//! Persistence is idempotent, so a crash between steps 3 and 4 only means the
//! window is fetched again.

use std::sync::Arc;

use chainledger_core::checkpoint::{BlockWindow, Checkpoint, CheckpointSettings, CheckpointStatus, CounterDelta};
use chainledger_core::error::IndexerError;
use chainledger_core::events::{EventQuery, EventStatus, NewEvent, PersistOutcome};
use chainledger_core::source::{ChainReader, EventDecoder};
use chainledger_core::store::Storage;
use chainledger_core::types::{EventId, RawLog, SubscriptionKey};

use crate::health::ChainHealth;

/// What one ingestion cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A window was persisted and the checkpoint advanced to its end.
    Advanced { window: BlockWindow, stats: BatchStats },
    /// The window was persisted but another writer moved the checkpoint
    /// first; the cursor was left alone.
    Superseded { window: BlockWindow, stats: BatchStats },
    /// Nothing safe to fetch yet.
    CaughtUp,
    /// The chain is halted by an unresolvable divergence.
    Halted,
}

/// Per-window ingestion counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub reconfirmed: u64,
    pub decode_failures: u64,
    pub skipped_removed: u64,
}

/// Ingests one subscription.
pub struct SubscriptionWorker {
    key: SubscriptionKey,
    start_block: u64,
    settings: CheckpointSettings,
    decoder: Arc<dyn EventDecoder>,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn Storage>,
    health: Arc<ChainHealth>,
}

impl SubscriptionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        contract_address: &str,
        start_block: u64,
        settings: CheckpointSettings,
        decoder: Arc<dyn EventDecoder>,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn Storage>,
        health: Arc<ChainHealth>,
    ) -> Self {
        let key = SubscriptionKey::new(chain_id, contract_address, decoder.event_type());
        Self { key, start_block, settings, decoder, reader, store, health }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// The checkpoint for this subscription, created at `start_block - 1` on
    /// first use.
    pub async fn checkpoint(&self) -> Result<Checkpoint, IndexerError> {
        let seed = Checkpoint::seeded(self.key.clone(), self.start_block, self.settings);
        self.store.get_or_create_checkpoint(seed).await
    }

    /// Run one cycle. Errors leave the checkpoint in `error` status without
    /// moving it; the caller retries on the next tick.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, IndexerError> {
        if self.health.is_halted() {
            tracing::debug!(subscription = %self.key, "chain halted, skipping cycle");
            return Ok(CycleOutcome::Halted);
        }
        let mut checkpoint = self.checkpoint().await?;
        let head = match self.reader.current_height().await {
            Ok(head) => head,
            Err(e) => {
                self.record_failure(checkpoint, &e).await;
                return Err(e);
            }
        };

        let outcome = match checkpoint.next_window(head) {
            None => {
                if checkpoint.status == CheckpointStatus::Error || checkpoint.status == CheckpointStatus::Backfilling {
                    // Caught up (or recovered): settle back to idle.
                    let expected = checkpoint.last_processed_block;
                    if let Some(safe) = checkpoint.safe_head(head) {
                        checkpoint.last_finalized_block = Some(safe);
                    }
                    checkpoint.status = CheckpointStatus::Idle;
                    checkpoint.error_message = None;
                    self.store.compare_and_save_checkpoint(&checkpoint, expected).await?;
                }
                CycleOutcome::CaughtUp
            }
            Some(window) => self.ingest(checkpoint, window, head).await?,
        };

        if let Err(e) = self.retry_failed_decodes().await {
            tracing::warn!(subscription = %self.key, error = %e, "decode retry pass failed");
        }
        Ok(outcome)
    }

    async fn ingest(
        &self,
        mut checkpoint: Checkpoint,
        window: BlockWindow,
        head: u64,
    ) -> Result<CycleOutcome, IndexerError> {
        let expected = checkpoint.last_processed_block;
        if checkpoint.status != CheckpointStatus::Backfilling {
            checkpoint.status = CheckpointStatus::Indexing;
        }
        if !self.store.compare_and_save_checkpoint(&checkpoint, expected).await? {
            tracing::debug!(subscription = %self.key, "checkpoint moved before the window started");
            return Ok(CycleOutcome::Superseded { window, stats: BatchStats::default() });
        }

        let stats = match self.ingest_window(window, head).await {
            Ok(stats) => stats,
            Err(e) => {
                self.record_failure(checkpoint, &e).await;
                return Err(e);
            }
        };

        let safe_head = checkpoint.safe_head(head).unwrap_or(window.to);
        checkpoint.advance(window.to, safe_head);
        if !self.store.compare_and_save_checkpoint(&checkpoint, expected).await? {
            tracing::warn!(
                subscription = %self.key,
                from = window.from,
                to = window.to,
                "checkpoint moved by another writer; not advancing"
            );
            return Ok(CycleOutcome::Superseded { window, stats });
        }

        tracing::debug!(
            subscription = %self.key,
            from = window.from,
            to = window.to,
            head,
            fetched = stats.fetched,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            decode_failures = stats.decode_failures,
            "batch complete"
        );
        Ok(CycleOutcome::Advanced { window, stats })
    }

    /// Fetch, decode and persist every log in `window` without touching the
    /// cursor. Counters for whatever was inserted are bumped even when a later
    /// log fails the batch.
    pub async fn ingest_window(&self, window: BlockWindow, head: u64) -> Result<BatchStats, IndexerError> {
        let logs = self
            .reader
            .get_logs(&self.key.contract_address, self.decoder.topic(), window.from, window.to)
            .await?;

        let mut stats = BatchStats { fetched: logs.len() as u64, ..Default::default() };
        let mut delta = CounterDelta::default();
        let result = self.persist_logs(&logs, head, &mut stats, &mut delta).await;
        if !delta.is_zero() {
            self.store.bump_counters(&self.key, delta).await?;
        }
        result.map(|()| stats)
    }

    async fn persist_logs(
        &self,
        logs: &[RawLog],
        head: u64,
        stats: &mut BatchStats,
        delta: &mut CounterDelta,
    ) -> Result<(), IndexerError> {
        let threshold = self.settings.confirmation_threshold;
        for log in logs {
            if log.removed {
                stats.skipped_removed += 1;
                continue;
            }
            let decoded = self.decoder.decode(log);
            let decode_ok = decoded.is_ok();
            let (decoded_payload, processing_error) = match decoded {
                Ok(value) => (Some(value), None),
                Err(e) => {
                    tracing::debug!(
                        subscription = %self.key,
                        tx = %log.tx_hash,
                        log_index = log.log_index,
                        error = %e,
                        "decode failed; storing raw log"
                    );
                    (None, Some(e.to_string()))
                }
            };
            let id = EventId::new(&log.tx_hash, log.log_index, self.decoder.event_type());
            let event = NewEvent {
                id: id.clone(),
                chain_id: self.key.chain_id,
                contract_address: self.key.contract_address.clone(),
                block_number: log.block_number,
                block_hash: log.block_hash.clone(),
                raw_payload: serde_json::to_value(log)
                    .map_err(|e| IndexerError::Other(format!("cannot serialise log {id}: {e}")))?,
                decoded_payload,
                processing_error,
            };

            match self.store.persist(event, head, threshold).await? {
                PersistOutcome::Inserted { .. } => {
                    stats.inserted += 1;
                    delta.inserted += 1;
                    if decode_ok {
                        delta.decoded += 1;
                    } else {
                        stats.decode_failures += 1;
                        delta.failing += 1;
                    }
                }
                PersistOutcome::Duplicate => stats.duplicates += 1,
                PersistOutcome::Orphaned => {
                    if self
                        .store
                        .reconfirm_event(&id, log.block_number, &log.block_hash, head, threshold)
                        .await?
                    {
                        stats.reconfirmed += 1;
                        tracing::info!(subscription = %self.key, event = %id, block = log.block_number, "orphaned event reappeared");
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-decode stored events whose decode failed fewer than `retryLimit`
    /// times. Returns the number that now decode.
    pub async fn retry_failed_decodes(&self) -> Result<u64, IndexerError> {
        let query = EventQuery::subscription(&self.key).failing();
        let candidates: Vec<_> = self
            .store
            .query_events(&query)
            .await?
            .into_iter()
            .filter(|e| e.status != EventStatus::Orphaned && e.retry_count < self.settings.retry_limit)
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut delta = CounterDelta::default();
        let mut result = Ok(());
        for event in candidates {
            let decoded = serde_json::from_value::<RawLog>(event.raw_payload.clone())
                .map_err(|e| format!("malformed raw payload: {e}"))
                .and_then(|raw| self.decoder.decode(&raw).map_err(|e| e.to_string()));
            let ok = decoded.is_ok();
            if let Err(e) = self.store.record_decode_result(&event.id, decoded).await {
                result = Err(e);
                break;
            }
            if ok {
                delta.decoded += 1;
                delta.failing -= 1;
            }
        }
        if !delta.is_zero() {
            self.store.bump_counters(&self.key, delta).await?;
            tracing::info!(subscription = %self.key, recovered = delta.decoded, "failed decodes recovered");
        }
        result.map(|()| delta.decoded)
    }

    async fn record_failure(&self, mut checkpoint: Checkpoint, error: &IndexerError) {
        tracing::warn!(subscription = %self.key, error = %error, "ingestion cycle failed");
        let expected = checkpoint.last_processed_block;
        checkpoint.fail(error.to_string());
        if let Err(e) = self.store.compare_and_save_checkpoint(&checkpoint, expected).await {
            tracing::error!(subscription = %self.key, error = %e, "could not record checkpoint failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_core::events::EventStore;
    use chainledger_core::memory::MemoryStore;
    use chainledger_core::testing::MockChain;
    use chainledger_core::CheckpointStore;

    use crate::decoder::AbiEventDecoder;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";
    const PING: &str = "event Ping(uint256 n)";

    fn settings(batch: u64) -> CheckpointSettings {
        CheckpointSettings { batch_size: batch, confirmation_threshold: 12, retry_limit: 3 }
    }

    fn worker(chain: Arc<MockChain>, store: Arc<MemoryStore>, start: u64, batch: u64) -> SubscriptionWorker {
        let decoder = Arc::new(AbiEventDecoder::new(PING).unwrap());
        SubscriptionWorker::new(1, ADDR, start, settings(batch), decoder, chain, store, Arc::new(ChainHealth::new()))
    }

    fn ping(chain: &MockChain, block: u64, tx: &str, n: u64) {
        let topic = AbiEventDecoder::new(PING).unwrap().topic().to_string();
        chain.add_log_with(block, ADDR, vec![topic], &format!("0x{n:064x}"), tx, 0);
    }

    #[tokio::test]
    async fn window_is_ingested_and_checkpoint_advances() {
        let chain = Arc::new(MockChain::with_blocks(130));
        ping(&chain, 100, "0x01", 1);
        ping(&chain, 105, "0x02", 2);
        let store = Arc::new(MemoryStore::new());
        let w = worker(chain.clone(), store.clone(), 100, 10);

        let outcome = w.run_cycle().await.unwrap();
        let CycleOutcome::Advanced { window, stats } = outcome else { panic!("expected advance") };
        assert_eq!(window, BlockWindow { from: 100, to: 109 });
        assert_eq!(stats.inserted, 2);

        let cp = store.load_checkpoint(w.key()).await.unwrap().unwrap();
        assert_eq!(cp.last_processed_block, Some(109));
        assert_eq!(cp.status, CheckpointStatus::Idle);
        assert_eq!((cp.total_events, cp.processed_events, cp.failed_events), (2, 2, 0));

        let stored = store.query_events(&EventQuery::subscription(w.key())).await.unwrap();
        assert_eq!(stored[0].decoded_payload, Some(serde_json::json!({"n": "1"})));
        assert!(stored.iter().all(|e| e.finalized));
    }

    #[tokio::test]
    async fn waits_for_confirmations() {
        let chain = Arc::new(MockChain::with_blocks(111));
        let store = Arc::new(MemoryStore::new());
        let w = worker(chain, store, 100, 10);
        assert_eq!(w.run_cycle().await.unwrap(), CycleOutcome::CaughtUp);
    }

    #[tokio::test]
    async fn rpc_failure_marks_error_without_advancing() {
        let chain = Arc::new(MockChain::with_blocks(130));
        let store = Arc::new(MemoryStore::new());
        let w = worker(chain.clone(), store.clone(), 100, 10);

        chain.fail_next(1);
        assert!(w.run_cycle().await.is_err());
        let cp = store.load_checkpoint(w.key()).await.unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Error);
        assert_eq!(cp.last_processed_block, Some(99));
        assert!(cp.error_message.is_some());

        w.run_cycle().await.unwrap();
        let cp = store.load_checkpoint(w.key()).await.unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Idle);
        assert_eq!(cp.last_processed_block, Some(109));
    }

    #[tokio::test]
    async fn decode_failures_do_not_block_the_batch() {
        let chain = Arc::new(MockChain::with_blocks(130));
        let topic = AbiEventDecoder::new(PING).unwrap().topic().to_string();
        chain.add_log_with(101, ADDR, vec![topic], "0x01", "0x01", 0);
        ping(&chain, 102, "0x02", 5);
        let store = Arc::new(MemoryStore::new());
        let w = worker(chain, store.clone(), 100, 10);

        let CycleOutcome::Advanced { stats, .. } = w.run_cycle().await.unwrap() else { panic!() };
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.decode_failures, 1);

        let failing = store.query_events(&EventQuery::subscription(w.key()).failing()).await.unwrap();
        assert_eq!(failing.len(), 1);
        // first attempt at ingest + one retry pass in the same cycle
        assert_eq!(failing[0].retry_count, 2);

        w.run_cycle().await.unwrap();
        w.run_cycle().await.unwrap();
        let failing = store.query_events(&EventQuery::subscription(w.key()).failing()).await.unwrap();
        assert_eq!(failing[0].retry_count, 3);

        let cp = store.load_checkpoint(w.key()).await.unwrap().unwrap();
        assert_eq!((cp.total_events, cp.processed_events, cp.failed_events), (2, 1, 1));
    }

    #[tokio::test]
    async fn removed_logs_are_skipped() {
        let chain = Arc::new(MockChain::with_blocks(130));
        ping(&chain, 100, "0x01", 1);
        let store = Arc::new(MemoryStore::new());
        let w = worker(chain.clone(), store.clone(), 100, 10);

        let mut logs = chain.logs_at(100);
        logs[0].removed = true;
        let mut stats = BatchStats::default();
        let mut delta = CounterDelta::default();
        w.persist_logs(&logs, 130, &mut stats, &mut delta).await.unwrap();
        assert_eq!(stats.skipped_removed, 1);
        assert!(delta.is_zero());
        assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn halted_chain_skips_cycles() {
        let chain = Arc::new(MockChain::with_blocks(130));
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(ChainHealth::new());
        let decoder = Arc::new(AbiEventDecoder::new(PING).unwrap());
        let w = SubscriptionWorker::new(1, ADDR, 100, settings(10), decoder, chain.clone(), store, health.clone());

        health.halt("test");
        assert_eq!(w.run_cycle().await.unwrap(), CycleOutcome::Halted);
        assert_eq!(chain.log_queries(), 0);
    }
}
