//! The indexer service. Owns the subscription workers and the chain
//! watcher, and drives them on fixed-interval tickers.
//!
//! ```text
//! Indexer::start
//!   ├─ task: ChainWatcher      (ledger sync, reconcile, sweep, recover)
//!   └─ task: SubscriptionWorker × N
//! ```
//!
//! A stop request is only seen between cycles, so an in-flight batch always
//! completes before its task exits.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use chainledger_core::checkpoint::{Checkpoint, CheckpointStatus};
use chainledger_core::config::IndexerConfig;
use chainledger_core::error::IndexerError;
use chainledger_core::reconcile::ConsistencyReport;
use chainledger_core::source::ChainReader;
use chainledger_core::store::Storage;
use chainledger_core::types::SubscriptionKey;

use crate::health::ChainHealth;
use crate::index_loop::{CycleOutcome, SubscriptionWorker};
use crate::watcher::{ChainWatcher, WatcherReport};

/// Checkpoint summary exposed by [`Indexer::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub contract_address: String,
    pub event_type: String,
    pub last_processed_block: Option<u64>,
    pub last_finalized_block: Option<u64>,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
}

impl From<Checkpoint> for CheckpointSummary {
    fn from(cp: Checkpoint) -> Self {
        Self {
            contract_address: cp.key.contract_address,
            event_type: cp.key.event_type,
            last_processed_block: cp.last_processed_block,
            last_finalized_block: cp.last_finalized_block,
            status: cp.status,
            error_message: cp.error_message,
            total_events: cp.total_events,
            processed_events: cp.processed_events,
            failed_events: cp.failed_events,
        }
    }
}

/// Snapshot returned by [`Indexer::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub chain_id: u64,
    pub running: bool,
    /// Node head, or the last head the watcher saw if the node is unreachable.
    pub head: Option<u64>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub subscriptions: Vec<CheckpointSummary>,
}

/// Result of one synchronous [`Indexer::tick`].
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub watcher: Option<WatcherReport>,
    pub outcomes: Vec<(SubscriptionKey, CycleOutcome)>,
    pub failures: Vec<(SubscriptionKey, String)>,
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// A reorg-aware event indexer for one chain.
pub struct Indexer {
    config: IndexerConfig,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn Storage>,
    health: Arc<ChainHealth>,
    workers: Vec<Arc<SubscriptionWorker>>,
    watcher: Arc<ChainWatcher>,
    running: Mutex<Option<Running>>,
}

impl Indexer {
    pub(crate) fn new(
        config: IndexerConfig,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn Storage>,
        workers: Vec<Arc<SubscriptionWorker>>,
        health: Arc<ChainHealth>,
    ) -> Self {
        let watcher = Arc::new(ChainWatcher::new(&config, reader.clone(), store.clone(), health.clone()));
        Self { config, reader, store, health, workers, watcher, running: Mutex::new(None) }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// The backing store, for consumers querying finalized events.
    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn health(&self) -> &Arc<ChainHealth> {
        &self.health
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Create any missing checkpoints at their configured start blocks.
    pub async fn ensure_checkpoints(&self) -> Result<(), IndexerError> {
        for worker in &self.workers {
            worker.checkpoint().await?;
        }
        Ok(())
    }

    /// Spawn the watcher and one task per subscription. Calling `start` on a
    /// running indexer is a no-op.
    pub async fn start(&self) -> Result<(), IndexerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!(chain_id = self.config.chain_id, "indexer already running");
            return Ok(());
        }
        self.ensure_checkpoints().await?;

        let (stop, stop_rx) = watch::channel(false);
        let period = self.config.poll_interval();
        let mut tasks = Vec::with_capacity(self.workers.len() + 1);

        let watcher = self.watcher.clone();
        tasks.push(spawn_ticker(period, stop_rx.clone(), move || {
            let watcher = watcher.clone();
            async move {
                if let Err(e) = watcher.run_cycle().await {
                    if !e.is_unresolvable() {
                        tracing::warn!(error = %e, "watcher cycle failed");
                    }
                }
            }
        }));
        for worker in &self.workers {
            let worker = worker.clone();
            tasks.push(spawn_ticker(period, stop_rx.clone(), move || {
                let worker = worker.clone();
                async move {
                    // failures are logged and recorded on the checkpoint by the worker
                    let _ = worker.run_cycle().await;
                }
            }));
        }

        tracing::info!(
            chain_id = self.config.chain_id,
            subscriptions = self.workers.len(),
            poll_interval_ms = self.config.poll_interval_ms,
            "indexer started"
        );
        *running = Some(Running { stop, tasks });
        Ok(())
    }

    /// Signal every task and wait for in-flight cycles to finish.
    pub async fn stop(&self) {
        let Some(run) = self.running.lock().await.take() else {
            return;
        };
        let _ = run.stop.send(true);
        for result in future::join_all(run.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "indexer task panicked");
            }
        }
        tracing::info!(chain_id = self.config.chain_id, "indexer stopped");
    }

    pub async fn restart(&self) -> Result<(), IndexerError> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> Result<IndexerStatus, IndexerError> {
        let head = match self.reader.current_height().await {
            Ok(head) => Some(head),
            Err(e) => {
                tracing::debug!(error = %e, "head unavailable for status");
                self.health.head()
            }
        };
        let subscriptions = self
            .store
            .list_checkpoints(self.config.chain_id)
            .await?
            .into_iter()
            .map(CheckpointSummary::from)
            .collect();
        Ok(IndexerStatus {
            chain_id: self.config.chain_id,
            running: self.is_running().await,
            head,
            halted: self.health.is_halted(),
            halt_reason: self.health.halt_reason(),
            subscriptions,
        })
    }

    /// Operator backfill: rewind every checkpoint of `contract_address` so the
    /// next cycle starts at `block`. On a halted chain this is
    /// [`Indexer::backfill_from_fork`].
    pub async fn backfill(&self, contract_address: &str, block: u64) -> Result<Vec<Checkpoint>, IndexerError> {
        let abandon_fork = self.health.is_halted();
        self.rewind_contract(contract_address, block, abandon_fork).await
    }

    /// Backfill that also gives up on every stored block from `block` on:
    /// live events there are orphaned (re-ingestion reconfirms the ones still
    /// canonical), other checkpoints past it are rewound, the block ledger is
    /// reset and a halt is cleared.
    pub async fn backfill_from_fork(
        &self,
        contract_address: &str,
        block: u64,
    ) -> Result<Vec<Checkpoint>, IndexerError> {
        self.rewind_contract(contract_address, block, true).await
    }

    async fn rewind_contract(
        &self,
        contract_address: &str,
        block: u64,
        abandon_fork: bool,
    ) -> Result<Vec<Checkpoint>, IndexerError> {
        let chain_id = self.config.chain_id;
        let matching = self.contract_checkpoints(contract_address).await?;
        if matching.is_empty() {
            return Err(IndexerError::NotFound(format!(
                "no checkpoint for contract {contract_address} on chain {chain_id}"
            )));
        }

        if abandon_fork {
            let engine = self.watcher.engine();
            if let Some(record) = engine.abandon_above(block.saturating_sub(1)).await? {
                tracing::warn!(
                    chain_id,
                    record = record.id,
                    from = record.range_start,
                    to = record.range_end,
                    orphaned = record.orphaned.len(),
                    "stored fork abandoned"
                );
            }
            let removed = self.store.reset_ledger(chain_id).await?;
            self.health.reset_heads();
            tracing::warn!(chain_id, removed, "block ledger reset");
        }

        // Reload: abandoning the fork may have moved these checkpoints.
        let mut rewound = Vec::with_capacity(matching.len());
        for mut checkpoint in self.contract_checkpoints(contract_address).await? {
            checkpoint.rewind_to(block);
            self.store.save_checkpoint(&checkpoint).await?;
            rewound.push(checkpoint);
        }

        if abandon_fork && self.health.is_halted() {
            self.health.resume();
            tracing::warn!(chain_id, "chain resumed");
        }
        tracing::info!(
            chain_id,
            contract = contract_address,
            block,
            checkpoints = rewound.len(),
            "backfill scheduled"
        );
        Ok(rewound)
    }

    async fn contract_checkpoints(&self, contract_address: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        Ok(self
            .store
            .list_checkpoints(self.config.chain_id)
            .await?
            .into_iter()
            .filter(|cp| cp.key.contract_address.eq_ignore_ascii_case(contract_address))
            .collect())
    }

    /// Run one watcher cycle, then one cycle of every subscription, in order.
    pub async fn tick(&self) -> Result<TickReport, IndexerError> {
        let mut report = TickReport { watcher: self.watcher.run_cycle().await?, ..Default::default() };
        for worker in &self.workers {
            match worker.run_cycle().await {
                Ok(outcome) => report.outcomes.push((worker.key().clone(), outcome)),
                Err(e) => report.failures.push((worker.key().clone(), e.to_string())),
            }
        }
        Ok(report)
    }

    pub async fn check_consistency(&self) -> Result<ConsistencyReport, IndexerError> {
        self.watcher.engine().check_consistency().await
    }
}

fn spawn_ticker<F, Fut>(period: Duration, mut stop: watch::Receiver<bool>, mut cycle: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            cycle().await;
        }
    })
}
