//! The chain watcher: keeps the block ledger in step with the node.
//!
//! Each cycle:
//! 1. Read the head; a head below the highest one seen is a regression.
//! 2. Re-verify the ledger tip against the node.
//! 3. Pull the next headers above the tip (or from `head - ledgerRetention`
//!    on an empty ledger), running each through the divergence detector
//!    before it is recorded.
//! 4. Prune the ledger below `head - ledgerRetention`.
//! 5. Sweep confirmations, then try to recover orphaned events.
//!
//! An unresolvable divergence halts every subscription of the chain.

use std::sync::Arc;

use chainledger_core::config::IndexerConfig;
use chainledger_core::divergence::{DivergenceDetector, DivergenceRecord, SweepOutcome};
use chainledger_core::error::IndexerError;
use chainledger_core::reconcile::ReconciliationEngine;
use chainledger_core::source::ChainReader;
use chainledger_core::store::Storage;
use chainledger_core::types::BlockHeader;

use crate::health::ChainHealth;

/// What one watcher cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherReport {
    pub head: u64,
    /// Head used for the sweep; stays at the highest head seen while the node
    /// reports a regression, unless demotion on regression is enabled.
    pub sweep_head: u64,
    pub headers_recorded: u64,
    pub divergences: Vec<DivergenceRecord>,
    pub pruned: u64,
    pub sweep: SweepOutcome,
    pub recovered: usize,
}

/// Tracks the canonical chain for one chain id.
pub struct ChainWatcher {
    chain_id: u64,
    ledger_retention: u64,
    headers_per_cycle: u64,
    demote_on_head_regression: bool,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn Storage>,
    detector: DivergenceDetector<dyn Storage>,
    engine: ReconciliationEngine,
    health: Arc<ChainHealth>,
}

impl ChainWatcher {
    pub fn new(
        config: &IndexerConfig,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn Storage>,
        health: Arc<ChainHealth>,
    ) -> Self {
        Self {
            chain_id: config.chain_id,
            ledger_retention: config.ledger_retention,
            headers_per_cycle: config.headers_per_cycle.max(1),
            demote_on_head_regression: config.demote_on_head_regression,
            detector: DivergenceDetector::new(reader.clone(), store.clone(), config.chain_id, config.max_walk_back),
            engine: ReconciliationEngine::new(store.clone(), config.chain_id, config.confirmation_threshold),
            reader,
            store,
            health,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Run one cycle. Returns `Ok(None)` while the chain is halted.
    pub async fn run_cycle(&self) -> Result<Option<WatcherReport>, IndexerError> {
        if self.health.is_halted() {
            return Ok(None);
        }
        match self.cycle().await {
            Err(e) if e.is_unresolvable() => {
                self.halt(&e).await;
                Err(e)
            }
            other => other.map(Some),
        }
    }

    async fn cycle(&self) -> Result<WatcherReport, IndexerError> {
        let head = self.reader.current_height().await?;
        if self.health.highest_head().is_none() {
            if let Some(tip) = self.store.ledger_tip(self.chain_id).await? {
                self.health.seed_highest_head(tip.number);
            }
        }
        let highest = self.health.observe_head(head);
        let sweep_head = if head < highest && !self.demote_on_head_regression {
            tracing::warn!(
                chain_id = self.chain_id,
                head,
                highest,
                "node head went backwards; holding confirmations at the highest head"
            );
            highest
        } else {
            head
        };

        let mut report = WatcherReport { head, sweep_head, ..Default::default() };

        if let Some(record) = self.verify_tip(head).await? {
            report.divergences.push(record);
        }
        self.sync_headers(head, &mut report).await?;

        if let Some(below) = head.checked_sub(self.ledger_retention) {
            report.pruned = self.store.prune_headers(self.chain_id, below).await?;
        }
        report.sweep = self.engine.sweep(sweep_head).await?;
        report.recovered = self.engine.recover_orphans(self.reader.as_ref(), head).await?;

        tracing::debug!(
            chain_id = self.chain_id,
            head,
            headers = report.headers_recorded,
            divergences = report.divergences.len(),
            pruned = report.pruned,
            promoted = report.sweep.promoted,
            recovered = report.recovered,
            "watcher cycle complete"
        );
        Ok(report)
    }

    /// Compare the ledger tip (or the node's head, if lower) with the node.
    async fn verify_tip(&self, head: u64) -> Result<Option<DivergenceRecord>, IndexerError> {
        let Some(tip) = self.store.ledger_tip(self.chain_id).await? else {
            return Ok(None);
        };
        let height = tip.number.min(head);
        let Some(recorded) = self.store.canonical_header(self.chain_id, height).await? else {
            return Ok(None);
        };
        let Some(node) = self.reader.get_block_header(height).await? else {
            tracing::warn!(chain_id = self.chain_id, height, "node has no header at the ledger tip");
            return Ok(None);
        };
        if node.hash.eq_ignore_ascii_case(&recorded.hash) {
            return Ok(None);
        }
        match self.detector.detect(&node).await? {
            Some(divergence) => self.engine.reconcile(divergence).await.map(Some),
            None => Err(IndexerError::UnresolvableDivergence {
                detected_at: height,
                lowest_checked: height,
                reason: "ledger tip replaced and its parent is not retained".into(),
            }),
        }
    }

    async fn sync_headers(&self, head: u64, report: &mut WatcherReport) -> Result<(), IndexerError> {
        let start = match self.store.ledger_tip(self.chain_id).await? {
            Some(tip) => tip.number + 1,
            None => head.saturating_sub(self.ledger_retention),
        };
        if start > head {
            return Ok(());
        }
        let end = head.min(start.saturating_add(self.headers_per_cycle - 1));
        for number in start..=end {
            let Some(header) = self.reader.get_block_header(number).await? else {
                break;
            };
            match self.detector.detect(&header).await? {
                None => {
                    self.record(&header).await?;
                    report.headers_recorded += 1;
                }
                Some(divergence) => {
                    let record = self.engine.reconcile(divergence).await?;
                    report.headers_recorded += 1;
                    report.divergences.push(record);
                }
            }
        }
        Ok(())
    }

    async fn record(&self, header: &BlockHeader) -> Result<(), IndexerError> {
        self.store.record_header(self.chain_id, header).await
    }

    async fn halt(&self, error: &IndexerError) {
        let reason = error.to_string();
        self.health.halt(reason.clone());
        tracing::error!(
            chain_id = self.chain_id,
            error = %error,
            "unresolvable divergence; chain halted until an operator backfills"
        );
        match self.store.list_checkpoints(self.chain_id).await {
            Ok(checkpoints) => {
                for mut checkpoint in checkpoints {
                    checkpoint.fail(reason.clone());
                    if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
                        tracing::error!(subscription = %checkpoint.key, error = %e, "could not mark checkpoint halted");
                    }
                }
            }
            Err(e) => tracing::error!(chain_id = self.chain_id, error = %e, "could not list checkpoints to halt"),
        }
    }
}
