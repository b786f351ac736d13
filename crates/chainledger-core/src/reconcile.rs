//! The reconciliation engine turns detected divergences into storage state.
//!
//! Event state machine:
//!
//! ```text
//! pending ──(confirmations ≥ threshold)──▶ confirmed
//!    │                                        │
//!    └──────────(divergence / sweep)──────────┴──▶ orphaned
//!                                                     │
//!          confirmed ◀──(log back on canonical chain)─┘
//! ```
//!
//! Every transition that touches more than one row is delegated to a single
//! [`DivergenceLog`](crate::divergence::DivergenceLog) call, so a crash never
//! leaves half-orphaned ranges behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::divergence::{Divergence, DivergencePlan, DivergenceRecord, SweepOutcome};
use crate::error::IndexerError;
use crate::events::{EventQuery, EventRecord, EventStatus};
use crate::source::ChainReader;
use crate::store::Storage;
use crate::types::{RawLog, SubscriptionKey};

const CAS_ATTEMPTS: usize = 5;

/// Applies divergences, sweeps confirmations and recovers orphans for one chain.
pub struct ReconciliationEngine {
    store: Arc<dyn Storage>,
    chain_id: u64,
    threshold: u64,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn Storage>, chain_id: u64, threshold: u64) -> Self {
        Self { store, chain_id, threshold }
    }

    /// Orphan everything above the fork point, swap in the replacement
    /// headers, then pull checkpoints that ran past the fork point back to it.
    pub async fn reconcile(&self, divergence: Divergence) -> Result<DivergenceRecord, IndexerError> {
        let plan = DivergencePlan::reorg(divergence);
        let record = self.store.apply_divergence(self.chain_id, &plan).await?;
        warn!(
            chain_id = self.chain_id,
            record = record.id,
            fork_point = record.fork_point,
            depth = record.depth,
            orphaned = record.orphaned.len(),
            "reorg reconciled"
        );
        let rewound = self.rewind_checkpoints(record.fork_point).await?;
        if rewound > 0 {
            info!(chain_id = self.chain_id, rewound, fork_point = record.fork_point, "checkpoints rewound");
        }
        Ok(record)
    }

    /// Compare-and-set every checkpoint past `fork_point` back to it.
    pub async fn rewind_checkpoints(&self, fork_point: u64) -> Result<usize, IndexerError> {
        let mut rewound = 0;
        for checkpoint in self.store.list_checkpoints(self.chain_id).await? {
            if self.rewind_one(checkpoint, fork_point).await? {
                rewound += 1;
            }
        }
        Ok(rewound)
    }

    async fn rewind_one(&self, mut current: Checkpoint, fork_point: u64) -> Result<bool, IndexerError> {
        for _ in 0..CAS_ATTEMPTS {
            let expected = current.last_processed_block;
            let mut next = current.clone();
            if !next.rewind_after_divergence(fork_point) {
                return Ok(false);
            }
            if self.store.compare_and_save_checkpoint(&next, expected).await? {
                return Ok(true);
            }
            match self.store.load_checkpoint(&current.key).await? {
                Some(reloaded) => current = reloaded,
                None => return Ok(false),
            }
        }
        Err(IndexerError::Storage(format!(
            "checkpoint {} kept changing during divergence rewind",
            current.key
        )))
    }

    /// Give up on everything stored above `fork_point` without asking the
    /// node where the fork is: orphan the live events, demote the ledger
    /// headers and rewind checkpoints past it. Used to recover from an
    /// unresolvable divergence, after which re-ingestion reconfirms events
    /// that are still on the canonical chain.
    pub async fn abandon_above(&self, fork_point: u64) -> Result<Option<DivergenceRecord>, IndexerError> {
        let ledger_tip = self.store.ledger_tip(self.chain_id).await?.map(|h| h.number);
        let highest_live = self
            .store
            .query_events(&EventQuery::chain(self.chain_id).since_block(fork_point + 1))
            .await?
            .into_iter()
            .filter(|e| e.status != EventStatus::Orphaned)
            .map(|e| e.block_number)
            .max();

        match ledger_tip.max(highest_live).filter(|&top| top > fork_point) {
            Some(previous_head) => {
                let divergence = Divergence {
                    detected_at: previous_head,
                    fork_point,
                    previous_head,
                    replacement: Vec::new(),
                };
                self.reconcile(divergence).await.map(Some)
            }
            None => {
                self.rewind_checkpoints(fork_point).await?;
                Ok(None)
            }
        }
    }

    /// Recompute confirmations under `head`; promote and demote.
    pub async fn sweep(&self, head: u64) -> Result<SweepOutcome, IndexerError> {
        let outcome = self.store.apply_sweep(self.chain_id, head, self.threshold).await?;
        if let Some(record) = &outcome.demoted {
            warn!(
                chain_id = self.chain_id,
                head,
                record = record.id,
                demoted = record.orphaned.len(),
                "finalized events fell below the confirmation threshold"
            );
        }
        if outcome.promoted > 0 {
            debug!(chain_id = self.chain_id, head, promoted = outcome.promoted, "events finalized");
        }
        Ok(outcome)
    }

    /// Re-query orphaned events inside the retained window whose height is
    /// confirmed under `head`; return the ones found on the canonical chain
    /// to `confirmed`.
    pub async fn recover_orphans(&self, reader: &dyn ChainReader, head: u64) -> Result<usize, IndexerError> {
        let Some(floor) = self.store.ledger_floor(self.chain_id).await? else {
            return Ok(0);
        };
        let Some(safe) = head.checked_sub(self.threshold) else {
            return Ok(0);
        };
        if safe < floor {
            return Ok(0);
        }
        let query = EventQuery::chain(self.chain_id)
            .status(EventStatus::Orphaned)
            .blocks(floor, safe);
        let orphans = self.store.query_events(&query).await?;

        let mut groups: BTreeMap<(String, String, u64), Vec<EventRecord>> = BTreeMap::new();
        for event in orphans {
            let topic = match serde_json::from_value::<RawLog>(event.raw_payload.clone()) {
                Ok(raw) => raw.topic0().map(str::to_string),
                Err(_) => None,
            };
            let Some(topic) = topic else {
                warn!(event = %event.id, "orphaned event has no usable raw log; skipping recovery");
                continue;
            };
            groups
                .entry((event.contract_address.clone(), topic, event.block_number))
                .or_default()
                .push(event);
        }

        let mut recovered = 0;
        for ((address, topic, block), events) in groups {
            let logs = reader.get_logs(&address, &topic, block, block).await?;
            let canonical = self.store.canonical_header(self.chain_id, block).await?;
            for event in events {
                let found = logs.iter().find(|log| {
                    !log.removed
                        && log.log_index == event.id.log_index
                        && log.tx_hash.eq_ignore_ascii_case(&event.id.tx_hash)
                        && canonical
                            .as_ref()
                            .map_or(true, |h| h.hash.eq_ignore_ascii_case(&log.block_hash))
                });
                let Some(log) = found else { continue };
                match self
                    .store
                    .reconfirm_event(&event.id, block, &log.block_hash, head, self.threshold)
                    .await
                {
                    Ok(true) => recovered += 1,
                    Ok(false) => {}
                    Err(IndexerError::Invariant(msg)) => {
                        error!(event = %event.id, %msg, "orphan recovery blocked by a live event");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if recovered > 0 {
            info!(chain_id = self.chain_id, recovered, "orphaned events reconfirmed");
        }
        Ok(recovered)
    }

    /// Compare stored state with the divergence records and checkpoint
    /// counters. Mismatches are reported, never corrected.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport, IndexerError> {
        let orphaned_in_store = self
            .store
            .count_events(&EventQuery::chain(self.chain_id).status(EventStatus::Orphaned))
            .await?;
        let records = self.store.divergences(self.chain_id).await?;
        let orphaned_total: u64 = records.iter().map(|r| r.orphaned.len() as u64).sum();
        let reconciled_total: u64 = records.iter().map(|r| r.reconciled.len() as u64).sum();
        let orphaned_by_records = orphaned_total.saturating_sub(reconciled_total);

        let mut mismatches = Vec::new();
        if orphaned_in_store != orphaned_by_records {
            mismatches.push(format!(
                "store holds {orphaned_in_store} orphaned events, divergence records account for {orphaned_by_records}"
            ));
        }

        let mut subscriptions = Vec::new();
        for cp in self.store.list_checkpoints(self.chain_id).await? {
            let query = EventQuery::subscription(&cp.key);
            let stored = self.store.count_events(&query).await?;
            let failing = self.store.count_events(&query.clone().failing()).await?;
            if stored != cp.total_events {
                mismatches.push(format!(
                    "{}: {stored} stored events, checkpoint counts {}",
                    cp.key, cp.total_events
                ));
            }
            if failing != cp.failed_events {
                mismatches.push(format!(
                    "{}: {failing} failing decodes, checkpoint counts {}",
                    cp.key, cp.failed_events
                ));
            }
            subscriptions.push(SubscriptionConsistency {
                key: cp.key,
                stored_events: stored,
                total_events: cp.total_events,
                failing_events: failing,
                failed_events: cp.failed_events,
            });
        }

        for msg in &mismatches {
            error!(chain_id = self.chain_id, %msg, "consistency mismatch");
        }
        Ok(ConsistencyReport {
            chain_id: self.chain_id,
            orphaned_in_store,
            orphaned_by_records,
            divergence_records: records.len() as u64,
            subscriptions,
            mismatches,
        })
    }
}

/// Operator-facing consistency report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub chain_id: u64,
    pub orphaned_in_store: u64,
    /// Σ orphaned − Σ reconciled over all divergence records.
    pub orphaned_by_records: u64,
    pub divergence_records: u64,
    pub subscriptions: Vec<SubscriptionConsistency>,
    pub mismatches: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConsistency {
    pub key: SubscriptionKey,
    pub stored_events: u64,
    pub total_events: u64,
    pub failing_events: u64,
    pub failed_events: u64,
}
