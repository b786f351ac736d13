//! Divergence (reorg) detection against the block ledger.
//!
//! A header whose parent hash disagrees with the ledger's canonical record at
//! `n - 1` means the node switched to another fork. The detector walks back
//! along the node's new chain until the ledger and the node agree again: that
//! height is the fork point. Everything above it in the ledger is invalid.
//!
//! ```text
//! ledger:  … ─ 2 ─ 3 ─ 4 ─ 5
//! node:    … ─ 2 ─ 3'─ 4'─ 5'─ 6'
//!                ^ fork point
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::ledger::BlockLedger;
use crate::source::ChainReader;
use crate::types::{BlockHeader, EventId};

/// What triggered a divergence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DivergenceKind {
    /// Parent-hash mismatch found by the detector.
    Reorg,
    /// Finalized events fell back below the threshold during a sweep.
    ConfirmationSweep,
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reorg => "reorg",
            Self::ConfirmationSweep => "confirmationSweep",
        }
    }
}

impl std::str::FromStr for DivergenceKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reorg" => Ok(Self::Reorg),
            "confirmationSweep" => Ok(Self::ConfirmationSweep),
            other => Err(IndexerError::Storage(format!("unknown divergence kind '{other}'"))),
        }
    }
}

/// A divergence found by [`DivergenceDetector::detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Height of the header that exposed the divergence.
    pub detected_at: u64,
    /// Highest height on which ledger and node agree.
    pub fork_point: u64,
    /// Ledger tip before reconciliation.
    pub previous_head: u64,
    /// The node's headers above the fork point, ascending.
    pub replacement: Vec<BlockHeader>,
}

impl Divergence {
    /// Number of ledger blocks invalidated.
    pub fn depth(&self) -> u64 {
        self.previous_head.saturating_sub(self.fork_point)
    }
}

/// Everything a store needs to apply a divergence in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergencePlan {
    pub kind: DivergenceKind,
    pub detected_at: DateTime<Utc>,
    pub detected_at_block: u64,
    pub fork_point: u64,
    /// Last invalidated height; the affected range is `[fork_point + 1, range_end]`.
    pub range_end: u64,
    pub replacement: Vec<BlockHeader>,
}

impl DivergencePlan {
    /// Plan for a sweep demotion: everything above the deepest final height
    /// under `head`, up to the highest demoted block.
    pub fn sweep(head: u64, threshold: u64, highest_demoted: u64) -> Self {
        Self {
            kind: DivergenceKind::ConfirmationSweep,
            detected_at: Utc::now(),
            detected_at_block: head,
            fork_point: head.saturating_sub(threshold),
            range_end: highest_demoted,
            replacement: Vec::new(),
        }
    }

    pub fn reorg(divergence: Divergence) -> Self {
        Self {
            kind: DivergenceKind::Reorg,
            detected_at: Utc::now(),
            detected_at_block: divergence.detected_at,
            fork_point: divergence.fork_point,
            range_end: divergence.previous_head.max(divergence.detected_at),
            replacement: divergence.replacement,
        }
    }

    pub fn range_start(&self) -> u64 {
        self.fork_point + 1
    }

    pub fn depth(&self) -> u64 {
        self.range_end.saturating_sub(self.fork_point)
    }
}

/// An appended divergence record with its reconciliation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceRecord {
    pub id: u64,
    pub chain_id: u64,
    pub kind: DivergenceKind,
    pub detected_at: DateTime<Utc>,
    pub detected_at_block: u64,
    pub fork_point: u64,
    pub depth: u64,
    pub range_start: u64,
    pub range_end: u64,
    /// Events orphaned by this divergence.
    pub orphaned: Vec<EventId>,
    /// Orphaned events later found on the canonical chain again.
    pub reconciled: Vec<EventId>,
}

/// Result of one confirmation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Live events whose confirmation count changed.
    pub updated: u64,
    /// Pending events that reached the threshold.
    pub promoted: u64,
    /// Finalized events that fell below it.
    pub demoted: Option<DivergenceRecord>,
}

/// Atomic multi-table operations of the reconciliation engine.
#[async_trait]
pub trait DivergenceLog: Send + Sync {
    /// In one transaction: orphan live events in the plan's range, mark the
    /// range's headers non-canonical, store the replacement headers as
    /// canonical, and append the divergence record.
    async fn apply_divergence(
        &self,
        chain_id: u64,
        plan: &DivergencePlan,
    ) -> Result<DivergenceRecord, IndexerError>;

    /// In one transaction: recompute confirmations of live events under
    /// `head`, promote pending events that reached `threshold`, and orphan
    /// finalized events that fell below it under a `confirmationSweep`
    /// record.
    async fn apply_sweep(
        &self,
        chain_id: u64,
        head: u64,
        threshold: u64,
    ) -> Result<SweepOutcome, IndexerError>;

    /// In one transaction: return an orphaned event to the canonical chain at
    /// `block_number`/`block_hash` and append a reconciliation entry for the
    /// record that orphaned it. Returns `false` if the event is not orphaned.
    async fn reconfirm_event(
        &self,
        id: &EventId,
        block_number: u64,
        block_hash: &str,
        head: u64,
        threshold: u64,
    ) -> Result<bool, IndexerError>;

    /// Divergence records of a chain, oldest first.
    async fn divergences(&self, chain_id: u64) -> Result<Vec<DivergenceRecord>, IndexerError>;
}

/// Locates fork points by walking back from a mismatching header.
pub struct DivergenceDetector<L: BlockLedger + ?Sized = dyn BlockLedger> {
    reader: Arc<dyn ChainReader>,
    ledger: Arc<L>,
    chain_id: u64,
    max_walk_back: u64,
}

impl<L: BlockLedger + ?Sized> DivergenceDetector<L> {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        ledger: Arc<L>,
        chain_id: u64,
        max_walk_back: u64,
    ) -> Self {
        Self { reader, ledger, chain_id, max_walk_back }
    }

    /// Check `header` (a header the node reports as canonical) against the
    /// ledger. `Ok(None)` means it extends the ledger or the ledger has no
    /// record to compare with.
    pub async fn detect(&self, header: &BlockHeader) -> Result<Option<Divergence>, IndexerError> {
        let n = header.number;
        let Some(parent_number) = n.checked_sub(1) else {
            return Ok(None);
        };
        let Some(parent) = self.ledger.canonical_header(self.chain_id, parent_number).await? else {
            return Ok(None);
        };
        let previous_head = self
            .ledger
            .ledger_tip(self.chain_id)
            .await?
            .map_or(parent_number, |tip| tip.number);

        if parent.hash.eq_ignore_ascii_case(&header.parent_hash) {
            // Same parent; only a different block already recorded at `n`
            // is a divergence.
            return match self.ledger.canonical_header(self.chain_id, n).await? {
                Some(existing) if !existing.hash.eq_ignore_ascii_case(&header.hash) => {
                    Ok(Some(Divergence {
                        detected_at: n,
                        fork_point: parent_number,
                        previous_head: previous_head.max(n),
                        replacement: vec![header.clone()],
                    }))
                }
                _ => Ok(None),
            };
        }

        debug!(chain_id = self.chain_id, block = n, "parent hash mismatch, walking back");
        let (fork_point, mut replacement) = self.walk_back(header).await?;
        replacement.push(header.clone());

        let divergence = Divergence {
            detected_at: n,
            fork_point,
            previous_head: previous_head.max(parent_number),
            replacement,
        };
        warn!(
            chain_id = self.chain_id,
            detected_at = n,
            fork_point,
            depth = divergence.depth(),
            "chain divergence detected"
        );
        Ok(Some(divergence))
    }

    /// Find the highest height where the ledger's canonical hash equals the
    /// node's chain leading to `header`. Returns it with the node's headers
    /// strictly between that height and `header`, ascending.
    async fn walk_back(
        &self,
        header: &BlockHeader,
    ) -> Result<(u64, Vec<BlockHeader>), IndexerError> {
        let n = header.number;
        let mut expected = header.parent_hash.clone();
        let mut height = n - 1;
        let mut walked = Vec::new();
        loop {
            if n - height > self.max_walk_back {
                return Err(IndexerError::UnresolvableDivergence {
                    detected_at: n,
                    lowest_checked: height + 1,
                    reason: format!("fork point deeper than maxWalkBack ({})", self.max_walk_back),
                });
            }
            let Some(recorded) = self.ledger.canonical_header(self.chain_id, height).await? else {
                return Err(IndexerError::UnresolvableDivergence {
                    detected_at: n,
                    lowest_checked: height,
                    reason: "fork point below the retained block ledger".into(),
                });
            };
            if recorded.hash.eq_ignore_ascii_case(&expected) {
                walked.reverse();
                return Ok((height, walked));
            }
            let node = self.node_header(height).await?;
            if !node.hash.eq_ignore_ascii_case(&expected) {
                return Err(IndexerError::Rpc(format!(
                    "node changed its view of block {height} during fork search"
                )));
            }
            if height == 0 {
                return Err(IndexerError::UnresolvableDivergence {
                    detected_at: n,
                    lowest_checked: 0,
                    reason: "chains disagree at genesis".into(),
                });
            }
            expected = node.parent_hash.clone();
            walked.push(node);
            height -= 1;
        }
    }

    async fn node_header(&self, number: u64) -> Result<BlockHeader, IndexerError> {
        self.reader
            .get_block_header(number)
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("node has no block {number}")))
    }
}
