//! The block ledger: recently seen headers, kept only for divergence
//! detection. At most one canonical header exists per height; retention is a
//! trailing window below the head.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{BlockHeader, LedgerEntry};

#[async_trait]
pub trait BlockLedger: Send + Sync {
    /// The canonical header recorded at `number`.
    async fn canonical_header(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<BlockHeader>, IndexerError>;

    /// The highest canonical header.
    async fn ledger_tip(&self, chain_id: u64) -> Result<Option<BlockHeader>, IndexerError>;

    /// The lowest retained canonical height.
    async fn ledger_floor(&self, chain_id: u64) -> Result<Option<u64>, IndexerError>;

    /// Record `header` as canonical. Re-recording the same hash is a no-op;
    /// a different canonical hash at that height is an invariant violation
    /// (replacements go through the divergence path).
    async fn record_header(&self, chain_id: u64, header: &BlockHeader) -> Result<(), IndexerError>;

    /// Every entry (canonical or not) in `[from, to]`, by height.
    async fn ledger_entries(
        &self,
        chain_id: u64,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerEntry>, IndexerError>;

    /// Drop headers below `below`. Returns the number removed.
    async fn prune_headers(&self, chain_id: u64, below: u64) -> Result<u64, IndexerError>;

    /// Forget every header of the chain (operator backfill).
    async fn reset_ledger(&self, chain_id: u64) -> Result<u64, IndexerError>;
}
