//! Checkpoints: the durable per-subscription ingestion cursor.
//!
//! A checkpoint stores the last block whose logs were durably persisted for a
//! `(chain, contract, event type)` subscription. On restart the ingestion loop
//! resumes from it; re-processing the tail after a crash is safe because
//! persistence is idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::SubscriptionKey;

/// Ingestion status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Caught up, waiting for the next safe window.
    Idle,
    /// A batch is being fetched and persisted.
    Indexing,
    /// Re-ingesting a range an operator rewound to.
    Backfilling,
    /// The last cycle failed; see `error_message`.
    Error,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Indexing => "indexing",
            Self::Backfilling => "backfilling",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "indexing" => Ok(Self::Indexing),
            "backfilling" => Ok(Self::Backfilling),
            "error" => Ok(Self::Error),
            other => Err(IndexerError::Storage(format!("unknown checkpoint status '{other}'"))),
        }
    }
}

/// Per-subscription settings copied onto the checkpoint when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    pub batch_size: u64,
    pub confirmation_threshold: u64,
    pub retry_limit: u32,
}

/// A block range `[from, to]`, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub from: u64,
    pub to: u64,
}

impl BlockWindow {
    /// Number of blocks in the window.
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        (self.from..=self.to).contains(&block)
    }
}

/// Counter changes accumulated over one cycle, applied atomically by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    /// Newly inserted events.
    pub inserted: u64,
    /// Events whose decode succeeded (on insert or on retry).
    pub decoded: u64,
    /// Change in the number of events whose decode is currently failing.
    pub failing: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.inserted == 0 && self.decoded == 0 && self.failing == 0
    }
}

/// A persisted checkpoint for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: SubscriptionKey,
    /// Last block whose logs are durably stored. `None` until the first
    /// block has been processed (a start block of 0 seeds to `None`).
    pub last_processed_block: Option<u64>,
    /// Upper bound of the last window fetched from the node.
    pub last_scanned_block: Option<u64>,
    /// Highest block considered final at the last cycle (`head - threshold`).
    pub last_finalized_block: Option<u64>,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    /// Events inserted by this subscription.
    pub total_events: u64,
    /// Inserted events that decoded successfully.
    pub processed_events: u64,
    /// Inserted events whose decode is currently failing.
    pub failed_events: u64,
    pub batch_size: u64,
    pub confirmation_threshold: u64,
    pub retry_limit: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A fresh checkpoint seeded to `start_block - 1`.
    pub fn seeded(key: SubscriptionKey, start_block: u64, settings: CheckpointSettings) -> Self {
        let now = Utc::now();
        Self {
            key,
            last_processed_block: start_block.checked_sub(1),
            last_scanned_block: None,
            last_finalized_block: None,
            status: CheckpointStatus::Idle,
            error_message: None,
            total_events: 0,
            processed_events: 0,
            failed_events: 0,
            batch_size: settings.batch_size,
            confirmation_threshold: settings.confirmation_threshold,
            retry_limit: settings.retry_limit,
            created_at: now,
            updated_at: now,
        }
    }

    /// The next block to ingest.
    pub fn next_block(&self) -> u64 {
        self.last_processed_block.map_or(0, |b| b + 1)
    }

    /// The highest block that is deep enough under `head` to ingest.
    pub fn safe_head(&self, head: u64) -> Option<u64> {
        head.checked_sub(self.confirmation_threshold)
    }

    /// The next window that is safe to fetch under `head`, or `None` if the
    /// subscription is already at the safe head.
    pub fn next_window(&self, head: u64) -> Option<BlockWindow> {
        let from = self.next_block();
        let safe = self.safe_head(head)?;
        let to = from.saturating_add(self.batch_size.max(1) - 1).min(safe);
        (from <= to).then_some(BlockWindow { from, to })
    }

    /// Move the cursor forward after a window has been durably persisted.
    pub fn advance(&mut self, to: u64, safe_head: u64) {
        self.last_processed_block = Some(to);
        self.last_scanned_block = Some(to);
        self.last_finalized_block = Some(safe_head);
        self.error_message = None;
        self.status = if self.status == CheckpointStatus::Backfilling && to < safe_head {
            CheckpointStatus::Backfilling
        } else {
            CheckpointStatus::Idle
        };
        self.updated_at = Utc::now();
    }

    /// Record a batch-level failure. The cursor is not moved.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = CheckpointStatus::Error;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Apply `delta` to the counters (stores do this in place).
    pub fn apply_counters(&mut self, delta: CounterDelta) {
        self.total_events += delta.inserted;
        self.processed_events += delta.decoded;
        self.failed_events = self.failed_events.saturating_add_signed(delta.failing);
    }

    /// Pull the cursor back to `fork_point` after a divergence invalidated
    /// the blocks above it. Returns `false` if the cursor is not past it.
    pub fn rewind_after_divergence(&mut self, fork_point: u64) -> bool {
        if self.last_processed_block.map_or(true, |b| b <= fork_point) {
            return false;
        }
        self.last_processed_block = Some(fork_point);
        self.last_scanned_block = Some(fork_point);
        self.updated_at = Utc::now();
        true
    }

    /// Operator rewind: the next cycle starts at `block`.
    pub fn rewind_to(&mut self, block: u64) {
        self.last_processed_block = block.checked_sub(1);
        self.status = CheckpointStatus::Backfilling;
        self.error_message = None;
        self.updated_at = Utc::now();
    }
}

/// Durable storage of checkpoints. One row per subscription key, enforced by
/// the backend's uniqueness constraint.
///
/// `save_checkpoint` and `compare_and_save_checkpoint` write cursor, status
/// and settings only; counters change exclusively through `bump_counters` so
/// concurrent writers never lose each other's increments.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a subscription.
    async fn load_checkpoint(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>, IndexerError>;

    /// Insert `seed` unless a checkpoint for its key already exists; return
    /// whichever row is stored afterwards.
    async fn get_or_create_checkpoint(&self, seed: Checkpoint) -> Result<Checkpoint, IndexerError>;

    /// Overwrite a checkpoint unconditionally (operator paths only).
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError>;

    /// Overwrite a checkpoint only if its stored `last_processed_block` still
    /// equals `expected`. Returns `false` when another writer moved it.
    async fn compare_and_save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<bool, IndexerError>;

    /// Atomically add `delta` to the stored counters.
    async fn bump_counters(&self, key: &SubscriptionKey, delta: CounterDelta) -> Result<(), IndexerError>;

    /// All checkpoints of a chain, ordered by key.
    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(start: u64, batch: u64, threshold: u64) -> Checkpoint {
        Checkpoint::seeded(
            SubscriptionKey::new(1, "0xabc", "Transfer"),
            start,
            CheckpointSettings { batch_size: batch, confirmation_threshold: threshold, retry_limit: 3 },
        )
    }

    #[test]
    fn seeds_to_start_minus_one() {
        assert_eq!(cp(100, 10, 12).last_processed_block, Some(99));
        assert_eq!(cp(100, 10, 12).next_block(), 100);
        assert_eq!(cp(0, 10, 12).last_processed_block, None);
        assert_eq!(cp(0, 10, 12).next_block(), 0);
    }

    #[test]
    fn window_capped_by_batch_and_safe_head() {
        let c = cp(100, 10, 12);
        assert_eq!(c.next_window(200), Some(BlockWindow { from: 100, to: 109 }));
        assert_eq!(c.next_window(115), Some(BlockWindow { from: 100, to: 103 }));
        // 111 - 12 = 99 < 100: nothing safe yet
        assert_eq!(c.next_window(111), None);
        // head below the threshold
        assert_eq!(c.next_window(5), None);
    }

    #[test]
    fn advance_moves_forward_and_clears_error() {
        let mut c = cp(100, 10, 12);
        c.fail("rpc down");
        assert_eq!(c.status, CheckpointStatus::Error);
        assert_eq!(c.last_processed_block, Some(99));

        c.advance(109, 188);
        assert_eq!(c.last_processed_block, Some(109));
        assert_eq!(c.status, CheckpointStatus::Idle);
        assert!(c.error_message.is_none());
        assert_eq!(c.next_block(), 110);
    }

    #[test]
    fn backfilling_persists_until_caught_up() {
        let mut c = cp(150_000, 1000, 12);
        c.rewind_to(100_000);
        assert_eq!(c.last_processed_block, Some(99_999));
        assert_eq!(c.status, CheckpointStatus::Backfilling);

        c.advance(100_999, 150_000);
        assert_eq!(c.status, CheckpointStatus::Backfilling);
        c.advance(150_000, 150_000);
        assert_eq!(c.status, CheckpointStatus::Idle);
    }

    #[test]
    fn divergence_rewind_only_moves_back() {
        let mut c = cp(100, 10, 12);
        c.advance(120, 130);
        assert!(c.rewind_after_divergence(115));
        assert_eq!(c.next_block(), 116);
        assert!(!c.rewind_after_divergence(118));
        assert_eq!(c.last_processed_block, Some(115));
    }

    #[test]
    fn counters_never_go_negative() {
        let mut c = cp(100, 10, 12);
        c.apply_counters(CounterDelta { inserted: 3, decoded: 2, failing: 1 });
        c.apply_counters(CounterDelta { failing: -2, ..Default::default() });
        assert_eq!((c.total_events, c.processed_events, c.failed_events), (3, 2, 0));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CheckpointStatus::Idle,
            CheckpointStatus::Indexing,
            CheckpointStatus::Backfilling,
            CheckpointStatus::Error,
        ] {
            assert_eq!(s.as_str().parse::<CheckpointStatus>().unwrap(), s);
        }
    }
}
