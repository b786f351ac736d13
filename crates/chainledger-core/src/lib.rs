//! chainledger-core — foundation of the reorg-aware event ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! Indexer ─┬─ SubscriptionWorker × N ── ChainReader → EventDecoder → EventStore → CheckpointStore
//!          └─ ChainWatcher ─┬─ DivergenceDetector  (parent-hash chain vs BlockLedger)
//!                           └─ ReconciliationEngine (orphan, sweep, recover, check)
//! ```
//!
//! This crate holds the storage traits, the detector and the reconciliation
//! engine. Backends live in `chainledger-storage`; the EVM reader, decoder and
//! service live in `chainledger-evm`.

pub mod checkpoint;
pub mod config;
pub mod divergence;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use checkpoint::{BlockWindow, Checkpoint, CheckpointSettings, CheckpointStatus, CheckpointStore, CounterDelta};
pub use config::{IndexerConfig, SubscriptionConfig};
pub use divergence::{
    Divergence, DivergenceDetector, DivergenceKind, DivergenceLog, DivergencePlan, DivergenceRecord,
    SweepOutcome,
};
pub use error::{DecodeError, IndexerError};
pub use events::{EventQuery, EventRecord, EventStatus, EventStore, InsertOutcome, NewEvent, PersistOutcome};
pub use ledger::BlockLedger;
pub use memory::MemoryStore;
pub use reconcile::{ConsistencyReport, ReconciliationEngine, SubscriptionConsistency};
pub use source::{ChainReader, EventDecoder};
pub use store::Storage;
pub use types::{BlockHeader, EventId, LedgerEntry, RawLog, SubscriptionKey};
