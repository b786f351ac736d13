//! chainledger-storage — transactional storage backends for ChainLedger.
//!
//! Backends:
//! - [`MemoryStore`] — in-memory (tests, ephemeral runs), re-exported from core
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Every backend implements [`chainledger_core::Storage`]: checkpoints,
//! events, the block ledger and divergence records live in one database so
//! reconciliation can touch all of them in a single transaction.

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainledger_core::memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
