//! SQLite storage backend for ChainLedger.
//!
//! Persists checkpoints, events, block headers and divergence records to a
//! single SQLite file. Uniqueness rules are enforced by the schema:
//!
//! - `events` primary key `(tx_hash, log_index, event_type)`
//! - partial unique index on `(chain_id, block_number, log_index)` for rows
//!   that are not orphaned
//! - partial unique index on `(chain_id, number)` for canonical headers
//!
//! Multi-table operations run inside one `sqlx` transaction.
//!
//! # Usage
//! ```rust,no_run
//! use chainledger_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use chainledger_core::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, CounterDelta};
use chainledger_core::divergence::{
    DivergenceKind, DivergenceLog, DivergencePlan, DivergenceRecord, SweepOutcome,
};
use chainledger_core::error::IndexerError;
use chainledger_core::events::{
    EventQuery, EventRecord, EventStatus, EventStore, InsertOutcome, REDECODE_PENDING,
};
use chainledger_core::ledger::BlockLedger;
use chainledger_core::types::{BlockHeader, EventId, LedgerEntry, SubscriptionKey};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id               INTEGER NOT NULL,
        contract_address       TEXT    NOT NULL,
        event_type             TEXT    NOT NULL,
        last_processed_block   INTEGER,
        last_scanned_block     INTEGER,
        last_finalized_block   INTEGER,
        status                 TEXT    NOT NULL,
        error_message          TEXT,
        total_events           INTEGER NOT NULL DEFAULT 0,
        processed_events       INTEGER NOT NULL DEFAULT 0,
        failed_events          INTEGER NOT NULL DEFAULT 0,
        batch_size             INTEGER NOT NULL,
        confirmation_threshold INTEGER NOT NULL,
        retry_limit            INTEGER NOT NULL,
        created_at             TEXT    NOT NULL,
        updated_at             TEXT    NOT NULL,
        PRIMARY KEY (chain_id, contract_address, event_type)
    );",
    "CREATE TABLE IF NOT EXISTS events (
        tx_hash          TEXT    NOT NULL,
        log_index        INTEGER NOT NULL,
        event_type       TEXT    NOT NULL,
        chain_id         INTEGER NOT NULL,
        contract_address TEXT    NOT NULL,
        block_number     INTEGER NOT NULL,
        block_hash       TEXT    NOT NULL,
        raw_payload      TEXT    NOT NULL,
        decoded_payload  TEXT,
        confirmations    INTEGER NOT NULL,
        status           TEXT    NOT NULL,
        finalized        INTEGER NOT NULL,
        processed        INTEGER NOT NULL,
        processing_error TEXT,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        orphaned_by      INTEGER,
        created_at       TEXT    NOT NULL,
        updated_at       TEXT    NOT NULL,
        processed_at     TEXT,
        PRIMARY KEY (tx_hash, log_index, event_type)
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_events_live_position
        ON events (chain_id, block_number, log_index) WHERE status != 'orphaned';",
    "CREATE INDEX IF NOT EXISTS idx_events_subscription
        ON events (chain_id, contract_address, event_type, block_number);",
    "CREATE INDEX IF NOT EXISTS idx_events_status ON events (chain_id, status, block_number);",
    "CREATE TABLE IF NOT EXISTS block_headers (
        chain_id    INTEGER NOT NULL,
        number      INTEGER NOT NULL,
        hash        TEXT    NOT NULL,
        parent_hash TEXT    NOT NULL,
        timestamp   INTEGER NOT NULL,
        canonical   INTEGER NOT NULL,
        PRIMARY KEY (chain_id, number, hash)
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_headers_canonical
        ON block_headers (chain_id, number) WHERE canonical = 1;",
    "CREATE TABLE IF NOT EXISTS divergences (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        chain_id          INTEGER NOT NULL,
        kind              TEXT    NOT NULL,
        detected_at       TEXT    NOT NULL,
        detected_at_block INTEGER NOT NULL,
        fork_point        INTEGER NOT NULL,
        depth             INTEGER NOT NULL,
        range_start       INTEGER NOT NULL,
        range_end         INTEGER NOT NULL,
        orphaned          TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS reconciliations (
        divergence_id INTEGER NOT NULL REFERENCES divergences (id),
        tx_hash       TEXT    NOT NULL,
        log_index     INTEGER NOT NULL,
        event_type    TEXT    NOT NULL,
        reconciled_at TEXT    NOT NULL,
        PRIMARY KEY (divergence_id, tx_hash, log_index, event_type)
    );",
];

const EVENT_COLUMNS: &str = "tx_hash, log_index, event_type, chain_id, contract_address, block_number, \
    block_hash, raw_payload, decoded_payload, confirmations, status, finalized, processed, \
    processing_error, retry_count, orphaned_by, created_at, updated_at, processed_at";

fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

fn json(e: serde_json::Error) -> IndexerError {
    IndexerError::Storage(format!("corrupt JSON column: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|d| d.is_unique_violation())
}

fn opt_u64(v: Option<i64>) -> Option<u64> {
    v.map(|n| n as u64)
}

/// SQLite-backed implementation of every store trait.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(db)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!(%url, "sqlite storage opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Restricted to one connection that is never recycled: every pooled
    /// connection to `sqlite::memory:` sees its own empty database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    // ─── Row mapping ─────────────────────────────────────────────────────────

    fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, IndexerError> {
        let status: String = row.try_get("status").map_err(db)?;
        Ok(Checkpoint {
            key: SubscriptionKey {
                chain_id: row.try_get::<i64, _>("chain_id").map_err(db)? as u64,
                contract_address: row.try_get("contract_address").map_err(db)?,
                event_type: row.try_get("event_type").map_err(db)?,
            },
            last_processed_block: opt_u64(row.try_get("last_processed_block").map_err(db)?),
            last_scanned_block: opt_u64(row.try_get("last_scanned_block").map_err(db)?),
            last_finalized_block: opt_u64(row.try_get("last_finalized_block").map_err(db)?),
            status: status.parse::<CheckpointStatus>()?,
            error_message: row.try_get("error_message").map_err(db)?,
            total_events: row.try_get::<i64, _>("total_events").map_err(db)? as u64,
            processed_events: row.try_get::<i64, _>("processed_events").map_err(db)? as u64,
            failed_events: row.try_get::<i64, _>("failed_events").map_err(db)? as u64,
            batch_size: row.try_get::<i64, _>("batch_size").map_err(db)? as u64,
            confirmation_threshold: row.try_get::<i64, _>("confirmation_threshold").map_err(db)? as u64,
            retry_limit: row.try_get::<i64, _>("retry_limit").map_err(db)? as u32,
            created_at: row.try_get("created_at").map_err(db)?,
            updated_at: row.try_get("updated_at").map_err(db)?,
        })
    }

    fn event_from_row(row: &SqliteRow) -> Result<EventRecord, IndexerError> {
        let raw: String = row.try_get("raw_payload").map_err(db)?;
        let decoded: Option<String> = row.try_get("decoded_payload").map_err(db)?;
        let status: String = row.try_get("status").map_err(db)?;
        Ok(EventRecord {
            id: EventId {
                tx_hash: row.try_get("tx_hash").map_err(db)?,
                log_index: row.try_get::<i64, _>("log_index").map_err(db)? as u64,
                event_type: row.try_get("event_type").map_err(db)?,
            },
            chain_id: row.try_get::<i64, _>("chain_id").map_err(db)? as u64,
            contract_address: row.try_get("contract_address").map_err(db)?,
            block_number: row.try_get::<i64, _>("block_number").map_err(db)? as u64,
            block_hash: row.try_get("block_hash").map_err(db)?,
            raw_payload: serde_json::from_str(&raw).map_err(json)?,
            decoded_payload: decoded.map(|d| serde_json::from_str(&d)).transpose().map_err(json)?,
            confirmations: row.try_get::<i64, _>("confirmations").map_err(db)? as u64,
            status: status.parse::<EventStatus>()?,
            finalized: row.try_get("finalized").map_err(db)?,
            processed: row.try_get("processed").map_err(db)?,
            processing_error: row.try_get("processing_error").map_err(db)?,
            retry_count: row.try_get::<i64, _>("retry_count").map_err(db)? as u32,
            orphaned_by: opt_u64(row.try_get("orphaned_by").map_err(db)?),
            created_at: row.try_get("created_at").map_err(db)?,
            updated_at: row.try_get("updated_at").map_err(db)?,
            processed_at: row.try_get("processed_at").map_err(db)?,
        })
    }

    fn header_from_row(row: &SqliteRow) -> Result<BlockHeader, IndexerError> {
        Ok(BlockHeader {
            number: row.try_get::<i64, _>("number").map_err(db)? as u64,
            hash: row.try_get("hash").map_err(db)?,
            parent_hash: row.try_get("parent_hash").map_err(db)?,
            timestamp: row.try_get("timestamp").map_err(db)?,
        })
    }

    fn divergence_from_row(row: &SqliteRow) -> Result<DivergenceRecord, IndexerError> {
        let kind: String = row.try_get("kind").map_err(db)?;
        let orphaned: String = row.try_get("orphaned").map_err(db)?;
        Ok(DivergenceRecord {
            id: row.try_get::<i64, _>("id").map_err(db)? as u64,
            chain_id: row.try_get::<i64, _>("chain_id").map_err(db)? as u64,
            kind: kind.parse::<DivergenceKind>()?,
            detected_at: row.try_get("detected_at").map_err(db)?,
            detected_at_block: row.try_get::<i64, _>("detected_at_block").map_err(db)? as u64,
            fork_point: row.try_get::<i64, _>("fork_point").map_err(db)? as u64,
            depth: row.try_get::<i64, _>("depth").map_err(db)? as u64,
            range_start: row.try_get::<i64, _>("range_start").map_err(db)? as u64,
            range_end: row.try_get::<i64, _>("range_end").map_err(db)? as u64,
            orphaned: serde_json::from_str(&orphaned).map_err(json)?,
            reconciled: Vec::new(),
        })
    }

    // ─── Transaction helpers ─────────────────────────────────────────────────

    async fn insert_divergence(
        tx: &mut Transaction<'_, Sqlite>,
        chain_id: u64,
        plan: &DivergencePlan,
    ) -> Result<u64, IndexerError> {
        let result = sqlx::query(
            "INSERT INTO divergences
                (chain_id, kind, detected_at, detected_at_block, fork_point, depth, range_start, range_end, orphaned)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, '[]')",
        )
        .bind(chain_id as i64)
        .bind(plan.kind.as_str())
        .bind(plan.detected_at)
        .bind(plan.detected_at_block as i64)
        .bind(plan.fork_point as i64)
        .bind(plan.depth() as i64)
        .bind(plan.range_start() as i64)
        .bind(plan.range_end as i64)
        .execute(&mut **tx)
        .await
        .map_err(db)?;
        Ok(result.last_insert_rowid() as u64)
    }

    /// Orphan `events` under `record_id`, fix up failing-decode counters and
    /// store the orphaned identities on the record.
    async fn orphan_events(
        tx: &mut Transaction<'_, Sqlite>,
        events: &[EventRecord],
        record_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventId>, IndexerError> {
        let mut orphaned = Vec::with_capacity(events.len());
        let mut failing: HashMap<SubscriptionKey, i64> = HashMap::new();
        for event in events {
            let result = sqlx::query(
                "UPDATE events
                 SET status = 'orphaned', finalized = 0, processed = 0, processed_at = NULL,
                     processing_error = NULL, retry_count = 0, orphaned_by = ?, updated_at = ?
                 WHERE tx_hash = ? AND log_index = ? AND event_type = ? AND status != 'orphaned'",
            )
            .bind(record_id as i64)
            .bind(now)
            .bind(&event.id.tx_hash)
            .bind(event.id.log_index as i64)
            .bind(&event.id.event_type)
            .execute(&mut **tx)
            .await
            .map_err(db)?;
            if result.rows_affected() == 0 {
                continue;
            }
            if event.processing_error.is_some() {
                *failing.entry(event.subscription()).or_default() += 1;
            }
            orphaned.push(event.id.clone());
        }

        for (key, count) in failing {
            sqlx::query(
                "UPDATE checkpoints SET failed_events = MAX(failed_events - ?, 0)
                 WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
            )
            .bind(count)
            .bind(key.chain_id as i64)
            .bind(&key.contract_address)
            .bind(&key.event_type)
            .execute(&mut **tx)
            .await
            .map_err(db)?;
        }

        let ids = serde_json::to_string(&orphaned).map_err(json)?;
        sqlx::query("UPDATE divergences SET orphaned = ? WHERE id = ?")
            .bind(ids)
            .bind(record_id as i64)
            .execute(&mut **tx)
            .await
            .map_err(db)?;
        Ok(orphaned)
    }

    async fn upsert_canonical(
        tx: &mut Transaction<'_, Sqlite>,
        chain_id: u64,
        header: &BlockHeader,
    ) -> Result<(), IndexerError> {
        let hash = header.hash.to_ascii_lowercase();
        sqlx::query(
            "UPDATE block_headers SET canonical = 0
             WHERE chain_id = ? AND number = ? AND hash != ?",
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(&hash)
        .execute(&mut **tx)
        .await
        .map_err(db)?;
        sqlx::query(
            "INSERT INTO block_headers (chain_id, number, hash, parent_hash, timestamp, canonical)
             VALUES (?, ?, ?, ?, ?, 1)
             ON CONFLICT (chain_id, number, hash) DO UPDATE SET
                canonical = 1, parent_hash = excluded.parent_hash, timestamp = excluded.timestamp",
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(&hash)
        .bind(header.parent_hash.to_ascii_lowercase())
        .bind(header.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn load_divergence(
        tx: &mut Transaction<'_, Sqlite>,
        record_id: u64,
    ) -> Result<DivergenceRecord, IndexerError> {
        let row = sqlx::query("SELECT * FROM divergences WHERE id = ?")
            .bind(record_id as i64)
            .fetch_one(&mut **tx)
            .await
            .map_err(db)?;
        Self::divergence_from_row(&row)
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a EventQuery) {
        builder.push(" WHERE 1 = 1");
        if let Some(chain_id) = query.chain_id {
            builder.push(" AND chain_id = ").push_bind(chain_id as i64);
        }
        if let Some(address) = &query.contract_address {
            builder.push(" AND contract_address = ").push_bind(address.to_ascii_lowercase());
        }
        if let Some(event_type) = &query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(finalized) = query.finalized {
            builder.push(" AND finalized = ").push_bind(finalized);
        }
        if let Some(processed) = query.processed {
            builder.push(" AND processed = ").push_bind(processed);
        }
        match query.failing {
            Some(true) => {
                builder.push(" AND processing_error IS NOT NULL");
            }
            Some(false) => {
                builder.push(" AND processing_error IS NULL");
            }
            None => {}
        }
        if let Some(from) = query.from_block {
            builder.push(" AND block_number >= ").push_bind(from as i64);
        }
        if let Some(to) = query.to_block {
            builder.push(" AND block_number <= ").push_bind(to as i64);
        }
    }
}

// ─── CheckpointStore ─────────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load_checkpoint(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
        )
        .bind(key.chain_id as i64)
        .bind(&key.contract_address)
        .bind(&key.event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    async fn get_or_create_checkpoint(&self, seed: Checkpoint) -> Result<Checkpoint, IndexerError> {
        sqlx::query(
            "INSERT INTO checkpoints
                (chain_id, contract_address, event_type, last_processed_block, last_scanned_block,
                 last_finalized_block, status, error_message, total_events, processed_events,
                 failed_events, batch_size, confirmation_threshold, retry_limit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(seed.key.chain_id as i64)
        .bind(&seed.key.contract_address)
        .bind(&seed.key.event_type)
        .bind(seed.last_processed_block.map(|b| b as i64))
        .bind(seed.last_scanned_block.map(|b| b as i64))
        .bind(seed.last_finalized_block.map(|b| b as i64))
        .bind(seed.status.as_str())
        .bind(&seed.error_message)
        .bind(seed.total_events as i64)
        .bind(seed.processed_events as i64)
        .bind(seed.failed_events as i64)
        .bind(seed.batch_size as i64)
        .bind(seed.confirmation_threshold as i64)
        .bind(seed.retry_limit as i64)
        .bind(seed.created_at)
        .bind(seed.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        self.load_checkpoint(&seed.key)
            .await?
            .ok_or_else(|| IndexerError::Storage(format!("checkpoint {} vanished after insert", seed.key)))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO checkpoints
                (chain_id, contract_address, event_type, last_processed_block, last_scanned_block,
                 last_finalized_block, status, error_message, total_events, processed_events,
                 failed_events, batch_size, confirmation_threshold, retry_limit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, contract_address, event_type) DO UPDATE SET
                last_processed_block   = excluded.last_processed_block,
                last_scanned_block     = excluded.last_scanned_block,
                last_finalized_block   = excluded.last_finalized_block,
                status                 = excluded.status,
                error_message          = excluded.error_message,
                batch_size             = excluded.batch_size,
                confirmation_threshold = excluded.confirmation_threshold,
                retry_limit            = excluded.retry_limit,
                updated_at             = excluded.updated_at",
        )
        .bind(checkpoint.key.chain_id as i64)
        .bind(&checkpoint.key.contract_address)
        .bind(&checkpoint.key.event_type)
        .bind(checkpoint.last_processed_block.map(|b| b as i64))
        .bind(checkpoint.last_scanned_block.map(|b| b as i64))
        .bind(checkpoint.last_finalized_block.map(|b| b as i64))
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.error_message)
        .bind(checkpoint.total_events as i64)
        .bind(checkpoint.processed_events as i64)
        .bind(checkpoint.failed_events as i64)
        .bind(checkpoint.batch_size as i64)
        .bind(checkpoint.confirmation_threshold as i64)
        .bind(checkpoint.retry_limit as i64)
        .bind(checkpoint.created_at)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn compare_and_save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<bool, IndexerError> {
        let result = sqlx::query(
            "UPDATE checkpoints SET
                last_processed_block = ?, last_scanned_block = ?, last_finalized_block = ?,
                status = ?, error_message = ?, batch_size = ?, confirmation_threshold = ?,
                retry_limit = ?, updated_at = ?
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND last_processed_block IS ?",
        )
        .bind(checkpoint.last_processed_block.map(|b| b as i64))
        .bind(checkpoint.last_scanned_block.map(|b| b as i64))
        .bind(checkpoint.last_finalized_block.map(|b| b as i64))
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.error_message)
        .bind(checkpoint.batch_size as i64)
        .bind(checkpoint.confirmation_threshold as i64)
        .bind(checkpoint.retry_limit as i64)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.key.chain_id as i64)
        .bind(&checkpoint.key.contract_address)
        .bind(&checkpoint.key.event_type)
        .bind(expected.map(|b| b as i64))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn bump_counters(&self, key: &SubscriptionKey, delta: CounterDelta) -> Result<(), IndexerError> {
        let result = sqlx::query(
            "UPDATE checkpoints SET
                total_events     = total_events + ?,
                processed_events = processed_events + ?,
                failed_events    = MAX(failed_events + ?, 0),
                updated_at       = ?
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
        )
        .bind(delta.inserted as i64)
        .bind(delta.decoded as i64)
        .bind(delta.failing)
        .bind(Utc::now())
        .bind(key.chain_id as i64)
        .bind(&key.contract_address)
        .bind(&key.event_type)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(IndexerError::NotFound(format!("checkpoint {key}")));
        }
        Ok(())
    }

    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE chain_id = ?
             ORDER BY contract_address, event_type",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(Self::checkpoint_from_row).collect()
    }
}

// ─── EventStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl EventStore for SqliteStorage {
    async fn find_event(&self, id: &EventId) -> Result<Option<EventRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE tx_hash = ? AND log_index = ? AND event_type = ?"
        ))
        .bind(&id.tx_hash)
        .bind(id.log_index as i64)
        .bind(&id.event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(Self::event_from_row).transpose()
    }

    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, IndexerError> {
        let raw = serde_json::to_string(&record.raw_payload).map_err(json)?;
        let decoded = record
            .decoded_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json)?;

        let result = sqlx::query(&format!(
            "INSERT INTO events ({EVENT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING"
        ))
        .bind(&record.id.tx_hash)
        .bind(record.id.log_index as i64)
        .bind(&record.id.event_type)
        .bind(record.chain_id as i64)
        .bind(record.contract_address.to_ascii_lowercase())
        .bind(record.block_number as i64)
        .bind(&record.block_hash)
        .bind(raw)
        .bind(decoded)
        .bind(record.confirmations as i64)
        .bind(record.status.as_str())
        .bind(record.finalized)
        .bind(record.processed)
        .bind(&record.processing_error)
        .bind(record.retry_count as i64)
        .bind(record.orphaned_by.map(|id| id as i64))
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 1 {
            debug!(event = %record.id, block = record.block_number, "event stored");
            return Ok(InsertOutcome::Inserted);
        }
        if self.find_event(&record.id).await?.is_some() {
            return Ok(InsertOutcome::IdentityExists);
        }
        let occupant = sqlx::query(
            "SELECT tx_hash, log_index, event_type FROM events
             WHERE chain_id = ? AND block_number = ? AND log_index = ? AND status != 'orphaned'",
        )
        .bind(record.chain_id as i64)
        .bind(record.block_number as i64)
        .bind(record.id.log_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        match occupant {
            Some(row) => Ok(InsertOutcome::PositionTaken {
                occupant: EventId {
                    tx_hash: row.try_get("tx_hash").map_err(db)?,
                    log_index: row.try_get::<i64, _>("log_index").map_err(db)? as u64,
                    event_type: row.try_get("event_type").map_err(db)?,
                },
            }),
            None => Err(IndexerError::Storage(format!(
                "insert of {} hit a conflict that no longer exists",
                record.id
            ))),
        }
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, IndexerError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
        Self::push_filters(&mut builder, query);
        builder.push(" ORDER BY block_number, log_index");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder.build().fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn count_events(&self, query: &EventQuery) -> Result<u64, IndexerError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS cnt FROM events");
        Self::push_filters(&mut builder, query);
        let row = builder.build().fetch_one(&self.pool).await.map_err(db)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(db)? as u64)
    }

    async fn record_decode_result(
        &self,
        id: &EventId,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), IndexerError> {
        let query = match result {
            Ok(decoded) => sqlx::query(
                "UPDATE events SET decoded_payload = ?, processing_error = NULL, updated_at = ?
                 WHERE tx_hash = ? AND log_index = ? AND event_type = ?",
            )
            .bind(serde_json::to_string(&decoded).map_err(json)?),
            Err(message) => sqlx::query(
                "UPDATE events SET processing_error = ?, retry_count = retry_count + 1, updated_at = ?
                 WHERE tx_hash = ? AND log_index = ? AND event_type = ?",
            )
            .bind(message),
        };
        let result = query
            .bind(Utc::now())
            .bind(&id.tx_hash)
            .bind(id.log_index as i64)
            .bind(&id.event_type)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(IndexerError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn mark_processed(&self, id: &EventId) -> Result<bool, IndexerError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE events SET processed = 1, processed_at = ?, updated_at = ?
             WHERE tx_hash = ? AND log_index = ? AND event_type = ? AND finalized = 1",
        )
        .bind(now)
        .bind(now)
        .bind(&id.tx_hash)
        .bind(id.log_index as i64)
        .bind(&id.event_type)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }
}

// ─── BlockLedger ─────────────────────────────────────────────────────────────

#[async_trait]
impl BlockLedger for SqliteStorage {
    async fn canonical_header(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<BlockHeader>, IndexerError> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM block_headers
             WHERE chain_id = ? AND number = ? AND canonical = 1",
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(Self::header_from_row).transpose()
    }

    async fn ledger_tip(&self, chain_id: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM block_headers
             WHERE chain_id = ? AND canonical = 1 ORDER BY number DESC LIMIT 1",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(Self::header_from_row).transpose()
    }

    async fn ledger_floor(&self, chain_id: u64) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query(
            "SELECT MIN(number) AS floor FROM block_headers WHERE chain_id = ? AND canonical = 1",
        )
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(opt_u64(row.try_get("floor").map_err(db)?))
    }

    async fn record_header(&self, chain_id: u64, header: &BlockHeader) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let existing = sqlx::query(
            "SELECT hash FROM block_headers WHERE chain_id = ? AND number = ? AND canonical = 1",
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        if let Some(row) = existing {
            let hash: String = row.try_get("hash").map_err(db)?;
            if hash.eq_ignore_ascii_case(&header.hash) {
                return Ok(());
            }
            return Err(IndexerError::Invariant(format!(
                "block {} on chain {chain_id} already has canonical header {hash}",
                header.number
            )));
        }
        let inserted = sqlx::query(
            "INSERT INTO block_headers (chain_id, number, hash, parent_hash, timestamp, canonical)
             VALUES (?, ?, ?, ?, ?, 1)
             ON CONFLICT (chain_id, number, hash) DO UPDATE SET canonical = 1",
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(header.hash.to_ascii_lowercase())
        .bind(header.parent_hash.to_ascii_lowercase())
        .bind(header.timestamp)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(IndexerError::Invariant(format!(
                    "concurrent canonical header at block {} on chain {chain_id}",
                    header.number
                )));
            }
            Err(e) => return Err(db(e)),
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn ledger_entries(
        &self,
        chain_id: u64,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerEntry>, IndexerError> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp, canonical FROM block_headers
             WHERE chain_id = ? AND number BETWEEN ? AND ? ORDER BY number, canonical DESC",
        )
        .bind(chain_id as i64)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(|row| {
                Ok(LedgerEntry {
                    header: Self::header_from_row(row)?,
                    canonical: row.try_get("canonical").map_err(db)?,
                })
            })
            .collect()
    }

    async fn prune_headers(&self, chain_id: u64, below: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM block_headers WHERE chain_id = ? AND number < ?")
            .bind(chain_id as i64)
            .bind(below.min(i64::MAX as u64) as i64)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn reset_ledger(&self, chain_id: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM block_headers WHERE chain_id = ?")
            .bind(chain_id as i64)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }
}

// ─── DivergenceLog ───────────────────────────────────────────────────────────

#[async_trait]
impl DivergenceLog for SqliteStorage {
    async fn apply_divergence(
        &self,
        chain_id: u64,
        plan: &DivergencePlan,
    ) -> Result<DivergenceRecord, IndexerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db)?;
        let record_id = Self::insert_divergence(&mut tx, chain_id, plan).await?;

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE chain_id = ? AND status != 'orphaned' AND block_number BETWEEN ? AND ?"
        ))
        .bind(chain_id as i64)
        .bind(plan.range_start() as i64)
        .bind(plan.range_end as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        let affected = rows.iter().map(Self::event_from_row).collect::<Result<Vec<_>, _>>()?;
        Self::orphan_events(&mut tx, &affected, record_id, now).await?;

        sqlx::query(
            "UPDATE block_headers SET canonical = 0
             WHERE chain_id = ? AND number BETWEEN ? AND ?",
        )
        .bind(chain_id as i64)
        .bind(plan.range_start() as i64)
        .bind(plan.range_end as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        for header in &plan.replacement {
            Self::upsert_canonical(&mut tx, chain_id, header).await?;
        }

        let record = Self::load_divergence(&mut tx, record_id).await?;
        tx.commit().await.map_err(db)?;
        Ok(record)
    }

    async fn apply_sweep(
        &self,
        chain_id: u64,
        head: u64,
        threshold: u64,
    ) -> Result<SweepOutcome, IndexerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db)?;

        let updated = sqlx::query(
            "UPDATE events SET confirmations = MAX(? - block_number, 0), updated_at = ?
             WHERE chain_id = ? AND status != 'orphaned' AND confirmations != MAX(? - block_number, 0)",
        )
        .bind(head as i64)
        .bind(now)
        .bind(chain_id as i64)
        .bind(head as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        let promoted = sqlx::query(
            "UPDATE events SET finalized = 1, status = 'confirmed', updated_at = ?
             WHERE chain_id = ? AND status != 'orphaned' AND finalized = 0 AND confirmations >= ?",
        )
        .bind(now)
        .bind(chain_id as i64)
        .bind(threshold as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE chain_id = ? AND status != 'orphaned' AND finalized = 1 AND confirmations < ?"
        ))
        .bind(chain_id as i64)
        .bind(threshold as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        let demote = rows.iter().map(Self::event_from_row).collect::<Result<Vec<_>, _>>()?;

        let mut outcome = SweepOutcome { updated, promoted, demoted: None };
        if let Some(highest) = demote.iter().map(|e| e.block_number).max() {
            let plan = DivergencePlan::sweep(head, threshold, highest);
            let record_id = Self::insert_divergence(&mut tx, chain_id, &plan).await?;
            Self::orphan_events(&mut tx, &demote, record_id, now).await?;
            outcome.demoted = Some(Self::load_divergence(&mut tx, record_id).await?);
        }
        tx.commit().await.map_err(db)?;
        Ok(outcome)
    }

    async fn reconfirm_event(
        &self,
        id: &EventId,
        block_number: u64,
        block_hash: &str,
        head: u64,
        threshold: u64,
    ) -> Result<bool, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE tx_hash = ? AND log_index = ? AND event_type = ?"
        ))
        .bind(&id.tx_hash)
        .bind(id.log_index as i64)
        .bind(&id.event_type)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        let Some(event) = row.as_ref().map(Self::event_from_row).transpose()? else {
            return Ok(false);
        };
        if event.status != EventStatus::Orphaned {
            return Ok(false);
        }

        let occupant = sqlx::query(
            "SELECT tx_hash FROM events
             WHERE chain_id = ? AND block_number = ? AND log_index = ? AND status != 'orphaned'",
        )
        .bind(event.chain_id as i64)
        .bind(block_number as i64)
        .bind(id.log_index as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        if let Some(row) = occupant {
            let tx_hash: String = row.try_get("tx_hash").map_err(db)?;
            return Err(IndexerError::Invariant(format!(
                "cannot reconfirm {id}: position {block_number}#{} is held by {tx_hash}",
                id.log_index
            )));
        }

        let now = Utc::now();
        let confirmations = head.saturating_sub(block_number);
        let finalized = confirmations >= threshold;
        let status = if finalized { EventStatus::Confirmed } else { EventStatus::Pending };
        let needs_decode = event.decoded_payload.is_none();
        sqlx::query(
            "UPDATE events SET block_number = ?, block_hash = ?, confirmations = ?, finalized = ?,
                status = ?, processing_error = ?, updated_at = ?
             WHERE tx_hash = ? AND log_index = ? AND event_type = ?",
        )
        .bind(block_number as i64)
        .bind(block_hash)
        .bind(confirmations as i64)
        .bind(finalized)
        .bind(status.as_str())
        .bind(needs_decode.then_some(REDECODE_PENDING))
        .bind(now)
        .bind(&id.tx_hash)
        .bind(id.log_index as i64)
        .bind(&id.event_type)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if needs_decode {
            let key = event.subscription();
            sqlx::query(
                "UPDATE checkpoints SET failed_events = failed_events + 1
                 WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
            )
            .bind(key.chain_id as i64)
            .bind(&key.contract_address)
            .bind(&key.event_type)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        if let Some(record_id) = event.orphaned_by {
            sqlx::query(
                "INSERT INTO reconciliations (divergence_id, tx_hash, log_index, event_type, reconciled_at)
                 VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(record_id as i64)
            .bind(&id.tx_hash)
            .bind(id.log_index as i64)
            .bind(&id.event_type)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(true)
    }

    async fn divergences(&self, chain_id: u64) -> Result<Vec<DivergenceRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM divergences WHERE chain_id = ? ORDER BY id")
            .bind(chain_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let mut records = rows.iter().map(Self::divergence_from_row).collect::<Result<Vec<_>, _>>()?;

        let reconciled = sqlx::query(
            "SELECT r.divergence_id, r.tx_hash, r.log_index, r.event_type
             FROM reconciliations r JOIN divergences d ON d.id = r.divergence_id
             WHERE d.chain_id = ? ORDER BY r.reconciled_at, r.rowid",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let mut by_record: HashMap<u64, Vec<EventId>> = HashMap::new();
        for row in &reconciled {
            let record_id = row.try_get::<i64, _>("divergence_id").map_err(db)? as u64;
            by_record.entry(record_id).or_default().push(EventId {
                tx_hash: row.try_get("tx_hash").map_err(db)?,
                log_index: row.try_get::<i64, _>("log_index").map_err(db)? as u64,
                event_type: row.try_get("event_type").map_err(db)?,
            });
        }
        for record in &mut records {
            record.reconciled = by_record.remove(&record.id).unwrap_or_default();
        }
        Ok(records)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
