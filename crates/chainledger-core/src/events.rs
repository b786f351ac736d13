//! The event store: idempotent, uniquely-keyed persistence of ingested logs.
//!
//! `persist` may be called any number of times for the same physical log
//! (duplicate RPC responses, restarts, overlapping windows, a backfill racing
//! the live loop). The identity check is only an optimisation: backends must
//! enforce the identity uniqueness constraint themselves and report a
//! constraint hit as [`InsertOutcome::IdentityExists`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{confirmations, EventId, SubscriptionKey};

/// Error recorded on a reconfirmed event that never decoded, so the decode
/// retry picks it up again.
pub const REDECODE_PENDING: &str = "decode pending after reconciliation";

/// Lifecycle of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Stored, not yet deep enough to be final.
    Pending,
    /// Confirmations reached the threshold on the canonical chain.
    Confirmed,
    /// Its block was invalidated by a divergence; awaiting reconciliation.
    Orphaned,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(IndexerError::Storage(format!("unknown event status '{other}'"))),
        }
    }
}

/// A stored event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub chain_id: u64,
    pub contract_address: String,
    pub block_number: u64,
    pub block_hash: String,
    /// The log as received from the node.
    pub raw_payload: serde_json::Value,
    /// Decoded fields; `None` while decoding is failing.
    pub decoded_payload: Option<serde_json::Value>,
    pub confirmations: u64,
    pub status: EventStatus,
    pub finalized: bool,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub retry_count: u32,
    /// Divergence record that orphaned this event, if any.
    pub orphaned_by: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Subscription this event belongs to.
    pub fn subscription(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.chain_id, &self.contract_address, self.id.event_type.clone())
    }
}

/// An event about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub id: EventId,
    pub chain_id: u64,
    pub contract_address: String,
    pub block_number: u64,
    pub block_hash: String,
    pub raw_payload: serde_json::Value,
    pub decoded_payload: Option<serde_json::Value>,
    pub processing_error: Option<String>,
}

impl NewEvent {
    /// Materialise the row stored for this event under `head`.
    pub fn into_record(self, head: u64, threshold: u64, now: DateTime<Utc>) -> EventRecord {
        let confirmations = confirmations(head, self.block_number);
        let finalized = confirmations >= threshold;
        EventRecord {
            id: self.id,
            chain_id: self.chain_id,
            contract_address: self.contract_address.to_ascii_lowercase(),
            block_number: self.block_number,
            block_hash: self.block_hash,
            raw_payload: self.raw_payload,
            decoded_payload: self.decoded_payload,
            confirmations,
            status: if finalized { EventStatus::Confirmed } else { EventStatus::Pending },
            finalized,
            processed: false,
            retry_count: u32::from(self.processing_error.is_some()),
            processing_error: self.processing_error,
            orphaned_by: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Result of a raw insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same identity exists (constraint hit or pre-check).
    IdentityExists,
    /// A different live event occupies `(chain, block, log index)`.
    PositionTaken { occupant: EventId },
}

/// Result of [`EventStore::persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { finalized: bool },
    Duplicate,
    /// The identity is known but currently orphaned; the log has reappeared
    /// and the caller should reconfirm it.
    Orphaned,
}

/// Filter for the consumer hand-off query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub chain_id: Option<u64>,
    pub contract_address: Option<String>,
    pub event_type: Option<String>,
    pub status: Option<EventStatus>,
    pub finalized: Option<bool>,
    pub processed: Option<bool>,
    /// Only events whose decode is failing.
    pub failing: Option<bool>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub limit: Option<u64>,
}

impl EventQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self { chain_id: Some(chain_id), ..Default::default() }
    }

    /// All events of one subscription.
    pub fn subscription(key: &SubscriptionKey) -> Self {
        Self {
            chain_id: Some(key.chain_id),
            contract_address: Some(key.contract_address.clone()),
            event_type: Some(key.event_type.clone()),
            ..Default::default()
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn finalized(mut self, finalized: bool) -> Self {
        self.finalized = Some(finalized);
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = Some(true);
        self
    }

    pub fn blocks(mut self, from: u64, to: u64) -> Self {
        self.from_block = Some(from);
        self.to_block = Some(to);
        self
    }

    /// Blocks at or above `from`.
    pub fn since_block(mut self, from: u64) -> Self {
        self.from_block = Some(from);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `record` passes every set filter.
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.chain_id.map_or(true, |c| record.chain_id == c)
            && self
                .contract_address
                .as_deref()
                .map_or(true, |a| record.contract_address.eq_ignore_ascii_case(a))
            && self.event_type.as_deref().map_or(true, |t| record.id.event_type == t)
            && self.status.map_or(true, |s| record.status == s)
            && self.finalized.map_or(true, |f| record.finalized == f)
            && self.processed.map_or(true, |p| record.processed == p)
            && self.failing.map_or(true, |f| record.processing_error.is_some() == f)
            && self.from_block.map_or(true, |b| record.block_number >= b)
            && self.to_block.map_or(true, |b| record.block_number <= b)
    }
}

/// Durable, uniquely-keyed event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_event(&self, id: &EventId) -> Result<Option<EventRecord>, IndexerError>;

    /// Insert `record`, relying on the backend's uniqueness constraints.
    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, IndexerError>;

    /// Events matching `query`, ordered by `(block_number, log_index)`.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, IndexerError>;

    async fn count_events(&self, query: &EventQuery) -> Result<u64, IndexerError>;

    /// Store the outcome of a decode retry: success replaces the decoded
    /// payload and clears the error; failure records the error and bumps
    /// `retry_count`.
    async fn record_decode_result(
        &self,
        id: &EventId,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), IndexerError>;

    /// Consumer acknowledgement. Only finalized events can be marked; returns
    /// `false` if the event is missing or not finalized.
    async fn mark_processed(&self, id: &EventId) -> Result<bool, IndexerError>;

    /// Idempotent persist: a no-op for known identities, an insert otherwise.
    async fn persist(
        &self,
        event: NewEvent,
        head: u64,
        threshold: u64,
    ) -> Result<PersistOutcome, IndexerError> {
        if let Some(existing) = self.find_event(&event.id).await? {
            return Ok(if existing.status == EventStatus::Orphaned {
                PersistOutcome::Orphaned
            } else {
                PersistOutcome::Duplicate
            });
        }
        let record = event.into_record(head, threshold, Utc::now());
        match self.insert_event(&record).await? {
            InsertOutcome::Inserted => Ok(PersistOutcome::Inserted { finalized: record.finalized }),
            InsertOutcome::IdentityExists => Ok(PersistOutcome::Duplicate),
            InsertOutcome::PositionTaken { occupant } => Err(IndexerError::Invariant(format!(
                "log position {}#{} on chain {} is held by live event {occupant}; \
                 a competing fork has not been reconciled yet",
                record.block_number, record.id.log_index, record.chain_id
            ))),
        }
    }
}
