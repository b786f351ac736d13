//! Error types for the chainledger pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting, reconciling or serving state.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The fork point could not be located inside the retained block ledger
    /// or within the walk-back bound. Requires operator intervention.
    #[error(
        "Unresolvable divergence detected at block {detected_at}: walked back to {lowest_checked} ({reason})"
    )]
    UnresolvableDivergence {
        detected_at: u64,
        lowest_checked: u64,
        reason: String,
    },

    /// A storage-level invariant was bypassed (duplicate canonical header,
    /// conflicting log position, counter mismatch...). Never repaired silently.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the same operation on the next cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }

    /// Returns `true` if the error halts the chain until an operator intervenes.
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, Self::UnresolvableDivergence { .. })
    }
}

/// A per-event decode failure. Recorded on the event, never fatal to a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("topic0 {actual} does not match event signature {expected}")]
    TopicMismatch { expected: String, actual: String },

    #[error("log has no topics")]
    MissingTopics,

    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: String, reason: String },

    #[error("ABI decode failed: {0}")]
    Abi(String),

    #[error("malformed raw payload: {0}")]
    MalformedPayload(String),
}
