//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The identity of a chain block, enough to verify the parent-hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash.eq_ignore_ascii_case(&parent.hash)
    }
}

/// A header as held by the block ledger, with its canonical flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub header: BlockHeader,
    pub canonical: bool,
}

// ─── RawLog ───────────────────────────────────────────────────────────────────

/// A contract log as returned by the chain reader, already parsed out of the
/// node's hex-quantity encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u64,
    /// Set by the node when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// topic0, the event signature hash, if any.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── Identities ──────────────────────────────────────────────────────────────

/// One subscription: a contract × event type on a chain. Addresses are stored
/// lower-cased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub chain_id: u64,
    pub contract_address: String,
    pub event_type: String,
}

impl SubscriptionKey {
    pub fn new(chain_id: u64, contract_address: &str, event_type: impl Into<String>) -> Self {
        Self {
            chain_id,
            contract_address: contract_address.to_ascii_lowercase(),
            event_type: event_type.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.contract_address, self.event_type)
    }
}

/// The identity of one physical log for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub tx_hash: String,
    pub log_index: u64,
    pub event_type: String,
}

impl EventId {
    pub fn new(tx_hash: &str, log_index: u64, event_type: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.to_ascii_lowercase(),
            log_index,
            event_type: event_type.into(),
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}:{}", self.tx_hash, self.log_index, self.event_type)
    }
}

/// Confirmations of `block` under `head`.
pub fn confirmations(head: u64, block: u64) -> u64 {
    head.saturating_sub(block)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (number * 12) as i64,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = header(100, "0xaaa", "0x000");
        let child = header(101, "0xbbb", "0xAAA");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = header(100, "0xaaa", "0x000");
        let b = header(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let a = SubscriptionKey::new(1, "0xAbCdEf", "Transfer");
        let b = SubscriptionKey::new(1, "0xabcdef", "Transfer");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "1:0xabcdef:Transfer");

        let e = EventId::new("0xDEAD", 3, "Transfer");
        assert_eq!(e.tx_hash, "0xdead");
    }

    #[test]
    fn confirmations_saturate() {
        assert_eq!(confirmations(112, 100), 12);
        assert_eq!(confirmations(90, 100), 0);
    }
}
