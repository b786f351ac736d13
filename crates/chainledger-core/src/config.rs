//! Indexer configuration.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// One contract to follow and the events to ingest from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    /// Contract address (`0x…`).
    pub address: String,
    /// First block to ingest (inclusive).
    #[serde(default)]
    pub start_block: u64,
    /// Human-readable Solidity event signatures, e.g.
    /// `"event Transfer(address indexed from, address indexed to, uint256 value)"`.
    pub events: Vec<String>,
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    /// JSON-RPC endpoint of the node.
    pub rpc_url: String,
    /// Numeric chain id (e.g. `1` for Ethereum mainnet).
    pub chain_id: u64,
    /// Blocks mined on top of an event's block before it counts as finalized.
    /// Typical values: 12 (Ethereum PoS), 64 (Ethereum safe), 1 (fast chains).
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: u64,
    /// How many blocks to fetch per `eth_getLogs` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// How many times a failed decode is retried before it is left for an operator.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Fixed polling interval (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of trailing block headers retained in the block ledger.
    #[serde(default = "default_ledger_retention")]
    pub ledger_retention: u64,
    /// Upper bound on the fork-point walk-back.
    #[serde(default = "default_max_walk_back")]
    pub max_walk_back: u64,
    /// Max headers the chain watcher pulls per cycle while catching up.
    #[serde(default = "default_headers_per_cycle")]
    pub headers_per_cycle: u64,
    /// Demote finalized events even when the observed head went backwards.
    #[serde(default)]
    pub demote_on_head_regression: bool,
    /// Contracts and events to ingest.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_confirmation_threshold() -> u64 {
    12
}

fn default_batch_size() -> u64 {
    1_000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_ledger_retention() -> u64 {
    256
}

fn default_max_walk_back() -> u64 {
    1_000
}

fn default_headers_per_cycle() -> u64 {
    128
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".into(),
            chain_id: 1,
            confirmation_threshold: default_confirmation_threshold(),
            batch_size: default_batch_size(),
            retry_limit: default_retry_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            ledger_retention: default_ledger_retention(),
            max_walk_back: default_max_walk_back(),
            headers_per_cycle: default_headers_per_cycle(),
            demote_on_head_regression: false,
            subscriptions: Vec::new(),
        }
    }
}

impl IndexerConfig {
    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.rpc_url.trim().is_empty() {
            return Err(IndexerError::Config("rpcUrl must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batchSize must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IndexerError::Config("pollIntervalMs must be at least 1".into()));
        }
        if self.headers_per_cycle == 0 {
            return Err(IndexerError::Config("headersPerCycle must be at least 1".into()));
        }
        // The ledger must reach below every block that can still be demoted.
        if self.ledger_retention <= self.confirmation_threshold {
            return Err(IndexerError::Config(format!(
                "ledgerRetention ({}) must exceed confirmationThreshold ({})",
                self.ledger_retention, self.confirmation_threshold
            )));
        }
        if self.max_walk_back == 0 {
            return Err(IndexerError::Config("maxWalkBack must be at least 1".into()));
        }
        for sub in &self.subscriptions {
            if !is_hex_address(&sub.address) {
                return Err(IndexerError::Config(format!(
                    "invalid contract address '{}'",
                    sub.address
                )));
            }
            if sub.events.is_empty() {
                return Err(IndexerError::Config(format!(
                    "subscription {} lists no events",
                    sub.address
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

fn is_hex_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|h| h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
