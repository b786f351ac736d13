//! Fluent builder API for creating EVM indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainledger_evm::IndexerBuilder;
//!
//! # fn main() -> Result<(), chainledger_core::IndexerError> {
//! let indexer = IndexerBuilder::new()
//!     .rpc_url("http://localhost:8545")
//!     .chain_id(1)
//!     .confirmation_threshold(12)
//!     .batch_size(500)
//!     .subscribe(
//!         "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
//!         19_000_000,
//!         ["event Transfer(address indexed from, address indexed to, uint256 value)"],
//!     )
//!     .build()?;
//! # Ok(()) }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chainledger_core::checkpoint::CheckpointSettings;
use chainledger_core::config::{IndexerConfig, SubscriptionConfig};
use chainledger_core::error::IndexerError;
use chainledger_core::memory::MemoryStore;
use chainledger_core::source::{ChainReader, EventDecoder};
use chainledger_core::store::Storage;

use crate::decoder::AbiEventDecoder;
use crate::health::ChainHealth;
use crate::index_loop::SubscriptionWorker;
use crate::reader::JsonRpcChainReader;
use crate::service::Indexer;
use crate::transport::HttpRpcClient;

/// Fluent builder for [`Indexer`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    reader: Option<Arc<dyn ChainReader>>,
    store: Option<Arc<dyn Storage>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc_url = url.into();
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// Blocks on top of an event's block before it is finalized.
    pub fn confirmation_threshold(mut self, blocks: u64) -> Self {
        self.config.confirmation_threshold = blocks;
        self
    }

    /// Set the number of blocks per ingestion window.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn ledger_retention(mut self, blocks: u64) -> Self {
        self.config.ledger_retention = blocks;
        self
    }

    pub fn max_walk_back(mut self, blocks: u64) -> Self {
        self.config.max_walk_back = blocks;
        self
    }

    pub fn headers_per_cycle(mut self, headers: u64) -> Self {
        self.config.headers_per_cycle = headers;
        self
    }

    pub fn demote_on_head_regression(mut self, enabled: bool) -> Self {
        self.config.demote_on_head_regression = enabled;
        self
    }

    /// Follow `events` (Solidity signatures) on `address` from `start_block`.
    pub fn subscribe<I, S>(mut self, address: impl Into<String>, start_block: u64, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subscriptions.push(SubscriptionConfig {
            address: address.into(),
            start_block,
            events: events.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Use `reader` instead of a JSON-RPC client for `rpc_url`.
    pub fn reader(mut self, reader: Arc<dyn ChainReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Use `store`; defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the configuration, compile every event signature and wire
    /// the service together.
    pub fn build(self) -> Result<Indexer, IndexerError> {
        let config = self.config;
        config.validate()?;

        let reader = match self.reader {
            Some(reader) => reader,
            None => {
                let client = HttpRpcClient::default_for(config.rpc_url.clone())?;
                Arc::new(JsonRpcChainReader::new(Arc::new(client))) as Arc<dyn ChainReader>
            }
        };
        let store = match self.store {
            Some(store) => store,
            None => {
                tracing::info!("no store configured; events are kept in memory only");
                Arc::new(MemoryStore::new()) as Arc<dyn Storage>
            }
        };

        let settings = CheckpointSettings {
            batch_size: config.batch_size,
            confirmation_threshold: config.confirmation_threshold,
            retry_limit: config.retry_limit,
        };
        let health = Arc::new(ChainHealth::new());
        let mut workers = Vec::new();
        let mut seen_topics = HashSet::new();
        let mut seen_names = HashSet::new();
        for sub in &config.subscriptions {
            let address = sub.address.to_ascii_lowercase();
            for signature in &sub.events {
                let decoder = AbiEventDecoder::new(signature)?;
                // Live events are unique per (block, log index), so one log
                // must never match two subscriptions.
                if !seen_topics.insert((address.clone(), decoder.topic().to_string())) {
                    return Err(IndexerError::Config(format!(
                        "event '{}' is subscribed twice on {}",
                        decoder.signature(),
                        sub.address
                    )));
                }
                if !seen_names.insert((address.clone(), decoder.event_type().to_string())) {
                    return Err(IndexerError::Config(format!(
                        "two subscribed events on {} share the name '{}'",
                        sub.address,
                        decoder.event_type()
                    )));
                }
                workers.push(Arc::new(SubscriptionWorker::new(
                    config.chain_id,
                    &address,
                    sub.start_block,
                    settings,
                    Arc::new(decoder),
                    reader.clone(),
                    store.clone(),
                    health.clone(),
                )));
            }
        }

        Ok(Indexer::new(config, reader, store, workers, health))
    }
}
