//! chainledger-evm — EVM chain support for ChainLedger.
//!
//! - [`transport`] — JSON-RPC 2.0 over HTTP with bounded retry
//! - [`reader`] — [`JsonRpcChainReader`], the `ChainReader` for EVM nodes
//! - [`decoder`] — [`AbiEventDecoder`], Solidity event signature → JSON
//! - [`index_loop`] — per-subscription ingestion worker
//! - [`watcher`] — block ledger sync, divergence handling, sweeps
//! - [`service`] — [`Indexer`], which runs all of the above on tickers
//! - [`builder`] — [`IndexerBuilder`]

pub mod builder;
pub mod decoder;
pub mod health;
pub mod index_loop;
pub mod reader;
pub mod service;
pub mod transport;
pub mod watcher;

pub use builder::IndexerBuilder;
pub use decoder::AbiEventDecoder;
pub use health::ChainHealth;
pub use index_loop::{BatchStats, CycleOutcome, SubscriptionWorker};
pub use reader::JsonRpcChainReader;
pub use service::{CheckpointSummary, Indexer, IndexerStatus, TickReport};
pub use transport::{HttpClientConfig, HttpRpcClient, RetryConfig, RpcTransport, TransportError};
pub use watcher::{ChainWatcher, WatcherReport};
