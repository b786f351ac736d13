//! Seams to the outside world: the chain reader and the event decoder.

use async_trait::async_trait;

use crate::error::{DecodeError, IndexerError};
use crate::types::{BlockHeader, RawLog};

/// Read-only access to a chain node. Stateless; every call goes to the node.
///
/// Transport failures are `Err`. An absent block is `Ok(None)` and a range
/// without matching logs is `Ok(vec![])`.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// The node's current block height.
    async fn current_height(&self) -> Result<u64, IndexerError>;

    /// Logs emitted by `address` with `topic0 == topic` in `[from, to]`.
    async fn get_logs(
        &self,
        address: &str,
        topic: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError>;

    /// The header at `number` on the node's canonical chain.
    async fn get_block_header(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError>;
}

/// Turns one raw log of a known event type into a JSON document.
pub trait EventDecoder: Send + Sync {
    /// Event type name, e.g. `"Transfer"`.
    fn event_type(&self) -> &str;

    /// topic0 (keccak256 of the canonical signature), `0x`-prefixed.
    fn topic(&self) -> &str;

    fn decode(&self, log: &RawLog) -> Result<serde_json::Value, DecodeError>;
}
