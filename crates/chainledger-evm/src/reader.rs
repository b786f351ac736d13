//! EVM chain reader over JSON-RPC.
//!
//! Uses `eth_blockNumber`, `eth_getBlockByNumber` and `eth_getLogs`, splitting
//! log queries that span more than `max_log_range` blocks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainledger_core::error::IndexerError;
use chainledger_core::source::ChainReader;
use chainledger_core::types::{BlockHeader, RawLog};

use crate::transport::RpcTransport;

/// Default upper bound on the block span of one `eth_getLogs` call.
pub const DEFAULT_MAX_LOG_RANGE: u64 = 2_000;

/// A log exactly as returned by `eth_getLogs`, quantities still hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl WireLog {
    /// Parse the hex quantities into a [`RawLog`].
    pub fn into_raw(self) -> Result<RawLog, IndexerError> {
        Ok(RawLog {
            block_number: parse_hex_u64(&self.block_number)?,
            log_index: parse_hex_u64(&self.log_index)?,
            address: self.address.to_ascii_lowercase(),
            topics: self.topics.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
            data: self.data,
            block_hash: self.block_hash.to_ascii_lowercase(),
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            removed: self.removed.unwrap_or(false),
        })
    }
}

/// [`ChainReader`] backed by any [`RpcTransport`].
pub struct JsonRpcChainReader {
    transport: Arc<dyn RpcTransport>,
    max_log_range: u64,
}

impl JsonRpcChainReader {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport, max_log_range: DEFAULT_MAX_LOG_RANGE }
    }

    /// Set the largest block span requested per `eth_getLogs` call.
    pub fn with_max_log_range(mut self, blocks: u64) -> Self {
        self.max_log_range = blocks.max(1);
        self
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    async fn logs_in_range(
        &self,
        address: &str,
        topic: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let filter = json!({
            "address": address,
            "topics": [topic],
            "fromBlock": to_hex(from),
            "toBlock": to_hex(to),
        });
        let result = self.transport.call("eth_getLogs", vec![filter]).await?;
        let wire: Vec<WireLog> = serde_json::from_value(result)
            .map_err(|e| IndexerError::Rpc(format!("malformed eth_getLogs response: {e}")))?;
        wire.into_iter().map(WireLog::into_raw).collect()
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        let result = self.transport.call("eth_blockNumber", vec![]).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| IndexerError::Rpc(format!("eth_blockNumber returned {result}")))?;
        parse_hex_u64(hex)
    }

    async fn get_logs(
        &self,
        address: &str,
        topic: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let mut all_logs = Vec::new();
        let mut start = from;
        loop {
            let end = start.saturating_add(self.max_log_range - 1).min(to);
            let chunk = self.logs_in_range(address, topic, start, end).await?;
            all_logs.extend(chunk);
            if end == to {
                break;
            }
            start = end + 1;
        }
        Ok(all_logs)
    }

    async fn get_block_header(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let result = self
            .transport
            .call("eth_getBlockByNumber", vec![json!(to_hex(number)), json!(false)])
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        header_from_json(&result).map(Some)
    }
}

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Result<u64, IndexerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| IndexerError::Rpc(format!("invalid hex quantity '{s}': {e}")))
}

pub fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

/// Convert an `eth_getBlockByNumber` result to a [`BlockHeader`].
pub fn header_from_json(v: &Value) -> Result<BlockHeader, IndexerError> {
    let field = |name: &str| {
        v[name]
            .as_str()
            .ok_or_else(|| IndexerError::Rpc(format!("block response missing '{name}'")))
    };
    Ok(BlockHeader {
        number: parse_hex_u64(field("number")?)?,
        hash: field("hash")?.to_ascii_lowercase(),
        parent_hash: field("parentHash")?.to_ascii_lowercase(),
        timestamp: parse_hex_u64(field("timestamp")?)? as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::transport::TransportError;

    /// Answers from a fixed table and records every call.
    struct ScriptedTransport {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        respond: Box<dyn Fn(&str, &[Value]) -> Value + Send + Sync>,
    }

    impl ScriptedTransport {
        fn new(respond: impl Fn(&str, &[Value]) -> Value + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), respond: Box::new(respond) })
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
            let out = (self.respond)(method, &params);
            self.calls.lock().unwrap().push((method.to_string(), params));
            Ok(out)
        }

        fn url(&self) -> &str {
            "scripted"
        }
    }

    fn wire_log(block: u64, index: u64) -> Value {
        json!({
            "address": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "topics": ["0xDDF252AD1BE2C89B69C2B068FC378DAA952BA7F163C4A11628F55A4DF523B3EF"],
            "data": "0x",
            "blockNumber": to_hex(block),
            "blockHash": "0xB1",
            "transactionHash": "0xAA",
            "logIndex": to_hex(index),
            "removed": false
        })
    }

    #[test]
    fn parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("0x12a05f200").unwrap(), 5_000_000_000);
        assert!(parse_hex_u64("0xzz").is_err());
        assert_eq!(to_hex(255), "0xff");
    }

    #[test]
    fn wire_log_is_normalised() {
        let wire: WireLog = serde_json::from_value(wire_log(16, 5)).unwrap();
        let raw = wire.into_raw().unwrap();
        assert_eq!(raw.block_number, 16);
        assert_eq!(raw.log_index, 5);
        assert_eq!(raw.address, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(raw.tx_hash, "0xaa");
        assert!(!raw.removed);
    }

    #[tokio::test]
    async fn current_height_parses_hex() {
        let t = ScriptedTransport::new(|_, _| json!("0x10"));
        let reader = JsonRpcChainReader::new(t.clone());
        assert_eq!(reader.current_height().await.unwrap(), 16);
        assert_eq!(t.calls()[0].0, "eth_blockNumber");
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let t = ScriptedTransport::new(|_, _| Value::Null);
        let reader = JsonRpcChainReader::new(t);
        assert!(reader.get_block_header(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn block_header_from_response() {
        let t = ScriptedTransport::new(|_, _| {
            json!({"number": "0x64", "hash": "0xABC", "parentHash": "0xDEF", "timestamp": "0x5f5e100"})
        });
        let reader = JsonRpcChainReader::new(t.clone());
        let header = reader.get_block_header(100).await.unwrap().unwrap();
        assert_eq!(header.number, 100);
        assert_eq!(header.hash, "0xabc");
        assert_eq!(header.parent_hash, "0xdef");
        assert_eq!(header.timestamp, 100_000_000);
        assert_eq!(t.calls()[0].1, vec![json!("0x64"), json!(false)]);
    }

    #[tokio::test]
    async fn log_queries_are_chunked() {
        let t = ScriptedTransport::new(|_, params| {
            let from = parse_hex_u64(params[0]["fromBlock"].as_str().unwrap()).unwrap();
            json!([wire_log(from, 0)])
        });
        let reader = JsonRpcChainReader::new(t.clone()).with_max_log_range(10);
        let logs = reader.get_logs("0xabc", "0xt", 100, 124).await.unwrap();
        assert_eq!(logs.len(), 3);

        let ranges: Vec<(String, String)> = t
            .calls()
            .iter()
            .map(|(_, p)| {
                (p[0]["fromBlock"].as_str().unwrap().to_string(), p[0]["toBlock"].as_str().unwrap().to_string())
            })
            .collect();
        assert_eq!(
            ranges,
            vec![
                ("0x64".to_string(), "0x6d".to_string()),
                ("0x6e".to_string(), "0x77".to_string()),
                ("0x78".to_string(), "0x7c".to_string()),
            ]
        );
        assert_eq!(t.calls()[0].1[0]["topics"], json!(["0xt"]));
    }

    #[tokio::test]
    async fn malformed_logs_are_rpc_errors() {
        let t = ScriptedTransport::new(|_, _| json!([{"address": "0x1"}]));
        let reader = JsonRpcChainReader::new(t);
        let err = reader.get_logs("0x1", "0xt", 1, 1).await.unwrap_err();
        assert!(err.is_transient());
    }
}
