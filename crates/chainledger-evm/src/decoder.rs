//! `AbiEventDecoder` decodes EVM logs against a Solidity event signature.
//!
//! Indexed parameters come from `topics[1..]`; value types are recovered,
//! reference types (string, bytes, arrays, tuples) are stored as the 32-byte
//! keccak hash the EVM put in the topic. Non-indexed parameters are the ABI
//! encoded `data` payload.

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Event;
use serde_json::{Map, Value};

use chainledger_core::error::{DecodeError, IndexerError};
use chainledger_core::source::EventDecoder;
use chainledger_core::types::RawLog;

struct Param {
    name: String,
    ty: DynSolType,
}

/// Decoder for one event type.
pub struct AbiEventDecoder {
    name: String,
    signature: String,
    topic: String,
    indexed: Vec<Param>,
    body: Vec<Param>,
}

impl AbiEventDecoder {
    /// Parse a human-readable signature such as
    /// `"event Transfer(address indexed from, address indexed to, uint256 value)"`.
    pub fn new(signature: &str) -> Result<Self, IndexerError> {
        let event = Event::parse(signature)
            .map_err(|e| IndexerError::Config(format!("invalid event signature '{signature}': {e}")))?;
        if event.anonymous {
            return Err(IndexerError::Config(format!(
                "anonymous event '{}' has no topic0 to filter on",
                event.name
            )));
        }

        let mut indexed = Vec::new();
        let mut body = Vec::new();
        for (i, input) in event.inputs.iter().enumerate() {
            let ty = input
                .resolve()
                .map_err(|e| IndexerError::Config(format!("unsupported type '{}': {e}", input.ty)))?;
            let name = if input.name.is_empty() { format!("arg{i}") } else { input.name.clone() };
            let param = Param { name, ty };
            if input.indexed {
                indexed.push(param);
            } else {
                body.push(param);
            }
        }

        Ok(Self {
            name: event.name.clone(),
            signature: event.signature(),
            topic: format!("{:#x}", event.selector()),
            indexed,
            body,
        })
    }

    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    fn decode_topic(&self, param: &Param, topic_hex: &str) -> Result<Value, DecodeError> {
        let bytes = decode_hex("topic", topic_hex)?;
        if is_hashed_in_topic(&param.ty) {
            return Ok(Value::String(format!("0x{}", hex::encode(bytes))));
        }
        let value = param
            .ty
            .abi_decode(&bytes)
            .map_err(|e| DecodeError::Abi(format!("topic {}: {e}", param.name)))?;
        Ok(to_json(value))
    }

    fn decode_body(&self, data_hex: &str) -> Result<Vec<Value>, DecodeError> {
        if self.body.is_empty() {
            return Ok(Vec::new());
        }
        let data = decode_hex("data", data_hex)?;
        let tuple = DynSolType::Tuple(self.body.iter().map(|p| p.ty.clone()).collect());
        let decoded = tuple.abi_decode_sequence(&data).map_err(|e| DecodeError::Abi(e.to_string()))?;
        let values = match decoded {
            DynSolValue::Tuple(vals) => vals,
            other => vec![other],
        };
        Ok(values.into_iter().map(to_json).collect())
    }
}

impl EventDecoder for AbiEventDecoder {
    fn event_type(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn decode(&self, log: &RawLog) -> Result<Value, DecodeError> {
        let topic0 = log.topic0().ok_or(DecodeError::MissingTopics)?;
        if !topic0.eq_ignore_ascii_case(&self.topic) {
            return Err(DecodeError::TopicMismatch { expected: self.topic.clone(), actual: topic0.to_string() });
        }
        let expected_topics = self.indexed.len() + 1;
        if log.topics.len() != expected_topics {
            return Err(DecodeError::Abi(format!(
                "{} expects {expected_topics} topics, log has {}",
                self.name,
                log.topics.len()
            )));
        }

        let mut fields = Map::new();
        for (param, topic) in self.indexed.iter().zip(&log.topics[1..]) {
            fields.insert(param.name.clone(), self.decode_topic(param, topic)?);
        }
        for (param, value) in self.body.iter().zip(self.decode_body(&log.data)?) {
            fields.insert(param.name.clone(), value);
        }
        Ok(Value::Object(fields))
    }
}

/// Reference types are stored in topics as the keccak256 of their encoding.
fn is_hashed_in_topic(ty: &DynSolType) -> bool {
    matches!(
        ty,
        DynSolType::String | DynSolType::Bytes | DynSolType::Array(_) | DynSolType::FixedArray(..) | DynSolType::Tuple(_)
    )
}

fn decode_hex(field: &str, s: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| DecodeError::InvalidHex { field: field.to_string(), reason: e.to_string() })
}

/// Convert a decoded value to JSON. Integers become decimal strings so 256-bit
/// values survive the round trip; addresses use EIP-55 checksums.
fn to_json(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => Value::String(format!("0x{}", hex::encode(&word[..size]))),
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) | DynSolValue::Tuple(vals) => {
            Value::Array(vals.into_iter().map(to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";
    const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
    const USDC: &str = "A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
    const USDT: &str = "dAC17F958D2ee523a2206206994597C13D831ec7";

    fn word(n: u64) -> String {
        format!("{n:064x}")
    }

    fn address_topic(addr: &str) -> String {
        format!("0x{:0>64}", addr.to_ascii_lowercase())
    }

    fn log(topics: Vec<String>, data: String) -> RawLog {
        RawLog {
            address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
            topics,
            data,
            block_number: 100,
            block_hash: "0xb".into(),
            tx_hash: "0xaa".into(),
            log_index: 0,
            removed: false,
        }
    }

    #[test]
    fn transfer_topic_and_signature() {
        let d = AbiEventDecoder::new(TRANSFER).unwrap();
        assert_eq!(d.event_type(), "Transfer");
        assert_eq!(d.topic(), TRANSFER_TOPIC);
        assert_eq!(d.signature(), "Transfer(address,address,uint256)");
    }

    #[test]
    fn decodes_transfer() {
        let d = AbiEventDecoder::new(TRANSFER).unwrap();
        let raw = log(
            vec![TRANSFER_TOPIC.into(), address_topic(USDC), address_topic(USDT)],
            format!("0x{}", word(1_000_000)),
        );
        let decoded = d.decode(&raw).unwrap();
        assert_eq!(
            decoded,
            json!({
                "from": format!("0x{USDC}"),
                "to": format!("0x{USDT}"),
                "value": "1000000"
            })
        );
    }

    #[test]
    fn decodes_dynamic_data_and_hashed_topics() {
        let d = AbiEventDecoder::new("event Memo(uint256 indexed id, string indexed tag, string note)").unwrap();
        let tag_hash = format!("0x{}", "ab".repeat(32));
        let data = format!("0x{}{}{}", word(0x20), word(2), format!("{:0<64}", "6869"));
        let raw = log(vec![d.topic().to_string(), format!("0x{}", word(7)), tag_hash.clone()], data);
        let decoded = d.decode(&raw).unwrap();
        assert_eq!(decoded["id"], json!("7"));
        assert_eq!(decoded["tag"], json!(tag_hash));
        assert_eq!(decoded["note"], json!("hi"));
    }

    #[test]
    fn rejects_wrong_topic0() {
        let d = AbiEventDecoder::new(TRANSFER).unwrap();
        let raw = log(vec![format!("0x{}", word(1))], "0x".into());
        assert!(matches!(d.decode(&raw), Err(DecodeError::TopicMismatch { .. })));
    }

    #[test]
    fn rejects_missing_topics_and_bad_hex() {
        let d = AbiEventDecoder::new(TRANSFER).unwrap();
        assert_eq!(d.decode(&log(vec![], "0x".into())), Err(DecodeError::MissingTopics));

        let raw = log(
            vec![TRANSFER_TOPIC.into(), address_topic(USDC), address_topic(USDT)],
            "0xnothex".into(),
        );
        assert!(matches!(d.decode(&raw), Err(DecodeError::InvalidHex { .. })));
    }

    #[test]
    fn truncated_data_is_an_abi_error() {
        let d = AbiEventDecoder::new(TRANSFER).unwrap();
        let raw = log(
            vec![TRANSFER_TOPIC.into(), address_topic(USDC), address_topic(USDT)],
            "0x01".into(),
        );
        assert!(matches!(d.decode(&raw), Err(DecodeError::Abi(_))));
    }

    #[test]
    fn invalid_signatures_are_config_errors() {
        assert!(matches!(AbiEventDecoder::new("event Broken(uint256"), Err(IndexerError::Config(_))));
        assert!(matches!(
            AbiEventDecoder::new("event Anon(uint256 a) anonymous"),
            Err(IndexerError::Config(_))
        ));
    }
}
