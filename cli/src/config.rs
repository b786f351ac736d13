//! `chainledger.yaml` loading.
//!
//! ```yaml
//! rpcUrl: http://localhost:8545
//! chainId: 1
//! confirmationThreshold: 12
//! databaseUrl: ./chainledger.db
//! adminListen: 127.0.0.1:8080
//! logging:
//!   level: info
//! subscriptions:
//!   - address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
//!     startBlock: 19000000
//!     events:
//!       - "event Transfer(address indexed from, address indexed to, uint256 value)"
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use chainledger_core::{IndexerConfig, Storage};
use chainledger_storage::{MemoryStore, SqliteStorage};

use crate::logging::LogConfig;

pub const ENV_RPC_URL: &str = "CHAINLEDGER_RPC_URL";
pub const ENV_DATABASE_URL: &str = "CHAINLEDGER_DATABASE_URL";

/// Selects the in-memory store instead of SQLite.
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(flatten)]
    pub indexer: IndexerConfig,
    /// SQLite path or URL, `sqlite::memory:`, or `memory`.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_database_url() -> String {
    "./chainledger.db".into()
}

fn default_admin_listen() -> String {
    "127.0.0.1:8080".into()
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config = Self::parse(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Environment variables win over the file.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RPC_URL).filter(|v| !v.is_empty()) {
            self.indexer.rpc_url = url;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            self.database_url = url;
        }
    }

    pub async fn open_store(&self) -> Result<Arc<dyn Storage>> {
        let store: Arc<dyn Storage> = match self.database_url.as_str() {
            MEMORY_DATABASE => Arc::new(MemoryStore::new()),
            "sqlite::memory:" => Arc::new(SqliteStorage::in_memory().await?),
            url => Arc::new(
                SqliteStorage::open(url)
                    .await
                    .with_context(|| format!("cannot open database {url}"))?,
            ),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_core::CheckpointStore;

    const YAML: &str = r#"
rpcUrl: http://node:8545
chainId: 10
confirmationThreshold: 20
ledgerRetention: 64
adminListen: 0.0.0.0:9000
logging:
  level: debug
  json: true
subscriptions:
  - address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
    startBlock: 500
    events:
      - "event Transfer(address indexed from, address indexed to, uint256 value)"
"#;

    #[test]
    fn parses_file_with_defaults() {
        let config = AppConfig::parse(YAML).unwrap();
        assert_eq!(config.indexer.chain_id, 10);
        assert_eq!(config.indexer.confirmation_threshold, 20);
        assert_eq!(config.indexer.ledger_retention, 64);
        assert_eq!(config.indexer.batch_size, 1000);
        assert_eq!(config.indexer.subscriptions[0].start_block, 500);
        assert_eq!(config.database_url, "./chainledger.db");
        assert_eq!(config.admin_listen, "0.0.0.0:9000");
        assert!(config.logging.json);
        assert!(config.indexer.validate().is_ok());
    }

    #[test]
    fn env_overrides_rpc_and_database() {
        let mut config = AppConfig::parse(YAML).unwrap();
        config.apply_overrides(|name| match name {
            ENV_RPC_URL => Some("http://other:8545".into()),
            ENV_DATABASE_URL => Some(MEMORY_DATABASE.into()),
            _ => None,
        });
        assert_eq!(config.indexer.rpc_url, "http://other:8545");
        assert_eq!(config.database_url, MEMORY_DATABASE);

        let mut untouched = AppConfig::parse(YAML).unwrap();
        untouched.apply_overrides(|_| Some(String::new()));
        assert_eq!(untouched.indexer.rpc_url, "http://node:8545");
    }

    #[test]
    fn missing_chain_id_is_rejected() {
        assert!(AppConfig::parse("rpcUrl: http://node:8545").is_err());
    }

    #[tokio::test]
    async fn opens_in_memory_backends() {
        let mut config = AppConfig::parse(YAML).unwrap();
        config.database_url = MEMORY_DATABASE.into();
        let store = config.open_store().await.unwrap();
        assert!(store.list_checkpoints(10).await.unwrap().is_empty());

        config.database_url = "sqlite::memory:".into();
        let store = config.open_store().await.unwrap();
        assert!(store.list_checkpoints(10).await.unwrap().is_empty());
    }
}
