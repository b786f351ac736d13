//! Scriptable in-memory chain for tests.
//!
//! Blocks get readable hashes (`0xa-3` is block 3 on branch `a`), so a test
//! can fork the chain, re-add logs on the new branch and assert on exactly
//! which block an event ended up in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::source::ChainReader;
use crate::types::{BlockHeader, RawLog};

struct MockBlock {
    header: BlockHeader,
    logs: Vec<RawLog>,
}

struct MockState {
    blocks: Vec<MockBlock>,
    branch: String,
    reported_height: Option<u64>,
    failures: u32,
}

/// A [`ChainReader`] over a scripted chain.
pub struct MockChain {
    state: Mutex<MockState>,
    log_queries: AtomicU64,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::with_blocks(0)
    }
}

impl MockChain {
    /// A chain of blocks `0..=tip` on branch `a`.
    pub fn with_blocks(tip: u64) -> Self {
        let chain = Self {
            state: Mutex::new(MockState {
                blocks: Vec::new(),
                branch: "a".into(),
                reported_height: None,
                failures: 0,
            }),
            log_queries: AtomicU64::new(0),
        };
        chain.extend_to(tip);
        chain
    }

    pub fn block_hash(branch: &str, number: u64) -> String {
        format!("0x{branch}-{number}")
    }

    pub fn tip(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.blocks.len() as u64 - 1
    }

    /// Mine blocks on the current branch until the tip is `tip`.
    pub fn extend_to(&self, tip: u64) {
        let mut state = self.state.lock().unwrap();
        while state.blocks.is_empty() || (state.blocks.len() as u64) <= tip {
            let number = state.blocks.len() as u64;
            let parent_hash = state
                .blocks
                .last()
                .map_or_else(|| "0x0".to_string(), |b| b.header.hash.clone());
            let header = BlockHeader {
                number,
                hash: Self::block_hash(&state.branch, number),
                parent_hash,
                timestamp: 1_700_000_000 + number as i64 * 12,
            };
            state.blocks.push(MockBlock { header, logs: Vec::new() });
        }
    }

    pub fn mine(&self, count: u64) {
        self.extend_to(self.tip() + count);
    }

    /// Replace every block above `fork_point` with a new branch reaching
    /// `new_tip`. Logs of the dropped blocks disappear.
    pub fn reorg(&self, fork_point: u64, new_tip: u64, branch: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.blocks.truncate(fork_point as usize + 1);
            state.branch = branch.to_string();
        }
        self.extend_to(new_tip);
    }

    pub fn header(&self, number: u64) -> Option<BlockHeader> {
        let state = self.state.lock().unwrap();
        state.blocks.get(number as usize).map(|b| b.header.clone())
    }

    /// Attach a log with one topic and an empty data field.
    pub fn add_log(&self, block: u64, address: &str, topic: &str, tx_hash: &str, log_index: u64) -> RawLog {
        self.add_log_with(block, address, vec![topic.to_string()], "0x", tx_hash, log_index)
    }

    /// Attach a fully specified log to the current block at `block`.
    pub fn add_log_with(
        &self,
        block: u64,
        address: &str,
        topics: Vec<String>,
        data: &str,
        tx_hash: &str,
        log_index: u64,
    ) -> RawLog {
        let mut state = self.state.lock().unwrap();
        let target = &mut state.blocks[block as usize];
        let log = RawLog {
            address: address.to_string(),
            topics,
            data: data.to_string(),
            block_number: block,
            block_hash: target.header.hash.clone(),
            tx_hash: tx_hash.to_string(),
            log_index,
            removed: false,
        };
        target.logs.push(log.clone());
        log
    }

    pub fn logs_at(&self, block: u64) -> Vec<RawLog> {
        let state = self.state.lock().unwrap();
        state.blocks.get(block as usize).map(|b| b.logs.clone()).unwrap_or_default()
    }

    /// Report `height` from `current_height` instead of the real tip.
    pub fn set_reported_height(&self, height: Option<u64>) {
        self.state.lock().unwrap().reported_height = height;
    }

    /// Fail the next `count` RPC calls with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().failures = count;
    }

    /// Number of `get_logs` calls served so far.
    pub fn log_queries(&self) -> u64 {
        self.log_queries.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(IndexerError::Rpc("mock transport failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state.reported_height.unwrap_or(state.blocks.len() as u64 - 1))
    }

    async fn get_logs(
        &self,
        address: &str,
        topic: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        self.check_failure()?;
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .iter()
            .filter(|b| (from..=to).contains(&b.header.number))
            .flat_map(|b| b.logs.iter())
            .filter(|log| {
                log.address.eq_ignore_ascii_case(address)
                    && log.topics.first().is_some_and(|t| t.eq_ignore_ascii_case(topic))
            })
            .cloned()
            .collect())
    }

    async fn get_block_header(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        self.check_failure()?;
        Ok(self.header(number))
    }
}
