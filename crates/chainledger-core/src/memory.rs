//! In-memory storage backend.
//!
//! Holds checkpoints, events, the block ledger and divergence records under a
//! single lock, so every multi-table operation is as atomic as its SQL
//! counterpart. Uniqueness rules match the relational schema: one row per
//! event identity, one live event per `(chain, block, log index)`, one
//! canonical header per height. All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointStore, CounterDelta};
use crate::divergence::{DivergenceLog, DivergencePlan, DivergenceRecord, SweepOutcome};
use crate::error::IndexerError;
use crate::events::{EventQuery, EventRecord, EventStatus, EventStore, InsertOutcome, REDECODE_PENDING};
use crate::ledger::BlockLedger;
use crate::types::{confirmations, BlockHeader, EventId, LedgerEntry, SubscriptionKey};

type Position = (u64, u64, u64);

#[derive(Default)]
struct State {
    checkpoints: BTreeMap<SubscriptionKey, Checkpoint>,
    events: BTreeMap<EventId, EventRecord>,
    /// Live (non-orphaned) events by position.
    positions: HashMap<Position, EventId>,
    /// `(chain, height)` → every header seen at that height.
    headers: BTreeMap<(u64, u64), Vec<LedgerEntry>>,
    divergences: Vec<DivergenceRecord>,
}

fn position(record: &EventRecord) -> Position {
    (record.chain_id, record.block_number, record.id.log_index)
}

impl State {
    /// Orphan `ids` under record `record_id`. Returns the ids actually orphaned.
    fn orphan(&mut self, ids: &[EventId], record_id: u64, now: DateTime<Utc>) -> Vec<EventId> {
        let mut orphaned = Vec::new();
        let mut failing: HashMap<SubscriptionKey, i64> = HashMap::new();
        for id in ids {
            let Some(record) = self.events.get_mut(id) else { continue };
            if record.status == EventStatus::Orphaned {
                continue;
            }
            if record.processing_error.is_some() {
                *failing.entry(record.subscription()).or_default() -= 1;
            }
            record.status = EventStatus::Orphaned;
            record.finalized = false;
            record.processed = false;
            record.processed_at = None;
            record.processing_error = None;
            record.retry_count = 0;
            record.orphaned_by = Some(record_id);
            record.updated_at = now;
            self.positions.remove(&position(record));
            orphaned.push(id.clone());
        }
        for (key, delta) in failing {
            if let Some(cp) = self.checkpoints.get_mut(&key) {
                cp.apply_counters(CounterDelta { failing: delta, ..Default::default() });
            }
        }
        orphaned
    }

    fn live_in_range(&self, chain_id: u64, from: u64, to: u64) -> Vec<EventId> {
        self.events
            .values()
            .filter(|r| {
                r.chain_id == chain_id
                    && r.status != EventStatus::Orphaned
                    && (from..=to).contains(&r.block_number)
            })
            .map(|r| r.id.clone())
            .collect()
    }

    fn append_record(&mut self, chain_id: u64, plan: &DivergencePlan) -> u64 {
        let id = self.divergences.len() as u64 + 1;
        self.divergences.push(DivergenceRecord {
            id,
            chain_id,
            kind: plan.kind,
            detected_at: plan.detected_at,
            detected_at_block: plan.detected_at_block,
            fork_point: plan.fork_point,
            depth: plan.depth(),
            range_start: plan.range_start(),
            range_end: plan.range_end,
            orphaned: Vec::new(),
            reconciled: Vec::new(),
        });
        id
    }

    fn canonical(&self, chain_id: u64, number: u64) -> Option<&BlockHeader> {
        self.headers
            .get(&(chain_id, number))
            .and_then(|entries| entries.iter().find(|e| e.canonical))
            .map(|e| &e.header)
    }

    fn set_canonical(&mut self, chain_id: u64, header: &BlockHeader) {
        let entries = self.headers.entry((chain_id, header.number)).or_default();
        for entry in entries.iter_mut() {
            entry.canonical = false;
        }
        match entries.iter_mut().find(|e| e.header.hash.eq_ignore_ascii_case(&header.hash)) {
            Some(entry) => {
                entry.header = header.clone();
                entry.canonical = true;
            }
            None => entries.push(LedgerEntry { header: header.clone(), canonical: true }),
        }
    }
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, IndexerError> {
        self.state
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.state()?.checkpoints.get(key).cloned())
    }

    async fn get_or_create_checkpoint(&self, seed: Checkpoint) -> Result<Checkpoint, IndexerError> {
        let mut state = self.state()?;
        Ok(state.checkpoints.entry(seed.key.clone()).or_insert(seed).clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        let stored = state
            .checkpoints
            .entry(checkpoint.key.clone())
            .or_insert_with(|| checkpoint.clone());
        write_cursor(stored, checkpoint);
        Ok(())
    }

    async fn compare_and_save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        match state.checkpoints.get_mut(&checkpoint.key) {
            Some(stored) if stored.last_processed_block == expected => {
                write_cursor(stored, checkpoint);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bump_counters(&self, key: &SubscriptionKey, delta: CounterDelta) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        let cp = state
            .checkpoints
            .get_mut(key)
            .ok_or_else(|| IndexerError::NotFound(format!("checkpoint {key}")))?;
        cp.apply_counters(delta);
        cp.updated_at = Utc::now();
        Ok(())
    }

    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, IndexerError> {
        Ok(self
            .state()?
            .checkpoints
            .values()
            .filter(|cp| cp.key.chain_id == chain_id)
            .cloned()
            .collect())
    }
}

/// Copy everything except the counters and creation time.
fn write_cursor(stored: &mut Checkpoint, from: &Checkpoint) {
    stored.last_processed_block = from.last_processed_block;
    stored.last_scanned_block = from.last_scanned_block;
    stored.last_finalized_block = from.last_finalized_block;
    stored.status = from.status;
    stored.error_message = from.error_message.clone();
    stored.batch_size = from.batch_size;
    stored.confirmation_threshold = from.confirmation_threshold;
    stored.retry_limit = from.retry_limit;
    stored.updated_at = from.updated_at;
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn find_event(&self, id: &EventId) -> Result<Option<EventRecord>, IndexerError> {
        Ok(self.state()?.events.get(id).cloned())
    }

    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, IndexerError> {
        let mut state = self.state()?;
        if state.events.contains_key(&record.id) {
            return Ok(InsertOutcome::IdentityExists);
        }
        let live = record.status != EventStatus::Orphaned;
        if live {
            if let Some(occupant) = state.positions.get(&position(record)) {
                return Ok(InsertOutcome::PositionTaken { occupant: occupant.clone() });
            }
            state.positions.insert(position(record), record.id.clone());
        }
        state.events.insert(record.id.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, IndexerError> {
        let state = self.state()?;
        let mut out: Vec<EventRecord> =
            state.events.values().filter(|r| query.matches(r)).cloned().collect();
        out.sort_by_key(|r| (r.block_number, r.id.log_index));
        if let Some(limit) = query.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn count_events(&self, query: &EventQuery) -> Result<u64, IndexerError> {
        Ok(self.state()?.events.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn record_decode_result(
        &self,
        id: &EventId,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        let record = state
            .events
            .get_mut(id)
            .ok_or_else(|| IndexerError::NotFound(format!("event {id}")))?;
        match result {
            Ok(decoded) => {
                record.decoded_payload = Some(decoded);
                record.processing_error = None;
            }
            Err(message) => {
                record.processing_error = Some(message);
                record.retry_count += 1;
            }
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_processed(&self, id: &EventId) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        match state.events.get_mut(id) {
            Some(record) if record.finalized => {
                let now = Utc::now();
                record.processed = true;
                record.processed_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl BlockLedger for MemoryStore {
    async fn canonical_header(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<BlockHeader>, IndexerError> {
        Ok(self.state()?.canonical(chain_id, number).cloned())
    }

    async fn ledger_tip(&self, chain_id: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let state = self.state()?;
        Ok(state
            .headers
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .rev()
            .find_map(|(_, entries)| entries.iter().find(|e| e.canonical))
            .map(|e| e.header.clone()))
    }

    async fn ledger_floor(&self, chain_id: u64) -> Result<Option<u64>, IndexerError> {
        let state = self.state()?;
        Ok(state
            .headers
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .find(|(_, entries)| entries.iter().any(|e| e.canonical))
            .map(|((_, number), _)| *number))
    }

    async fn record_header(&self, chain_id: u64, header: &BlockHeader) -> Result<(), IndexerError> {
        let mut state = self.state()?;
        if let Some(existing) = state.canonical(chain_id, header.number) {
            if existing.hash.eq_ignore_ascii_case(&header.hash) {
                return Ok(());
            }
            return Err(IndexerError::Invariant(format!(
                "block {} on chain {chain_id} already has canonical header {}",
                header.number, existing.hash
            )));
        }
        state.set_canonical(chain_id, header);
        Ok(())
    }

    async fn ledger_entries(
        &self,
        chain_id: u64,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerEntry>, IndexerError> {
        let state = self.state()?;
        Ok(state
            .headers
            .range((chain_id, from)..=(chain_id, to))
            .flat_map(|(_, entries)| entries.iter().cloned())
            .collect())
    }

    async fn prune_headers(&self, chain_id: u64, below: u64) -> Result<u64, IndexerError> {
        let mut state = self.state()?;
        let doomed: Vec<(u64, u64)> = state
            .headers
            .range((chain_id, 0)..(chain_id, below))
            .map(|(k, _)| *k)
            .collect();
        let mut removed = 0;
        for key in doomed {
            removed += state.headers.remove(&key).map_or(0, |e| e.len() as u64);
        }
        Ok(removed)
    }

    async fn reset_ledger(&self, chain_id: u64) -> Result<u64, IndexerError> {
        self.prune_headers(chain_id, u64::MAX).await
    }
}

#[async_trait]
impl DivergenceLog for MemoryStore {
    async fn apply_divergence(
        &self,
        chain_id: u64,
        plan: &DivergencePlan,
    ) -> Result<DivergenceRecord, IndexerError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let record_id = state.append_record(chain_id, plan);

        let affected = state.live_in_range(chain_id, plan.range_start(), plan.range_end);
        let orphaned = state.orphan(&affected, record_id, now);

        for number in plan.range_start()..=plan.range_end {
            if let Some(entries) = state.headers.get_mut(&(chain_id, number)) {
                for entry in entries.iter_mut() {
                    entry.canonical = false;
                }
            }
        }
        for header in &plan.replacement {
            state.set_canonical(chain_id, header);
        }

        let record = &mut state.divergences[record_id as usize - 1];
        record.orphaned = orphaned;
        Ok(record.clone())
    }

    async fn apply_sweep(
        &self,
        chain_id: u64,
        head: u64,
        threshold: u64,
    ) -> Result<SweepOutcome, IndexerError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut demote = Vec::new();
        let mut highest_demoted = 0;

        for record in state.events.values_mut() {
            if record.chain_id != chain_id || record.status == EventStatus::Orphaned {
                continue;
            }
            let conf = confirmations(head, record.block_number);
            if conf != record.confirmations {
                record.confirmations = conf;
                record.updated_at = now;
                outcome.updated += 1;
            }
            if !record.finalized && conf >= threshold {
                record.finalized = true;
                record.status = EventStatus::Confirmed;
                outcome.promoted += 1;
            } else if record.finalized && conf < threshold {
                highest_demoted = highest_demoted.max(record.block_number);
                demote.push(record.id.clone());
            }
        }

        if !demote.is_empty() {
            let plan = DivergencePlan::sweep(head, threshold, highest_demoted);
            let record_id = state.append_record(chain_id, &plan);
            let orphaned = state.orphan(&demote, record_id, now);
            let record = &mut state.divergences[record_id as usize - 1];
            record.orphaned = orphaned;
            outcome.demoted = Some(record.clone());
        }
        Ok(outcome)
    }

    async fn reconfirm_event(
        &self,
        id: &EventId,
        block_number: u64,
        block_hash: &str,
        head: u64,
        threshold: u64,
    ) -> Result<bool, IndexerError> {
        let mut state = self.state()?;
        let Some(record) = state.events.get(id) else {
            return Ok(false);
        };
        if record.status != EventStatus::Orphaned {
            return Ok(false);
        }
        let pos = (record.chain_id, block_number, id.log_index);
        if let Some(occupant) = state.positions.get(&pos) {
            return Err(IndexerError::Invariant(format!(
                "cannot reconfirm {id}: position {block_number}#{} is held by {occupant}",
                id.log_index
            )));
        }

        let now = Utc::now();
        let conf = confirmations(head, block_number);
        let Some(record) = state.events.get_mut(id) else {
            return Ok(false);
        };
        record.block_number = block_number;
        record.block_hash = block_hash.to_string();
        record.confirmations = conf;
        record.finalized = conf >= threshold;
        record.status = if record.finalized { EventStatus::Confirmed } else { EventStatus::Pending };
        record.updated_at = now;
        let needs_decode = record.decoded_payload.is_none();
        if needs_decode {
            record.processing_error = Some(REDECODE_PENDING.into());
        }
        let key = record.subscription();
        let orphaned_by = record.orphaned_by;
        state.positions.insert(pos, id.clone());

        if needs_decode {
            if let Some(cp) = state.checkpoints.get_mut(&key) {
                cp.apply_counters(CounterDelta { failing: 1, ..Default::default() });
            }
        }
        let slot = orphaned_by.and_then(|rid| rid.checked_sub(1));
        if let Some(rec) = slot.and_then(|i| state.divergences.get_mut(i as usize)) {
            rec.reconciled.push(id.clone());
        }
        Ok(true)
    }

    async fn divergences(&self, chain_id: u64) -> Result<Vec<DivergenceRecord>, IndexerError> {
        Ok(self
            .state()?
            .divergences
            .iter()
            .filter(|r| r.chain_id == chain_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSettings;
    use crate::events::{NewEvent, PersistOutcome};

    fn new_event(tx: &str, block: u64, log_index: u64) -> NewEvent {
        NewEvent {
            id: EventId::new(tx, log_index, "Transfer"),
            chain_id: 1,
            contract_address: "0xabc".into(),
            block_number: block,
            block_hash: format!("0xb{block}"),
            raw_payload: serde_json::json!({}),
            decoded_payload: Some(serde_json::json!({})),
            processing_error: None,
        }
    }

    fn header(number: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader { number, hash: hash.into(), parent_hash: parent.into(), timestamp: 0 }
    }

    #[tokio::test]
    async fn persist_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.persist(new_event("0x1", 100, 0), 105, 12).await.unwrap();
        assert_eq!(first, PersistOutcome::Inserted { finalized: false });
        for _ in 0..5 {
            let again = store.persist(new_event("0x1", 100, 0), 105, 12).await.unwrap();
            assert_eq!(again, PersistOutcome::Duplicate);
        }
        assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn live_position_conflict_fails() {
        let store = MemoryStore::new();
        store.persist(new_event("0x1", 100, 0), 105, 12).await.unwrap();
        let err = store.persist(new_event("0x2", 100, 0), 105, 12).await.unwrap_err();
        assert!(matches!(err, IndexerError::Invariant(_)));
    }

    #[tokio::test]
    async fn orphaned_row_frees_its_position() {
        let store = MemoryStore::new();
        store.persist(new_event("0x1", 3, 0), 5, 2).await.unwrap();
        let plan = DivergencePlan {
            kind: crate::divergence::DivergenceKind::Reorg,
            detected_at: Utc::now(),
            detected_at_block: 5,
            fork_point: 2,
            range_end: 5,
            replacement: vec![],
        };
        let record = store.apply_divergence(1, &plan).await.unwrap();
        assert_eq!(record.orphaned.len(), 1);
        assert_eq!(record.depth, 3);

        let again = store.persist(new_event("0x2", 3, 0), 5, 2).await.unwrap();
        assert!(matches!(again, PersistOutcome::Inserted { .. }));
        let old = store.persist(new_event("0x1", 3, 0), 5, 2).await.unwrap();
        assert_eq!(old, PersistOutcome::Orphaned);
    }

    #[tokio::test]
    async fn second_canonical_header_is_an_invariant_violation() {
        let store = MemoryStore::new();
        store.record_header(1, &header(10, "0xa", "0x9")).await.unwrap();
        store.record_header(1, &header(10, "0xa", "0x9")).await.unwrap();
        let err = store.record_header(1, &header(10, "0xb", "0x9")).await.unwrap_err();
        assert!(matches!(err, IndexerError::Invariant(_)));
    }

    #[tokio::test]
    async fn ledger_tip_floor_and_prune() {
        let store = MemoryStore::new();
        for n in 1..=5 {
            store
                .record_header(1, &header(n, &format!("0x{n}"), &format!("0x{}", n - 1)))
                .await
                .unwrap();
        }
        assert_eq!(store.ledger_tip(1).await.unwrap().unwrap().number, 5);
        assert_eq!(store.ledger_floor(1).await.unwrap(), Some(1));
        assert_eq!(store.prune_headers(1, 3).await.unwrap(), 2);
        assert_eq!(store.ledger_floor(1).await.unwrap(), Some(3));
        assert_eq!(store.reset_ledger(1).await.unwrap(), 3);
        assert!(store.ledger_tip(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_promotes_and_demotes() {
        let store = MemoryStore::new();
        store.persist(new_event("0x1", 100, 0), 105, 12).await.unwrap();
        store.persist(new_event("0x2", 101, 0), 200, 12).await.unwrap();

        let out = store.apply_sweep(1, 113, 12).await.unwrap();
        assert_eq!(out.promoted, 1);
        assert!(out.demoted.is_none());

        // head regressed below the threshold of both events
        let out = store.apply_sweep(1, 110, 12).await.unwrap();
        let record = out.demoted.unwrap();
        assert_eq!(record.orphaned.len(), 2);
        let live = EventQuery::chain(1).status(EventStatus::Orphaned);
        assert_eq!(store.count_events(&live).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reconfirm_appends_reconciliation() {
        let store = MemoryStore::new();
        store.persist(new_event("0x1", 3, 0), 20, 2).await.unwrap();
        let plan = DivergencePlan::sweep(4, 2, 3);
        let record = store.apply_divergence(1, &plan).await.unwrap();
        let id = EventId::new("0x1", 0, "Transfer");

        assert!(store.reconfirm_event(&id, 3, "0xnew", 20, 2).await.unwrap());
        assert!(!store.reconfirm_event(&id, 3, "0xnew", 20, 2).await.unwrap());
        let ev = store.find_event(&id).await.unwrap().unwrap();
        assert_eq!(ev.status, EventStatus::Confirmed);
        assert_eq!(ev.block_hash, "0xnew");

        let records = store.divergences(1).await.unwrap();
        assert_eq!(records[0].id, record.id);
        assert_eq!(records[0].reconciled, vec![id]);
    }

    #[tokio::test]
    async fn compare_and_save_rejects_stale_writer() {
        let store = MemoryStore::new();
        let settings = CheckpointSettings { batch_size: 10, confirmation_threshold: 12, retry_limit: 3 };
        let seed = Checkpoint::seeded(SubscriptionKey::new(1, "0xabc", "Transfer"), 100, settings);
        let mut cp = store.get_or_create_checkpoint(seed).await.unwrap();

        let mut backfill = cp.clone();
        backfill.rewind_to(50);
        store.save_checkpoint(&backfill).await.unwrap();

        cp.advance(109, 200);
        assert!(!store.compare_and_save_checkpoint(&cp, Some(99)).await.unwrap());
        let stored = store.load_checkpoint(&cp.key).await.unwrap().unwrap();
        assert_eq!(stored.last_processed_block, Some(49));

        store
            .bump_counters(&cp.key, CounterDelta { inserted: 2, decoded: 2, failing: 0 })
            .await
            .unwrap();
        let stored = store.load_checkpoint(&cp.key).await.unwrap().unwrap();
        assert_eq!(stored.total_events, 2);
    }
}
