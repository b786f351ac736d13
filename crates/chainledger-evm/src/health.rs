//! Shared per-chain health flag.
//!
//! The chain watcher halts the chain on an unresolvable divergence; every
//! subscription worker checks the flag before starting a cycle. Only an
//! operator backfill clears it.

use std::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct HealthState {
    halted: Option<String>,
    head: Option<u64>,
    highest_head: Option<u64>,
}

/// Halt flag and head observations for one chain.
#[derive(Debug, Default)]
pub struct ChainHealth {
    state: RwLock<HealthState>,
}

impl ChainHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> HealthState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn write<R>(&self, f: impl FnOnce(&mut HealthState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.write(|s| s.halted = Some(reason));
    }

    pub fn resume(&self) {
        self.write(|s| s.halted = None);
    }

    pub fn is_halted(&self) -> bool {
        self.read().halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.read().halted
    }

    /// Record an observed head. Returns the highest head seen so far,
    /// including this one.
    pub fn observe_head(&self, head: u64) -> u64 {
        self.write(|s| {
            s.head = Some(head);
            let highest = s.highest_head.map_or(head, |h| h.max(head));
            s.highest_head = Some(highest);
            highest
        })
    }

    /// Raise the highest-head mark without recording an observation.
    pub fn seed_highest_head(&self, head: u64) {
        self.write(|s| s.highest_head = Some(s.highest_head.map_or(head, |h| h.max(head))));
    }

    /// Forget the head history (the ledger was reset).
    pub fn reset_heads(&self) {
        self.write(|s| {
            s.head = None;
            s.highest_head = None;
        });
    }

    /// Last head reported by the node.
    pub fn head(&self) -> Option<u64> {
        self.read().head
    }

    pub fn highest_head(&self) -> Option<u64> {
        self.read().highest_head
    }
}
