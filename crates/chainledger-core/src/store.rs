use crate::checkpoint::CheckpointStore;
use crate::divergence::DivergenceLog;
use crate::events::EventStore;
use crate::ledger::BlockLedger;

/// A complete storage backend: every table the pipeline needs, in one
/// database so multi-table operations can share a transaction.
pub trait Storage: CheckpointStore + EventStore + BlockLedger + DivergenceLog {}

impl<T> Storage for T where T: CheckpointStore + EventStore + BlockLedger + DivergenceLog + ?Sized {}
