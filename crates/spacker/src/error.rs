//! Typed failure kinds surfaced by the migration protocol.
//!
//! Plan construction failures are rejected before any barrier is injected;
//! everything else is reported per key-group to the coordinator, which makes
//! the atomic commit/abort decision for the reconfiguration as a whole.

use thiserror::Error;

use crate::key_group::KeyGroup;

/// Rejections raised while constructing a [`crate::execution_plan::JobExecutionPlan`].
#[derive(Debug, Error)]
pub enum PlanError {
    /// The new mapping does not describe a legal scale-out/scale-in/repartition shape.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A key-group appears in the destination set of two subtasks.
    #[error("plan conflict: key group {kg} claimed by subtasks {first} and {second}")]
    PlanConflict {
        kg: KeyGroup,
        first: usize,
        second: usize,
    },
}

/// Failures observed while a reconfig-point is in flight.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A source could not serialize a key-group during the affected snapshot.
    #[error("snapshot failure for key group {kg}: {reason}")]
    SnapshotFailure { kg: KeyGroup, reason: String },

    /// A destination did not acknowledge a key-group within the transfer budget.
    #[error("transfer timeout for key group {kg} after {attempts} attempts")]
    TransferTimeout { kg: KeyGroup, attempts: u32 },

    /// A destination could not deserialize a shipped key-group.
    #[error("ingest failure for key group {kg}: {reason}")]
    IngestFailure { kg: KeyGroup, reason: String },

    /// Channel/gate substitution failed; the task falls back to engine failover.
    #[error("rewire failure at subtask {subtask}: {reason}")]
    RewireFailure { subtask: usize, reason: String },

    /// Replica shipping failed. Non-fatal: the changelog keeps the key-groups.
    #[error("replication failure for {failed} key group(s)")]
    ReplicationFailure { failed: usize },

    /// A trigger arrived while a reconfig-point was already in flight.
    #[error("coordinator is not idle (state {state})")]
    NotIdle { state: String },

    /// A control message carried a reconfig id older than one already applied.
    #[error("stale reconfig id {got}, already at {current}")]
    StaleReconfig { got: u64, current: u64 },
}
