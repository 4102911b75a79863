//! Elements flowing on the record stream between tasks.
//!
//! Barriers travel in-band with records and are aligned across input
//! channels. A reconfig-point barrier is a distinguished checkpoint kind: it
//! aligns exactly like a checkpoint but triggers the affected-state snapshot
//! path instead of a full snapshot, and it carries the plan the receiving
//! task needs to classify itself as source, destination, or unaffected.

use std::sync::Arc;

use crate::execution_plan::JobExecutionPlan;
use crate::key_group::KeyGroup;

/// One keyed record, with its key-group precomputed by the partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub key_group: KeyGroup,
    pub timestamp_ms: u64,
}

/// Barrier kinds understood by the input processor.
#[derive(Debug, Clone)]
pub enum BarrierKind {
    /// Ordinary checkpoint barrier.
    Checkpoint,
    /// Reconfig-point: snapshot only the affected key-groups and enter
    /// migration mode according to the attached plan.
    ReconfigPoint {
        plan: Arc<JobExecutionPlan>,
        plan_digest: u128,
    },
    /// Abort marker for an in-flight reconfig with the same id.
    CancelReconfig,
}

/// Checkpoint/reconfig barrier carried in-band on the record stream.
#[derive(Debug, Clone)]
pub struct Barrier {
    /// Checkpoint id, or the monotonic reconfig id for reconfig-points.
    pub id: u64,
    pub timestamp_ms: u64,
    pub kind: BarrierKind,
}

impl Barrier {
    pub fn reconfig_point(id: u64, timestamp_ms: u64, plan: Arc<JobExecutionPlan>) -> Self {
        let plan_digest = plan.digest();
        Self {
            id,
            timestamp_ms,
            kind: BarrierKind::ReconfigPoint { plan, plan_digest },
        }
    }

    pub fn cancel(id: u64, timestamp_ms: u64) -> Self {
        Self {
            id,
            timestamp_ms,
            kind: BarrierKind::CancelReconfig,
        }
    }

    pub fn is_reconfig_point(&self) -> bool {
        matches!(self.kind, BarrierKind::ReconfigPoint { .. })
    }
}

/// Everything that can arrive on an input channel.
#[derive(Debug, Clone)]
pub enum StreamElement {
    Record(StreamRecord),
    Watermark(u64),
    Barrier(Barrier),
}
