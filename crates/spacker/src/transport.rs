//! Control-plane messaging between the coordinator and tasks.
//!
//! The real cluster RPC stack is an external collaborator; this module is the
//! seam. Gateways are trait objects so tasks and the coordinator never know
//! whether a peer is remote or in-process, and the in-process implementation
//! delivers into the receiving task's mailbox channel, which serializes
//! control handling with record processing.
//!
//! State payloads ship one key-group per call so transfers make interleaved
//! progress; payloads are either a single frame or a chunk sequence,
//! depending on the transmission config.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::barrier::{Barrier, StreamElement};
use crate::execution_plan::{IdInModel, JobExecutionPlan, SubtaskIndex};
use crate::key_group::{KeyGroup, KeyGroupRange};
use crate::state_handle::KeyGroupStateHandle;

/// Physical execution attempt of a subtask.
pub type ExecutionId = u64;

pub type RecordSender = mpsc::Sender<StreamElement>;
pub type RecordReceiver = mpsc::Receiver<StreamElement>;

/// State payload framing for one key-group.
#[derive(Debug, Clone)]
pub enum StatePayload {
    /// One framed message carrying the whole key-group.
    Frame(Bytes),
    /// Bounded chunks to be reassembled at the destination.
    Chunks(Vec<Bytes>),
    /// The destination already holds a fresh replica: promote it instead of
    /// shipping bytes.
    PromoteReplica,
}

impl StatePayload {
    /// Reassemble into a single frame. Promote markers carry no bytes.
    pub fn into_frame(self) -> Option<Bytes> {
        match self {
            StatePayload::Frame(frame) => Some(frame),
            StatePayload::Chunks(chunks) => Some(reassemble_chunks(chunks)),
            StatePayload::PromoteReplica => None,
        }
    }

    pub fn is_promote(&self) -> bool {
        matches!(self, StatePayload::PromoteReplica)
    }
}

/// Split a frame into bounded chunks for chunked transmission.
pub fn chunk_payload(frame: Bytes, chunk_bytes: usize) -> Vec<Bytes> {
    let chunk_bytes = chunk_bytes.max(1);
    if frame.len() <= chunk_bytes {
        return vec![frame];
    }
    let mut chunks = Vec::with_capacity(frame.len().div_ceil(chunk_bytes));
    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + chunk_bytes).min(frame.len());
        chunks.push(frame.slice(offset..end));
        offset = end;
    }
    chunks
}

pub fn reassemble_chunks(chunks: Vec<Bytes>) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

/// Per-key-group outcome reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum KeyGroupStatus {
    /// Source finished snapshotting and started shipping this key-group.
    SnapshotShipped,
    /// Destination ingested the shipped bytes.
    Ingested,
    /// Destination promoted a fresh replica instead of ingesting bytes.
    Promoted,
    /// Source released its state and changelog entries.
    Released,
    Failed(String),
}

/// Control messages delivered to a task's mailbox.
#[derive(Debug)]
pub enum TaskControl {
    /// Inject a barrier at a pipeline head (sources of the dataflow).
    InjectBarrier(Barrier),
    /// Reinitialize ownership: the task now runs `id_in_model` over `range`.
    DispatchStateToTask {
        execution_id: ExecutionId,
        operator_id: String,
        range: KeyGroupRange,
        id_in_model: IdInModel,
    },
    /// One migrating key-group's state from a source or replicator.
    DispatchState {
        reconfig_id: u64,
        operator_id: String,
        kg: KeyGroup,
        version: u64,
        payload: StatePayload,
    },
    /// Replica delta shipped between reconfigs.
    ReplicaDelta {
        operator_id: String,
        kg: KeyGroup,
        version: u64,
        frame: Bytes,
    },
    /// Set the key-groups this task ships replica deltas for.
    UpdateBackupKeyGroups {
        execution_id: ExecutionId,
        operator_id: String,
        kgs: Vec<KeyGroup>,
    },
    /// Swap output partitioning to the given plan at the next record boundary.
    Rewire { plan: Arc<JobExecutionPlan> },
    /// Redispatch key-groups whose transfer was not acknowledged in time.
    RetryTransfer {
        reconfig_id: u64,
        kgs: Vec<KeyGroup>,
    },
    /// All migrating key-groups arrived: sources drop state and changelogs.
    ReleaseMigratedState { reconfig_id: u64 },
    /// Reconfig committed: leave migration mode under the new plan.
    CompleteReconfig {
        reconfig_id: u64,
        plan: Arc<JobExecutionPlan>,
    },
    /// Reconfig aborted: discard buffers and partial transfers, keep the old plan.
    CancelReconfig { reconfig_id: u64 },
    /// Replication timer fired: ship the changelog delta to standby replicas.
    ReplicationCycle,
    /// Load-report timer fired: send per-key-group counters to the coordinator.
    ReportLoadCycle,
    Shutdown,
}

/// Messages from tasks (and test harnesses) to the coordinator.
#[derive(Debug)]
pub enum CoordinatorMessage {
    AcknowledgeReconfig {
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        per_kg: Vec<(KeyGroup, KeyGroupStatus)>,
        /// Coordinator-side bookkeeping copy of the snapshot artifact.
        summary: Option<KeyGroupStateHandle>,
    },
    DeclineReconfig {
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        cause: String,
    },
    /// Periodic per-key-group load report feeding the planners.
    ReportLoad {
        subtask: SubtaskIndex,
        records_per_kg: Vec<(KeyGroup, u64)>,
    },
}

/// Coordinator → task and task → task control surface.
#[async_trait]
pub trait TaskGateway: Send + Sync {
    async fn dispatch_state_to_task(
        &self,
        execution_id: ExecutionId,
        operator_id: &str,
        range: KeyGroupRange,
        id_in_model: IdInModel,
    ) -> anyhow::Result<()>;

    async fn dispatch_state(
        &self,
        reconfig_id: u64,
        operator_id: &str,
        kg: KeyGroup,
        version: u64,
        payload: StatePayload,
    ) -> anyhow::Result<()>;

    async fn update_backup_key_groups(
        &self,
        execution_id: ExecutionId,
        operator_id: &str,
        kgs: Vec<KeyGroup>,
    ) -> anyhow::Result<()>;

    async fn send_control(&self, msg: TaskControl) -> anyhow::Result<()>;
}

/// Task → coordinator control surface.
#[async_trait]
pub trait CoordinatorGateway: Send + Sync {
    async fn acknowledge_reconfig(
        &self,
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        per_kg: Vec<(KeyGroup, KeyGroupStatus)>,
        summary: Option<KeyGroupStateHandle>,
    ) -> anyhow::Result<()>;

    async fn decline_reconfig(
        &self,
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        cause: String,
    ) -> anyhow::Result<()>;

    async fn report_load(
        &self,
        subtask: SubtaskIndex,
        records_per_kg: Vec<(KeyGroup, u64)>,
    ) -> anyhow::Result<()>;
}

/// Test hook corrupting or delaying selected key-group payloads in flight.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    corrupt_kgs: Arc<Mutex<HashSet<KeyGroup>>>,
    delays: Arc<Mutex<HashMap<KeyGroup, Duration>>>,
}

impl FaultInjector {
    /// Corrupt every future payload shipped for `kg`.
    pub fn corrupt_key_group(&self, kg: KeyGroup) {
        self.corrupt_kgs.lock().expect("fault injector lock").insert(kg);
    }

    /// Delay every future state dispatch for `kg`.
    pub fn delay_key_group(&self, kg: KeyGroup, delay: Duration) {
        self.delays.lock().expect("fault injector lock").insert(kg, delay);
    }

    fn delay_for(&self, kg: KeyGroup) -> Option<Duration> {
        self.delays.lock().expect("fault injector lock").get(&kg).copied()
    }

    fn maybe_corrupt(&self, kg: KeyGroup, payload: StatePayload) -> StatePayload {
        if !self
            .corrupt_kgs
            .lock()
            .expect("fault injector lock")
            .contains(&kg)
        {
            return payload;
        }
        match payload.into_frame() {
            Some(frame) if !frame.is_empty() => {
                let mut bytes = frame.to_vec();
                let last = bytes.len() - 1;
                bytes[last] ^= 0xff;
                StatePayload::Frame(Bytes::from(bytes))
            }
            Some(frame) => StatePayload::Frame(frame),
            None => StatePayload::PromoteReplica,
        }
    }
}

/// In-process gateway delivering into one task's mailbox.
#[derive(Clone)]
pub struct InProcessTaskGateway {
    mailbox: mpsc::Sender<TaskControl>,
    faults: FaultInjector,
}

impl InProcessTaskGateway {
    pub fn new(mailbox: mpsc::Sender<TaskControl>, faults: FaultInjector) -> Self {
        Self { mailbox, faults }
    }
}

#[async_trait]
impl TaskGateway for InProcessTaskGateway {
    async fn dispatch_state_to_task(
        &self,
        execution_id: ExecutionId,
        operator_id: &str,
        range: KeyGroupRange,
        id_in_model: IdInModel,
    ) -> anyhow::Result<()> {
        self.mailbox
            .send(TaskControl::DispatchStateToTask {
                execution_id,
                operator_id: operator_id.to_string(),
                range,
                id_in_model,
            })
            .await
            .map_err(|_| anyhow::anyhow!("task mailbox closed"))
    }

    async fn dispatch_state(
        &self,
        reconfig_id: u64,
        operator_id: &str,
        kg: KeyGroup,
        version: u64,
        payload: StatePayload,
    ) -> anyhow::Result<()> {
        if let Some(delay) = self.faults.delay_for(kg) {
            tokio::time::sleep(delay).await;
        }
        let payload = self.faults.maybe_corrupt(kg, payload);
        self.mailbox
            .send(TaskControl::DispatchState {
                reconfig_id,
                operator_id: operator_id.to_string(),
                kg,
                version,
                payload,
            })
            .await
            .map_err(|_| anyhow::anyhow!("task mailbox closed"))
    }

    async fn update_backup_key_groups(
        &self,
        execution_id: ExecutionId,
        operator_id: &str,
        kgs: Vec<KeyGroup>,
    ) -> anyhow::Result<()> {
        self.mailbox
            .send(TaskControl::UpdateBackupKeyGroups {
                execution_id,
                operator_id: operator_id.to_string(),
                kgs,
            })
            .await
            .map_err(|_| anyhow::anyhow!("task mailbox closed"))
    }

    async fn send_control(&self, msg: TaskControl) -> anyhow::Result<()> {
        self.mailbox
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("task mailbox closed"))
    }
}

/// In-process gateway delivering into the coordinator's command channel.
#[derive(Clone)]
pub struct InProcessCoordinatorGateway {
    commands: mpsc::Sender<CoordinatorMessage>,
}

impl InProcessCoordinatorGateway {
    pub fn new(commands: mpsc::Sender<CoordinatorMessage>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl CoordinatorGateway for InProcessCoordinatorGateway {
    async fn acknowledge_reconfig(
        &self,
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        per_kg: Vec<(KeyGroup, KeyGroupStatus)>,
        summary: Option<KeyGroupStateHandle>,
    ) -> anyhow::Result<()> {
        self.commands
            .send(CoordinatorMessage::AcknowledgeReconfig {
                reconfig_id,
                execution_id,
                subtask,
                per_kg,
                summary,
            })
            .await
            .map_err(|_| anyhow::anyhow!("coordinator channel closed"))
    }

    async fn decline_reconfig(
        &self,
        reconfig_id: u64,
        execution_id: ExecutionId,
        subtask: SubtaskIndex,
        cause: String,
    ) -> anyhow::Result<()> {
        self.commands
            .send(CoordinatorMessage::DeclineReconfig {
                reconfig_id,
                execution_id,
                subtask,
                cause,
            })
            .await
            .map_err(|_| anyhow::anyhow!("coordinator channel closed"))
    }

    async fn report_load(
        &self,
        subtask: SubtaskIndex,
        records_per_kg: Vec<(KeyGroup, u64)>,
    ) -> anyhow::Result<()> {
        self.commands
            .send(CoordinatorMessage::ReportLoad {
                subtask,
                records_per_kg,
            })
            .await
            .map_err(|_| anyhow::anyhow!("coordinator channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_round_trips() {
        let frame = Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz");
        let chunks = chunk_payload(frame.clone(), 8);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 8));
        assert_eq!(reassemble_chunks(chunks), frame);
    }

    #[test]
    fn small_frames_stay_unchunked() {
        let frame = Bytes::from_static(b"tiny");
        let chunks = chunk_payload(frame.clone(), 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(StatePayload::Chunks(chunks).into_frame(), Some(frame));
    }

    #[test]
    fn fault_injector_flips_payload_bytes() {
        let faults = FaultInjector::default();
        faults.corrupt_key_group(2);
        let clean = faults.maybe_corrupt(1, StatePayload::Frame(Bytes::from_static(b"ok")));
        assert_eq!(clean.into_frame().unwrap().as_ref(), b"ok");
        let corrupted = faults.maybe_corrupt(2, StatePayload::Frame(Bytes::from_static(b"ok")));
        assert_ne!(corrupted.into_frame().unwrap().as_ref(), b"ok");
    }
}
