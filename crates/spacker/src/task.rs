//! The subtask runtime: record dispatch, reconfig-point handling, and the
//! per-task migration mode machine.
//!
//! A task is a single tokio task owning its operator, state table, and input
//! processor. Control RPCs land in the task's mailbox and are handled between
//! records, which serializes them with operator invocation the way the task
//! lock does in the engine. The reconfig-point snapshot is split into a
//! synchronous phase (a consistent view of the affected key-groups, taken
//! inline) and an asynchronous phase (serialize and ship, spawned off the
//! dispatch path when `state.backend.async` is set).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::StateBackend;
use crate::barrier::{Barrier, BarrierKind, StreamElement, StreamRecord};
use crate::config::{ReplicatorConfig, TaskConfig};
use crate::execution_plan::{IdInModel, JobExecutionPlan, SubtaskIndex};
use crate::input_processor::{InputGate, InputProcessor, WatermarkValve};
use crate::key_group::{KeyGroup, KeyGroupRange};
use crate::state_handle::encode_key_group_frame;
use crate::state_table::KeyedStateTable;
use crate::transport::{
    chunk_payload, CoordinatorGateway, ExecutionId, KeyGroupStatus, RecordSender, StatePayload,
    TaskControl, TaskGateway,
};

/// Role of a task within the in-flight reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    Normal,
    Source,
    Destination,
    SourceAndDestination,
}

impl MigrationMode {
    fn of(is_source: bool, is_destination: bool) -> Self {
        match (is_source, is_destination) {
            (true, true) => MigrationMode::SourceAndDestination,
            (true, false) => MigrationMode::Source,
            (false, true) => MigrationMode::Destination,
            (false, false) => MigrationMode::Normal,
        }
    }
}

/// Operator-facing view of the task during one record invocation.
pub struct OperatorContext<'a, B: StateBackend> {
    pub table: &'a mut KeyedStateTable<B>,
    pub subtask: SubtaskIndex,
    outputs: &'a mut Vec<StreamRecord>,
}

impl<B: StateBackend> OperatorContext<'_, B> {
    pub fn emit(&mut self, record: StreamRecord) {
        self.outputs.push(record);
    }
}

/// User operator invoked once per record under the current key context.
pub trait KeyedOperator<B: StateBackend>: Send + 'static {
    fn process(
        &mut self,
        record: &StreamRecord,
        ctx: &mut OperatorContext<'_, B>,
    ) -> anyhow::Result<()>;
}

/// Identity and configuration handed to a task at deploy time.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: ExecutionId,
    pub operator_id: String,
    pub subtask_index: SubtaskIndex,
    pub id_in_model: IdInModel,
    /// Standby peer receiving this task's replica deltas.
    pub standby: Option<SubtaskIndex>,
    pub cfg: TaskConfig,
    pub replicator_cfg: ReplicatorConfig,
}

/// Per-reconfig state kept while a reconfig-point is in flight at this task.
struct ReconfigContext {
    reconfig_id: u64,
    plan: Arc<JobExecutionPlan>,
    previous_range: KeyGroupRange,
    outgoing: Vec<KeyGroup>,
    incoming: Vec<KeyGroup>,
    /// Framed payloads kept until release so a transfer retry needs no second
    /// snapshot.
    cached_frames: Vec<(KeyGroup, Bytes)>,
    /// Key-groups shipped as promote markers instead of payloads.
    promoted: Vec<KeyGroup>,
    released: bool,
}

pub struct StreamTask<B: StateBackend, O: KeyedOperator<B>> {
    ctx: TaskContext,
    table: KeyedStateTable<B>,
    operator: O,
    input: InputProcessor,
    gate: InputGate,
    valve: WatermarkValve,
    mailbox: mpsc::Receiver<TaskControl>,
    peers: Arc<HashMap<SubtaskIndex, Arc<dyn TaskGateway>>>,
    coordinator: Arc<dyn CoordinatorGateway>,
    downstream: RecordSender,
    mode: MigrationMode,
    reconfig: Option<ReconfigContext>,
    /// Reconfig id of the last committed plan seen by this task.
    applied_reconfig_id: u64,
    /// Key-groups this task replicates out, as set by the coordinator.
    backup_key_groups: HashSet<KeyGroup>,
    /// Standby replicas held for peers: kg → (cycle version, framed bytes).
    replica_store: HashMap<KeyGroup, (u64, Bytes)>,
    /// Replica cycle versions acknowledged per key-group we shipped.
    replicated_acked: HashMap<KeyGroup, u64>,
    replica_version: u64,
    /// State dispatches that arrived before their reconfig barrier. Control
    /// messages can overtake the in-band barrier; these are replayed once the
    /// barrier establishes the migration context.
    early_dispatches: Vec<(u64, KeyGroup, u64, StatePayload)>,
    /// Aborted reconfig ids; a cancel can overtake the reconfig barrier, so
    /// the barrier itself must check this before entering migration mode.
    canceled_reconfigs: HashSet<u64>,
}

impl<B: StateBackend, O: KeyedOperator<B>> StreamTask<B, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: TaskContext,
        table: KeyedStateTable<B>,
        operator: O,
        gate: InputGate,
        mailbox: mpsc::Receiver<TaskControl>,
        peers: Arc<HashMap<SubtaskIndex, Arc<dyn TaskGateway>>>,
        coordinator: Arc<dyn CoordinatorGateway>,
        downstream: RecordSender,
    ) -> Self {
        let valve = WatermarkValve::new(gate.num_channels());
        let input = InputProcessor::new(ctx.cfg.order_function);
        Self {
            ctx,
            table,
            operator,
            input,
            gate,
            valve,
            mailbox,
            peers,
            coordinator,
            downstream,
            mode: MigrationMode::Normal,
            reconfig: None,
            applied_reconfig_id: 0,
            backup_key_groups: HashSet::new(),
            replica_store: HashMap::new(),
            replicated_acked: HashMap::new(),
            replica_version: 0,
            early_dispatches: Vec::new(),
            canceled_reconfigs: HashSet::new(),
        }
    }

    /// The task's single-threaded dispatch loop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            // Migrated key-groups drain at the top of the loop, each queue
            // atomically with respect to the operator.
            while let Some((kg, queue)) = self.input.next_drain() {
                for record in queue {
                    self.process_record(record).await?;
                }
                debug!(kg, "drained buffered records for migrated key group");
            }
            if self.input.migration_drained() {
                self.input.exit_migration();
                self.mode = match self.mode {
                    MigrationMode::SourceAndDestination => MigrationMode::Source,
                    MigrationMode::Destination => MigrationMode::Normal,
                    other => other,
                };
            }

            tokio::select! {
                biased;
                msg = self.mailbox.recv() => match msg {
                    None => break,
                    Some(control) => {
                        if !self.handle_control(control).await? {
                            break;
                        }
                    }
                },
                element = self.gate.next() => match element {
                    None => break,
                    Some((_, StreamElement::Record(record))) => {
                        self.dispatch_record(record).await?;
                    }
                    Some((channel, StreamElement::Watermark(watermark))) => {
                        if let Some(emit) = self.valve.input_watermark(channel, watermark) {
                            let _ = self.downstream.send(StreamElement::Watermark(emit)).await;
                        }
                    }
                    Some((_, StreamElement::Barrier(barrier))) => {
                        self.handle_barrier(barrier).await?;
                    }
                },
            }
        }
        Ok(())
    }

    async fn dispatch_record(&mut self, record: StreamRecord) -> anyhow::Result<()> {
        let kg = record.key_group;
        self.input.observe(kg);
        if self.input.should_buffer(kg) {
            self.input.buffer(record);
            return Ok(());
        }
        if self.input.is_suppressed(kg) {
            // Ownership moved away; the partitioner re-emits to the new owner.
            debug!(kg, "dropping record for out-migrated key group");
            return Ok(());
        }
        if !self.table.owns(kg) {
            warn!(kg, subtask = self.ctx.subtask_index, "record routed to non-owner");
            return Ok(());
        }
        self.process_record(record).await
    }

    async fn process_record(&mut self, record: StreamRecord) -> anyhow::Result<()> {
        self.table.set_current_key(&record.key);
        let mut outputs = Vec::new();
        {
            let mut ctx = OperatorContext {
                table: &mut self.table,
                subtask: self.ctx.subtask_index,
                outputs: &mut outputs,
            };
            self.operator.process(&record, &mut ctx)?;
        }
        for output in outputs {
            self.downstream
                .send(StreamElement::Record(output))
                .await
                .map_err(|_| anyhow::anyhow!("downstream channel closed"))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    async fn handle_barrier(&mut self, barrier: Barrier) -> anyhow::Result<()> {
        match barrier.kind.clone() {
            BarrierKind::Checkpoint => {
                // Checkpoint storage is an external collaborator; the
                // changelog path only restricts what gets serialized.
                let handle = if self.ctx.cfg.snapshot_changelog_enabled {
                    self.table.snapshot_changelog(|_| true)
                } else {
                    let owned: Vec<KeyGroup> = self.table.range().iter().collect();
                    self.table.snapshot(&owned)
                };
                match handle {
                    Ok(handle) => debug!(
                        checkpoint = barrier.id,
                        bytes = handle.stream_len(),
                        "checkpoint snapshot taken"
                    ),
                    Err(err) => warn!(error = ?err, "checkpoint snapshot failed"),
                }
                Ok(())
            }
            BarrierKind::CancelReconfig => {
                self.cancel_reconfig(barrier.id);
                Ok(())
            }
            BarrierKind::ReconfigPoint { plan, plan_digest } => {
                self.handle_reconfig_point(barrier.id, plan, plan_digest).await
            }
        }
    }

    async fn handle_reconfig_point(
        &mut self,
        reconfig_id: u64,
        plan: Arc<JobExecutionPlan>,
        plan_digest: u128,
    ) -> anyhow::Result<()> {
        if reconfig_id <= self.applied_reconfig_id {
            let err = crate::error::MigrationError::StaleReconfig {
                got: reconfig_id,
                current: self.applied_reconfig_id,
            };
            warn!(error = %err, "ignoring stale reconfig point");
            return Ok(());
        }
        if self.canceled_reconfigs.contains(&reconfig_id) {
            debug!(reconfig_id, "ignoring reconfig point canceled in flight");
            return Ok(());
        }
        if plan.digest() != plan_digest {
            self.coordinator
                .decline_reconfig(
                    reconfig_id,
                    self.ctx.execution_id,
                    self.ctx.subtask_index,
                    "plan digest mismatch".to_string(),
                )
                .await?;
            return Ok(());
        }

        let subtask = self.ctx.subtask_index;
        let outgoing = plan.source_key_groups(subtask).to_vec();
        let incoming = plan.destination_key_groups(subtask).to_vec();
        if outgoing.is_empty() && incoming.is_empty() {
            // Unaffected tasks skip the state snapshot entirely.
            debug!(reconfig_id, "reconfig point for unaffected task");
            self.applied_reconfig_id = reconfig_id;
            return Ok(());
        }
        info!(
            reconfig_id,
            subtask,
            outgoing = ?outgoing,
            incoming = ?incoming,
            "reconfig point reached"
        );

        let previous_range = self.table.range().clone();
        let mut context = ReconfigContext {
            reconfig_id,
            plan: plan.clone(),
            previous_range,
            outgoing: outgoing.clone(),
            incoming: incoming.clone(),
            cached_frames: Vec::new(),
            promoted: Vec::new(),
            released: false,
        };

        if !outgoing.is_empty() {
            // Stop dispatching for out-migrating key-groups before snapshot.
            self.input.suppress(&outgoing);

            // Key-groups whose replica at the destination is still fresh need
            // no payload, only a promote marker.
            let mut ship = Vec::new();
            for kg in &outgoing {
                let dest = plan.destination_for(*kg);
                let replica_fresh = self.ctx.standby == dest
                    && self.replicated_acked.contains_key(kg)
                    && !self.table.is_dirty(*kg);
                if replica_fresh {
                    context.promoted.push(*kg);
                } else {
                    ship.push(*kg);
                }
            }

            // Synchronous phase: a consistent view of the affected groups.
            let handle = match self.table.snapshot(&ship) {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(error = %err, "affected snapshot failed");
                    self.coordinator
                        .decline_reconfig(
                            reconfig_id,
                            self.ctx.execution_id,
                            subtask,
                            err.to_string(),
                        )
                        .await?;
                    self.input.clear_suppressed();
                    return Ok(());
                }
            };
            let summary = handle.compose_summary();
            let parts = match handle.decompose() {
                Ok(parts) => parts,
                Err(err) => {
                    self.coordinator
                        .decline_reconfig(
                            reconfig_id,
                            self.ctx.execution_id,
                            subtask,
                            err.to_string(),
                        )
                        .await?;
                    self.input.clear_suppressed();
                    return Ok(());
                }
            };
            context.cached_frames = parts
                .into_iter()
                .map(|(kg, _, payload)| (kg, encode_key_group_frame(kg, &payload)))
                .collect();

            // Asynchronous phase: serialize-and-ship off the dispatch path.
            let shipment = Shipment {
                reconfig_id,
                execution_id: self.ctx.execution_id,
                operator_id: self.ctx.operator_id.clone(),
                subtask,
                frames: context.cached_frames.clone(),
                promoted: context.promoted.clone(),
                plan: plan.clone(),
                peers: self.peers.clone(),
                coordinator: self.coordinator.clone(),
                cfg: self.ctx.cfg,
                summary: Some(summary),
            };
            if self.ctx.cfg.async_snapshot {
                tokio::spawn(shipment.run());
            } else {
                shipment.run().await;
            }
        }

        // Ownership transitions atomically at the reconfig-point boundary.
        self.table
            .update_range(plan.aligned_key_group_range(subtask).clone());
        self.ctx.id_in_model = plan.id_in_model(subtask);

        if !incoming.is_empty() {
            if let Err(err) = self.input.begin_migration(&incoming, reconfig_id) {
                self.coordinator
                    .decline_reconfig(
                        reconfig_id,
                        self.ctx.execution_id,
                        subtask,
                        err.to_string(),
                    )
                    .await?;
                return Ok(());
            }
        }

        self.mode = MigrationMode::of(!outgoing.is_empty(), !incoming.is_empty());
        self.reconfig = Some(context);

        // Replay state dispatches that overtook the barrier.
        let early: Vec<_> = std::mem::take(&mut self.early_dispatches);
        for (id, kg, version, payload) in early {
            if id == reconfig_id {
                self.ingest_dispatched(id, kg, version, payload).await?;
            } else {
                warn!(kg, id, reconfig_id, "discarding stale early state dispatch");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control messages
    // ------------------------------------------------------------------

    async fn handle_control(&mut self, control: TaskControl) -> anyhow::Result<bool> {
        match control {
            TaskControl::Shutdown => return Ok(false),
            TaskControl::InjectBarrier(barrier) => {
                // Only pipeline heads inject; a worker sees this when it is
                // itself the head of a chain, which this topology has none of.
                warn!(id = barrier.id, "barrier injection on non-head task");
            }
            TaskControl::DispatchStateToTask {
                execution_id: _,
                operator_id,
                range,
                id_in_model,
            } => {
                if operator_id != self.ctx.operator_id {
                    warn!(operator_id, "ownership dispatch for unknown operator");
                    return Ok(true);
                }
                info!(id_in_model, kgs = range.len(), "ownership reinitialized");
                self.table.update_range(range);
                self.ctx.id_in_model = id_in_model;
            }
            TaskControl::DispatchState {
                reconfig_id,
                operator_id,
                kg,
                version,
                payload,
            } => {
                if operator_id == self.ctx.operator_id {
                    self.ingest_dispatched(reconfig_id, kg, version, payload)
                        .await?;
                }
            }
            TaskControl::ReplicaDelta {
                operator_id,
                kg,
                version,
                frame,
            } => {
                if operator_id == self.ctx.operator_id {
                    debug!(kg, version, "standby replica delta stored");
                    self.replica_store.insert(kg, (version, frame));
                }
            }
            TaskControl::UpdateBackupKeyGroups {
                execution_id: _,
                operator_id,
                kgs,
            } => {
                if operator_id == self.ctx.operator_id {
                    self.backup_key_groups = kgs.into_iter().collect();
                }
            }
            TaskControl::Rewire { plan } => {
                // Worker inputs are slot-stable in this topology; a rewire
                // only refreshes channel-derived state.
                debug!(version = plan.version(), "reconnecting input processor");
                self.valve.reconnect(self.gate.num_channels());
            }
            TaskControl::RetryTransfer { reconfig_id, kgs } => {
                self.retry_transfer(reconfig_id, kgs).await?;
            }
            TaskControl::ReleaseMigratedState { reconfig_id } => {
                self.release_migrated_state(reconfig_id).await?;
            }
            TaskControl::CompleteReconfig { reconfig_id, plan } => {
                self.complete_reconfig(reconfig_id, plan);
            }
            TaskControl::CancelReconfig { reconfig_id } => {
                self.cancel_reconfig(reconfig_id);
            }
            TaskControl::ReplicationCycle => {
                self.replication_cycle().await?;
            }
            TaskControl::ReportLoadCycle => {
                let load = self.input.take_load_snapshot();
                if !load.is_empty() {
                    self.coordinator
                        .report_load(self.ctx.subtask_index, load)
                        .await?;
                }
            }
        }
        Ok(true)
    }

    async fn ingest_dispatched(
        &mut self,
        reconfig_id: u64,
        kg: KeyGroup,
        version: u64,
        payload: StatePayload,
    ) -> anyhow::Result<()> {
        let Some(context) = &self.reconfig else {
            if reconfig_id > self.applied_reconfig_id
                && !self.canceled_reconfigs.contains(&reconfig_id)
            {
                debug!(kg, reconfig_id, "state dispatch ahead of barrier, stashing");
                self.early_dispatches.push((reconfig_id, kg, version, payload));
            } else {
                warn!(kg, reconfig_id, "dropping state dispatch for settled reconfig");
            }
            return Ok(());
        };
        if context.reconfig_id != reconfig_id {
            if reconfig_id > context.reconfig_id {
                self.early_dispatches.push((reconfig_id, kg, version, payload));
            } else {
                warn!(
                    kg,
                    got = reconfig_id,
                    current = context.reconfig_id,
                    "dropping state dispatch for mismatched reconfig"
                );
            }
            return Ok(());
        }

        let outcome = if payload.is_promote() {
            match self.replica_store.remove(&kg) {
                Some((_, frame)) => self
                    .table
                    .ingest_key_group(kg, version, frame)
                    .map(|_| KeyGroupStatus::Promoted),
                None => Err(crate::error::MigrationError::IngestFailure {
                    kg,
                    reason: "promote marker without a stored replica".to_string(),
                }),
            }
        } else {
            let frame = payload.into_frame().unwrap_or_default();
            self.table
                .ingest_key_group(kg, version, frame)
                .map(|_| KeyGroupStatus::Ingested)
        };

        match outcome {
            Ok(status) => {
                self.input.complete_migration_for_key(kg);
                self.coordinator
                    .acknowledge_reconfig(
                        reconfig_id,
                        self.ctx.execution_id,
                        self.ctx.subtask_index,
                        vec![(kg, status)],
                        None,
                    )
                    .await?;
            }
            Err(err) => {
                warn!(error = %err, kg, "state ingest failed");
                self.coordinator
                    .decline_reconfig(
                        reconfig_id,
                        self.ctx.execution_id,
                        self.ctx.subtask_index,
                        err.to_string(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn retry_transfer(&mut self, reconfig_id: u64, kgs: Vec<KeyGroup>) -> anyhow::Result<()> {
        let Some(context) = &self.reconfig else {
            warn!(reconfig_id, "transfer retry without in-flight reconfig");
            return Ok(());
        };
        if context.reconfig_id != reconfig_id || context.released {
            return Ok(());
        }
        let frames: Vec<(KeyGroup, Bytes)> = context
            .cached_frames
            .iter()
            .filter(|(kg, _)| kgs.contains(kg))
            .cloned()
            .collect();
        let promoted: Vec<KeyGroup> = context
            .promoted
            .iter()
            .filter(|kg| kgs.contains(kg))
            .copied()
            .collect();
        info!(reconfig_id, retried = frames.len() + promoted.len(), "retrying state transfer");
        let shipment = Shipment {
            reconfig_id,
            execution_id: self.ctx.execution_id,
            operator_id: self.ctx.operator_id.clone(),
            subtask: self.ctx.subtask_index,
            frames,
            promoted,
            plan: context.plan.clone(),
            peers: self.peers.clone(),
            coordinator: self.coordinator.clone(),
            cfg: self.ctx.cfg,
            summary: None,
        };
        shipment.run().await;
        Ok(())
    }

    async fn release_migrated_state(&mut self, reconfig_id: u64) -> anyhow::Result<()> {
        let Some(context) = self.reconfig.as_mut() else {
            return Ok(());
        };
        if context.reconfig_id != reconfig_id || context.outgoing.is_empty() {
            return Ok(());
        }
        let outgoing = context.outgoing.clone();
        context.released = true;
        context.cached_frames.clear();
        self.table.release_changelogs(&outgoing);
        for kg in &outgoing {
            self.replicated_acked.remove(kg);
        }
        info!(reconfig_id, released = outgoing.len(), "source released migrated state");
        let per_kg = outgoing
            .into_iter()
            .map(|kg| (kg, KeyGroupStatus::Released))
            .collect();
        self.coordinator
            .acknowledge_reconfig(
                reconfig_id,
                self.ctx.execution_id,
                self.ctx.subtask_index,
                per_kg,
                None,
            )
            .await?;
        Ok(())
    }

    fn complete_reconfig(&mut self, reconfig_id: u64, _plan: Arc<JobExecutionPlan>) {
        if let Some(context) = &self.reconfig {
            if context.reconfig_id != reconfig_id {
                return;
            }
        }
        self.applied_reconfig_id = self.applied_reconfig_id.max(reconfig_id);
        self.input.clear_suppressed();
        self.reconfig = None;
        self.mode = if self.input.is_under_migration() {
            MigrationMode::Destination
        } else {
            MigrationMode::Normal
        };
        debug!(reconfig_id, "reconfig committed at task");
    }

    fn cancel_reconfig(&mut self, reconfig_id: u64) {
        self.canceled_reconfigs.insert(reconfig_id);
        self.early_dispatches.retain(|(id, _, _, _)| *id != reconfig_id);
        let Some(context) = self.reconfig.take() else {
            return;
        };
        if context.reconfig_id != reconfig_id {
            self.reconfig = Some(context);
            return;
        }
        // Destinations drop partial transfers; sources re-own their state.
        if !context.incoming.is_empty() {
            self.table.release_changelogs(&context.incoming);
            let dropped = self.input.cancel_migration();
            info!(reconfig_id, dropped, "migration canceled, buffers discarded");
        }
        self.table.update_range(context.previous_range);
        self.input.clear_suppressed();
        self.mode = MigrationMode::Normal;
    }

    /// One proactive replication cycle: ship the changelog delta of the
    /// filter-selected key-groups to the standby peer.
    async fn replication_cycle(&mut self) -> anyhow::Result<()> {
        let Some(standby) = self.ctx.standby else {
            return Ok(());
        };
        if !self.ctx.replicator_cfg.enabled() {
            return Ok(());
        }
        let mut candidates: Vec<KeyGroup> = self
            .table
            .changelog()
            .iter()
            .copied()
            .filter(|kg| self.ctx.replicator_cfg.selects(*kg))
            .filter(|kg| self.backup_key_groups.is_empty() || self.backup_key_groups.contains(kg))
            .filter(|kg| self.table.owns(*kg))
            .collect();
        candidates.sort_unstable();
        if candidates.is_empty() {
            return Ok(());
        }

        let handle = match self.table.snapshot(&candidates) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "replication snapshot failed");
                return Ok(());
            }
        };
        let parts = match handle.decompose() {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "replication snapshot decompose failed");
                return Ok(());
            }
        };
        let Some(peer) = self.peers.get(&standby) else {
            warn!(standby, "no gateway for standby peer");
            return Ok(());
        };

        self.replica_version += 1;
        let mut shipped = Vec::new();
        let mut failed = 0usize;
        for (kg, _, payload) in parts {
            let frame = encode_key_group_frame(kg, &payload);
            let delta = TaskControl::ReplicaDelta {
                operator_id: self.ctx.operator_id.clone(),
                kg,
                version: self.replica_version,
                frame,
            };
            match peer.send_control(delta).await {
                Ok(()) => {
                    self.replicated_acked.insert(kg, self.replica_version);
                    shipped.push(kg);
                }
                Err(err) => {
                    // Non-fatal: the changelog keeps the key-group for the
                    // next cycle.
                    warn!(error = ?err, kg, "replica delta send failed");
                    failed += 1;
                }
            }
        }
        self.table.clear_changelog(&shipped);
        if failed > 0 {
            let err = crate::error::MigrationError::ReplicationFailure { failed };
            warn!(error = %err, "replication cycle left dirty key groups behind");
        } else {
            debug!(shipped = shipped.len(), "replication cycle complete");
        }
        Ok(())
    }
}

/// The asynchronous snapshot phase: push each migrating key-group to its
/// destination and hand the summary handle to the coordinator.
struct Shipment {
    reconfig_id: u64,
    execution_id: ExecutionId,
    operator_id: String,
    subtask: SubtaskIndex,
    frames: Vec<(KeyGroup, Bytes)>,
    promoted: Vec<KeyGroup>,
    plan: Arc<JobExecutionPlan>,
    peers: Arc<HashMap<SubtaskIndex, Arc<dyn TaskGateway>>>,
    coordinator: Arc<dyn CoordinatorGateway>,
    cfg: TaskConfig,
    summary: Option<crate::state_handle::KeyGroupStateHandle>,
}

impl Shipment {
    /// Transfer order for migrating key-groups, driving both destination
    /// arrival order and drain order; this is the tail-latency knob.
    fn order_frames(&mut self) {
        use crate::config::OrderFunction;
        match self.cfg.order_function {
            OrderFunction::Default => self.frames.sort_by_key(|(kg, _)| *kg),
            OrderFunction::Reverse => {
                self.frames.sort_by_key(|(kg, _)| std::cmp::Reverse(*kg));
            }
            OrderFunction::Random => {
                use rand::seq::SliceRandom;
                use rand::SeedableRng;
                let mut rng = rand::rngs::StdRng::seed_from_u64(self.reconfig_id);
                self.frames.shuffle(&mut rng);
            }
        }
    }

    async fn run(mut self) {
        self.order_frames();
        let mut per_kg = Vec::with_capacity(self.frames.len() + self.promoted.len());
        let batch = if self.cfg.sync_keys == 0 {
            self.frames.len().max(1)
        } else {
            self.cfg.sync_keys
        };

        for round in self.frames.chunks(batch) {
            for (kg, frame) in round {
                let payload = if self.cfg.chunked_transmission {
                    StatePayload::Chunks(chunk_payload(frame.clone(), self.cfg.chunk_bytes))
                } else {
                    StatePayload::Frame(frame.clone())
                };
                if self.dispatch(*kg, payload).await {
                    per_kg.push((*kg, KeyGroupStatus::SnapshotShipped));
                }
            }
            // Let the dispatch loop and destinations make progress between
            // transfer rounds.
            tokio::task::yield_now().await;
        }
        for kg in &self.promoted {
            if self.dispatch(*kg, StatePayload::PromoteReplica).await {
                per_kg.push((*kg, KeyGroupStatus::SnapshotShipped));
            }
        }

        if let Err(err) = self
            .coordinator
            .acknowledge_reconfig(
                self.reconfig_id,
                self.execution_id,
                self.subtask,
                per_kg,
                self.summary,
            )
            .await
        {
            warn!(error = ?err, "snapshot acknowledgement failed");
        }
    }

    async fn dispatch(&self, kg: KeyGroup, payload: StatePayload) -> bool {
        let Some(destination) = self.plan.destination_for(kg) else {
            warn!(kg, "no destination for migrating key group");
            return false;
        };
        let Some(peer) = self.peers.get(&destination) else {
            warn!(kg, destination, "no gateway for destination");
            return false;
        };
        match peer
            .dispatch_state(
                self.reconfig_id,
                &self.operator_id,
                kg,
                self.reconfig_id,
                payload,
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(error = ?err, kg, "state dispatch failed");
                false
            }
        }
    }
}
