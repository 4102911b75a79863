//! The reconfig coordinator: one actor per job driving reconfig-points.
//!
//! Reconfiguration is staged:
//! 1. build the next plan (strategy or explicit target) and stamp a
//!    monotonic `reconfig_id`
//! 2. inject a reconfig-point barrier at the pipeline head
//! 3. collect source snapshot acks (`Snapshotting`)
//! 4. collect per-key-group ingest acks, retrying slow transfers
//!    (`Transferring`)
//! 5. tell sources to release migrated state and collect release acks
//!    (`Draining`)
//! 6. commit: push the new plan as current and notify tasks
//!
//! A decline from any task aborts the reconfig-point: the head is rewired
//! back to the old plan and an in-band cancel marker follows the reconfig
//! barrier, so every task sees trigger-then-cancel in stream order. Only one
//! reconfig-point can be in flight; triggers while not `Idle` are rejected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::barrier::Barrier;
use crate::config::{CoordinatorConfig, ReplicatorConfig};
use crate::error::MigrationError;
use crate::execution_plan::{IdInModel, JobExecutionPlan, SubtaskIndex, UNUSED_SUBTASK};
use crate::key_group::{KeyGroup, KeyGroupRange};
use crate::planner::{strategy_for, LoadSnapshot};
use crate::state_handle::KeyGroupStateHandle;
use crate::transport::{CoordinatorMessage, KeyGroupStatus, TaskControl, TaskGateway};

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Coordinator FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconfigState {
    Idle,
    Triggered,
    Snapshotting,
    Transferring,
    Draining,
    Committed,
}

/// Final record of one reconfig-point.
#[derive(Debug, Clone, Serialize)]
pub struct ReconfigOutcome {
    pub reconfig_id: u64,
    pub committed: bool,
    pub partial: bool,
    pub per_kg: Vec<(KeyGroup, KeyGroupStatus)>,
    pub cause: Option<String>,
}

/// Health surface exposed by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: ReconfigState,
    pub reconfig_id: u64,
    pub unacked_tasks: Vec<SubtaskIndex>,
    pub plan_version: u64,
    pub last_outcome: Option<ReconfigOutcome>,
}

enum CoordinatorCommand {
    Trigger {
        target: Option<BTreeMap<IdInModel, Vec<KeyGroup>>>,
        reply: oneshot::Sender<anyhow::Result<u64>>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown,
}

/// Clonable handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Trigger a reconfiguration with an explicit target mapping.
    pub async fn trigger_with_target(
        &self,
        target: BTreeMap<IdInModel, Vec<KeyGroup>>,
    ) -> anyhow::Result<u64> {
        self.trigger(Some(target)).await
    }

    /// Trigger a reconfiguration planned by the configured strategy.
    pub async fn trigger_planned(&self) -> anyhow::Result<u64> {
        self.trigger(None).await
    }

    async fn trigger(
        &self,
        target: Option<BTreeMap<IdInModel, Vec<KeyGroup>>>,
    ) -> anyhow::Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CoordinatorCommand::Trigger { target, reply })
            .await
            .map_err(|_| anyhow::anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("coordinator stopped"))?
    }

    pub async fn status(&self) -> anyhow::Result<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CoordinatorCommand::Status { reply })
            .await
            .map_err(|_| anyhow::anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("coordinator stopped"))
    }

    /// JSON rendering of [`Self::status`] for health endpoints and logs.
    pub async fn status_json(&self) -> anyhow::Result<String> {
        let status = self.status().await?;
        serde_json::to_string(&status).map_err(Into::into)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(CoordinatorCommand::Shutdown).await;
    }
}

struct InflightReconfig {
    reconfig_id: u64,
    plan: Arc<JobExecutionPlan>,
    previous_plan: Arc<JobExecutionPlan>,
    pending_sources: HashSet<SubtaskIndex>,
    pending_ingest: HashSet<KeyGroup>,
    pending_release: HashSet<SubtaskIndex>,
    per_kg: BTreeMap<KeyGroup, KeyGroupStatus>,
    transfer_deadline: Instant,
    attempts: u32,
    partial: bool,
    summaries: Vec<KeyGroupStateHandle>,
    release_requested: bool,
}

/// Singleton per-job coordinator actor.
pub struct ReconfigCoordinator {
    cfg: CoordinatorConfig,
    replicator_cfg: ReplicatorConfig,
    operator_id: String,
    plan: Arc<JobExecutionPlan>,
    head: Arc<dyn TaskGateway>,
    tasks: HashMap<SubtaskIndex, Arc<dyn TaskGateway>>,
    commands: mpsc::Receiver<CoordinatorCommand>,
    messages: mpsc::Receiver<CoordinatorMessage>,
    reconfig_seq: u64,
    inflight: Option<InflightReconfig>,
    load: LoadSnapshot,
    last_outcome: Option<ReconfigOutcome>,
}

impl ReconfigCoordinator {
    /// Spawn the coordinator actor and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        cfg: CoordinatorConfig,
        replicator_cfg: ReplicatorConfig,
        operator_id: String,
        initial_plan: Arc<JobExecutionPlan>,
        head: Arc<dyn TaskGateway>,
        tasks: HashMap<SubtaskIndex, Arc<dyn TaskGateway>>,
        messages: mpsc::Receiver<CoordinatorMessage>,
    ) -> CoordinatorHandle {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let coordinator = Self {
            cfg,
            replicator_cfg,
            operator_id,
            plan: initial_plan,
            head,
            tasks,
            commands: commands_rx,
            messages,
            reconfig_seq: 0,
            inflight: None,
            load: LoadSnapshot::default(),
            last_outcome: None,
        };
        tokio::spawn(coordinator.run());
        CoordinatorHandle {
            commands: commands_tx,
        }
    }

    async fn run(mut self) {
        // Push the initial backup assignment so replication can start before
        // the first reconfig.
        self.push_backup_key_groups().await;

        let tick = self
            .cfg
            .transfer_timeout
            .checked_div(4)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(CoordinatorCommand::Shutdown) => break,
                    Some(CoordinatorCommand::Trigger { target, reply }) => {
                        let result = self.handle_trigger(target).await;
                        let _ = reply.send(result);
                    }
                    Some(CoordinatorCommand::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                },
                message = self.messages.recv() => match message {
                    None => break,
                    Some(message) => self.handle_message(message).await,
                },
                _ = ticker.tick() => self.check_transfer_deadline().await,
            }
        }
    }

    fn state(&self) -> ReconfigState {
        match &self.inflight {
            None => ReconfigState::Idle,
            Some(inflight) => {
                if !inflight.pending_sources.is_empty() {
                    ReconfigState::Snapshotting
                } else if !inflight.pending_ingest.is_empty() {
                    ReconfigState::Transferring
                } else if !inflight.pending_release.is_empty() {
                    ReconfigState::Draining
                } else {
                    ReconfigState::Committed
                }
            }
        }
    }

    fn status(&self) -> CoordinatorStatus {
        let unacked_tasks = match &self.inflight {
            None => Vec::new(),
            Some(inflight) => {
                if !inflight.pending_sources.is_empty() {
                    inflight.pending_sources.iter().copied().collect()
                } else if !inflight.pending_ingest.is_empty() {
                    let mut tasks: Vec<SubtaskIndex> = inflight
                        .pending_ingest
                        .iter()
                        .filter_map(|kg| inflight.plan.destination_for(*kg))
                        .collect();
                    tasks.sort_unstable();
                    tasks.dedup();
                    tasks
                } else {
                    inflight.pending_release.iter().copied().collect()
                }
            }
        };
        CoordinatorStatus {
            state: self.state(),
            reconfig_id: self
                .inflight
                .as_ref()
                .map(|inflight| inflight.reconfig_id)
                .unwrap_or(self.reconfig_seq),
            unacked_tasks,
            plan_version: self.plan.version(),
            last_outcome: self.last_outcome.clone(),
        }
    }

    async fn handle_trigger(
        &mut self,
        target: Option<BTreeMap<IdInModel, Vec<KeyGroup>>>,
    ) -> anyhow::Result<u64> {
        if self.inflight.is_some() {
            return Err(MigrationError::NotIdle {
                state: format!("{:?}", self.state()),
            }
            .into());
        }
        if !self.cfg.target_operators.is_empty()
            && !self.cfg.target_operators.iter().any(|name| *name == self.operator_id)
        {
            anyhow::bail!("operator {} is not a reconfig target", self.operator_id);
        }

        let reconfig_id = self.reconfig_seq + 1;
        let mapping = match target {
            Some(mapping) => mapping,
            None => {
                let mut strategy = strategy_for(&self.cfg, reconfig_id)?;
                strategy.plan(&self.plan, &self.load)?
            }
        };

        let plan = Arc::new(JobExecutionPlan::from_previous(
            &self.plan,
            &mapping,
            reconfig_id,
        )?);
        let migrating = plan.migrating_key_groups();
        self.reconfig_seq = reconfig_id;

        if migrating.is_empty() {
            // Nothing moves (profiling runs, identical mappings): the new
            // plan becomes current without a barrier round.
            info!(reconfig_id, "reconfig is a no-op, committing in place");
            self.plan = plan;
            self.last_outcome = Some(ReconfigOutcome {
                reconfig_id,
                committed: true,
                partial: false,
                per_kg: Vec::new(),
                cause: None,
            });
            return Ok(reconfig_id);
        }

        let pending_sources: HashSet<SubtaskIndex> = (0..plan.num_opened_subtasks())
            .filter(|subtask| plan.is_source(*subtask))
            .collect();
        let pending_release = pending_sources.clone();
        info!(
            reconfig_id,
            migrating = migrating.len(),
            sources = pending_sources.len(),
            "triggering reconfig point"
        );

        // Reconnect gates on affected tasks while the transfer runs.
        for subtask in plan.affected_subtasks() {
            if let Some(gateway) = self.tasks.get(&subtask) {
                let _ = gateway
                    .send_control(TaskControl::Rewire { plan: plan.clone() })
                    .await;
            }
        }

        let barrier = Barrier::reconfig_point(reconfig_id, now_unix_ms(), plan.clone());
        self.head
            .send_control(TaskControl::InjectBarrier(barrier))
            .await
            .map_err(|err| anyhow::anyhow!("barrier injection failed: {err}"))?;

        self.inflight = Some(InflightReconfig {
            reconfig_id,
            previous_plan: self.plan.clone(),
            plan,
            pending_sources,
            pending_ingest: migrating.into_iter().collect(),
            pending_release,
            per_kg: BTreeMap::new(),
            transfer_deadline: Instant::now() + self.cfg.transfer_timeout,
            attempts: 0,
            partial: false,
            summaries: Vec::new(),
            release_requested: false,
        });
        Ok(reconfig_id)
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::ReportLoad {
                subtask: _,
                records_per_kg,
            } => {
                for (kg, count) in records_per_kg {
                    *self.load.records_per_kg.entry(kg).or_insert(0) += count;
                }
            }
            CoordinatorMessage::AcknowledgeReconfig {
                reconfig_id,
                execution_id: _,
                subtask,
                per_kg,
                summary,
            } => {
                self.handle_ack(reconfig_id, subtask, per_kg, summary).await;
            }
            CoordinatorMessage::DeclineReconfig {
                reconfig_id,
                execution_id: _,
                subtask,
                cause,
            } => {
                warn!(reconfig_id, subtask, cause, "reconfig declined");
                self.abort(reconfig_id, cause).await;
            }
        }
    }

    async fn handle_ack(
        &mut self,
        reconfig_id: u64,
        subtask: SubtaskIndex,
        per_kg: Vec<(KeyGroup, KeyGroupStatus)>,
        summary: Option<KeyGroupStateHandle>,
    ) {
        let Some(inflight) = self.inflight.as_mut() else {
            debug!(reconfig_id, "ack without in-flight reconfig");
            return;
        };
        if inflight.reconfig_id != reconfig_id {
            warn!(
                got = reconfig_id,
                current = inflight.reconfig_id,
                "ack for mismatched reconfig"
            );
            return;
        }
        if let Some(summary) = summary {
            inflight.summaries.push(summary);
        }

        let mut source_acked = false;
        let mut release_acked = false;
        let mut failure: Option<String> = None;
        for (kg, status) in per_kg {
            match &status {
                KeyGroupStatus::SnapshotShipped => source_acked = true,
                KeyGroupStatus::Ingested | KeyGroupStatus::Promoted => {
                    inflight.pending_ingest.remove(&kg);
                }
                KeyGroupStatus::Released => release_acked = true,
                KeyGroupStatus::Failed(cause) => failure = Some(cause.clone()),
            }
            // Shipped/released acks are source-side progress markers; the
            // destination's ingest outcome is what the record keeps.
            match &status {
                KeyGroupStatus::SnapshotShipped | KeyGroupStatus::Released => {
                    inflight.per_kg.entry(kg).or_insert(status);
                }
                _ => {
                    inflight.per_kg.insert(kg, status);
                }
            }
        }
        if let Some(cause) = failure {
            self.abort(reconfig_id, cause).await;
            return;
        }
        if source_acked {
            inflight.pending_sources.remove(&subtask);
        }
        if release_acked {
            inflight.pending_release.remove(&subtask);
        }

        if inflight.pending_sources.is_empty()
            && inflight.pending_ingest.is_empty()
            && !inflight.release_requested
        {
            inflight.release_requested = true;
            info!(reconfig_id, "all key groups ingested, requesting source release");
            let sources: Vec<SubtaskIndex> = inflight.pending_release.iter().copied().collect();
            for source in sources {
                if let Some(gateway) = self.tasks.get(&source) {
                    let _ = gateway
                        .send_control(TaskControl::ReleaseMigratedState { reconfig_id })
                        .await;
                }
            }
        }

        if self.state() == ReconfigState::Committed {
            self.commit().await;
        }
    }

    async fn commit(&mut self) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        let reconfig_id = inflight.reconfig_id;
        let plan = inflight.plan.clone();
        info!(
            reconfig_id,
            version = plan.version(),
            partial = inflight.partial,
            "reconfig committed"
        );
        self.plan = plan.clone();
        self.last_outcome = Some(ReconfigOutcome {
            reconfig_id,
            committed: true,
            partial: inflight.partial,
            per_kg: inflight.per_kg.clone().into_iter().collect(),
            cause: None,
        });
        // The summaries were bookkeeping for the transfer; the real bytes
        // moved task-to-task and the destinations acknowledged them.
        debug!(
            reconfig_id,
            summaries = inflight.summaries.len(),
            covered = inflight
                .summaries
                .iter()
                .map(|summary| summary.range().len())
                .sum::<usize>(),
            "dropping transfer bookkeeping"
        );
        drop(inflight);

        for (subtask, gateway) in &self.tasks {
            let _ = gateway
                .send_control(TaskControl::CompleteReconfig {
                    reconfig_id,
                    plan: plan.clone(),
                })
                .await;
            // Slots that lost their executor are reinitialized as unused.
            if plan.id_in_model(*subtask) == UNUSED_SUBTASK {
                let _ = gateway
                    .dispatch_state_to_task(
                        0,
                        &self.operator_id,
                        KeyGroupRange::empty(),
                        UNUSED_SUBTASK,
                    )
                    .await;
            }
        }
        self.push_backup_key_groups().await;
    }

    async fn abort(&mut self, reconfig_id: u64, cause: String) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        if inflight.reconfig_id != reconfig_id {
            self.inflight = Some(inflight);
            return;
        }
        warn!(reconfig_id, cause, "aborting reconfig point");

        // Rewire the head back to the old plan, then follow with an in-band
        // cancel marker so tasks on the restored routing see trigger-then-
        // cancel in stream order. Tasks outside that routing (a destination
        // occupied only under the new plan, a retired source) get the cancel
        // over their mailbox; the canceled-id guard makes duplicates and
        // early arrivals harmless.
        let _ = self
            .head
            .send_control(TaskControl::Rewire {
                plan: inflight.previous_plan.clone(),
            })
            .await;
        let _ = self
            .head
            .send_control(TaskControl::InjectBarrier(Barrier::cancel(
                reconfig_id,
                now_unix_ms(),
            )))
            .await;
        for gateway in self.tasks.values() {
            let _ = gateway
                .send_control(TaskControl::CancelReconfig { reconfig_id })
                .await;
        }

        self.last_outcome = Some(ReconfigOutcome {
            reconfig_id,
            committed: false,
            partial: false,
            per_kg: inflight.per_kg.into_iter().collect(),
            cause: Some(cause),
        });
    }

    async fn check_transfer_deadline(&mut self) {
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };
        if inflight.pending_ingest.is_empty() || Instant::now() < inflight.transfer_deadline {
            return;
        }
        inflight.attempts += 1;
        let reconfig_id = inflight.reconfig_id;

        if inflight.attempts > self.cfg.transfer_retries {
            if self.cfg.partial_commit_on_timeout {
                warn!(
                    reconfig_id,
                    missing = inflight.pending_ingest.len(),
                    "transfer timed out, committing partially"
                );
                inflight.partial = true;
                inflight.pending_ingest.clear();
                inflight.pending_sources.clear();
                if !inflight.release_requested {
                    inflight.release_requested = true;
                    let sources: Vec<SubtaskIndex> =
                        inflight.pending_release.iter().copied().collect();
                    for source in sources {
                        if let Some(gateway) = self.tasks.get(&source) {
                            let _ = gateway
                                .send_control(TaskControl::ReleaseMigratedState { reconfig_id })
                                .await;
                        }
                    }
                }
                if self.state() == ReconfigState::Committed {
                    self.commit().await;
                }
            } else {
                let attempts = inflight.attempts;
                let kg = inflight.pending_ingest.iter().copied().min().unwrap_or(0);
                self.abort(
                    reconfig_id,
                    MigrationError::TransferTimeout { kg, attempts }.to_string(),
                )
                .await;
            }
            return;
        }

        // Group outstanding key-groups by their source and redispatch.
        let mut by_source: HashMap<SubtaskIndex, Vec<KeyGroup>> = HashMap::new();
        for kg in &inflight.pending_ingest {
            if let Some(source) = inflight.plan.source_for(*kg) {
                by_source.entry(source).or_default().push(*kg);
            }
        }
        inflight.transfer_deadline = Instant::now() + self.cfg.transfer_timeout;
        warn!(
            reconfig_id,
            attempt = inflight.attempts,
            outstanding = inflight.pending_ingest.len(),
            "transfer deadline passed, retrying"
        );
        for (source, kgs) in by_source {
            if let Some(gateway) = self.tasks.get(&source) {
                let _ = gateway
                    .send_control(TaskControl::RetryTransfer { reconfig_id, kgs })
                    .await;
            }
        }
    }

    /// Tell every occupied task which of its key-groups the replication
    /// filter selects.
    async fn push_backup_key_groups(&self) {
        if !self.replicator_cfg.enabled() {
            return;
        }
        for (subtask, gateway) in &self.tasks {
            if self.plan.id_in_model(*subtask) == UNUSED_SUBTASK {
                continue;
            }
            let kgs: Vec<KeyGroup> = self
                .plan
                .partition(*subtask)
                .iter()
                .copied()
                .filter(|kg| self.replicator_cfg.selects(*kg))
                .collect();
            let _ = gateway
                .update_backup_key_groups(0, &self.operator_id, kgs)
                .await;
        }
    }
}
