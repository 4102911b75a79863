//! Spacker: non-disruptive key-group state migration for a keyed
//! stream-processing pipeline.
//!
//! The subsystem moves ownership of key-groups between parallel subtasks
//! while records keep flowing. A reconfig-point barrier separates old from
//! new routing; sources snapshot and ship only the affected key-groups;
//! destinations buffer records for in-flight key-groups and drain each one
//! atomically once its state arrives, preserving per-key order and
//! exactly-once processing.
//!
//! The crate is embeddable: [`spawn_pipeline`] assembles an in-process
//! pipeline (head, subtasks, coordinator, replicator) wired over channels,
//! with the cluster RPC transport abstracted behind the gateway traits in
//! [`transport`].

pub mod backend;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution_plan;
pub mod input_processor;
pub mod key_group;
pub mod planner;
pub mod replicator;
pub mod rewiring;
pub mod state_handle;
pub mod state_table;
pub mod task;
pub mod transport;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::StateBackend;
use crate::barrier::StreamElement;
use crate::config::MigrationArgs;
use crate::coordinator::{CoordinatorHandle, ReconfigCoordinator};
use crate::execution_plan::{IdInModel, JobExecutionPlan, SubtaskIndex};
use crate::input_processor::InputGate;
use crate::key_group::KeyGroup;
use crate::rewiring::{OutputRouter, PipelineHead, SourceInput};
use crate::state_table::KeyedStateTable;
use crate::task::{KeyedOperator, StreamTask, TaskContext};
use crate::transport::{
    FaultInjector, InProcessCoordinatorGateway, InProcessTaskGateway, TaskControl, TaskGateway,
};

/// Deploy-time description of an embedded pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub operator_id: String,
    pub max_parallelism: u32,
    /// Provisioned slots; must be at least the peak parallelism.
    pub num_opened_subtasks: usize,
    /// Initial `id_in_model → [kg]` assignment.
    pub initial_mapping: BTreeMap<IdInModel, Vec<KeyGroup>>,
    /// Standby peer per slot, receiving that slot's replica deltas.
    pub standby_of: Vec<Option<SubtaskIndex>>,
    pub args: MigrationArgs,
}

impl PipelineConfig {
    pub fn new(
        operator_id: &str,
        max_parallelism: u32,
        num_opened_subtasks: usize,
        initial_mapping: BTreeMap<IdInModel, Vec<KeyGroup>>,
    ) -> Self {
        Self {
            operator_id: operator_id.to_string(),
            max_parallelism,
            num_opened_subtasks,
            initial_mapping,
            standby_of: vec![None; num_opened_subtasks],
            args: MigrationArgs::default(),
        }
    }
}

/// A running embedded pipeline.
pub struct Pipeline {
    pub coordinator: CoordinatorHandle,
    /// Application-side record input, routed by the pipeline head.
    pub input: mpsc::Sender<SourceInput>,
    /// Operator outputs and forwarded watermarks.
    pub outputs: mpsc::Receiver<StreamElement>,
    /// Test hook corrupting selected key-group transfers.
    pub faults: FaultInjector,
    mailboxes: Vec<mpsc::Sender<TaskControl>>,
    head_mailbox: mpsc::Sender<TaskControl>,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Pipeline {
    /// Inject an ordinary checkpoint barrier at the pipeline head. The
    /// engine's checkpoint coordinator is an external collaborator; this is
    /// its hook point.
    pub async fn inject_checkpoint(&self, checkpoint_id: u64) -> anyhow::Result<()> {
        self.head_mailbox
            .send(TaskControl::InjectBarrier(crate::barrier::Barrier {
                id: checkpoint_id,
                timestamp_ms: coordinator::now_unix_ms(),
                kind: crate::barrier::BarrierKind::Checkpoint,
            }))
            .await
            .map_err(|_| anyhow::anyhow!("pipeline head stopped"))
    }

    /// Stop every task and wait for the loops to exit.
    pub async fn shutdown(mut self) {
        self.coordinator.shutdown().await;
        let _ = self.head_mailbox.send(TaskControl::Shutdown).await;
        for mailbox in &self.mailboxes {
            let _ = mailbox.send(TaskControl::Shutdown).await;
        }
        drop(self.input);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Assemble and spawn an in-process pipeline: one head, `num_opened_subtasks`
/// worker slots, the coordinator, and the replication/load tickers.
///
/// `make_backend` and `make_operator` are invoked once per slot.
pub fn spawn_pipeline<B, O>(
    config: PipelineConfig,
    mut make_backend: impl FnMut(SubtaskIndex) -> B,
    mut make_operator: impl FnMut(SubtaskIndex) -> O,
) -> anyhow::Result<Pipeline>
where
    B: StateBackend,
    O: KeyedOperator<B>,
{
    let plan = Arc::new(JobExecutionPlan::initial(
        &config.operator_id,
        &config.initial_mapping,
        config.num_opened_subtasks,
    )?);

    let faults = FaultInjector::default();
    let (coordinator_tx, coordinator_rx) = mpsc::channel(1024);
    let coordinator_gateway = Arc::new(InProcessCoordinatorGateway::new(coordinator_tx));
    let (collector_tx, collector_rx) = mpsc::channel(65_536);

    let mut record_senders = Vec::with_capacity(config.num_opened_subtasks);
    let mut record_receivers = Vec::with_capacity(config.num_opened_subtasks);
    let mut mailboxes = Vec::with_capacity(config.num_opened_subtasks);
    let mut gateways: HashMap<SubtaskIndex, Arc<dyn TaskGateway>> = HashMap::new();
    for subtask in 0..config.num_opened_subtasks {
        let (record_tx, record_rx) = mpsc::channel(4096);
        record_senders.push(Some(record_tx));
        record_receivers.push(record_rx);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(1024);
        gateways.insert(
            subtask,
            Arc::new(InProcessTaskGateway::new(mailbox_tx.clone(), faults.clone()))
                as Arc<dyn TaskGateway>,
        );
        mailboxes.push((mailbox_tx, mailbox_rx));
    }
    let peers = Arc::new(gateways.clone());

    let mut handles = Vec::new();
    let mut mailbox_senders = Vec::with_capacity(config.num_opened_subtasks);
    for (subtask, (record_rx, (mailbox_tx, mailbox_rx))) in record_receivers
        .into_iter()
        .zip(mailboxes.into_iter())
        .enumerate()
    {
        mailbox_senders.push(mailbox_tx);
        let ctx = TaskContext {
            execution_id: subtask as u64 + 1,
            operator_id: config.operator_id.clone(),
            subtask_index: subtask,
            id_in_model: plan.id_in_model(subtask),
            standby: config.standby_of.get(subtask).copied().flatten(),
            cfg: config.args.task_config(),
            replicator_cfg: config.args.replicator_config(),
        };
        let table = KeyedStateTable::new(
            make_backend(subtask),
            plan.aligned_key_group_range(subtask).clone(),
            config.max_parallelism,
        );
        let task = StreamTask::new(
            ctx,
            table,
            make_operator(subtask),
            InputGate::new(vec![record_rx]),
            mailbox_rx,
            peers.clone(),
            coordinator_gateway.clone(),
            collector_tx.clone(),
        );
        handles.push(tokio::spawn(task.run()));
    }

    let (input_tx, input_rx) = mpsc::channel(4096);
    let (head_mailbox_tx, head_mailbox_rx) = mpsc::channel(256);
    let router = OutputRouter::new(plan.clone(), record_senders, config.max_parallelism);
    let head = PipelineHead::new(router, input_rx, head_mailbox_rx);
    handles.push(tokio::spawn(head.run()));
    let head_gateway: Arc<dyn TaskGateway> = Arc::new(InProcessTaskGateway::new(
        head_mailbox_tx.clone(),
        FaultInjector::default(),
    ));

    let coordinator = ReconfigCoordinator::spawn(
        config.args.coordinator_config(),
        config.args.replicator_config(),
        config.operator_id.clone(),
        plan,
        head_gateway,
        gateways.clone(),
        coordinator_rx,
    );

    let ticker_gateways: Vec<Arc<dyn TaskGateway>> = gateways.values().cloned().collect();
    let _ = replicator::spawn(config.args.replicator_config(), ticker_gateways.clone());
    let _ = replicator::spawn_load_reports(
        config.args.replicator_config().interval,
        ticker_gateways,
    );

    Ok(Pipeline {
        coordinator,
        input: input_tx,
        outputs: collector_rx,
        faults,
        mailboxes: mailbox_senders,
        head_mailbox: head_mailbox_tx,
        handles,
    })
}
