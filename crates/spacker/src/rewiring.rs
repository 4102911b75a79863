//! Output partitioning and channel rewiring.
//!
//! Upstream tasks route records by key-group under the current execution
//! plan. When ownership moves, the partitioner is swapped to the new plan at
//! a record boundary, so a reconfig barrier cleanly separates the records
//! routed under the old plan from those routed under the new one. Channel
//! substitution flushes pending sends before replacing writers, and the
//! receiving side reconnects its input gate to recompute channel state.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::barrier::{Barrier, BarrierKind, StreamElement, StreamRecord};
use crate::error::MigrationError;
use crate::execution_plan::{JobExecutionPlan, SubtaskIndex, UNUSED_SUBTASK};
use crate::key_group::assign_to_key_group;
use crate::transport::{RecordSender, TaskControl};

/// One keyed input record handed to the pipeline head by the application.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Routes records to downstream subtasks by key-group ownership.
///
/// Channels are provisioned per slot (`num_opened_subtasks`), so a scale-out
/// onto a pre-provisioned slot needs no new wiring, only a plan swap.
pub struct OutputRouter {
    plan: Arc<JobExecutionPlan>,
    channels: Vec<Option<RecordSender>>,
    max_parallelism: u32,
}

impl OutputRouter {
    pub fn new(
        plan: Arc<JobExecutionPlan>,
        channels: Vec<Option<RecordSender>>,
        max_parallelism: u32,
    ) -> Self {
        Self {
            plan,
            channels,
            max_parallelism,
        }
    }

    pub fn plan(&self) -> &Arc<JobExecutionPlan> {
        &self.plan
    }

    /// Swap the routing plan at a record boundary.
    pub fn rewire(&mut self, plan: Arc<JobExecutionPlan>) {
        info!(version = plan.version(), "partitioner retargeted to new plan");
        self.plan = plan;
    }

    /// Substitute channel descriptors. Old senders are dropped only after
    /// every pending send completed, so no records are lost in the swap.
    pub fn substitute_channels(
        &mut self,
        channels: Vec<Option<RecordSender>>,
    ) -> Result<(), MigrationError> {
        if channels.len() != self.channels.len() {
            return Err(MigrationError::RewireFailure {
                subtask: usize::MAX,
                reason: format!(
                    "channel count changed from {} to {}",
                    self.channels.len(),
                    channels.len()
                ),
            });
        }
        self.channels = channels;
        Ok(())
    }

    /// Route one keyed record to the owner of its key-group.
    pub async fn emit(&self, input: SourceInput) -> anyhow::Result<()> {
        let kg = assign_to_key_group(&input.key, self.max_parallelism);
        let owner = self
            .plan
            .owner_of(kg)
            .ok_or_else(|| anyhow::anyhow!("key group {kg} has no owner in current plan"))?;
        let sender = self.channels[owner]
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("subtask {owner} has no channel"))?;
        sender
            .send(StreamElement::Record(StreamRecord {
                key: input.key,
                payload: input.payload,
                key_group: kg,
                timestamp_ms: input.timestamp_ms,
            }))
            .await
            .map_err(|_| anyhow::anyhow!("channel to subtask {owner} closed"))
    }

    /// Broadcast a barrier to every occupied slot of the current plan, plus
    /// every slot the barrier's own plan occupies (a reconfig barrier must
    /// reach destinations that are only active under the new plan).
    pub async fn broadcast_barrier(&self, barrier: Barrier) -> anyhow::Result<()> {
        let mut targets: BTreeSet<SubtaskIndex> = (0..self.channels.len())
            .filter(|subtask| self.plan.id_in_model(*subtask) != UNUSED_SUBTASK)
            .collect();
        if let BarrierKind::ReconfigPoint { plan, .. } = &barrier.kind {
            targets.extend(
                (0..self.channels.len())
                    .filter(|subtask| plan.id_in_model(*subtask) != UNUSED_SUBTASK),
            );
        }
        for subtask in targets {
            if let Some(sender) = &self.channels[subtask] {
                sender
                    .send(StreamElement::Barrier(barrier.clone()))
                    .await
                    .map_err(|_| anyhow::anyhow!("channel to subtask {subtask} closed"))?;
            }
        }
        Ok(())
    }

}

/// Pipeline head: feeds application records through the partitioner and
/// applies barrier injection and rewiring commands from the coordinator.
///
/// A reconfig barrier swaps the partitioner in the same dispatch step that
/// broadcasts it, so the barrier exactly marks the routing switch point on
/// every downstream channel.
pub struct PipelineHead {
    router: OutputRouter,
    input: mpsc::Receiver<SourceInput>,
    mailbox: mpsc::Receiver<TaskControl>,
}

impl PipelineHead {
    pub fn new(
        router: OutputRouter,
        input: mpsc::Receiver<SourceInput>,
        mailbox: mpsc::Receiver<TaskControl>,
    ) -> Self {
        Self {
            router,
            input,
            mailbox,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.mailbox.recv() => match msg {
                    None | Some(TaskControl::Shutdown) => break,
                    Some(TaskControl::InjectBarrier(barrier)) => {
                        if let BarrierKind::ReconfigPoint { plan, .. } = &barrier.kind {
                            // Broadcast under the old plan's targets plus the
                            // new plan's, then retarget: records after the
                            // barrier flow under the new ownership.
                            let plan = plan.clone();
                            self.router.broadcast_barrier(barrier).await?;
                            self.router.rewire(plan);
                        } else {
                            self.router.broadcast_barrier(barrier).await?;
                        }
                    }
                    Some(TaskControl::Rewire { plan }) => self.router.rewire(plan),
                    Some(other) => debug!(msg = ?other, "pipeline head ignoring control message"),
                },
                record = self.input.recv() => match record {
                    Some(input) => {
                        if let Err(err) = self.router.emit(input).await {
                            warn!(error = ?err, "record emission failed");
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    use crate::execution_plan::IdInModel;
    use crate::key_group::KeyGroup;

    fn plan_for(assignments: &[(IdInModel, &[KeyGroup])], slots: usize) -> Arc<JobExecutionPlan> {
        let mapping: BTreeMap<IdInModel, Vec<KeyGroup>> = assignments
            .iter()
            .map(|(id, kgs)| (*id, kgs.to_vec()))
            .collect();
        Arc::new(JobExecutionPlan::initial("counter", &mapping, slots).unwrap())
    }

    #[tokio::test]
    async fn records_route_to_the_plan_owner() {
        let plan = plan_for(&[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])], 2);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let router = OutputRouter::new(plan, vec![Some(tx_a), Some(tx_b)], 8);

        let mut seen = [0usize; 2];
        for i in 0..32 {
            let key = format!("key-{i}").into_bytes();
            router
                .emit(SourceInput {
                    key,
                    payload: vec![],
                    timestamp_ms: 0,
                })
                .await
                .unwrap();
            if let Ok(StreamElement::Record(record)) = rx_a.try_recv() {
                assert!(record.key_group < 4);
                seen[0] += 1;
            }
            if let Ok(StreamElement::Record(record)) = rx_b.try_recv() {
                assert!(record.key_group >= 4);
                seen[1] += 1;
            }
        }
        assert_eq!(seen[0] + seen[1], 32);
    }

    #[tokio::test]
    async fn reconfig_barrier_reaches_new_plan_subtasks() {
        let old_plan = plan_for(&[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])], 3);
        let new_plan = Arc::new(
            JobExecutionPlan::from_previous(
                &old_plan,
                &[(0, vec![0, 1]), (1, vec![4, 5, 6, 7]), (2, vec![2, 3])]
                    .into_iter()
                    .collect(),
                1,
            )
            .unwrap(),
        );
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let router = OutputRouter::new(old_plan, vec![Some(tx_a), Some(tx_b), Some(tx_c)], 8);

        let barrier = Barrier::reconfig_point(1, 0, new_plan);
        router.broadcast_barrier(barrier).await.unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(StreamElement::Barrier(_))));
        assert!(matches!(rx_b.try_recv(), Ok(StreamElement::Barrier(_))));
        // Subtask 2 is only occupied under the new plan and still gets the barrier.
        assert!(matches!(rx_c.try_recv(), Ok(StreamElement::Barrier(_))));
    }

    #[tokio::test]
    async fn substitute_channels_swaps_writers_without_losing_records() {
        let plan = plan_for(&[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])], 2);
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (other_tx, _other_rx) = mpsc::channel(8);
        let mut router = OutputRouter::new(plan, vec![Some(old_tx), Some(other_tx)], 8);

        let key = (0..10_000u32)
            .map(|i| format!("key-{i}").into_bytes())
            .find(|key| assign_to_key_group(key, 8) == 0)
            .unwrap();
        router
            .emit(SourceInput {
                key: key.clone(),
                payload: vec![],
                timestamp_ms: 0,
            })
            .await
            .unwrap();

        let (new_tx, mut new_rx) = mpsc::channel(8);
        let (other_tx, _other_rx2) = mpsc::channel(8);
        router
            .substitute_channels(vec![Some(new_tx), Some(other_tx)])
            .unwrap();
        router
            .emit(SourceInput {
                key,
                payload: vec![],
                timestamp_ms: 1,
            })
            .await
            .unwrap();

        // The record sent before the swap is already delivered on the old
        // channel; the one after lands on the substitute.
        assert!(matches!(old_rx.try_recv(), Ok(StreamElement::Record(_))));
        assert!(matches!(new_rx.try_recv(), Ok(StreamElement::Record(_))));

        // A descriptor set of the wrong shape is a rewire failure.
        let (odd_tx, _odd_rx) = mpsc::channel(8);
        assert!(matches!(
            router.substitute_channels(vec![Some(odd_tx)]),
            Err(MigrationError::RewireFailure { .. })
        ));
    }

    #[tokio::test]
    async fn rewire_switches_routing_at_the_swap_point() {
        let old_plan = plan_for(&[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])], 2);
        let new_mapping: BTreeMap<IdInModel, Vec<KeyGroup>> =
            [(0, vec![0, 1, 2, 3, 4, 5, 6]), (1, vec![7])].into();
        let new_plan = Arc::new(
            JobExecutionPlan::from_previous(&old_plan, &new_mapping, 1).unwrap(),
        );
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, mut rx_b) = mpsc::channel(64);
        let mut router = OutputRouter::new(old_plan, vec![Some(tx_a), Some(tx_b)], 8);

        // Find a key for a key-group that moves from subtask 1 to subtask 0.
        let moved_kg = 4;
        let key = (0..10_000u32)
            .map(|i| format!("key-{i}").into_bytes())
            .find(|key| assign_to_key_group(key, 8) == moved_kg)
            .unwrap();

        router
            .emit(SourceInput {
                key: key.clone(),
                payload: vec![],
                timestamp_ms: 0,
            })
            .await
            .unwrap();
        router.rewire(new_plan);
        router
            .emit(SourceInput {
                key,
                payload: vec![],
                timestamp_ms: 0,
            })
            .await
            .unwrap();

        assert!(matches!(rx_b.try_recv(), Ok(StreamElement::Record(_))));
        assert!(rx_b.try_recv().is_err());
        assert!(matches!(rx_a.try_recv(), Ok(StreamElement::Record(_))));
    }
}
