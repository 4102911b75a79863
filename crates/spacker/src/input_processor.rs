//! Input-side record dispatch and the per-task migration hooks.
//!
//! The input processor is owned by the task loop and never shared. During a
//! migration a destination buffers records for in-flight key-groups, drains a
//! key-group's whole queue atomically once its state arrives, and leaves
//! migration mode when nothing is pending; a source suppresses records for
//! key-groups it no longer owns. Barriers align across channels exactly like
//! checkpoints, and watermarks pass through a per-channel valve.

use std::collections::{HashMap, HashSet, VecDeque};
use std::task::Poll;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::barrier::{Barrier, StreamElement, StreamRecord};
use crate::config::OrderFunction;
use crate::key_group::KeyGroup;
use crate::transport::RecordReceiver;

/// Multiplexes a task's input channels and aligns barriers across them.
pub struct InputGate {
    channels: Vec<RecordReceiver>,
    blocked: Vec<bool>,
    aligner: BarrierAligner,
    next_poll_start: usize,
}

impl InputGate {
    pub fn new(channels: Vec<RecordReceiver>) -> Self {
        let aligner = BarrierAligner::new(channels.len());
        let blocked = vec![false; channels.len()];
        Self {
            channels,
            blocked,
            aligner,
            next_poll_start: 0,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Replace the channel set after a rewire and recompute per-channel state.
    pub fn reconnect(&mut self, channels: Vec<RecordReceiver>) {
        self.aligner = BarrierAligner::new(channels.len());
        self.blocked = vec![false; channels.len()];
        self.next_poll_start = 0;
        self.channels = channels;
    }

    /// Next element from any unblocked channel, with the channel it arrived
    /// on, or `None` when every channel is closed and drained.
    ///
    /// Barriers are aligned internally: a channel that delivered the current
    /// barrier is blocked until the barrier arrived on all channels, at which
    /// point the barrier itself is returned once.
    pub async fn next(&mut self) -> Option<(usize, StreamElement)> {
        loop {
            let (channel, element) = match self.poll_channels().await {
                Some(pair) => pair,
                None => return None,
            };
            match element {
                StreamElement::Barrier(barrier) => {
                    self.blocked[channel] = true;
                    if let Some(aligned) = self.aligner.on_barrier(channel, barrier) {
                        for flag in &mut self.blocked {
                            *flag = false;
                        }
                        return Some((channel, StreamElement::Barrier(aligned)));
                    }
                }
                other => return Some((channel, other)),
            }
        }
    }

    async fn poll_channels(&mut self) -> Option<(usize, StreamElement)> {
        let num = self.channels.len();
        if num == 0 {
            return None;
        }
        let start = self.next_poll_start;
        self.next_poll_start = (self.next_poll_start + 1) % num;
        futures_util::future::poll_fn(|cx| {
            let mut open = 0;
            for offset in 0..num {
                let idx = (start + offset) % num;
                if self.blocked[idx] {
                    open += 1;
                    continue;
                }
                match self.channels[idx].poll_recv(cx) {
                    Poll::Ready(Some(element)) => return Poll::Ready(Some((idx, element))),
                    Poll::Ready(None) => {}
                    Poll::Pending => open += 1,
                }
            }
            if open == 0 {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// Tracks one in-flight barrier until it arrived on every channel.
struct BarrierAligner {
    expected: usize,
    arrived: HashSet<usize>,
    current: Option<Barrier>,
}

impl BarrierAligner {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            arrived: HashSet::new(),
            current: None,
        }
    }

    fn on_barrier(&mut self, channel: usize, barrier: Barrier) -> Option<Barrier> {
        match &self.current {
            Some(current) if current.id != barrier.id => {
                warn!(
                    pending = current.id,
                    arrived = barrier.id,
                    "barrier overtook incomplete alignment, resetting"
                );
                self.arrived.clear();
                self.current = Some(barrier);
            }
            Some(_) => {}
            None => self.current = Some(barrier),
        }
        self.arrived.insert(channel);
        if self.arrived.len() >= self.expected {
            self.arrived.clear();
            return self.current.take();
        }
        None
    }
}

/// Per-channel watermark tracking; emits when the minimum advances.
pub struct WatermarkValve {
    per_channel: Vec<u64>,
    emitted: u64,
}

impl WatermarkValve {
    pub fn new(num_channels: usize) -> Self {
        Self {
            per_channel: vec![0; num_channels],
            emitted: 0,
        }
    }

    pub fn reconnect(&mut self, num_channels: usize) {
        self.per_channel = vec![self.emitted; num_channels];
    }

    pub fn input_watermark(&mut self, channel: usize, watermark: u64) -> Option<u64> {
        if channel >= self.per_channel.len() {
            return None;
        }
        self.per_channel[channel] = self.per_channel[channel].max(watermark);
        let min = self.per_channel.iter().copied().min().unwrap_or(0);
        if min > self.emitted {
            self.emitted = min;
            Some(min)
        } else {
            None
        }
    }
}

/// Migration-mode record routing for one task.
pub struct InputProcessor {
    /// Key-groups in flight to this task as a destination.
    migrating: HashSet<KeyGroup>,
    /// Key-groups whose state arrived, drain pending.
    migrated: VecDeque<KeyGroup>,
    /// Records held back per in-flight key-group.
    buffered: HashMap<KeyGroup, VecDeque<StreamRecord>>,
    under_migration: bool,
    /// Key-groups this task stopped owning as a source.
    suppressed: HashSet<KeyGroup>,
    order: OrderFunction,
    drain_rng: StdRng,
    records_per_kg: HashMap<KeyGroup, u64>,
}

impl InputProcessor {
    pub fn new(order: OrderFunction) -> Self {
        Self {
            migrating: HashSet::new(),
            migrated: VecDeque::new(),
            buffered: HashMap::new(),
            under_migration: false,
            suppressed: HashSet::new(),
            order,
            drain_rng: StdRng::seed_from_u64(0),
            records_per_kg: HashMap::new(),
        }
    }

    pub fn is_under_migration(&self) -> bool {
        self.under_migration
    }

    /// Record load telemetry for the planners.
    pub fn observe(&mut self, kg: KeyGroup) {
        *self.records_per_kg.entry(kg).or_insert(0) += 1;
    }

    pub fn take_load_snapshot(&mut self) -> Vec<(KeyGroup, u64)> {
        let mut snapshot: Vec<(KeyGroup, u64)> = self.records_per_kg.drain().collect();
        snapshot.sort_unstable();
        snapshot
    }

    // ------------------------------------------------------------------
    // Destination side
    // ------------------------------------------------------------------

    /// Enter migration mode for the key-groups moving to this task.
    pub fn begin_migration(&mut self, kgs: &[KeyGroup], reconfig_id: u64) -> anyhow::Result<()> {
        if self.under_migration || !self.migrating.is_empty() || !self.migrated.is_empty() {
            anyhow::bail!("previous migration state not cleared");
        }
        info!(kgs = ?kgs, reconfig_id, "buffering records for in-flight key groups");
        self.under_migration = true;
        self.migrating.extend(kgs.iter().copied());
        self.drain_rng = StdRng::seed_from_u64(reconfig_id);
        Ok(())
    }

    /// Whether a record for `kg` must be held back instead of processed.
    pub fn should_buffer(&self, kg: KeyGroup) -> bool {
        self.under_migration && self.migrating.contains(&kg)
    }

    pub fn buffer(&mut self, record: StreamRecord) {
        self.buffered
            .entry(record.key_group)
            .or_default()
            .push_back(record);
    }

    pub fn buffered_len(&self, kg: KeyGroup) -> usize {
        self.buffered.get(&kg).map(VecDeque::len).unwrap_or(0)
    }

    /// State for `kg` arrived and was ingested; queue it for draining.
    pub fn complete_migration_for_key(&mut self, kg: KeyGroup) {
        if self.migrating.remove(&kg) {
            debug!(kg, "key group state arrived, drain pending");
            self.migrated.push_back(kg);
        }
    }

    /// Pop the next key-group to drain, honoring the configured order.
    ///
    /// The returned queue must be pushed through the operator in full before
    /// any other record; records of distinct key-groups never interleave
    /// within a drain.
    pub fn next_drain(&mut self) -> Option<(KeyGroup, VecDeque<StreamRecord>)> {
        if self.migrated.is_empty() {
            return None;
        }
        let idx = match self.order {
            OrderFunction::Default => 0,
            OrderFunction::Reverse => self
                .migrated
                .iter()
                .enumerate()
                .max_by_key(|(_, kg)| **kg)
                .map(|(idx, _)| idx)
                .unwrap_or(0),
            OrderFunction::Random => self.drain_rng.gen_range(0..self.migrated.len()),
        };
        let kg = self.migrated.remove(idx).expect("index within queue");
        let queue = self.buffered.remove(&kg).unwrap_or_default();
        if !queue.is_empty() {
            info!(kg, records = queue.len(), "draining buffered records");
        }
        Some((kg, queue))
    }

    /// True when every in-flight key-group arrived and every buffer drained.
    pub fn migration_drained(&self) -> bool {
        self.under_migration
            && self.migrating.is_empty()
            && self.migrated.is_empty()
            && self.buffered.values().all(VecDeque::is_empty)
    }

    /// Leave migration mode and clear migration-scoped state.
    pub fn exit_migration(&mut self) {
        info!("leaving migration mode");
        self.under_migration = false;
        self.migrating.clear();
        self.migrated.clear();
        self.buffered.clear();
    }

    /// Abort: drop buffered records and leave migration mode. Returns how
    /// many records were discarded.
    pub fn cancel_migration(&mut self) -> usize {
        let dropped: usize = self.buffered.values().map(VecDeque::len).sum();
        self.under_migration = false;
        self.migrating.clear();
        self.migrated.clear();
        self.buffered.clear();
        dropped
    }

    // ------------------------------------------------------------------
    // Source side
    // ------------------------------------------------------------------

    /// Stop dispatching records for key-groups migrating away from this task.
    pub fn suppress(&mut self, kgs: &[KeyGroup]) {
        self.suppressed.extend(kgs.iter().copied());
    }

    pub fn is_suppressed(&self, kg: KeyGroup) -> bool {
        self.suppressed.contains(&kg)
    }

    pub fn clear_suppressed(&mut self) {
        self.suppressed.clear();
    }
}
