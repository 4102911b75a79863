//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use spacker::backend::HeapStateBackend;
use spacker::barrier::{StreamElement, StreamRecord};
use spacker::config::MigrationArgs;
use spacker::coordinator::{CoordinatorHandle, ReconfigOutcome};
use spacker::execution_plan::{IdInModel, SubtaskIndex};
use spacker::key_group::{assign_to_key_group, KeyGroup};
use spacker::rewiring::SourceInput;
use spacker::task::{KeyedOperator, OperatorContext};
use spacker::{spawn_pipeline, Pipeline, PipelineConfig};

/// Timeout for reconfig settling and output collection.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);

pub const MAX_PARALLELISM: u32 = 8;
pub const OPERATOR: &str = "counter";

/// Operator keeping a per-key running count and tagging every output with the
/// subtask that processed it, so tests can trace ownership, ordering, and
/// state continuity end to end.
pub struct CountingOperator;

impl KeyedOperator<HeapStateBackend> for CountingOperator {
    fn process(
        &mut self,
        record: &StreamRecord,
        ctx: &mut OperatorContext<'_, HeapStateBackend>,
    ) -> anyhow::Result<()> {
        let count = ctx.table.get("counts").map(decode_u64).unwrap_or(0) + 1;
        ctx.table.put("counts", count.to_be_bytes().to_vec());
        let mut payload = Vec::with_capacity(12 + record.payload.len());
        payload.extend_from_slice(&(ctx.subtask as u32).to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.extend_from_slice(&record.payload);
        let output = StreamRecord {
            key: record.key.clone(),
            payload,
            key_group: record.key_group,
            timestamp_ms: record.timestamp_ms,
        };
        ctx.emit(output);
        Ok(())
    }
}

/// One decoded operator output.
#[derive(Debug, Clone)]
pub struct Output {
    pub key: Vec<u8>,
    pub key_group: KeyGroup,
    pub subtask: SubtaskIndex,
    pub count: u64,
    pub seq: u64,
}

fn decode_u64(bytes: Vec<u8>) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

pub fn decode_output(record: &StreamRecord) -> Output {
    let subtask = u32::from_be_bytes(record.payload[0..4].try_into().expect("subtask bytes"));
    let count = u64::from_be_bytes(record.payload[4..12].try_into().expect("count bytes"));
    let seq = u64::from_be_bytes(record.payload[12..20].try_into().expect("seq bytes"));
    Output {
        key: record.key.clone(),
        key_group: record.key_group,
        subtask: subtask as SubtaskIndex,
        count,
        seq,
    }
}

pub fn mapping(entries: &[(IdInModel, &[KeyGroup])]) -> BTreeMap<IdInModel, Vec<KeyGroup>> {
    entries
        .iter()
        .map(|(id, kgs)| (*id, kgs.to_vec()))
        .collect()
}

/// Spawn a counting pipeline over heap backends.
pub fn counting_pipeline(config: PipelineConfig) -> Pipeline {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
    spawn_pipeline(
        config,
        |_| HeapStateBackend::new(MAX_PARALLELISM),
        |_| CountingOperator,
    )
    .expect("pipeline spawns")
}

pub fn counting_pipeline_with(
    entries: &[(IdInModel, &[KeyGroup])],
    slots: usize,
    args: MigrationArgs,
) -> Pipeline {
    let mut config = PipelineConfig::new(OPERATOR, MAX_PARALLELISM, slots, mapping(entries));
    config.args = args;
    counting_pipeline(config)
}

/// Deterministically find a key hashing into `kg`.
pub fn key_for_group(kg: KeyGroup) -> Vec<u8> {
    for i in 0..100_000u32 {
        let key = format!("key-{i}").into_bytes();
        if assign_to_key_group(&key, MAX_PARALLELISM) == kg {
            return key;
        }
    }
    panic!("no key found for key group {kg}");
}

pub async fn send(pipeline: &Pipeline, key: &[u8], seq: u64) {
    pipeline
        .input
        .send(SourceInput {
            key: key.to_vec(),
            payload: seq.to_be_bytes().to_vec(),
            timestamp_ms: seq,
        })
        .await
        .expect("pipeline input open");
}

/// Collect exactly `n` operator outputs, skipping forwarded watermarks.
pub async fn collect_outputs(pipeline: &mut Pipeline, n: usize) -> Vec<Output> {
    let mut outputs = Vec::with_capacity(n);
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while outputs.len() < n {
        let element = tokio::time::timeout_at(deadline, pipeline.outputs.recv())
            .await
            .unwrap_or_else(|_| {
                panic!("timed out with {} of {n} outputs collected", outputs.len())
            })
            .expect("collector channel open");
        if let StreamElement::Record(record) = element {
            outputs.push(decode_output(&record));
        }
    }
    outputs
}

/// Poll the coordinator until the outcome for `reconfig_id` is recorded.
pub async fn wait_for_outcome(
    coordinator: &CoordinatorHandle,
    reconfig_id: u64,
) -> ReconfigOutcome {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let status = coordinator.status().await.expect("coordinator reachable");
        if let Some(outcome) = status.last_outcome {
            if outcome.reconfig_id == reconfig_id {
                return outcome;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("reconfig {reconfig_id} did not settle within {SETTLE_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
