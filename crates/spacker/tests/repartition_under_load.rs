//! Repartition while a continuous stream is flowing: key-group 5 swaps from
//! one subtask to the other mid-stream. No record may be processed by the
//! wrong owner, none may be lost or duplicated, and per-key order must hold
//! across the ownership boundary.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{
    collect_outputs, counting_pipeline_with, key_for_group, mapping, send, wait_for_outcome,
};
use spacker::config::MigrationArgs;

const RECORDS_PER_KEY: u64 = 1_500;

#[tokio::test]
async fn repartition_under_load_keeps_order_and_exactly_once() {
    let mut pipeline = counting_pipeline_with(
        &[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])],
        2,
        MigrationArgs::default(),
    );
    let moving_key = key_for_group(5);
    let steady_key = key_for_group(1);

    // Continuous feed at a few thousand records per second.
    let input = pipeline.input.clone();
    let moving = moving_key.clone();
    let steady = steady_key.clone();
    let feeder = tokio::spawn(async move {
        for seq in 0..RECORDS_PER_KEY {
            input
                .send(spacker::rewiring::SourceInput {
                    key: moving.clone(),
                    payload: seq.to_be_bytes().to_vec(),
                    timestamp_ms: seq,
                })
                .await
                .expect("input open");
            input
                .send(spacker::rewiring::SourceInput {
                    key: steady.clone(),
                    payload: seq.to_be_bytes().to_vec(),
                    timestamp_ms: seq,
                })
                .await
                .expect("input open");
            if seq % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });

    // Swap key-group 5 over to subtask 0 mid-stream.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let reconfig_id = pipeline
        .coordinator
        .trigger_with_target(mapping(&[(0, &[0, 1, 2, 3, 5]), (1, &[4, 6, 7])]))
        .await
        .expect("trigger accepted");
    let outcome = wait_for_outcome(&pipeline.coordinator, reconfig_id).await;
    assert!(outcome.committed);
    feeder.await.expect("feeder finishes");

    let outputs = collect_outputs(&mut pipeline, 2 * RECORDS_PER_KEY as usize).await;

    let mut per_key: HashMap<Vec<u8>, Vec<common::Output>> = HashMap::new();
    for output in outputs {
        per_key.entry(output.key.clone()).or_default().push(output);
    }

    // Exactly-once and per-key order: counts are 1..=N in sequence order.
    for (key, outputs) in &per_key {
        assert_eq!(outputs.len(), RECORDS_PER_KEY as usize);
        for (idx, output) in outputs.iter().enumerate() {
            assert_eq!(
                output.count,
                idx as u64 + 1,
                "record for key {key:?} lost, duplicated, or reordered"
            );
            assert_eq!(output.seq, idx as u64);
        }
    }

    // The moving key crosses ownership exactly once, old owner to new owner.
    let moving_trace: Vec<usize> = per_key[&moving_key].iter().map(|o| o.subtask).collect();
    let transitions = moving_trace.windows(2).filter(|w| w[0] != w[1]).count();
    assert!(moving_trace.first() == Some(&1), "kg 5 started at subtask 1");
    assert_eq!(
        transitions, 1,
        "kg 5 must cross the ownership boundary exactly once"
    );
    assert!(moving_trace.last() == Some(&0), "kg 5 must end at subtask 0");

    // The steady key never leaves its owner.
    assert!(per_key[&steady_key].iter().all(|o| o.subtask == 0));

    pipeline.shutdown().await;
}
