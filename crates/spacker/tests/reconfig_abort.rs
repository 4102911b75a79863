//! Abort path: an ingest failure on one migrating key-group aborts the whole
//! reconfig-point. Ownership must not change, the source keeps its state, and
//! processing continues under the old plan.

mod common;

use std::time::Duration;

use common::{
    collect_outputs, counting_pipeline_with, key_for_group, mapping, send, wait_for_outcome,
};
use spacker::config::MigrationArgs;

#[tokio::test]
async fn ingest_failure_aborts_and_keeps_the_old_plan() {
    let mut pipeline = counting_pipeline_with(
        &[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])],
        2,
        MigrationArgs::default(),
    );
    let keys: Vec<Vec<u8>> = (0..8).map(key_for_group).collect();

    for (seq, key) in keys.iter().enumerate() {
        send(&pipeline, key, seq as u64).await;
    }
    let before = collect_outputs(&mut pipeline, 8).await;
    assert!(before.iter().all(|output| output.count == 1));

    // Corrupt the payload of key-group 2 in flight: the destination's
    // checksum validation fails the ingest and declines the reconfig.
    pipeline.faults.corrupt_key_group(2);
    let reconfig_id = pipeline
        .coordinator
        .trigger_with_target(mapping(&[(0, &[0, 1, 3]), (1, &[2, 4, 5, 6, 7])]))
        .await
        .expect("trigger accepted");
    let outcome = wait_for_outcome(&pipeline.coordinator, reconfig_id).await;
    assert!(!outcome.committed, "corrupted transfer must abort");
    assert!(outcome.cause.is_some());

    // Let the rewire-back and the in-band cancel marker reach every task
    // before resuming the feed.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The old plan stays authoritative.
    let status = pipeline.coordinator.status().await.expect("status");
    assert_eq!(status.plan_version, 0);
    assert!(status.unacked_tasks.is_empty());

    // Processing continues under the old ownership with no state lost.
    for (seq, key) in keys.iter().enumerate() {
        send(&pipeline, key, 100 + seq as u64).await;
    }
    let after = collect_outputs(&mut pipeline, 8).await;
    for output in &after {
        let expected = if output.key_group < 4 { 0 } else { 1 };
        assert_eq!(
            output.subtask, expected,
            "kg {} left its owner despite the abort",
            output.key_group
        );
        assert_eq!(output.count, 2, "state for kg {} was lost", output.key_group);
    }

    pipeline.shutdown().await;
}
