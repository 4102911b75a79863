//! Proactive replication reuse: with `replicate_keys_filter=1` a standby
//! holds fresh deltas for the source's key-groups, so migrating one of them
//! ships a promote marker instead of the payload, and the promoted state
//! matches what a direct transfer would have produced.

mod common;

use std::time::Duration;

use common::{
    collect_outputs, counting_pipeline, key_for_group, mapping, send, wait_for_outcome, OPERATOR,
    MAX_PARALLELISM,
};
use spacker::config::MigrationArgs;
use spacker::transport::KeyGroupStatus;
use spacker::PipelineConfig;

#[tokio::test]
async fn migration_promotes_a_fresh_replica_instead_of_shipping_bytes() {
    let mut args = MigrationArgs::default();
    args.replicate_keys_filter = 1;
    args.replication_interval_ms = 50;

    let mut config = PipelineConfig::new(
        OPERATOR,
        MAX_PARALLELISM,
        3,
        mapping(&[(0, &[0, 1, 2, 3, 4]), (1, &[5, 6, 7])]),
    );
    // Subtask 2 is the standby for subtask 0's deltas and later the
    // migration destination.
    config.standby_of[0] = Some(2);
    config.args = args;
    let mut pipeline = counting_pipeline(config);

    // Dirty key-group 4 at its owner.
    let key = key_for_group(4);
    send(&pipeline, &key, 1).await;
    let before = collect_outputs(&mut pipeline, 1).await;
    assert_eq!(before[0].subtask, 0);
    assert_eq!(before[0].count, 1);

    // Let at least one replication cycle ship the delta and clear the
    // changelog.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reconfig_id = pipeline
        .coordinator
        .trigger_with_target(mapping(&[(0, &[0, 1, 2, 3]), (1, &[5, 6, 7]), (2, &[4])]))
        .await
        .expect("trigger accepted");
    let outcome = wait_for_outcome(&pipeline.coordinator, reconfig_id).await;
    assert!(outcome.committed);

    // The transfer skipped the payload for key-group 4.
    let status = outcome
        .per_kg
        .iter()
        .find(|(kg, _)| *kg == 4)
        .map(|(_, status)| status.clone())
        .expect("kg 4 tracked in outcome");
    assert_eq!(status, KeyGroupStatus::Promoted);

    // Promoted state behaves exactly like directly-shipped state.
    send(&pipeline, &key, 2).await;
    let after = collect_outputs(&mut pipeline, 1).await;
    assert_eq!(after[0].subtask, 2);
    assert_eq!(after[0].count, 2);

    pipeline.shutdown().await;
}
