//! Scale out 2→3 over 8 key-groups: a third subtask takes key-groups from
//! both survivors while the pipeline keeps running. Every key-group must end
//! up at its new owner with its state intact.

mod common;

use common::{
    collect_outputs, counting_pipeline_with, key_for_group, mapping, send, wait_for_outcome,
};
use spacker::config::MigrationArgs;

#[tokio::test]
async fn scale_out_reroutes_key_groups_and_preserves_state() {
    let mut pipeline = counting_pipeline_with(
        &[(0, &[0, 1, 2, 3]), (1, &[4, 5, 6, 7])],
        3,
        MigrationArgs::default(),
    );
    let keys: Vec<Vec<u8>> = (0..8).map(key_for_group).collect();

    // One record per key-group under the old plan.
    for (seq, key) in keys.iter().enumerate() {
        send(&pipeline, key, seq as u64).await;
    }
    let before = collect_outputs(&mut pipeline, 8).await;
    for output in &before {
        assert_eq!(output.count, 1);
        let expected = if output.key_group < 4 { 0 } else { 1 };
        assert_eq!(
            output.subtask, expected,
            "kg {} processed by wrong owner before migration",
            output.key_group
        );
    }

    let reconfig_id = pipeline
        .coordinator
        .trigger_with_target(mapping(&[
            (0, &[0, 1]),
            (1, &[4, 5]),
            (2, &[2, 3, 6, 7]),
        ]))
        .await
        .expect("trigger accepted");
    let outcome = wait_for_outcome(&pipeline.coordinator, reconfig_id).await;
    assert!(outcome.committed);
    assert!(!outcome.partial);

    // One record per key-group under the new plan: each arrives at the new
    // owner and continues the old count, i.e. identical output to a pipeline
    // that never migrated.
    for (seq, key) in keys.iter().enumerate() {
        send(&pipeline, key, 100 + seq as u64).await;
    }
    let after = collect_outputs(&mut pipeline, 8).await;
    for output in &after {
        let expected = match output.key_group {
            0 | 1 => 0,
            4 | 5 => 1,
            _ => 2,
        };
        assert_eq!(
            output.subtask, expected,
            "kg {} processed by wrong owner after migration",
            output.key_group
        );
        assert_eq!(output.count, 2, "state for kg {} was lost", output.key_group);
    }

    pipeline.shutdown().await;
}
