//! Drain-order policy: with key-groups {3, 1, 7} migrating and delayed
//! transfers, buffered records must drain in the configured order once each
//! key-group's state arrives.

mod common;

use std::time::Duration;

use common::{
    collect_outputs, counting_pipeline_with, key_for_group, mapping, send, wait_for_outcome,
    Output,
};
use spacker::config::{MigrationArgs, OrderFunction};
use spacker::key_group::KeyGroup;

async fn drained_group_order(order: OrderFunction) -> Vec<KeyGroup> {
    let mut args = MigrationArgs::default();
    args.reconfig_order_function = order;
    // One source owns every migrating key-group, so the transfer order (and
    // with it the drain order) is exactly the configured policy.
    let mut pipeline = counting_pipeline_with(
        &[(0, &[0, 1, 2, 3, 7]), (1, &[4, 5, 6])],
        3,
        args,
    );

    // Slow every migrating transfer so records queue up at the destination
    // before any state arrives.
    for kg in [1, 3, 7] {
        pipeline.faults.delay_key_group(kg, Duration::from_millis(150));
    }

    let reconfig_id = pipeline
        .coordinator
        .trigger_with_target(mapping(&[(0, &[0, 2]), (1, &[4, 5, 6]), (2, &[1, 3, 7])]))
        .await
        .expect("trigger accepted");

    // Records for the migrating key-groups land at the destination while the
    // transfers are still in flight.
    for kg in [1u32, 3, 7] {
        let key = key_for_group(kg);
        send(&pipeline, &key, u64::from(kg)).await;
        send(&pipeline, &key, u64::from(kg) + 100).await;
    }

    let outputs = collect_outputs(&mut pipeline, 6).await;
    let outcome = wait_for_outcome(&pipeline.coordinator, reconfig_id).await;
    assert!(outcome.committed);

    // Every record was buffered and drained at the new owner.
    assert!(outputs.iter().all(|output| output.subtask == 2));
    let order = group_order(&outputs);
    pipeline.shutdown().await;
    order
}

/// Collapse the output stream into the order key-groups finished draining.
fn group_order(outputs: &[Output]) -> Vec<KeyGroup> {
    let mut order = Vec::new();
    for output in outputs {
        if order.last() != Some(&output.key_group) {
            order.push(output.key_group);
        }
    }
    order
}

#[tokio::test]
async fn reverse_order_drains_highest_key_group_first() {
    let order = drained_group_order(OrderFunction::Reverse).await;
    assert_eq!(order, vec![7, 3, 1]);
}

#[tokio::test]
async fn random_order_drains_a_full_permutation() {
    let order = drained_group_order(OrderFunction::Random).await;
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 3, 7], "each key group drains exactly once");
}

#[tokio::test]
async fn default_order_drains_lowest_key_group_first() {
    let order = drained_group_order(OrderFunction::Default).await;
    assert_eq!(order, vec![1, 3, 7]);
}
