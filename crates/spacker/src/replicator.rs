//! Proactive state replication between reconfigurations.
//!
//! The replicator is a background ticker: every cycle it prompts each task to
//! ship the delta snapshot of its changelog-dirty, filter-selected key-groups
//! to its standby peer. A later migration can then replace the payload
//! transfer for a fresh key-group with a promote marker. Shipping failures
//! are non-fatal; dirty key-groups stay in the changelog and the next cycle
//! retries them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ReplicatorConfig;
use crate::transport::{TaskControl, TaskGateway};

/// Spawn the replication ticker over all task gateways.
///
/// The ticker stops once every task mailbox has closed.
pub fn spawn(cfg: ReplicatorConfig, gateways: Vec<Arc<dyn TaskGateway>>) -> Option<JoinHandle<()>> {
    if !cfg.enabled() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut reachable = 0usize;
            for gateway in &gateways {
                if gateway.send_control(TaskControl::ReplicationCycle).await.is_ok() {
                    reachable += 1;
                }
            }
            if reachable == 0 {
                debug!("all task mailboxes closed, replication ticker stopping");
                return;
            }
        }
    }))
}

/// Spawn the load-report ticker feeding the planners' telemetry.
pub fn spawn_load_reports(
    interval: Duration,
    gateways: Vec<Arc<dyn TaskGateway>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut reachable = 0usize;
            for gateway in &gateways {
                if gateway.send_control(TaskControl::ReportLoadCycle).await.is_ok() {
                    reachable += 1;
                }
            }
            if reachable == 0 {
                return;
            }
        }
    })
}
