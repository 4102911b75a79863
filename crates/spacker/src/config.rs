//! Deploy-time configuration for the migration subsystem.
//!
//! Options are parsed once (flags or `SPACKER_*` environment variables) and
//! handed to tasks, the coordinator, and the replicator as immutable structs.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Strategy used to compute the next key-group assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[clap(rename_all = "snake_case")]
pub enum ReconfigScenario {
    /// Randomly reassign a bounded number of key-groups.
    Shuffle,
    /// Move key-groups from the most- to the least-loaded subtask.
    LoadBalance,
    /// Load balancing with zipf-weighted synthetic key-group load.
    LoadBalanceZipf,
    /// Emit the current assignment unchanged (baseline measurement).
    Profiling,
    /// Apply an explicit target assignment supplied with the trigger.
    Static,
}

/// Drain order for migrated key-groups at a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[clap(rename_all = "snake_case")]
pub enum OrderFunction {
    /// Drain in state-arrival order.
    Default,
    /// Drain highest key-group first.
    Reverse,
    /// Drain in a permutation seeded from the reconfig id.
    Random,
}

/// Command-line / environment surface for the migration subsystem.
///
/// Mirrors the engine's dotted option names (`reconfig.*`,
/// `replicate_keys_filter`, `snapshot.changelog.enabled`, ...).
#[derive(Debug, Clone, Parser)]
pub struct MigrationArgs {
    /// Planner strategy selected for triggered reconfigurations.
    #[arg(long, env = "SPACKER_RECONFIG_SCENARIO", value_enum, default_value = "static")]
    pub reconfig_scenario: ReconfigScenario,

    /// Target number of key-groups to migrate per reconfig.
    #[arg(long, env = "SPACKER_RECONFIG_AFFECTED_KEYS", default_value_t = 8)]
    pub reconfig_affected_keys: usize,

    /// Upper bound on subtasks involved in one reconfig.
    #[arg(long, env = "SPACKER_RECONFIG_AFFECTED_TASKS", default_value_t = 2)]
    pub reconfig_affected_tasks: usize,

    /// Key-groups shipped per transfer round. `0` ships the whole range at once.
    #[arg(long, env = "SPACKER_RECONFIG_SYNC_KEYS", default_value_t = 0)]
    pub reconfig_sync_keys: usize,

    /// Drain order for migrated key-groups.
    #[arg(long, env = "SPACKER_RECONFIG_ORDER_FUNCTION", value_enum, default_value = "default")]
    pub reconfig_order_function: OrderFunction,

    /// Abort a reconfig stuck in transfer longer than this.
    #[arg(long, env = "SPACKER_RECONFIG_TIMEOUT_MS", default_value_t = 10_000)]
    pub reconfig_timeout_ms: u64,

    /// Per-key-group transfer retries before the reconfig is aborted.
    #[arg(long, env = "SPACKER_RECONFIG_TRANSFER_RETRIES", default_value_t = 3)]
    pub reconfig_transfer_retries: u32,

    /// On transfer timeout, commit the key-groups that did arrive instead of
    /// aborting the whole reconfig.
    #[arg(long, env = "SPACKER_RECONFIG_PARTIAL_COMMIT", default_value_t = false)]
    pub reconfig_partial_commit: bool,

    /// `0` disables proactive replication; `N` replicates key-groups where
    /// `kg % N == 0`; `1` replicates everything.
    #[arg(long, env = "SPACKER_REPLICATE_KEYS_FILTER", default_value_t = 0)]
    pub replicate_keys_filter: u32,

    /// Replication cycle interval (ms).
    #[arg(long, env = "SPACKER_REPLICATION_INTERVAL_MS", default_value_t = 1_000)]
    pub replication_interval_ms: u64,

    /// Snapshot only changelog-dirty key-groups instead of the full range.
    #[arg(long, env = "SPACKER_SNAPSHOT_CHANGELOG_ENABLED", default_value_t = true)]
    pub snapshot_changelog_enabled: bool,

    /// Run the serialize-and-ship snapshot phase off the task's critical path.
    #[arg(long, env = "SPACKER_STATE_BACKEND_ASYNC", default_value_t = true)]
    pub state_backend_async: bool,

    /// Ship state payloads as bounded chunks instead of one message per key-group.
    #[arg(long, env = "SPACKER_STATE_TRANSMISSION_CHUNKED", default_value_t = false)]
    pub state_transmission_chunked: bool,

    /// Chunk size in bytes when chunked transmission is enabled.
    #[arg(long, env = "SPACKER_STATE_CHUNK_BYTES", default_value_t = 64 * 1024)]
    pub state_chunk_bytes: usize,

    /// Comma-separated operator names that are reconfig targets.
    #[arg(long, env = "SPACKER_TARGET_OPERATORS", default_value = "")]
    pub target_operators: String,
}

impl Default for MigrationArgs {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}

impl MigrationArgs {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            scenario: self.reconfig_scenario,
            affected_keys: self.reconfig_affected_keys,
            affected_tasks: self.reconfig_affected_tasks,
            transfer_timeout: Duration::from_millis(self.reconfig_timeout_ms),
            transfer_retries: self.reconfig_transfer_retries,
            partial_commit_on_timeout: self.reconfig_partial_commit,
            target_operators: self.target_operator_names(),
        }
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            order_function: self.reconfig_order_function,
            sync_keys: self.reconfig_sync_keys,
            snapshot_changelog_enabled: self.snapshot_changelog_enabled,
            async_snapshot: self.state_backend_async,
            chunked_transmission: self.state_transmission_chunked,
            chunk_bytes: self.state_chunk_bytes,
        }
    }

    pub fn replicator_config(&self) -> ReplicatorConfig {
        ReplicatorConfig {
            keys_filter: self.replicate_keys_filter,
            interval: Duration::from_millis(self.replication_interval_ms),
        }
    }

    /// Operator names selected as reconfig targets. Empty means every operator.
    pub fn target_operator_names(&self) -> Vec<String> {
        self.target_operators
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Configuration for the reconfig coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Planner strategy for triggered reconfigurations.
    pub scenario: ReconfigScenario,
    /// Target number of key-groups moved per reconfig.
    pub affected_keys: usize,
    /// Upper bound on subtasks involved per reconfig.
    pub affected_tasks: usize,
    /// Budget for the transfer phase before the timeout policy applies.
    pub transfer_timeout: Duration,
    /// Per-key-group redispatch attempts before aborting.
    pub transfer_retries: u32,
    /// Timeout policy: commit the arrived subset (`partial=true`) vs abort.
    pub partial_commit_on_timeout: bool,
    /// Operator names accepted as reconfig targets; empty accepts every
    /// operator.
    pub target_operators: Vec<String>,
}

/// Per-task migration configuration.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Drain order for migrated key-groups.
    pub order_function: OrderFunction,
    /// Key-groups shipped per transfer round (`0` = whole range at once).
    pub sync_keys: usize,
    /// Restrict snapshots to changelog-dirty key-groups.
    pub snapshot_changelog_enabled: bool,
    /// Serialize and ship off the task's critical path.
    pub async_snapshot: bool,
    /// Chunked state payload framing.
    pub chunked_transmission: bool,
    /// Chunk size for chunked framing.
    pub chunk_bytes: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        MigrationArgs::default().task_config()
    }
}

/// Configuration for the proactive state replicator.
#[derive(Debug, Clone, Copy)]
pub struct ReplicatorConfig {
    /// `0` disables replication; `N` ships key-groups where `kg % N == 0`.
    pub keys_filter: u32,
    /// Cycle interval.
    pub interval: Duration,
}

impl ReplicatorConfig {
    pub fn enabled(&self) -> bool {
        self.keys_filter > 0
    }

    pub fn selects(&self, kg: crate::key_group::KeyGroup) -> bool {
        self.keys_filter > 0 && kg % self.keys_filter == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_flags() {
        let args = MigrationArgs::default();
        assert_eq!(args.reconfig_scenario, ReconfigScenario::Static);
        assert_eq!(args.reconfig_sync_keys, 0);
        assert!(args.target_operator_names().is_empty());
    }

    #[test]
    fn replicate_filter_selects_multiples() {
        let cfg = ReplicatorConfig {
            keys_filter: 2,
            interval: Duration::from_millis(100),
        };
        assert!(cfg.selects(0));
        assert!(!cfg.selects(3));
        assert!(cfg.selects(4));
        let off = ReplicatorConfig {
            keys_filter: 0,
            interval: Duration::from_millis(100),
        };
        assert!(!off.enabled());
        assert!(!off.selects(0));
    }

    #[test]
    fn target_operators_split_and_trim() {
        let mut args = MigrationArgs::default();
        args.target_operators = "counter, windowed_join".to_string();
        assert_eq!(
            args.target_operator_names(),
            vec!["counter".to_string(), "windowed_join".to_string()]
        );
    }
}
