//! Reassignment strategies producing the next key-group mapping.
//!
//! Design overview for pluggable planner strategies:
//! - `PlannerStrategy` is the strategy interface boundary used by the
//!   coordinator when a reconfiguration is triggered.
//! - `Static` applies an operator-supplied target mapping verbatim.
//! - `Shuffle` randomly relocates a bounded number of key-groups.
//! - `LoadBalance` moves the hottest key-groups from the most- to the
//!   least-loaded subtask, using observed per-key-group record counts.
//! - `LoadBalanceZipf` does the same over zipf-weighted synthetic load.
//! - `Profiling` emits the current assignment unchanged (baseline runs).

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{CoordinatorConfig, ReconfigScenario};
use crate::error::PlanError;
use crate::execution_plan::{IdInModel, JobExecutionPlan};
use crate::key_group::KeyGroup;

/// Observed per-key-group record counts, merged across subtasks.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    pub records_per_kg: BTreeMap<KeyGroup, u64>,
}

impl LoadSnapshot {
    pub fn load_of(&self, kg: KeyGroup) -> u64 {
        self.records_per_kg.get(&kg).copied().unwrap_or(0)
    }
}

/// Strategy boundary: compute the next `id_in_model → [kg]` mapping.
pub trait PlannerStrategy: Send {
    fn plan(
        &mut self,
        current: &JobExecutionPlan,
        load: &LoadSnapshot,
    ) -> Result<BTreeMap<IdInModel, Vec<KeyGroup>>, PlanError>;
}

/// Build the strategy selected by `reconfig.scenario`.
///
/// `Static` triggers carry their own target mapping, so asking for a static
/// strategy here is a planning error.
pub fn strategy_for(
    cfg: &CoordinatorConfig,
    seed: u64,
) -> Result<Box<dyn PlannerStrategy>, PlanError> {
    match cfg.scenario {
        ReconfigScenario::Static => Err(PlanError::InvalidPlan(
            "static scenario requires an explicit target mapping".to_string(),
        )),
        ReconfigScenario::Profiling => Ok(Box::new(ProfilingPlanner)),
        ReconfigScenario::Shuffle => Ok(Box::new(ShufflePlanner {
            rng: StdRng::seed_from_u64(seed),
            affected_keys: cfg.affected_keys,
            affected_tasks: cfg.affected_tasks,
        })),
        ReconfigScenario::LoadBalance => Ok(Box::new(LoadBalancePlanner {
            affected_keys: cfg.affected_keys,
            affected_tasks: cfg.affected_tasks,
            zipf_exponent: None,
        })),
        ReconfigScenario::LoadBalanceZipf => Ok(Box::new(LoadBalancePlanner {
            affected_keys: cfg.affected_keys,
            affected_tasks: cfg.affected_tasks,
            zipf_exponent: Some(1.0),
        })),
    }
}

/// Emit the current assignment unchanged.
pub struct ProfilingPlanner;

impl PlannerStrategy for ProfilingPlanner {
    fn plan(
        &mut self,
        current: &JobExecutionPlan,
        _load: &LoadSnapshot,
    ) -> Result<BTreeMap<IdInModel, Vec<KeyGroup>>, PlanError> {
        Ok(current.executor_mapping())
    }
}

/// Randomly relocate up to `affected_keys` key-groups between up to
/// `affected_tasks` subtasks.
pub struct ShufflePlanner {
    pub rng: StdRng,
    pub affected_keys: usize,
    pub affected_tasks: usize,
}

impl PlannerStrategy for ShufflePlanner {
    fn plan(
        &mut self,
        current: &JobExecutionPlan,
        _load: &LoadSnapshot,
    ) -> Result<BTreeMap<IdInModel, Vec<KeyGroup>>, PlanError> {
        let mut mapping = current.executor_mapping();
        let ids: Vec<IdInModel> = mapping.keys().copied().collect();
        if ids.len() < 2 {
            return Ok(mapping);
        }
        let mut involved: Vec<IdInModel> = ids.clone();
        involved.shuffle(&mut self.rng);
        involved.truncate(self.affected_tasks.max(2));

        let mut moved = 0;
        while moved < self.affected_keys {
            let from = involved[self.rng.gen_range(0..involved.len())];
            let to = involved[self.rng.gen_range(0..involved.len())];
            if from == to || mapping[&from].len() <= 1 {
                if involved.iter().all(|id| mapping[id].len() <= 1) {
                    break;
                }
                continue;
            }
            let idx = self.rng.gen_range(0..mapping[&from].len());
            let kg = mapping.get_mut(&from).expect("involved id present").remove(idx);
            mapping.get_mut(&to).expect("involved id present").push(kg);
            moved += 1;
        }
        Ok(mapping)
    }
}

/// Move the hottest key-groups from the most- to the least-loaded subtask.
pub struct LoadBalancePlanner {
    pub affected_keys: usize,
    pub affected_tasks: usize,
    /// When set, replace observed load with zipf weights of this exponent
    /// over the key-group id ordering.
    pub zipf_exponent: Option<f64>,
}

impl LoadBalancePlanner {
    fn weight(&self, kg: KeyGroup, load: &LoadSnapshot) -> u64 {
        match self.zipf_exponent {
            Some(s) => {
                // Rank by key-group id: weight ∝ 1/(rank+1)^s, scaled to keep
                // integer arithmetic.
                let rank = f64::from(kg) + 1.0;
                (1e9 / rank.powf(s)) as u64
            }
            None => load.load_of(kg),
        }
    }
}

impl PlannerStrategy for LoadBalancePlanner {
    fn plan(
        &mut self,
        current: &JobExecutionPlan,
        load: &LoadSnapshot,
    ) -> Result<BTreeMap<IdInModel, Vec<KeyGroup>>, PlanError> {
        let mut mapping = current.executor_mapping();
        if mapping.len() < 2 {
            return Ok(mapping);
        }

        let mut moved = 0;
        let mut touched: Vec<IdInModel> = Vec::new();
        while moved < self.affected_keys {
            let load_of = |id: &IdInModel, mapping: &BTreeMap<IdInModel, Vec<KeyGroup>>| {
                mapping[id]
                    .iter()
                    .map(|kg| self.weight(*kg, load))
                    .sum::<u64>()
            };
            let hottest = *mapping
                .keys()
                .max_by_key(|id| load_of(id, &mapping))
                .expect("non-empty mapping");
            let coldest = *mapping
                .keys()
                .min_by_key(|id| load_of(id, &mapping))
                .expect("non-empty mapping");
            if hottest == coldest || mapping[&hottest].len() <= 1 {
                break;
            }
            for id in [hottest, coldest] {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
            if touched.len() > self.affected_tasks.max(2) {
                break;
            }

            let partition = mapping.get_mut(&hottest).expect("hottest id present");
            let (idx, _) = partition
                .iter()
                .enumerate()
                .max_by_key(|(_, kg)| self.weight(**kg, load))
                .expect("non-empty partition");
            let kg = partition.remove(idx);
            mapping.get_mut(&coldest).expect("coldest id present").push(kg);
            moved += 1;
        }
        Ok(mapping)
    }
}
