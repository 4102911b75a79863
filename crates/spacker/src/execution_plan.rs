//! The logical plan mapping key-groups to subtasks across reconfigurations.
//!
//! A plan is built from the previous plan plus a new `id_in_model → [kg]`
//! mapping. Construction classifies the transition (scale out, scale in,
//! repartition), derives per-subtask source/destination key-group sets, and
//! routes every migrating key-group to exactly one destination. Slots beyond
//! the new parallelism carry the `UNUSED_SUBTASK` sentinel so a later scale
//! out can occupy a pre-provisioned slot without redeploying tasks.
//!
//! Plans are immutable once built; the previous plan is consumed as input and
//! dropped, never chained.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::PlanError;
use crate::key_group::{KeyGroup, KeyGroupRange};

/// Physical slot index of a subtask.
pub type SubtaskIndex = usize;

/// Logical executor identity, stable across reconfigurations.
pub type IdInModel = u32;

/// Sentinel marking an over-provisioned, currently unoccupied slot.
pub const UNUSED_SUBTASK: IdInModel = u32::MAX / 2;

/// Key-group-to-subtask mapping for one operator at one plan epoch.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecutionPlan {
    operator: String,
    version: u64,
    num_opened_subtasks: usize,
    partition_assignment: Vec<Vec<KeyGroup>>,
    subtask_index_mapping: Vec<IdInModel>,
    aligned_key_group_ranges: Vec<KeyGroupRange>,
    modified_subtasks: BTreeSet<SubtaskIndex>,
    src_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>>,
    dst_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>>,
    src_kg_to_destination: BTreeMap<KeyGroup, SubtaskIndex>,
    src_kg_to_source: BTreeMap<KeyGroup, SubtaskIndex>,
    #[serde(skip)]
    executor_id_mapping: HashMap<IdInModel, SubtaskIndex>,
    #[serde(skip)]
    owners: HashMap<KeyGroup, SubtaskIndex>,
}

impl JobExecutionPlan {
    /// Build the first plan of a job: executor `i` occupies slot `i`, the
    /// remaining slots up to `num_opened_subtasks` stay unused.
    pub fn initial(
        operator: &str,
        executor_mapping: &BTreeMap<IdInModel, Vec<KeyGroup>>,
        num_opened_subtasks: usize,
    ) -> Result<Self, PlanError> {
        if executor_mapping.len() > num_opened_subtasks {
            return Err(PlanError::InvalidPlan(format!(
                "{} executors exceed {num_opened_subtasks} opened subtasks",
                executor_mapping.len()
            )));
        }
        let mut partition_assignment = vec![Vec::new(); num_opened_subtasks];
        let mut subtask_index_mapping = vec![UNUSED_SUBTASK; num_opened_subtasks];
        for (id, partition) in executor_mapping {
            let subtask = *id as usize;
            if subtask >= num_opened_subtasks {
                return Err(PlanError::InvalidPlan(format!(
                    "executor {id} has no slot below {num_opened_subtasks}"
                )));
            }
            subtask_index_mapping[subtask] = *id;
            partition_assignment[subtask] = partition.clone();
        }

        Self::finish(
            operator.to_string(),
            0,
            num_opened_subtasks,
            partition_assignment,
            subtask_index_mapping,
            BTreeSet::new(),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    /// Build the next plan from the previous one and a new logical mapping.
    pub fn from_previous(
        previous: &JobExecutionPlan,
        new_mapping: &BTreeMap<IdInModel, Vec<KeyGroup>>,
        version: u64,
    ) -> Result<Self, PlanError> {
        let old_mapping = previous.executor_mapping();
        let num_opened_subtasks = previous.num_opened_subtasks;

        let mut partition_assignment = vec![Vec::new(); num_opened_subtasks];
        let mut subtask_index_mapping = vec![UNUSED_SUBTASK; num_opened_subtasks];
        let mut modified_subtasks = BTreeSet::new();
        let mut src_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>> = BTreeMap::new();
        let mut dst_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>> = BTreeMap::new();

        let occupy = |subtask: SubtaskIndex,
                          id: IdInModel,
                          partition: &[KeyGroup],
                          subtask_index_mapping: &mut Vec<IdInModel>,
                          partition_assignment: &mut Vec<Vec<KeyGroup>>|
         -> Result<(), PlanError> {
            if subtask_index_mapping[subtask] != UNUSED_SUBTASK {
                return Err(PlanError::InvalidPlan(format!(
                    "subtask {subtask} assigned twice"
                )));
            }
            subtask_index_mapping[subtask] = id;
            partition_assignment[subtask] = partition.to_vec();
            Ok(())
        };

        if new_mapping.len() > old_mapping.len() {
            // Scale out: exactly one created executor takes an unused slot.
            let created: Vec<IdInModel> = new_mapping
                .keys()
                .filter(|id| !old_mapping.contains_key(id))
                .copied()
                .collect();
            if created.len() != 1 {
                return Err(PlanError::InvalidPlan(format!(
                    "scale out created {} executors, expected 1",
                    created.len()
                )));
            }
            let created_id = created[0];
            for (id, partition) in new_mapping {
                let subtask = if *id == created_id {
                    previous.find_next_unused_subtask()?
                } else {
                    previous.subtask_for_id(*id).ok_or_else(|| {
                        PlanError::InvalidPlan(format!("executor {id} unknown to previous plan"))
                    })?
                };
                occupy(
                    subtask,
                    *id,
                    partition,
                    &mut subtask_index_mapping,
                    &mut partition_assignment,
                )?;
                let changed = *id == created_id
                    || old_mapping
                        .get(id)
                        .map(|old| old.len() != partition.len())
                        .unwrap_or(true);
                if changed {
                    modified_subtasks.insert(subtask);
                }
            }
        } else if new_mapping.len() < old_mapping.len() {
            // Scale in: exactly one removed executor; its key-groups spread
            // over the surviving subtasks.
            let removed: Vec<IdInModel> = old_mapping
                .keys()
                .filter(|id| !new_mapping.contains_key(id))
                .copied()
                .collect();
            if removed.len() != 1 {
                return Err(PlanError::InvalidPlan(format!(
                    "scale in removed {} executors, expected 1",
                    removed.len()
                )));
            }
            let removed_subtask = previous.subtask_for_id(removed[0]).ok_or_else(|| {
                PlanError::InvalidPlan(format!("executor {} unknown to previous plan", removed[0]))
            })?;
            modified_subtasks.insert(removed_subtask);

            for (id, partition) in new_mapping {
                let subtask = previous.subtask_for_id(*id).ok_or_else(|| {
                    PlanError::InvalidPlan(format!("executor {id} unknown to previous plan"))
                })?;
                occupy(
                    subtask,
                    *id,
                    partition,
                    &mut subtask_index_mapping,
                    &mut partition_assignment,
                )?;
                if partition.len() != old_mapping[id].len() {
                    modified_subtasks.insert(subtask);
                }
            }
        } else {
            // Repartition: any number of subtasks may exchange key-groups.
            for (id, partition) in new_mapping {
                let subtask = previous.subtask_for_id(*id).ok_or_else(|| {
                    PlanError::InvalidPlan(format!("executor {id} unknown to previous plan"))
                })?;
                occupy(
                    subtask,
                    *id,
                    partition,
                    &mut subtask_index_mapping,
                    &mut partition_assignment,
                )?;
                let old = &old_mapping[id];
                if old.len() != partition.len()
                    || !partition.iter().all(|kg| old.contains(kg))
                {
                    modified_subtasks.insert(subtask);
                }
            }
        }

        // Source/destination sets from the per-subtask set differences.
        for (id, old_partition) in &old_mapping {
            let old_subtask = previous
                .subtask_for_id(*id)
                .expect("old mapping derived from previous plan");
            let new_partition = new_mapping.get(id);
            let lost: Vec<KeyGroup> = old_partition
                .iter()
                .filter(|kg| new_partition.map(|new| !new.contains(kg)).unwrap_or(true))
                .copied()
                .collect();
            if !lost.is_empty() {
                src_affected.insert(old_subtask, lost);
                modified_subtasks.insert(old_subtask);
            }
        }
        for (subtask, id) in subtask_index_mapping.iter().enumerate() {
            if *id == UNUSED_SUBTASK {
                continue;
            }
            let new_partition = &partition_assignment[subtask];
            let old_partition = old_mapping.get(id);
            let gained: Vec<KeyGroup> = new_partition
                .iter()
                .filter(|kg| {
                    old_partition
                        .map(|old| !old.contains(kg))
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            if !gained.is_empty() {
                dst_affected.insert(subtask, gained);
                modified_subtasks.insert(subtask);
            }
        }

        Self::finish(
            previous.operator.clone(),
            version,
            num_opened_subtasks,
            partition_assignment,
            subtask_index_mapping,
            modified_subtasks,
            src_affected,
            dst_affected,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        operator: String,
        version: u64,
        num_opened_subtasks: usize,
        partition_assignment: Vec<Vec<KeyGroup>>,
        subtask_index_mapping: Vec<IdInModel>,
        modified_subtasks: BTreeSet<SubtaskIndex>,
        src_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>>,
        dst_affected: BTreeMap<SubtaskIndex, Vec<KeyGroup>>,
    ) -> Result<Self, PlanError> {
        // Ownership exclusivity across the whole plan.
        let mut owners: HashMap<KeyGroup, SubtaskIndex> = HashMap::new();
        for (subtask, partition) in partition_assignment.iter().enumerate() {
            for kg in partition {
                if let Some(first) = owners.insert(*kg, subtask) {
                    return Err(PlanError::PlanConflict {
                        kg: *kg,
                        first,
                        second: subtask,
                    });
                }
            }
        }

        // Each destination key-group must be claimed by exactly one gainer.
        let mut src_kg_to_destination: BTreeMap<KeyGroup, SubtaskIndex> = BTreeMap::new();
        for (subtask, gained) in &dst_affected {
            for kg in gained {
                if let Some(first) = src_kg_to_destination.insert(*kg, *subtask) {
                    return Err(PlanError::PlanConflict {
                        kg: *kg,
                        first,
                        second: *subtask,
                    });
                }
            }
        }
        let mut src_kg_to_source: BTreeMap<KeyGroup, SubtaskIndex> = BTreeMap::new();
        for (subtask, lost) in &src_affected {
            for kg in lost {
                src_kg_to_source.insert(*kg, *subtask);
                if !src_kg_to_destination.contains_key(kg) {
                    return Err(PlanError::InvalidPlan(format!(
                        "key group {kg} leaves subtask {subtask} but no subtask gains it"
                    )));
                }
            }
        }

        let occupied = subtask_index_mapping
            .iter()
            .filter(|id| **id != UNUSED_SUBTASK)
            .count();
        let executor_id_mapping: HashMap<IdInModel, SubtaskIndex> = subtask_index_mapping
            .iter()
            .enumerate()
            .filter(|(_, id)| **id != UNUSED_SUBTASK)
            .map(|(subtask, id)| (*id, subtask))
            .collect();
        if executor_id_mapping.len() != occupied {
            return Err(PlanError::InvalidPlan(
                "executor ids must map one-to-one onto subtasks".to_string(),
            ));
        }

        let aligned_key_group_ranges = partition_assignment
            .iter()
            .map(|partition| KeyGroupRange::from_key_groups(partition.clone()))
            .collect();

        Ok(Self {
            operator,
            version,
            num_opened_subtasks,
            partition_assignment,
            subtask_index_mapping,
            aligned_key_group_ranges,
            modified_subtasks,
            src_affected,
            dst_affected,
            src_kg_to_destination,
            src_kg_to_source,
            executor_id_mapping,
            owners,
        })
    }

    fn find_next_unused_subtask(&self) -> Result<SubtaskIndex, PlanError> {
        self.subtask_index_mapping
            .iter()
            .position(|id| *id == UNUSED_SUBTASK)
            .ok_or_else(|| {
                PlanError::InvalidPlan("no unused subtask slot for created executor".to_string())
            })
    }

    /// Current `id_in_model → [kg]` view of this plan.
    pub fn executor_mapping(&self) -> BTreeMap<IdInModel, Vec<KeyGroup>> {
        self.subtask_index_mapping
            .iter()
            .enumerate()
            .filter(|(_, id)| **id != UNUSED_SUBTASK)
            .map(|(subtask, id)| (*id, self.partition_assignment[subtask].clone()))
            .collect()
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_opened_subtasks(&self) -> usize {
        self.num_opened_subtasks
    }

    /// Number of occupied slots.
    pub fn parallelism(&self) -> usize {
        self.executor_id_mapping.len()
    }

    pub fn id_in_model(&self, subtask: SubtaskIndex) -> IdInModel {
        self.subtask_index_mapping
            .get(subtask)
            .copied()
            .unwrap_or(UNUSED_SUBTASK)
    }

    pub fn subtask_for_id(&self, id: IdInModel) -> Option<SubtaskIndex> {
        self.executor_id_mapping.get(&id).copied()
    }

    pub fn partition(&self, subtask: SubtaskIndex) -> &[KeyGroup] {
        &self.partition_assignment[subtask]
    }

    pub fn aligned_key_group_range(&self, subtask: SubtaskIndex) -> &KeyGroupRange {
        &self.aligned_key_group_ranges[subtask]
    }

    /// Subtask owning a key-group under this plan.
    pub fn owner_of(&self, kg: KeyGroup) -> Option<SubtaskIndex> {
        self.owners.get(&kg).copied()
    }

    pub fn is_affected(&self, subtask: SubtaskIndex) -> bool {
        self.modified_subtasks.contains(&subtask)
    }

    pub fn is_source(&self, subtask: SubtaskIndex) -> bool {
        self.src_affected.contains_key(&subtask)
    }

    pub fn is_destination(&self, subtask: SubtaskIndex) -> bool {
        self.dst_affected.contains_key(&subtask)
    }

    /// Key-groups this subtask loses in the transition into this plan.
    pub fn source_key_groups(&self, subtask: SubtaskIndex) -> &[KeyGroup] {
        self.src_affected
            .get(&subtask)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Key-groups this subtask gains in the transition into this plan.
    pub fn destination_key_groups(&self, subtask: SubtaskIndex) -> &[KeyGroup] {
        self.dst_affected
            .get(&subtask)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn destination_for(&self, kg: KeyGroup) -> Option<SubtaskIndex> {
        self.src_kg_to_destination.get(&kg).copied()
    }

    pub fn source_for(&self, kg: KeyGroup) -> Option<SubtaskIndex> {
        self.src_kg_to_source.get(&kg).copied()
    }

    /// Every key-group migrating in the transition into this plan.
    pub fn migrating_key_groups(&self) -> Vec<KeyGroup> {
        self.src_kg_to_destination.keys().copied().collect()
    }

    pub fn affected_subtasks(&self) -> impl Iterator<Item = SubtaskIndex> + '_ {
        self.modified_subtasks.iter().copied()
    }

    /// Stable digest over the fields that define routing, carried in the
    /// reconfig barrier for cross-task validation.
    pub fn digest(&self) -> u128 {
        let mut lo = DefaultHasher::new();
        self.partition_assignment.hash(&mut lo);
        self.subtask_index_mapping.hash(&mut lo);
        self.version.hash(&mut lo);
        let mut hi = DefaultHasher::new();
        1u8.hash(&mut hi);
        self.partition_assignment.hash(&mut hi);
        self.subtask_index_mapping.hash(&mut hi);
        self.version.hash(&mut hi);
        (u128::from(hi.finish()) << 64) | u128::from(lo.finish())
    }
}
