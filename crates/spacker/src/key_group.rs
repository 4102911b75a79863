//! Key-group identifiers and per-subtask key-group ranges.
//!
//! A key-group is the smallest unit of routable state: every record key maps
//! to exactly one key-group by hashing modulo the job-wide max parallelism,
//! and a subtask owns a set of key-groups. After rebalancing the owned set is
//! usually sparse, so a range keeps two views: the *hashed* view (the real
//! key-group ids) and the *aligned* view (dense `0..len`) used for byte
//! offsets in snapshot streams.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Key-group id in `[0, max_parallelism)`.
pub type KeyGroup = u32;

/// Stable hash used for key routing and peer-agnostic digests.
///
/// The choice of hash is a compatibility constant for the lifetime of a job:
/// the upstream partitioner and every state table must agree on it.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Map a record key onto its key-group.
pub fn assign_to_key_group(key: &[u8], max_parallelism: u32) -> KeyGroup {
    debug_assert!(max_parallelism > 0);
    (hash_key(key) % u64::from(max_parallelism)) as KeyGroup
}

/// The set of key-groups owned by one subtask.
///
/// `hashed` holds the real key-group ids in aligned order; `index` is the
/// inverse mapping. Ranges of distinct subtasks at the same plan epoch are
/// disjoint and their union covers the whole key-group space.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyGroupRange {
    hashed: Vec<KeyGroup>,
    #[serde(skip)]
    index: HashMap<KeyGroup, usize>,
}

impl KeyGroupRange {
    /// Range owning no key-groups (over-provisioned slots).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_key_groups(hashed: Vec<KeyGroup>) -> Self {
        let index = hashed
            .iter()
            .enumerate()
            .map(|(aligned, kg)| (*kg, aligned))
            .collect();
        Self { hashed, index }
    }

    /// Rebuild the aligned index after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .hashed
            .iter()
            .enumerate()
            .map(|(aligned, kg)| (*kg, aligned))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.hashed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashed.is_empty()
    }

    pub fn contains(&self, kg: KeyGroup) -> bool {
        if self.index.len() == self.hashed.len() {
            self.index.contains_key(&kg)
        } else {
            self.hashed.contains(&kg)
        }
    }

    /// Hashed key-group at `aligned`, or `None` past the end of the range.
    pub fn map_from_aligned_to_hashed(&self, aligned: usize) -> Option<KeyGroup> {
        self.hashed.get(aligned).copied()
    }

    /// Aligned offset of a hashed key-group inside this range.
    pub fn aligned_index_of(&self, kg: KeyGroup) -> Option<usize> {
        if self.index.len() == self.hashed.len() {
            self.index.get(&kg).copied()
        } else {
            self.hashed.iter().position(|h| *h == kg)
        }
    }

    /// Replace the owned set in place. Only called under the task lock while
    /// a reconfiguration is being applied.
    pub fn update(&mut self, new_range: KeyGroupRange) {
        *self = new_range;
        if self.index.len() != self.hashed.len() {
            self.reindex();
        }
    }

    /// Owned key-groups in aligned order.
    pub fn iter(&self) -> impl Iterator<Item = KeyGroup> + '_ {
        self.hashed.iter().copied()
    }

    pub fn as_slice(&self) -> &[KeyGroup] {
        &self.hashed
    }
}

impl FromIterator<KeyGroup> for KeyGroupRange {
    fn from_iter<T: IntoIterator<Item = KeyGroup>>(iter: T) -> Self {
        Self::from_key_groups(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_deterministic_and_in_bounds() {
        for key in [&b"alpha"[..], b"beta", b"gamma", b""] {
            let first = assign_to_key_group(key, 128);
            let second = assign_to_key_group(key, 128);
            assert_eq!(first, second);
            assert!(first < 128);
        }
    }

    #[test]
    fn aligned_and_hashed_views_stay_bijective() {
        let range = KeyGroupRange::from_key_groups(vec![7, 2, 11]);
        assert_eq!(range.len(), 3);
        assert_eq!(range.map_from_aligned_to_hashed(0), Some(7));
        assert_eq!(range.map_from_aligned_to_hashed(2), Some(11));
        assert_eq!(range.map_from_aligned_to_hashed(3), None);
        assert_eq!(range.aligned_index_of(2), Some(1));
        assert_eq!(range.aligned_index_of(5), None);
        assert!(range.contains(11));
        assert!(!range.contains(12));
    }

    #[test]
    fn update_replaces_ownership() {
        let mut range = KeyGroupRange::from_key_groups(vec![0, 1, 2, 3]);
        range.update(KeyGroupRange::from_key_groups(vec![0, 1]));
        assert_eq!(range.as_slice(), &[0, 1]);
        assert!(!range.contains(2));
        assert_eq!(range.aligned_index_of(1), Some(1));
    }
}
