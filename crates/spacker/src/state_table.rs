//! Per-operator keyed state, partitioned by key-group.
//!
//! The table tracks a changelog of key-groups written since the last
//! replication or reconfig cycle, produces key-group-scoped snapshots, and
//! ingests shipped key-groups at migration destinations. Value, list, map,
//! and reducing state kinds are thin accessors over the same quadruple
//! store.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::backend::{decode_entries, encode_entries, StateBackend};
use crate::error::MigrationError;
use crate::key_group::{assign_to_key_group, KeyGroup, KeyGroupRange};
use crate::state_handle::{decode_key_group_frame, KeyGroupStateHandle, KeyGroupStateWriter};

/// Namespace used by state kinds that do not scope by window.
pub const DEFAULT_NAMESPACE: &str = "";

/// Keyed state for one operator instance.
pub struct KeyedStateTable<B: StateBackend> {
    backend: B,
    range: KeyGroupRange,
    max_parallelism: u32,
    changelog: HashSet<KeyGroup>,
    /// Highest version ingested per key-group; repeated deliveries at or
    /// below it are ignored.
    ingested_versions: HashMap<KeyGroup, u64>,
    current_key: Option<Vec<u8>>,
    current_kg: Option<KeyGroup>,
}

impl<B: StateBackend> KeyedStateTable<B> {
    pub fn new(backend: B, range: KeyGroupRange, max_parallelism: u32) -> Self {
        Self {
            backend,
            range,
            max_parallelism,
            changelog: HashSet::new(),
            ingested_versions: HashMap::new(),
            current_key: None,
            current_kg: None,
        }
    }

    pub fn range(&self) -> &KeyGroupRange {
        &self.range
    }

    pub fn max_parallelism(&self) -> u32 {
        self.max_parallelism
    }

    /// Replace the owned range. Called while a reconfiguration is applied.
    pub fn update_range(&mut self, new_range: KeyGroupRange) {
        self.range.update(new_range);
    }

    pub fn owns(&self, kg: KeyGroup) -> bool {
        self.range.contains(kg)
    }

    /// Set the key context before invoking the operator for a record.
    pub fn set_current_key(&mut self, key: &[u8]) -> KeyGroup {
        let kg = assign_to_key_group(key, self.max_parallelism);
        self.current_key = Some(key.to_vec());
        self.current_kg = Some(kg);
        kg
    }

    pub fn current_key_group(&self) -> Option<KeyGroup> {
        self.current_kg
    }

    fn current_context(&self) -> (&[u8], KeyGroup) {
        let key = self
            .current_key
            .as_deref()
            .expect("operator invoked without key context");
        let kg = self.current_kg.expect("operator invoked without key context");
        (key, kg)
    }

    // ------------------------------------------------------------------
    // State kinds under the current key context
    // ------------------------------------------------------------------

    pub fn get(&self, namespace: &str) -> Option<Vec<u8>> {
        let (key, kg) = self.current_context();
        self.backend.get(kg, namespace, key)
    }

    pub fn put(&mut self, namespace: &str, value: Vec<u8>) {
        let (key, kg) = self.current_context();
        let key = key.to_vec();
        self.backend.put(kg, namespace, &key, value);
        self.changelog.insert(kg);
    }

    pub fn remove(&mut self, namespace: &str) -> Option<Vec<u8>> {
        let (key, kg) = self.current_context();
        let key = key.to_vec();
        let previous = self.backend.remove(kg, namespace, &key);
        self.changelog.insert(kg);
        previous
    }

    /// List state: append one element.
    pub fn add_to_list(&mut self, namespace: &str, element: &[u8]) {
        let mut buf = match self.get(namespace) {
            Some(existing) => BytesMut::from(&existing[..]),
            None => BytesMut::new(),
        };
        buf.put_u32(element.len() as u32);
        buf.put_slice(element);
        self.put(namespace, buf.to_vec());
    }

    /// List state: read all elements.
    pub fn list(&self, namespace: &str) -> Vec<Vec<u8>> {
        let Some(raw) = self.get(namespace) else {
            return Vec::new();
        };
        let mut buf = Bytes::from(raw);
        let mut elements = Vec::new();
        while buf.remaining() >= 4 {
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                break;
            }
            elements.push(buf.copy_to_bytes(len).to_vec());
        }
        elements
    }

    /// Reducing state: combine the stored value with a new one. Aggregating
    /// and folding kinds use the same shape with their own combine function.
    pub fn reduce(
        &mut self,
        namespace: &str,
        value: Vec<u8>,
        reducer: impl FnOnce(&[u8], &[u8]) -> Vec<u8>,
    ) {
        let next = match self.get(namespace) {
            Some(existing) => reducer(&existing, &value),
            None => value,
        };
        self.put(namespace, next);
    }

    /// Map state: write one user-map entry. The stored value is an encoded
    /// map, so the whole map moves with its key-group like any other value.
    pub fn put_map_entry(&mut self, namespace: &str, map_key: &[u8], value: Vec<u8>) {
        let mut entries = self.map_entries(namespace);
        entries.retain(|(key, _)| key != map_key);
        entries.push((map_key.to_vec(), value));
        let mut buf = BytesMut::new();
        for (key, value) in &entries {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        self.put(namespace, buf.to_vec());
    }

    pub fn get_map_entry(&self, namespace: &str, map_key: &[u8]) -> Option<Vec<u8>> {
        self.map_entries(namespace)
            .into_iter()
            .find(|(key, _)| key == map_key)
            .map(|(_, value)| value)
    }

    fn map_entries(&self, namespace: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(raw) = self.get(namespace) else {
            return Vec::new();
        };
        let mut buf = Bytes::from(raw);
        let mut entries = Vec::new();
        while buf.remaining() >= 4 {
            let key_len = buf.get_u32() as usize;
            if buf.remaining() < key_len + 4 {
                break;
            }
            let key = buf.copy_to_bytes(key_len).to_vec();
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                break;
            }
            entries.push((key, buf.copy_to_bytes(value_len).to_vec()));
        }
        entries
    }

    // ------------------------------------------------------------------
    // Changelog
    // ------------------------------------------------------------------

    pub fn changelog(&self) -> &HashSet<KeyGroup> {
        &self.changelog
    }

    pub fn is_dirty(&self, kg: KeyGroup) -> bool {
        self.changelog.contains(&kg)
    }

    /// Clear changelog entries after a successful replication cycle. State
    /// stays in place.
    pub fn clear_changelog(&mut self, kgs: &[KeyGroup]) {
        for kg in kgs {
            self.changelog.remove(kg);
        }
    }

    /// Relinquish ownership after migration: drop both the changelog entries
    /// and the in-memory state of the given key-groups.
    pub fn release_changelogs(&mut self, kgs: &[KeyGroup]) {
        for kg in kgs {
            self.changelog.remove(kg);
            self.ingested_versions.remove(kg);
            self.backend.drop_key_group(*kg);
        }
        debug!(released = kgs.len(), "released migrated key groups");
    }

    // ------------------------------------------------------------------
    // Snapshot / ingest
    // ------------------------------------------------------------------

    /// Snapshot the given key-groups into a single handle. Every requested
    /// key-group must be owned by this table.
    pub fn snapshot(&self, kgs: &[KeyGroup]) -> Result<KeyGroupStateHandle, MigrationError> {
        let mut writer = KeyGroupStateWriter::new();
        for kg in kgs {
            if !self.range.contains(*kg) {
                return Err(MigrationError::SnapshotFailure {
                    kg: *kg,
                    reason: "key group not owned by this subtask".to_string(),
                });
            }
            let payload = encode_entries(&self.backend.entries(*kg));
            writer.write_key_group(*kg, &payload, self.changelog.contains(kg));
        }
        Ok(writer.finish())
    }

    /// Delta snapshot of the changelog-dirty key-groups selected by `filter`.
    pub fn snapshot_changelog(
        &self,
        filter: impl Fn(KeyGroup) -> bool,
    ) -> Result<KeyGroupStateHandle, MigrationError> {
        let mut dirty: Vec<KeyGroup> = self
            .changelog
            .iter()
            .copied()
            .filter(|kg| filter(*kg))
            .collect();
        dirty.sort_unstable();
        self.snapshot(&dirty)
    }

    /// Ingest one shipped key-group frame. Returns `false` when the delivery
    /// was a duplicate (version already applied).
    pub fn ingest_key_group(
        &mut self,
        kg: KeyGroup,
        version: u64,
        frame: Bytes,
    ) -> Result<bool, MigrationError> {
        if self
            .ingested_versions
            .get(&kg)
            .is_some_and(|seen| *seen >= version)
        {
            debug!(kg, version, "skipping duplicate state delivery");
            return Ok(false);
        }
        let payload = decode_key_group_frame(kg, frame)?;
        let entries = decode_entries(kg, payload)?;
        self.backend.ingest(kg, entries);
        self.ingested_versions.insert(kg, version);
        self.changelog.insert(kg);
        Ok(true)
    }

    /// Ingest every key-group of a handle (restore / replica promotion).
    pub fn ingest_handle(
        &mut self,
        handle: KeyGroupStateHandle,
        version: u64,
    ) -> Result<(), MigrationError> {
        for (kg, _, payload) in handle.decompose()? {
            let entries = decode_entries(kg, payload)?;
            self.backend.ingest(kg, entries);
            self.ingested_versions.insert(kg, version);
            self.changelog.insert(kg);
        }
        Ok(())
    }

    pub fn key_group_len(&self, kg: KeyGroup) -> usize {
        self.backend.key_group_len(kg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapStateBackend;
    use crate::state_handle::encode_key_group_frame;

    fn table_with_range(kgs: Vec<KeyGroup>) -> KeyedStateTable<HeapStateBackend> {
        KeyedStateTable::new(
            HeapStateBackend::new(8),
            KeyGroupRange::from_key_groups(kgs),
            8,
        )
    }

    fn key_in_group(table: &mut KeyedStateTable<HeapStateBackend>, kg: KeyGroup) -> Vec<u8> {
        for i in 0..10_000u32 {
            let key = format!("key-{i}").into_bytes();
            if assign_to_key_group(&key, table.max_parallelism()) == kg {
                return key;
            }
        }
        panic!("no key found for key group {kg}");
    }

    #[test]
    fn mutations_mark_the_changelog() {
        let mut table = table_with_range((0..8).collect());
        let key = key_in_group(&mut table, 3);
        table.set_current_key(&key);
        assert!(table.changelog().is_empty());
        table.put(DEFAULT_NAMESPACE, b"v".to_vec());
        assert!(table.is_dirty(3));
        table.clear_changelog(&[3]);
        assert!(!table.is_dirty(3));
        // State survives a changelog clear.
        assert_eq!(table.get(DEFAULT_NAMESPACE), Some(b"v".to_vec()));
    }

    #[test]
    fn snapshot_ingest_round_trip() {
        let mut source = table_with_range((0..8).collect());
        for kg in [1u32, 4, 6] {
            let key = key_in_group(&mut source, kg);
            source.set_current_key(&key);
            source.put("counts", format!("value-{kg}").into_bytes());
            source.add_to_list("events", b"e1");
            source.add_to_list("events", b"e2");
        }

        let handle = source.snapshot(&[1, 4, 6]).unwrap();
        let mut destination = table_with_range(vec![1, 4, 6]);
        destination.ingest_handle(handle, 1).unwrap();

        for kg in [1u32, 4, 6] {
            let key = key_in_group(&mut destination, kg);
            destination.set_current_key(&key);
            assert_eq!(
                destination.get("counts"),
                Some(format!("value-{kg}").into_bytes())
            );
            assert_eq!(destination.list("events"), vec![b"e1".to_vec(), b"e2".to_vec()]);
        }
    }

    #[test]
    fn snapshot_rejects_unowned_key_group() {
        let table = table_with_range(vec![0, 1]);
        assert!(matches!(
            table.snapshot(&[5]),
            Err(MigrationError::SnapshotFailure { kg: 5, .. })
        ));
    }

    #[test]
    fn ingest_is_idempotent_per_version() {
        let mut source = table_with_range((0..8).collect());
        let key = key_in_group(&mut source, 2);
        source.set_current_key(&key);
        source.put(DEFAULT_NAMESPACE, b"once".to_vec());
        let parts = source.snapshot(&[2]).unwrap().decompose().unwrap();
        let frame = encode_key_group_frame(2, &parts[0].2);

        let mut destination = table_with_range(vec![2]);
        assert!(destination.ingest_key_group(2, 7, frame.clone()).unwrap());
        assert!(!destination.ingest_key_group(2, 7, frame.clone()).unwrap());
        assert!(!destination.ingest_key_group(2, 3, frame).unwrap());
        destination.set_current_key(&key);
        assert_eq!(destination.get(DEFAULT_NAMESPACE), Some(b"once".to_vec()));
    }

    #[test]
    fn release_changelogs_relinquishes_state() {
        let mut table = table_with_range((0..8).collect());
        let key = key_in_group(&mut table, 5);
        table.set_current_key(&key);
        table.put(DEFAULT_NAMESPACE, b"gone".to_vec());
        assert_eq!(table.key_group_len(5), 1);

        table.release_changelogs(&[5]);
        assert_eq!(table.key_group_len(5), 0);
        assert!(!table.is_dirty(5));
    }

    #[test]
    fn map_state_entries_update_in_place() {
        let mut table = table_with_range((0..8).collect());
        let key = key_in_group(&mut table, 1);
        table.set_current_key(&key);
        table.put_map_entry("attrs", b"color", b"red".to_vec());
        table.put_map_entry("attrs", b"size", b"xl".to_vec());
        table.put_map_entry("attrs", b"color", b"blue".to_vec());
        assert_eq!(table.get_map_entry("attrs", b"color"), Some(b"blue".to_vec()));
        assert_eq!(table.get_map_entry("attrs", b"size"), Some(b"xl".to_vec()));
        assert_eq!(table.get_map_entry("attrs", b"weight"), None);
    }

    #[test]
    fn reduce_combines_with_existing_value() {
        let mut table = table_with_range((0..8).collect());
        let key = key_in_group(&mut table, 0);
        table.set_current_key(&key);
        table.reduce("sum", vec![3], |_, v| v.to_vec());
        table.reduce("sum", vec![4], |a, b| vec![a[0] + b[0]]);
        assert_eq!(table.get("sum"), Some(vec![7]));
    }
}
