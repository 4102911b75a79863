//! State backend capability set and its two variants.
//!
//! Migration only depends on `{get, put, remove, entries, ingest, drop}` per
//! key-group, so backends are interchangeable behind `StateBackend`: a heap
//! variant holding nested maps, and a fjall-backed variant keeping one
//! partition per operator with key-group-prefixed keys.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fjall::{Keyspace, PartitionCreateOptions};
use tracing::warn;

use crate::error::MigrationError;
use crate::key_group::KeyGroup;

/// One keyed state quadruple inside a key-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub namespace: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Capability set the migration paths rely on.
///
/// Implementations are single-owner: the owning task mutates them only from
/// its own loop, so no interior locking is required.
pub trait StateBackend: Send + 'static {
    fn get(&self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&mut self, kg: KeyGroup, namespace: &str, key: &[u8], value: Vec<u8>);
    fn remove(&mut self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>>;
    /// All entries of one key-group, in a stable iteration order.
    fn entries(&self, kg: KeyGroup) -> Vec<StateEntry>;
    /// Replace a key-group's contents wholesale (migration ingest).
    fn ingest(&mut self, kg: KeyGroup, entries: Vec<StateEntry>);
    /// Drop a key-group's contents (ownership relinquished).
    fn drop_key_group(&mut self, kg: KeyGroup);
    fn key_group_len(&self, kg: KeyGroup) -> usize;
}

type NamespaceMap = HashMap<String, HashMap<Vec<u8>, Vec<u8>>>;

/// In-memory backend: a sparse array indexed by hashed key-group of
/// `namespace → key → value` nested maps.
pub struct HeapStateBackend {
    slots: Vec<Option<NamespaceMap>>,
}

impl HeapStateBackend {
    pub fn new(max_parallelism: u32) -> Self {
        Self {
            slots: (0..max_parallelism).map(|_| None).collect(),
        }
    }

    fn slot_mut(&mut self, kg: KeyGroup) -> &mut NamespaceMap {
        self.slots[kg as usize].get_or_insert_with(HashMap::new)
    }
}

impl StateBackend for HeapStateBackend {
    fn get(&self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.slots[kg as usize]
            .as_ref()?
            .get(namespace)?
            .get(key)
            .cloned()
    }

    fn put(&mut self, kg: KeyGroup, namespace: &str, key: &[u8], value: Vec<u8>) {
        self.slot_mut(kg)
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_vec(), value);
    }

    fn remove(&mut self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.slots[kg as usize]
            .as_mut()?
            .get_mut(namespace)?
            .remove(key)
    }

    fn entries(&self, kg: KeyGroup) -> Vec<StateEntry> {
        let Some(ns_map) = self.slots[kg as usize].as_ref() else {
            return Vec::new();
        };
        let mut entries: Vec<StateEntry> = ns_map
            .iter()
            .flat_map(|(namespace, keys)| {
                keys.iter().map(|(key, value)| StateEntry {
                    namespace: namespace.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        entries
    }

    fn ingest(&mut self, kg: KeyGroup, entries: Vec<StateEntry>) {
        let slot = self.slot_mut(kg);
        slot.clear();
        for entry in entries {
            slot.entry(entry.namespace)
                .or_default()
                .insert(entry.key, entry.value);
        }
    }

    fn drop_key_group(&mut self, kg: KeyGroup) {
        self.slots[kg as usize] = None;
    }

    fn key_group_len(&self, kg: KeyGroup) -> usize {
        self.slots[kg as usize]
            .as_ref()
            .map(|ns_map| ns_map.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }
}

/// Fjall-backed backend: one partition per operator, keys prefixed by the
/// hashed key-group so a key-group is one contiguous prefix scan.
pub struct FjallStateBackend {
    #[allow(dead_code)]
    keyspace: Keyspace,
    partition: fjall::PartitionHandle,
}

impl FjallStateBackend {
    pub fn open(keyspace: Keyspace, operator: &str) -> anyhow::Result<Self> {
        let name = format!("state_{operator}");
        let partition = keyspace.open_partition(&name, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            partition,
        })
    }

    fn encode_key(kg: KeyGroup, namespace: &str, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + namespace.len() + key.len());
        buf.extend_from_slice(&kg.to_be_bytes());
        buf.extend_from_slice(&(namespace.len() as u16).to_be_bytes());
        buf.extend_from_slice(namespace.as_bytes());
        buf.extend_from_slice(key);
        buf
    }

    fn decode_key(raw: &[u8]) -> Option<(String, Vec<u8>)> {
        if raw.len() < 6 {
            return None;
        }
        let ns_len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if raw.len() < 6 + ns_len {
            return None;
        }
        let namespace = String::from_utf8(raw[6..6 + ns_len].to_vec()).ok()?;
        Some((namespace, raw[6 + ns_len..].to_vec()))
    }
}

impl StateBackend for FjallStateBackend {
    fn get(&self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>> {
        match self.partition.get(Self::encode_key(kg, namespace, key)) {
            Ok(value) => value.map(|slice| slice.to_vec()),
            Err(err) => {
                warn!(error = ?err, kg, "state read failed");
                None
            }
        }
    }

    fn put(&mut self, kg: KeyGroup, namespace: &str, key: &[u8], value: Vec<u8>) {
        if let Err(err) = self.partition.insert(Self::encode_key(kg, namespace, key), value) {
            warn!(error = ?err, kg, "state write failed");
        }
    }

    fn remove(&mut self, kg: KeyGroup, namespace: &str, key: &[u8]) -> Option<Vec<u8>> {
        let encoded = Self::encode_key(kg, namespace, key);
        let previous = match self.partition.get(&encoded) {
            Ok(value) => value.map(|slice| slice.to_vec()),
            Err(err) => {
                warn!(error = ?err, kg, "state read failed");
                None
            }
        };
        if let Err(err) = self.partition.remove(encoded) {
            warn!(error = ?err, kg, "state remove failed");
        }
        previous
    }

    fn entries(&self, kg: KeyGroup) -> Vec<StateEntry> {
        let mut entries = Vec::new();
        for item in self.partition.prefix(kg.to_be_bytes()) {
            match item {
                Ok((raw_key, value)) => {
                    if let Some((namespace, key)) = Self::decode_key(&raw_key) {
                        entries.push(StateEntry {
                            namespace,
                            key,
                            value: value.to_vec(),
                        });
                    }
                }
                Err(err) => {
                    warn!(error = ?err, kg, "state scan failed");
                    break;
                }
            }
        }
        entries
    }

    fn ingest(&mut self, kg: KeyGroup, entries: Vec<StateEntry>) {
        self.drop_key_group(kg);
        for entry in entries {
            self.put(kg, &entry.namespace, &entry.key, entry.value);
        }
    }

    fn drop_key_group(&mut self, kg: KeyGroup) {
        let keys: Vec<Vec<u8>> = self
            .partition
            .prefix(kg.to_be_bytes())
            .filter_map(|item| item.ok().map(|(raw_key, _)| raw_key.to_vec()))
            .collect();
        for key in keys {
            if let Err(err) = self.partition.remove(key) {
                warn!(error = ?err, kg, "state remove failed");
            }
        }
    }

    fn key_group_len(&self, kg: KeyGroup) -> usize {
        self.partition.prefix(kg.to_be_bytes()).count()
    }
}

/// Encode a key-group's entries as a snapshot payload.
///
/// An empty entry set encodes to zero bytes so the key-group collapses in the
/// handle's offset table.
pub fn encode_entries(entries: &[StateEntry]) -> Bytes {
    if entries.is_empty() {
        return Bytes::new();
    }
    let mut buf = BytesMut::new();
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u16(entry.namespace.len() as u16);
        buf.put_slice(entry.namespace.as_bytes());
        buf.put_u32(entry.key.len() as u32);
        buf.put_slice(&entry.key);
        buf.put_u32(entry.value.len() as u32);
        buf.put_slice(&entry.value);
    }
    buf.freeze()
}

/// Decode a snapshot payload back into entries.
pub fn decode_entries(kg: KeyGroup, mut payload: Bytes) -> Result<Vec<StateEntry>, MigrationError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let fail = |reason: &str| MigrationError::IngestFailure {
        kg,
        reason: reason.to_string(),
    };
    if payload.remaining() < 4 {
        return Err(fail("truncated entry count"));
    }
    let count = payload.get_u32() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.remaining() < 2 {
            return Err(fail("truncated namespace length"));
        }
        let ns_len = payload.get_u16() as usize;
        if payload.remaining() < ns_len {
            return Err(fail("truncated namespace"));
        }
        let namespace = String::from_utf8(payload.copy_to_bytes(ns_len).to_vec())
            .map_err(|_| fail("namespace is not utf-8"))?;
        if payload.remaining() < 4 {
            return Err(fail("truncated key length"));
        }
        let key_len = payload.get_u32() as usize;
        if payload.remaining() < key_len {
            return Err(fail("truncated key"));
        }
        let key = payload.copy_to_bytes(key_len).to_vec();
        if payload.remaining() < 4 {
            return Err(fail("truncated value length"));
        }
        let value_len = payload.get_u32() as usize;
        if payload.remaining() < value_len {
            return Err(fail("truncated value"));
        }
        let value = payload.copy_to_bytes(value_len).to_vec();
        entries.push(StateEntry {
            namespace,
            key,
            value,
        });
    }
    if payload.has_remaining() {
        return Err(fail("trailing bytes after entries"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_backend<B: StateBackend>(backend: &mut B) {
        backend.put(3, "counts", b"user-1", b"1".to_vec());
        backend.put(3, "counts", b"user-2", b"2".to_vec());
        backend.put(5, "counts", b"user-3", b"3".to_vec());
        assert_eq!(backend.get(3, "counts", b"user-1"), Some(b"1".to_vec()));
        assert_eq!(backend.get(3, "counts", b"user-3"), None);
        assert_eq!(backend.key_group_len(3), 2);

        assert_eq!(backend.remove(3, "counts", b"user-2"), Some(b"2".to_vec()));
        assert_eq!(backend.key_group_len(3), 1);

        let entries = backend.entries(5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"user-3");

        backend.ingest(
            5,
            vec![StateEntry {
                namespace: "counts".to_string(),
                key: b"user-9".to_vec(),
                value: b"9".to_vec(),
            }],
        );
        assert_eq!(backend.get(5, "counts", b"user-3"), None);
        assert_eq!(backend.get(5, "counts", b"user-9"), Some(b"9".to_vec()));

        backend.drop_key_group(5);
        assert_eq!(backend.key_group_len(5), 0);
        assert_eq!(backend.key_group_len(3), 1);
    }

    #[test]
    fn heap_backend_capability_set() {
        let mut backend = HeapStateBackend::new(16);
        exercise_backend(&mut backend);
    }

    #[test]
    fn fjall_backend_capability_set() {
        let dir = tempfile::tempdir().unwrap();
        let keyspace = fjall::Config::new(dir.path()).open().unwrap();
        let mut backend = FjallStateBackend::open(keyspace, "counter").unwrap();
        exercise_backend(&mut backend);
    }

    #[test]
    fn entry_payload_round_trips() {
        let entries = vec![
            StateEntry {
                namespace: "window".to_string(),
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            },
            StateEntry {
                namespace: "window".to_string(),
                key: b"k2".to_vec(),
                value: vec![],
            },
        ];
        let payload = encode_entries(&entries);
        let decoded = decode_entries(1, payload).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn empty_entry_set_encodes_to_zero_bytes() {
        assert!(encode_entries(&[]).is_empty());
        assert!(decode_entries(0, Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn truncated_payload_is_an_ingest_failure() {
        let entries = vec![StateEntry {
            namespace: "counts".to_string(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }];
        let payload = encode_entries(&entries);
        let truncated = payload.slice(0..payload.len() - 1);
        assert!(matches!(
            decode_entries(2, truncated),
            Err(MigrationError::IngestFailure { kg: 2, .. })
        ));
    }
}
