//! Key-group-addressable snapshot artifacts.
//!
//! A handle is one byte stream covering a key-group range, with a per-key-group
//! offset table and "modified" bits. Non-empty key-groups are framed as
//! `[kg:u32][len:u32][crc:u32][payload]` in aligned order; an empty key-group
//! occupies no bytes, so its offset equals the next one. The leading key-group
//! id is validated on every read-back and the crc covers the payload.
//!
//! Handles are moveable-only: a source gives its handle away when the
//! destination acknowledges ingestion, so there is deliberately no `Clone`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MigrationError;
use crate::key_group::{KeyGroup, KeyGroupRange};

/// Bytes of framing before each non-empty key-group payload.
pub const KEY_GROUP_HEADER_BYTES: usize = 4 + 4 + 4;

/// Snapshot artifact addressable by key-group.
#[derive(Debug)]
pub struct KeyGroupStateHandle {
    range: KeyGroupRange,
    offsets: Vec<u64>,
    modified: Vec<bool>,
    stream: Bytes,
    summary: bool,
}

impl KeyGroupStateHandle {
    pub fn range(&self) -> &KeyGroupRange {
        &self.range
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Whether the key-group was changelog-dirty when this snapshot was taken.
    pub fn is_modified(&self, kg: KeyGroup) -> bool {
        self.range
            .aligned_index_of(kg)
            .map(|aligned| self.modified[aligned])
            .unwrap_or(false)
    }

    /// A summary carries the offset table but no payload bytes; it is what the
    /// coordinator keeps for bookkeeping while the real bytes go task-to-task.
    pub fn is_summary(&self) -> bool {
        self.summary
    }

    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    /// Produce the coordinator-side summary of this handle.
    pub fn compose_summary(&self) -> KeyGroupStateHandle {
        KeyGroupStateHandle {
            range: self.range.clone(),
            offsets: self.offsets.clone(),
            modified: self.modified.clone(),
            stream: Bytes::new(),
            summary: true,
        }
    }

    /// Validated payload bytes for one key-group. `Ok(None)` means the
    /// key-group was empty in this snapshot.
    pub fn key_group_bytes(&self, kg: KeyGroup) -> Result<Option<Bytes>, MigrationError> {
        if self.summary {
            return Err(MigrationError::SnapshotFailure {
                kg,
                reason: "summary handle carries no payload".to_string(),
            });
        }
        let aligned = self
            .range
            .aligned_index_of(kg)
            .ok_or_else(|| MigrationError::SnapshotFailure {
                kg,
                reason: "key group not covered by handle".to_string(),
            })?;
        let start = self.offsets[aligned] as usize;
        let end = self
            .offsets
            .get(aligned + 1)
            .map(|off| *off as usize)
            .unwrap_or(self.stream.len());
        if start == end {
            return Ok(None);
        }
        decode_key_group_frame(kg, self.stream.slice(start..end)).map(Some)
    }

    /// Split the handle into per-key-group payloads for task-to-task shipping.
    ///
    /// Empty key-groups yield empty payloads so the destination still learns
    /// about ownership of state-less key-groups.
    pub fn decompose(self) -> Result<Vec<(KeyGroup, bool, Bytes)>, MigrationError> {
        let mut parts = Vec::with_capacity(self.range.len());
        for (aligned, kg) in self.range.iter().enumerate() {
            let payload = self.key_group_bytes(kg)?.unwrap_or_default();
            parts.push((kg, self.modified[aligned], payload));
        }
        Ok(parts)
    }
}

/// Incremental writer producing a [`KeyGroupStateHandle`].
///
/// Key-groups must be appended in the aligned order of the covered range.
#[derive(Debug, Default)]
pub struct KeyGroupStateWriter {
    buf: BytesMut,
    offsets: Vec<u64>,
    modified: Vec<bool>,
    covered: Vec<KeyGroup>,
}

impl KeyGroupStateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one key-group. An empty payload writes no bytes, leaving this
    /// key-group's offset equal to the next one.
    pub fn write_key_group(&mut self, kg: KeyGroup, payload: &[u8], modified: bool) {
        self.offsets.push(self.buf.len() as u64);
        self.modified.push(modified);
        self.covered.push(kg);
        if payload.is_empty() {
            return;
        }
        let mut crc = crc32fast::Hasher::new();
        crc.update(payload);
        self.buf.reserve(KEY_GROUP_HEADER_BYTES + payload.len());
        self.buf.put_u32(kg);
        self.buf.put_u32(payload.len() as u32);
        self.buf.put_u32(crc.finalize());
        self.buf.put_slice(payload);
    }

    pub fn finish(self) -> KeyGroupStateHandle {
        KeyGroupStateHandle {
            range: KeyGroupRange::from_key_groups(self.covered),
            offsets: self.offsets,
            modified: self.modified,
            stream: self.buf.freeze(),
            summary: false,
        }
    }
}

/// Frame one key-group payload the way handles do, for single-key-group
/// shipping and replica deltas.
pub fn encode_key_group_frame(kg: KeyGroup, payload: &[u8]) -> Bytes {
    let mut writer = KeyGroupStateWriter::new();
    writer.write_key_group(kg, payload, true);
    writer.finish().stream
}

/// Validate and strip the `[kg][len][crc]` header from a framed payload.
pub fn decode_key_group_frame(kg: KeyGroup, mut frame: Bytes) -> Result<Bytes, MigrationError> {
    if frame.is_empty() {
        return Ok(Bytes::new());
    }
    if frame.len() < KEY_GROUP_HEADER_BYTES {
        return Err(MigrationError::IngestFailure {
            kg,
            reason: format!("truncated frame of {} bytes", frame.len()),
        });
    }
    let header_kg = frame.get_u32();
    if header_kg != kg {
        return Err(MigrationError::IngestFailure {
            kg,
            reason: format!("frame addressed to key group {header_kg}"),
        });
    }
    let len = frame.get_u32() as usize;
    let crc = frame.get_u32();
    if frame.len() != len {
        return Err(MigrationError::IngestFailure {
            kg,
            reason: format!("payload length {} does not match header {len}", frame.len()),
        });
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame);
    if hasher.finalize() != crc {
        return Err(MigrationError::IngestFailure {
            kg,
            reason: "payload checksum mismatch".to_string(),
        });
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handle() -> KeyGroupStateHandle {
        let mut writer = KeyGroupStateWriter::new();
        writer.write_key_group(4, b"four", true);
        writer.write_key_group(9, b"", false);
        writer.write_key_group(2, b"two-bytes", true);
        writer.finish()
    }

    #[test]
    fn offsets_are_monotone_and_empty_groups_collapse() {
        let handle = sample_handle();
        let offsets = handle.offsets();
        assert_eq!(offsets.len(), 3);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        // kg 9 is empty: its offset equals the next one.
        assert_eq!(offsets[1], offsets[2]);
    }

    #[test]
    fn payload_round_trips_with_validation() {
        let handle = sample_handle();
        assert_eq!(handle.key_group_bytes(4).unwrap().unwrap().as_ref(), b"four");
        assert_eq!(handle.key_group_bytes(9).unwrap(), None);
        assert_eq!(
            handle.key_group_bytes(2).unwrap().unwrap().as_ref(),
            b"two-bytes"
        );
        assert!(handle.is_modified(4));
        assert!(!handle.is_modified(9));
    }

    #[test]
    fn decompose_preserves_aligned_order() {
        let parts = sample_handle().decompose().unwrap();
        let kgs: Vec<KeyGroup> = parts.iter().map(|(kg, _, _)| *kg).collect();
        assert_eq!(kgs, vec![4, 9, 2]);
        assert!(parts[1].2.is_empty());
    }

    #[test]
    fn summary_has_offsets_but_refuses_reads() {
        let summary = sample_handle().compose_summary();
        assert!(summary.is_summary());
        assert_eq!(summary.stream_len(), 0);
        assert_eq!(summary.offsets().len(), 3);
        assert!(summary.key_group_bytes(4).is_err());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let frame = encode_key_group_frame(7, b"payload");
        let mut corrupted = frame.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let err = decode_key_group_frame(7, Bytes::from(corrupted)).unwrap_err();
        assert!(matches!(err, MigrationError::IngestFailure { kg: 7, .. }));
    }

    #[test]
    fn frame_addressed_to_wrong_key_group_is_rejected() {
        let frame = encode_key_group_frame(7, b"payload");
        let err = decode_key_group_frame(8, frame).unwrap_err();
        assert!(matches!(err, MigrationError::IngestFailure { kg: 8, .. }));
    }
}
