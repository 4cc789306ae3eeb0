//! The per-device log of mutations that is mirrored to remote storage

use std::collections::BTreeMap;

use bytes::BufMut;

use super::{
    mutate::{Mutate, MutateFlags, Version},
    CollectiveError,
};
use crate::model::id::DeviceId;

/// Leading tag of every serialized patch
pub const PATCH_TAG: &[u8] = b"XXDKPATCH";
pub const PATCH_VERSION: u16 = 1;
/// Trailer closing the element section of a serialized patch
pub const PATCH_DELIMITER: &[u8] = b"xxdkTxLogDelim";
/// Minimum number of log entries before compaction is considered
pub const COMPACT_MIN_ENTRIES: usize = 256;

/// Ordered log of the mutations made on one device.
///
/// Entries are appended in commit order and thus weakly ordered by timestamp. Compaction drops
/// entries superseded by a later change to the same key and bumps the [generation](Self::generation),
/// telling readers that entry indices have been renumbered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    device: DeviceId,
    generation: u32,
    entries: Vec<(String, Mutate)>,
    /// Index of the latest entry of every key: highest timestamp, later entries winning ties
    latest: BTreeMap<String, usize>,
}

/// The winning change of a key after merging patches from several devices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedValue {
    pub version: Version,
    pub value: Option<Vec<u8>>,
}

impl Patch {
    pub const fn new(device: DeviceId) -> Self {
        Self {
            device,
            generation: 0,
            entries: Vec::new(),
            latest: BTreeMap::new(),
        }
    }

    fn from_entries(device: DeviceId, generation: u32, entries: Vec<(String, Mutate)>) -> Self {
        let mut patch = Self {
            device,
            generation,
            entries: Vec::with_capacity(entries.len()),
            latest: BTreeMap::new(),
        };
        for (key, mutate) in entries {
            patch.push(key, mutate);
        }
        patch
    }

    fn push(&mut self, key: String, mutate: Mutate) {
        let replace = match self.latest.get(&key) {
            Some(&current) => mutate.timestamp_ns >= self.entries[current].1.timestamp_ns,
            None => true,
        };
        if replace {
            self.latest.insert(key.clone(), self.entries.len());
        }
        self.entries.push((key, mutate));
    }

    #[inline]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn entries(&self) -> &[(String, Mutate)] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a mutation to the log. Callers must hold exclusive access to the patch for the
    /// whole batch they are committing
    pub fn add_unsafe(&mut self, key: String, mutate: Mutate) {
        self.push(key, mutate);

        if self.entries.len() >= COMPACT_MIN_ENTRIES && self.entries.len() > 2 * self.latest.len() {
            self.compact();
        }
    }

    /// The current change of every key in this patch
    pub fn compacted(&self) -> BTreeMap<&str, &Mutate> {
        self.latest
            .iter()
            .map(|(key, &idx)| (key.as_str(), &self.entries[idx].1))
            .collect()
    }

    /// The current change of a single key
    pub fn get(&self, key: &str) -> Option<&Mutate> {
        self.latest.get(key).map(|&idx| &self.entries[idx].1)
    }

    /// Drop every entry superseded by another change to its key, keeping log order
    pub fn compact(&mut self) {
        let mut keep = vec![false; self.entries.len()];
        for &idx in self.latest.values() {
            keep[idx] = true;
        }

        let before = self.entries.len();
        let mut flags = keep.into_iter();
        let mut entries = std::mem::take(&mut self.entries);
        entries.retain(|_| flags.next().unwrap_or(false));
        self.latest.clear();
        for (key, mutate) in entries {
            self.push(key, mutate);
        }
        self.generation = self.generation.wrapping_add(1);

        log::debug!(
            "Compacted patch of {} from {} to {} entries, generation {}",
            self.device,
            before,
            self.entries.len(),
            self.generation
        );
    }

    /// Write the patch in its self-delimiting remote format
    pub fn serialize(&self) -> Result<Vec<u8>, CollectiveError> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| CollectiveError::Format("Too many patch entries".to_owned()))?;

        let mut buf = Vec::with_capacity(
            PATCH_TAG.len()
                + 10
                + PATCH_DELIMITER.len()
                + self
                    .entries
                    .iter()
                    .map(|(k, m)| 15 + k.len() + m.value.as_ref().map_or(0, Vec::len))
                    .sum::<usize>(),
        );

        buf.put_slice(PATCH_TAG);
        buf.put_u16(PATCH_VERSION);
        buf.put_u32_le(self.generation);
        buf.put_u32_le(count);

        for (key, mutate) in &self.entries {
            let key_len = u16::try_from(key.len())
                .map_err(|_| CollectiveError::Format(format!("Key of {} bytes is too long", key.len())))?;
            let value = mutate.value.as_deref().unwrap_or_default();
            let value_len = u32::try_from(value.len()).map_err(|_| {
                CollectiveError::Format(format!("Value of {} bytes is too long", value.len()))
            })?;

            buf.put_i64_le(mutate.timestamp_ns);
            buf.put_u8(mutate.flags().bits());
            buf.put_u16_le(key_len);
            buf.put_slice(key.as_bytes());
            buf.put_u32_le(value_len);
            buf.put_slice(value);
        }

        buf.put_slice(PATCH_DELIMITER);
        Ok(buf)
    }

    /// Parse a patch written by [Patch::serialize] for `device`. Bytes after the trailer are
    /// ignored
    pub fn deserialize(device: DeviceId, bytes: &[u8]) -> Result<Self, CollectiveError> {
        untrusted::Input::from(bytes).read_all(truncated(), |rdr| {
            if read_slice(rdr, PATCH_TAG.len())? != PATCH_TAG {
                return Err(CollectiveError::Format("Missing patch header tag".to_owned()));
            }

            let version = u16::from_be_bytes(read_array(rdr)?);
            if version != PATCH_VERSION {
                return Err(CollectiveError::Format(format!(
                    "Unsupported patch version {}",
                    version
                )));
            }

            let generation = u32::from_le_bytes(read_array(rdr)?);
            let count = u32::from_le_bytes(read_array(rdr)?) as usize;

            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let timestamp_ns = i64::from_le_bytes(read_array(rdr)?);
                let [flags] = read_array::<1>(rdr)?;
                let flags = MutateFlags::from_bits(flags).ok_or_else(|| {
                    CollectiveError::Format(format!("Unknown mutation flags {:#x}", flags))
                })?;

                let key_len = u16::from_le_bytes(read_array(rdr)?) as usize;
                let key = std::str::from_utf8(read_slice(rdr, key_len)?)
                    .map_err(|e| CollectiveError::Format(format!("Key is not UTF-8: {}", e)))?
                    .to_owned();

                let value_len = u32::from_le_bytes(read_array(rdr)?) as usize;
                let value = read_slice(rdr, value_len)?;

                let mutate = match flags.contains(MutateFlags::DELETION) {
                    true => Mutate::delete(timestamp_ns),
                    false => Mutate::write(timestamp_ns, value.to_vec()),
                };
                entries.push((key, mutate));
            }

            if read_slice(rdr, PATCH_DELIMITER.len())? != PATCH_DELIMITER {
                return Err(CollectiveError::Format("Missing patch trailer".to_owned()));
            }
            rdr.skip_to_end();

            Ok(Self::from_entries(device, generation, entries))
        })
    }

    /// Form persisted to local storage: a CRC32 of the serialized patch followed by it
    pub(crate) fn encode_local(&self) -> Result<Vec<u8>, CollectiveError> {
        let body = self.serialize()?;
        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        Ok(buf)
    }

    pub(crate) fn decode_local(device: DeviceId, bytes: &[u8]) -> Result<Self, CollectiveError> {
        if bytes.len() < 4 {
            return Err(CollectiveError::Corrupted);
        }

        let (crc, body) = bytes.split_at(4);
        if crc32fast::hash(body).to_le_bytes() != crc {
            return Err(CollectiveError::Corrupted);
        }

        Self::deserialize(device, body)
    }
}

/// Merge the compacted views of several patches under last-writer-wins. The result does not
/// depend on the order of `patches`
pub fn lww_merge<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> BTreeMap<String, MergedValue> {
    let mut merged = BTreeMap::<String, MergedValue>::new();
    for patch in patches {
        for (key, mutate) in patch.compacted() {
            let version = Version::of(mutate, patch.device);
            if version.supersedes(merged.get(key).map(|m| &m.version)) {
                merged.insert(
                    key.to_owned(),
                    MergedValue {
                        version,
                        value: mutate.value.clone(),
                    },
                );
            }
        }
    }
    merged
}

fn truncated() -> CollectiveError {
    CollectiveError::Format("Truncated patch".to_owned())
}

fn read_slice<'a>(rdr: &mut untrusted::Reader<'a>, len: usize) -> Result<&'a [u8], CollectiveError> {
    rdr.read_bytes(len)
        .map(|input| input.as_slice_less_safe())
        .map_err(|_| truncated())
}

fn read_array<const N: usize>(rdr: &mut untrusted::Reader<'_>) -> Result<[u8; N], CollectiveError> {
    let mut array = [0u8; N];
    array.copy_from_slice(read_slice(rdr, N)?);
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId([1; 16]);

    fn patch(entries: &[(&str, i64, Option<&str>)]) -> Patch {
        let mut patch = Patch::new(DEV);
        for (key, ts, value) in entries {
            let mutate = match value {
                Some(v) => Mutate::write(*ts, v.as_bytes().to_vec()),
                None => Mutate::delete(*ts),
            };
            patch.add_unsafe(key.to_string(), mutate);
        }
        patch
    }

    #[test]
    fn test_serialized_layout() {
        let patch = patch(&[("k", 7, Some("v")), ("d", 8, None)]);
        let bytes = patch.serialize().unwrap();

        let mut expected = b"XXDKPATCH".to_vec();
        expected.extend_from_slice(&[0, 1]);
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&7i64.to_le_bytes());
        expected.extend_from_slice(&[0, 1, 0, b'k', 1, 0, 0, 0, b'v']);
        expected.extend_from_slice(&8i64.to_le_bytes());
        expected.extend_from_slice(&[1, 1, 0, b'd', 0, 0, 0, 0]);
        expected.extend_from_slice(b"xxdkTxLogDelim");
        assert_eq!(bytes, expected);

        assert_eq!(Patch::deserialize(DEV, &bytes).unwrap(), patch);
    }

    #[test]
    fn test_deserialize_rejects_damage() {
        let bytes = patch(&[("key", 1, Some("value"))]).serialize().unwrap();

        for len in 0..bytes.len() {
            assert!(Patch::deserialize(DEV, &bytes[..len]).is_err(), "prefix {}", len);
        }

        let mut bad_tag = bytes.clone();
        bad_tag[0] = b'Y';
        assert!(matches!(
            Patch::deserialize(DEV, &bad_tag),
            Err(CollectiveError::Format(_))
        ));

        let mut bad_version = bytes.clone();
        bad_version[PATCH_TAG.len() + 1] = 2;
        assert!(Patch::deserialize(DEV, &bad_version).is_err());

        let mut trailing = bytes.clone();
        trailing.extend_from_slice(b"future section");
        assert_eq!(Patch::deserialize(DEV, &trailing).unwrap().len(), 1);
    }

    #[test]
    fn test_local_checksum() {
        let patch = patch(&[("a", 1, Some("1"))]);
        let mut local = patch.encode_local().unwrap();
        assert_eq!(Patch::decode_local(DEV, &local).unwrap(), patch);

        let last = local.len() - 1;
        local[last] ^= 0x01;
        assert!(matches!(
            Patch::decode_local(DEV, &local),
            Err(CollectiveError::Corrupted)
        ));
        assert!(matches!(
            Patch::decode_local(DEV, &[1, 2]),
            Err(CollectiveError::Corrupted)
        ));
    }

    #[test]
    fn test_compacted_view() {
        let patch = patch(&[
            ("a", 5, Some("old")),
            ("b", 3, Some("b")),
            ("a", 9, Some("new")),
            ("a", 7, Some("stale")),
            ("b", 3, None),
        ]);
        let view = patch.compacted();
        assert_eq!(view.len(), 2);
        assert_eq!(view["a"].value.as_deref(), Some(&b"new"[..]));
        assert!(view["b"].is_deletion());
        assert_eq!(patch.get("missing"), None);
    }

    #[test]
    fn test_compaction() {
        let mut patch = Patch::new(DEV);
        for i in 0..COMPACT_MIN_ENTRIES as i64 - 1 {
            patch.add_unsafe(format!("key{}", i % 4), Mutate::write(i, vec![i as u8]));
        }
        assert_eq!(patch.generation(), 0);
        let view_before = patch
            .compacted()
            .into_iter()
            .map(|(k, m)| (k.to_owned(), m.clone()))
            .collect::<BTreeMap<_, _>>();

        patch.add_unsafe("key0".to_owned(), Mutate::write(1000, vec![0xff]));
        assert_eq!(patch.generation(), 1);
        assert_eq!(patch.len(), 4);

        for (key, mutate) in patch.compacted() {
            if key != "key0" {
                assert_eq!(&view_before[key], mutate);
            }
        }
        assert_eq!(patch.get("key0").unwrap().timestamp_ns, 1000);
    }

    #[test]
    fn test_latest_index_survives_compaction() {
        let mut patch = Patch::new(DEV);
        let keys = 100;
        for round in 0..10i64 {
            for k in 0..keys {
                // Every key's newest write comes first in its round, so ties and stale writes
                // land after it
                patch.add_unsafe(format!("k{}", k), Mutate::write(round * 10 + 5, vec![1]));
                patch.add_unsafe(format!("k{}", k), Mutate::write(round * 10, vec![0]));
            }
        }

        assert!(patch.generation() > 0);
        assert!(patch.len() < COMPACT_MIN_ENTRIES);
        assert_eq!(patch.compacted().len(), keys);
        for k in 0..keys {
            let latest = patch.get(&format!("k{}", k)).unwrap();
            assert_eq!(latest.timestamp_ns, 95);
            assert_eq!(latest.value.as_deref(), Some(&[1][..]));
        }

        let reread = Patch::deserialize(DEV, &patch.serialize().unwrap()).unwrap();
        assert_eq!(reread, patch);
    }

    #[test]
    fn test_lww_merge_order_independent() {
        let x = Patch::from_entries(
            DeviceId([1; 16]),
            0,
            vec![
                ("k".to_owned(), Mutate::write(100, b"x".to_vec())),
                ("only_x".to_owned(), Mutate::write(1, b"1".to_vec())),
            ],
        );
        let y = Patch::from_entries(
            DeviceId([2; 16]),
            0,
            vec![
                ("k".to_owned(), Mutate::write(100, b"y".to_vec())),
                ("gone".to_owned(), Mutate::delete(50)),
            ],
        );

        let xy = lww_merge([&x, &y]);
        let yx = lww_merge([&y, &x]);
        assert_eq!(xy, yx);
        assert_eq!(xy["k"].value.as_deref(), Some(&b"x"[..]));
        assert_eq!(xy["gone"].value, None);
        assert_eq!(xy.len(), 3);
    }
}
