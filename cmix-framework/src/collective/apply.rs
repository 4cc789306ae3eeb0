//! Last-writer-wins application of mutations to local storage.
//!
//! Every synced key `k` is stored beside a [Version] record at [version_key]`(k)`, written in the
//! same transaction. Keys of the form `{map}_⦙_{element}` are map elements: applying them also
//! maintains the list of live elements at [map_file_key]`(map)`.

use std::collections::{BTreeMap, BTreeSet};

use cmix_wireformat::{FromBytes, ToBytes};

use super::mutate::{Mutate, Version};
use crate::{
    kv::{Kv, KvError, Values},
    model::id::DeviceId,
};

/// Prefix of every key used internally by the collective store
pub const RESERVED_PREFIX: &str = "_collective⦙";
pub(crate) const TXLOG_KEY: &str = "_collective⦙txlog";
pub(crate) const OFFSETS_KEY: &str = "_collective⦙offsets";
pub(crate) const DEVICE_KEY: &str = "_collective⦙device";

const MAP_ELEMENT_SEPARATOR: &str = "_⦙_";
const MAP_FILE_SUFFIX: &str = "_⦙mapKeys";

pub fn version_key(key: &str) -> String {
    format!("{}version⦙{}", RESERVED_PREFIX, key)
}

pub fn element_key(map: &str, element: &str) -> String {
    format!("{}{}{}", map, MAP_ELEMENT_SEPARATOR, element)
}

pub fn map_file_key(map: &str) -> String {
    format!("{}{}", map, MAP_FILE_SUFFIX)
}

/// Split an element key into its map and element names
pub fn split_element_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(MAP_ELEMENT_SEPARATOR)
}

/// Whether a user may address `key` directly
pub fn is_user_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with(RESERVED_PREFIX) && !key.ends_with(MAP_FILE_SUFFIX)
}

/// Whether `map` can be used as a map name
pub fn is_map_name(map: &str) -> bool {
    is_user_key(map) && !map.contains(MAP_ELEMENT_SEPARATOR)
}

/// A mutation that won against the stored version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub key: String,
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

fn aborted(e: impl std::fmt::Display) -> KvError {
    KvError::Aborted(e.to_string())
}

fn current_version(values: &Values, key: &str) -> Result<Option<Version>, KvError> {
    values
        .get(&version_key(key))
        .and_then(|v| v.as_deref())
        .map(|bytes| Version::decode_from_slice(bytes).map_err(aborted))
        .transpose()
}

/// Decode the element list of a map file
pub(crate) fn decode_map_file(bytes: Option<&[u8]>) -> Result<BTreeSet<String>, KvError> {
    match bytes {
        Some(bytes) => Ok(Vec::<String>::decode_from_slice(bytes)
            .map_err(aborted)?
            .into_iter()
            .collect()),
        None => Ok(BTreeSet::new()),
    }
}

/// Encode the element list of a map file, `None` once the map is empty
fn encode_map_file(elements: BTreeSet<String>) -> Result<Option<Vec<u8>>, KvError> {
    match elements.is_empty() {
        true => Ok(None),
        false => Ok(Some(
            elements
                .into_iter()
                .collect::<Vec<_>>()
                .encode_to_vec()
                .map_err(aborted)?,
        )),
    }
}

/// Keys read and written when applying a mutation of `key`
fn touched_keys(key: &str) -> Vec<String> {
    let mut keys = vec![key.to_owned(), version_key(key)];
    if let Some((map, _)) = split_element_key(key) {
        keys.push(map_file_key(map));
    }
    keys
}

/// Add the updates applying `mutate` from `origin` to `updates`, if it supersedes the stored
/// version. Returns whether it did
fn stage(
    values: &Values,
    updates: &mut Values,
    key: &str,
    mutate: &Mutate,
    origin: DeviceId,
) -> Result<bool, KvError> {
    let version = Version::of(mutate, origin);
    if !version.supersedes(current_version(values, key)?.as_ref()) {
        return Ok(false);
    }

    updates.insert(key.to_owned(), mutate.value.clone());
    updates.insert(
        version_key(key),
        Some(version.encode_to_vec().map_err(aborted)?),
    );

    if let Some((map, element)) = split_element_key(key) {
        let file = map_file_key(map);
        // Earlier elements of the same transaction may already have edited the list
        let current = updates
            .get(&file)
            .or_else(|| values.get(&file))
            .and_then(|v| v.as_deref());
        let mut elements = decode_map_file(current)?;

        match mutate.is_deletion() {
            true => elements.remove(element),
            false => elements.insert(element.to_owned()),
        };

        updates.insert(file, encode_map_file(elements)?);
    }

    Ok(true)
}

/// Mutations applied in one local transaction together with the values they replaced
pub(crate) struct Undo {
    origin: DeviceId,
    pub entries: Vec<(String, Mutate)>,
    old: Values,
}

fn transaction_keys(entries: &[(String, Mutate)]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|(key, _)| touched_keys(key))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Apply every mutation made on `origin` that supersedes the stored version of its key, in
/// one transaction
pub(crate) async fn apply_entries(
    kv: &dyn Kv,
    origin: DeviceId,
    entries: Vec<(String, Mutate)>,
) -> Result<Undo, KvError> {
    let keys = transaction_keys(&entries);
    let staged = entries.clone();
    let old = kv
        .mutual_transaction(
            &keys,
            Box::new(move |values: &Values| {
                let mut updates = Values::new();
                for (key, mutate) in &staged {
                    stage(values, &mut updates, key, mutate, origin)?;
                }
                Ok(updates)
            }),
        )
        .await?;

    Ok(Undo {
        origin,
        entries,
        old,
    })
}

impl Undo {
    /// The change made to `key`, if its mutation won against the stored version
    fn applied(&self, key: &str) -> Result<Option<Applied>, KvError> {
        let Some((_, mutate)) = self.entries.iter().find(|(k, _)| k == key) else {
            return Ok(None);
        };

        // The transaction body is a pure function of the old values, so the decision it made
        // can be recomputed from them
        let version = Version::of(mutate, self.origin);
        match version.supersedes(current_version(&self.old, key)?.as_ref()) {
            true => Ok(Some(Applied {
                key: key.to_owned(),
                old: self.old.get(key).cloned().flatten(),
                new: mutate.value.clone(),
            })),
            false => Ok(None),
        }
    }

    /// Restore the values replaced by these mutations. Keys rewritten by a later mutation since
    /// keep their newer value
    pub(crate) async fn revert(self, kv: &dyn Kv) -> Result<(), KvError> {
        let Self {
            origin,
            entries,
            old,
        } = self;
        let keys = transaction_keys(&entries);

        kv.mutual_transaction(
            &keys,
            Box::new(move |values: &Values| {
                let mut updates = Values::new();
                for (key, mutate) in &entries {
                    if current_version(values, key)? != Some(Version::of(mutate, origin)) {
                        continue;
                    }

                    let prior = old.get(key).cloned().flatten();
                    let prior_version = old.get(&version_key(key)).cloned().flatten();
                    if let Some((map, element)) = split_element_key(key) {
                        let file = map_file_key(map);
                        let current = updates
                            .get(&file)
                            .or_else(|| values.get(&file))
                            .and_then(|v| v.as_deref());
                        let mut elements = decode_map_file(current)?;
                        match prior.is_some() {
                            true => elements.insert(element.to_owned()),
                            false => elements.remove(element),
                        };
                        updates.insert(file, encode_map_file(elements)?);
                    }

                    updates.insert(version_key(key), prior_version);
                    updates.insert(key.clone(), prior);
                }
                Ok(updates)
            }),
        )
        .await?;

        Ok(())
    }
}

/// Apply a single mutation made on `origin` if it supersedes the stored version of `key`
pub(crate) async fn apply_lww(
    kv: &dyn Kv,
    origin: DeviceId,
    key: &str,
    mutate: &Mutate,
) -> Result<Option<Applied>, KvError> {
    let undo = apply_entries(kv, origin, vec![(key.to_owned(), mutate.clone())]).await?;
    undo.applied(key)
}

/// Prior values of the elements touched by a map write
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapWrite {
    /// Value of every added element before the write, `None` if it was absent
    pub old: BTreeMap<String, Option<Vec<u8>>>,
    /// Value of every deleted element before the write
    pub deleted: BTreeMap<String, Option<Vec<u8>>>,
}

/// Atomically apply element writes and deletions to a map, all stamped with `timestamp_ns`
pub(crate) async fn apply_map(
    kv: &dyn Kv,
    origin: DeviceId,
    map: &str,
    adds: &BTreeMap<String, Vec<u8>>,
    deletes: &BTreeSet<String>,
    timestamp_ns: i64,
) -> Result<(MapWrite, Undo), KvError> {
    let entries = adds
        .iter()
        .map(|(el, value)| {
            (
                element_key(map, el),
                Mutate::write(timestamp_ns, value.clone()),
            )
        })
        .chain(
            deletes
                .iter()
                .map(|el| (element_key(map, el), Mutate::delete(timestamp_ns))),
        )
        .collect::<Vec<_>>();

    let undo = apply_entries(kv, origin, entries).await?;
    let prior = |el: &String| undo.old.get(&element_key(map, el)).cloned().flatten();
    let write = MapWrite {
        old: adds.keys().map(|el| (el.clone(), prior(el))).collect(),
        deleted: deletes.iter().map(|el| (el.clone(), prior(el))).collect(),
    };
    Ok((write, undo))
}

/// Live elements of `map` in local storage
pub(crate) async fn map_elements(kv: &dyn Kv, map: &str) -> Result<BTreeSet<String>, KvError> {
    let file = kv.get_optional(&map_file_key(map)).await?;
    decode_map_file(file.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const X: DeviceId = DeviceId([1; 16]);
    const Y: DeviceId = DeviceId([2; 16]);

    #[test]
    fn test_key_helpers() {
        assert_eq!(element_key("M", "K"), "M_⦙_K");
        assert_eq!(map_file_key("M"), "M_⦙mapKeys");
        assert_eq!(split_element_key("M_⦙_K_⦙_x"), Some(("M", "K_⦙_x")));
        assert_eq!(split_element_key("plain"), None);

        assert!(is_user_key("plain"));
        assert!(!is_user_key(""));
        assert!(!is_user_key("_collective⦙txlog"));
        assert!(!is_user_key("M_⦙mapKeys"));
        assert!(!is_map_name("a_⦙_b"));
    }

    #[tokio::test]
    async fn test_apply_lww() {
        let kv = MemoryKv::new();

        let first = apply_lww(&kv, X, "k", &Mutate::write(100, b"x1".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.old, None);
        assert_eq!(first.new.as_deref(), Some(&b"x1"[..]));

        let newer = apply_lww(&kv, Y, "k", &Mutate::write(200, b"y".to_vec()))
            .await
            .unwrap();
        assert!(newer.is_some());

        let older = apply_lww(&kv, X, "k", &Mutate::write(150, b"x2".to_vec()))
            .await
            .unwrap();
        assert!(older.is_none());
        assert_eq!(kv.get("k").await.unwrap(), b"y");

        // Deletions are versioned too, so a stale write cannot resurrect the key
        apply_lww(&kv, X, "k", &Mutate::delete(300)).await.unwrap().unwrap();
        assert!(apply_lww(&kv, Y, "k", &Mutate::write(250, b"late".to_vec()))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(kv.get("k").await, Err(KvError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tie_break_converges() {
        let a = MemoryKv::new();
        let b = MemoryKv::new();
        let from_x = Mutate::write(100, b"x".to_vec());
        let from_y = Mutate::write(100, b"y".to_vec());

        apply_lww(&a, X, "k", &from_x).await.unwrap();
        apply_lww(&a, Y, "k", &from_y).await.unwrap();
        apply_lww(&b, Y, "k", &from_y).await.unwrap();
        apply_lww(&b, X, "k", &from_x).await.unwrap();

        assert_eq!(a.get("k").await.unwrap(), b"x");
        assert_eq!(b.get("k").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_map_elements_follow_applied_mutations() {
        let kv = MemoryKv::new();
        let key = element_key("M", "e");

        apply_lww(&kv, X, &key, &Mutate::write(1, b"v".to_vec()))
            .await
            .unwrap();
        apply_lww(&kv, X, &element_key("M", "f"), &Mutate::write(1, b"w".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            map_elements(&kv, "M").await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["e", "f"]
        );

        apply_lww(&kv, X, &key, &Mutate::delete(2)).await.unwrap();
        apply_lww(&kv, X, &element_key("M", "f"), &Mutate::delete(2))
            .await
            .unwrap();
        assert!(map_elements(&kv, "M").await.unwrap().is_empty());
        assert!(kv.get_optional(&map_file_key("M")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_map() {
        let kv = MemoryKv::new();
        let adds = [("K", "a"), ("L", "b")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.as_bytes().to_vec()))
            .collect::<BTreeMap<_, _>>();
        apply_map(&kv, X, "M", &adds, &BTreeSet::new(), 10)
            .await
            .unwrap();

        let adds = [("K", "a'"), ("N", "n")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.as_bytes().to_vec()))
            .collect::<BTreeMap<_, _>>();
        let deletes = BTreeSet::from(["L".to_owned()]);
        let (result, _) = apply_map(&kv, X, "M", &adds, &deletes, 20).await.unwrap();

        assert_eq!(result.old["K"].as_deref(), Some(&b"a"[..]));
        assert_eq!(result.old["N"], None);
        assert_eq!(result.deleted["L"].as_deref(), Some(&b"b"[..]));
        assert_eq!(
            map_elements(&kv, "M").await.unwrap(),
            BTreeSet::from(["K".to_owned(), "N".to_owned()])
        );
        assert_eq!(kv.get(&element_key("M", "K")).await.unwrap(), b"a'");
    }

    #[tokio::test]
    async fn test_revert_restores_replaced_values() {
        let kv = MemoryKv::new();
        apply_lww(&kv, X, &element_key("M", "a"), &Mutate::write(10, b"a".to_vec()))
            .await
            .unwrap();
        apply_lww(&kv, X, "k", &Mutate::write(10, b"k".to_vec()))
            .await
            .unwrap();
        let watched = [element_key("M", "a"), element_key("M", "b")]
            .iter()
            .flat_map(|k| touched_keys(k))
            .collect::<BTreeSet<_>>();
        let mut before = Vec::new();
        for key in &watched {
            before.push(kv.get_optional(key).await.unwrap());
        }

        let adds = BTreeMap::from([("b".to_owned(), b"b".to_vec())]);
        let deletes = BTreeSet::from(["a".to_owned()]);
        let (_, undo) = apply_map(&kv, X, "M", &adds, &deletes, 20).await.unwrap();
        assert_eq!(
            map_elements(&kv, "M").await.unwrap(),
            BTreeSet::from(["b".to_owned()])
        );
        undo.revert(&kv).await.unwrap();
        for (key, value) in watched.iter().zip(before) {
            assert_eq!(kv.get_optional(key).await.unwrap(), value, "{}", key);
        }

        // A newer write landing in between survives the revert
        let undo = apply_entries(&kv, X, vec![("k".to_owned(), Mutate::write(20, b"x".to_vec()))])
            .await
            .unwrap();
        apply_lww(&kv, Y, "k", &Mutate::write(30, b"y".to_vec()))
            .await
            .unwrap();
        undo.revert(&kv).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), b"y");
    }
}
