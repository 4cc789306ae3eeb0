//! Periodic merge of the patches other devices have uploaded

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use cmix_wireformat::{FromBytes, ToBytes};
use dashmap::DashMap;
use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use super::{
    apply::{apply_lww, is_user_key, split_element_key, OFFSETS_KEY},
    file::{self, SyncSecret},
    patch::Patch,
    CollectiveError,
};
use crate::{
    kv::Kv,
    model::id::DeviceId,
    remote::{RemoteError, RemoteStore},
};

/// How far the local store has applied the patch of one peer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ToBytes, FromBytes)]
pub struct DeviceOffset {
    /// Generation of the peer's patch the count refers to
    pub generation: u32,
    /// Number of leading entries of that patch already applied
    pub applied: u32,
}

/// Value of a key before and after a collection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyChange {
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// Called with a key and its change after a collection modified it
pub type KeyCallback = Arc<dyn Fn(&str, &KeyChange) + Send + Sync>;
/// Called with a map name and the changes to its elements after a collection modified them
pub type MapCallback = Arc<dyn Fn(&str, &BTreeMap<String, KeyChange>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub keys: DashMap<String, KeyCallback>,
    pub maps: DashMap<String, MapCallback>,
}

impl Callbacks {
    fn fire(&self, changes: BTreeMap<String, KeyChange>) {
        let mut maps = BTreeMap::<String, BTreeMap<String, KeyChange>>::new();

        for (key, change) in changes {
            match split_element_key(&key) {
                Some((map, element)) => {
                    maps.entry(map.to_owned())
                        .or_default()
                        .insert(element.to_owned(), change);
                }
                None => {
                    let callback = self.keys.get(&key).map(|cb| cb.clone());
                    if let Some(cb) = callback {
                        cb(&key, &change);
                    }
                }
            }
        }

        for (map, elements) in maps {
            let callback = self.maps.get(&map).map(|cb| cb.clone());
            if let Some(cb) = callback {
                cb(&map, &elements);
            }
        }
    }
}

/// Outcome of one collection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Every peer that was checked
    pub peers: Vec<DeviceId>,
    /// Number of new mutations read from peers
    pub applied: usize,
    /// Number of keys whose value changed
    pub changed: usize,
    /// Peers whose patch could not be fetched, decrypted, or applied
    pub failed: Vec<DeviceId>,
}

pub(crate) struct Collector {
    pub device: DeviceId,
    pub secret: SyncSecret,
    pub key_id: String,
    pub base_path: String,
    pub peers: Vec<DeviceId>,
    pub kv: Arc<dyn Kv>,
    pub remote: Arc<dyn RemoteStore>,
    pub sync_lock: Arc<RwLock<()>>,
    pub callbacks: Arc<Callbacks>,
    /// Serializes collections
    pub gate: Mutex<()>,
}

impl Collector {
    /// Run [Collector::collect] every `epoch` until stopped
    pub fn spawn(self: Arc<Self>, epoch: Duration, mut stop: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(epoch);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut stop => break,
                    _ = interval.tick() => match self.collect().await {
                        Ok(report) => log::trace!(
                            "Collected {} mutations from {} peers, {} keys changed",
                            report.applied,
                            report.peers.len(),
                            report.changed
                        ),
                        Err(e) => log::warn!("Collection failed: {}", e),
                    },
                }
            }

            log::debug!("Collector for {} stopped", self.device);
        })
    }

    /// Configured peers and every device found in remote storage, excluding this one
    async fn devices(&self) -> BTreeSet<DeviceId> {
        let mut devices = self.peers.iter().copied().collect::<BTreeSet<_>>();

        match self.remote.list(&self.base_path).await {
            Ok(names) => devices.extend(names.iter().filter_map(|name| DeviceId::from_hex(name))),
            Err(e) => log::warn!("Failed to list devices under '{}': {}", self.base_path, e),
        }

        devices.remove(&self.device);
        devices
    }

    /// Fetch and decrypt the patch of `peer`, `None` if it has not uploaded one
    async fn fetch(&self, peer: DeviceId) -> Result<Option<Patch>, CollectiveError> {
        let path = file::remote_path(&self.base_path, peer, &self.key_id);
        let sealed = match self.remote.read(&path).await {
            Ok(sealed) => sealed,
            Err(RemoteError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let serialized = file::open_patch(&self.secret, peer, &sealed)?;
        Ok(Some(Patch::deserialize(peer, &serialized)?))
    }

    async fn load_offsets(&self) -> Result<BTreeMap<DeviceId, DeviceOffset>, CollectiveError> {
        match self.kv.get_optional(OFFSETS_KEY).await? {
            Some(bytes) => Ok(BTreeMap::decode_from_slice(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Applied offsets of every peer seen so far
    pub async fn offsets(&self) -> Result<BTreeMap<DeviceId, DeviceOffset>, CollectiveError> {
        self.load_offsets().await
    }

    /// Apply the entries of `patch` from `start` on, recording the keys that won
    async fn apply_patch(
        &self,
        patch: &Patch,
        start: usize,
        changes: &mut BTreeMap<String, KeyChange>,
    ) -> Result<usize, CollectiveError> {
        let mut applied = 0;
        for (key, mutate) in &patch.entries()[start..] {
            applied += 1;
            if !is_user_key(key) {
                log::warn!("Ignoring mutation of reserved key from {}", patch.device());
                continue;
            }

            let Some(won) = apply_lww(&*self.kv, patch.device(), key, mutate).await? else {
                continue;
            };

            match changes.entry(won.key) {
                Entry::Occupied(mut entry) => entry.get_mut().new = won.new,
                Entry::Vacant(entry) => {
                    entry.insert(KeyChange {
                        old: won.old,
                        new: won.new,
                    });
                }
            }
        }
        Ok(applied)
    }

    /// Merge every peer's new mutations into local storage and notify listeners of the keys
    /// that changed
    pub async fn collect(&self) -> Result<CollectReport, CollectiveError> {
        let _gate = self.gate.lock().await;
        let mut report = CollectReport::default();

        let mut fetched = Vec::new();
        for peer in self.devices().await {
            report.peers.push(peer);
            match self.fetch(peer).await {
                Ok(Some(patch)) => fetched.push(patch),
                Ok(None) => log::trace!("No patch uploaded by {} yet", peer),
                Err(e) => {
                    log::warn!("Failed to fetch patch of {}: {}", peer, e);
                    report.failed.push(peer);
                }
            }
        }

        let mut changes = BTreeMap::new();
        {
            let _sync = self.sync_lock.write().await;
            let mut offsets = self.load_offsets().await?;
            let before = offsets.clone();

            for patch in &fetched {
                let peer = patch.device();
                let offset = offsets.get(&peer).copied().unwrap_or_default();
                let start = match offset.generation == patch.generation() {
                    true => (offset.applied as usize).min(patch.len()),
                    false => {
                        log::debug!(
                            "Patch of {} moved to generation {}, rereading it",
                            peer,
                            patch.generation()
                        );
                        0
                    }
                };

                match self.apply_patch(patch, start, &mut changes).await {
                    Ok(applied) => {
                        report.applied += applied;
                        offsets.insert(
                            peer,
                            DeviceOffset {
                                generation: patch.generation(),
                                applied: u32::try_from(patch.len()).unwrap_or(u32::MAX),
                            },
                        );
                    }
                    Err(e) => {
                        log::warn!("Failed to apply patch of {}: {}", peer, e);
                        report.failed.push(peer);
                    }
                }
            }

            if offsets != before {
                self.kv.set(OFFSETS_KEY, &offsets.encode_to_vec()?).await?;
            }
        }

        changes.retain(|_, change| change.old != change.new);
        report.changed = changes.len();
        self.callbacks.fire(changes);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as SyncMutex;
    use rand::rngs::OsRng;

    use super::*;
    use crate::{
        collective::mutate::Mutate,
        kv::MemoryKv,
        remote::MemoryStore,
    };

    const LOCAL: DeviceId = DeviceId([5; 16]);
    const PEER: DeviceId = DeviceId([6; 16]);

    fn collector(remote: Arc<MemoryStore>, secret: &SyncSecret) -> (Collector, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let collector = Collector {
            device: LOCAL,
            secret: secret.clone(),
            key_id: secret.key_id().unwrap(),
            base_path: "sync".to_owned(),
            peers: vec![],
            kv: kv.clone(),
            remote,
            sync_lock: Arc::new(RwLock::new(())),
            callbacks: Arc::new(Callbacks::default()),
            gate: Mutex::new(()),
        };
        (collector, kv)
    }

    async fn upload(remote: &MemoryStore, secret: &SyncSecret, patch: &Patch) {
        let sealed = file::seal_patch(secret, patch.device(), &patch.serialize().unwrap(), &mut OsRng).unwrap();
        let path = file::remote_path("sync", patch.device(), &secret.key_id().unwrap());
        remote.write(&path, &sealed).await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_applies_new_entries_once() {
        let secret = SyncSecret::generate(&mut OsRng);
        let remote = Arc::new(MemoryStore::new());
        let (collector, kv) = collector(remote.clone(), &secret);

        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        collector.callbacks.keys.insert(
            "k".to_owned(),
            Arc::new(move |key: &str, change: &KeyChange| {
                sink.lock().push((key.to_owned(), change.clone()))
            }),
        );

        let mut patch = Patch::new(PEER);
        patch.add_unsafe("k".to_owned(), Mutate::write(1, b"one".to_vec()));
        patch.add_unsafe("k".to_owned(), Mutate::write(2, b"two".to_vec()));
        upload(&remote, &secret, &patch).await;

        let report = collector.collect().await.unwrap();
        assert_eq!(report.peers, vec![PEER]);
        assert_eq!(report.applied, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(kv.get("k").await.unwrap(), b"two");
        assert_eq!(
            *seen.lock(),
            vec![(
                "k".to_owned(),
                KeyChange {
                    old: None,
                    new: Some(b"two".to_vec())
                }
            )]
        );

        // Unchanged patch: nothing new
        let report = collector.collect().await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(seen.lock().len(), 1);

        patch.add_unsafe("k".to_owned(), Mutate::delete(3));
        upload(&remote, &secret, &patch).await;
        let report = collector.collect().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(kv.get_optional("k").await.unwrap().is_none());
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(
            collector.offsets().await.unwrap()[&PEER],
            DeviceOffset {
                generation: 0,
                applied: 3
            }
        );
    }

    #[tokio::test]
    async fn test_generation_change_rereads() {
        let secret = SyncSecret::generate(&mut OsRng);
        let remote = Arc::new(MemoryStore::new());
        let (collector, kv) = collector(remote.clone(), &secret);

        let mut patch = Patch::new(PEER);
        patch.add_unsafe("a".to_owned(), Mutate::write(1, b"1".to_vec()));
        patch.add_unsafe("a".to_owned(), Mutate::write(2, b"2".to_vec()));
        upload(&remote, &secret, &patch).await;
        collector.collect().await.unwrap();

        patch.compact();
        patch.add_unsafe("b".to_owned(), Mutate::write(3, b"3".to_vec()));
        upload(&remote, &secret, &patch).await;

        let report = collector.collect().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(kv.get("b").await.unwrap(), b"3");
        assert_eq!(
            collector.offsets().await.unwrap()[&PEER],
            DeviceOffset {
                generation: 1,
                applied: 2
            }
        );
    }

    #[tokio::test]
    async fn test_bad_peer_is_isolated() {
        let secret = SyncSecret::generate(&mut OsRng);
        let remote = Arc::new(MemoryStore::new());
        let (collector, kv) = collector(remote.clone(), &secret);

        // Encrypted under another secret
        let other = SyncSecret::generate(&mut OsRng);
        let bad = DeviceId([7; 16]);
        let mut patch = Patch::new(bad);
        patch.add_unsafe("x".to_owned(), Mutate::write(1, b"x".to_vec()));
        let sealed = file::seal_patch(&other, bad, &patch.serialize().unwrap(), &mut OsRng).unwrap();
        remote
            .write(&file::remote_path("sync", bad, &secret.key_id().unwrap()), &sealed)
            .await
            .unwrap();

        let mut good = Patch::new(PEER);
        good.add_unsafe("y".to_owned(), Mutate::write(1, b"y".to_vec()));
        upload(&remote, &secret, &good).await;

        // Our own uploads are never collected
        let mut own = Patch::new(LOCAL);
        own.add_unsafe("z".to_owned(), Mutate::write(1, b"z".to_vec()));
        upload(&remote, &secret, &own).await;

        let report = collector.collect().await.unwrap();
        assert_eq!(report.failed, vec![bad]);
        assert_eq!(report.peers.len(), 2);
        assert_eq!(kv.get("y").await.unwrap(), b"y");
        assert!(kv.get_optional("x").await.unwrap().is_none());
        assert!(kv.get_optional("z").await.unwrap().is_none());
    }
}
