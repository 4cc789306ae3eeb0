//! A key-value store synchronized between the devices of one user.
//!
//! Every device appends its local changes to a [Patch], persists it locally, and mirrors it
//! encrypted to a shared [RemoteStore]. A collector periodically reads the patches of the other
//! devices and merges them under last-writer-wins, so all devices converge on the same values.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use cmix_wireformat::{FromBytes, FromBytesError, ToBytes, ToBytesError};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock},
    task::JoinHandle,
};

use crate::{
    kv::{Kv, KvError},
    model::{crypto::CryptoError, id::DeviceId},
    remote::{RemoteError, RemoteStore},
};

mod apply;
mod collector;
mod file;
mod mutate;
mod notifier;
mod patch;
mod writer;

pub use apply::{element_key, map_file_key, version_key, MapWrite, RESERVED_PREFIX};
pub use collector::{CollectReport, DeviceOffset, KeyCallback, KeyChange, MapCallback};
pub use file::{open_patch, remote_path, seal_patch, SyncSecret, FILE_TAG, FILE_VERSION};
pub use mutate::{Mutate, MutateFlags, Version};
pub use notifier::ConnectivityCallback;
pub use patch::{lww_merge, MergedValue, Patch, PATCH_DELIMITER, PATCH_TAG, PATCH_VERSION};
pub use writer::{Backoff, BACKOFF_MULTIPLIER, MAX_BACKOFF};

use apply::{
    apply_entries, apply_map, is_map_name, is_user_key, map_elements, split_element_key, Undo,
};
use collector::{Callbacks, Collector};
use notifier::Notifier;
use writer::{PendingMutation, Writer};

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("Key '{0}' is reserved or malformed")]
    InvalidKey(String),
    #[error("Malformed data: {0}")]
    Format(String),
    #[error("Local patch failed its integrity check")]
    Corrupted,
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Local storage: {0}")]
    Kv(#[from] KvError),
    #[error("Remote storage: {0}")]
    Remote(#[from] RemoteError),
    #[error("Failed to commit mutation: {0}")]
    Commit(String),
    #[error("Collective store has been stopped")]
    Stopped,
    #[error("Failed to encode: {0}")]
    Encode(#[from] ToBytesError),
    #[error("Failed to decode: {0}")]
    Decode(#[from] FromBytesError),
}

/// Configuration of the synchronization of one collective store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory of the remote store holding one subdirectory per device
    pub base_path: String,
    /// Interval between collections of peer patches. Zero disables periodic collection
    pub sync_epoch: Duration,
    /// Delay before the first retry of a failed upload
    pub upload_period: Duration,
    /// Longest time the writer waits to gather a burst of mutations into one commit
    pub coalesce_window: Duration,
    /// Amount the window shrinks by for every gathered mutation
    pub coalesce_step: Duration,
    /// Peers collected from even when the remote store cannot list devices
    pub peers: Vec<DeviceId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let epoch = Duration::from_secs(5);
        Self {
            base_path: "collective".to_owned(),
            sync_epoch: epoch,
            upload_period: epoch,
            coalesce_window: Duration::from_millis(100),
            coalesce_step: Duration::from_micros(100),
            peers: Vec::new(),
        }
    }
}

impl DeviceId {
    /// Read this device's ID from local storage, generating and storing one on first use
    pub async fn load_or_generate(kv: &dyn Kv) -> Result<Self, CollectiveError> {
        if let Some(bytes) = kv.get_optional(apply::DEVICE_KEY).await? {
            return Ok(Self::decode_from_slice(&bytes)?);
        }

        let device = Self::generate(&mut OsRng);
        kv.set(apply::DEVICE_KEY, &device.encode_to_vec()?).await?;
        log::info!("Generated device ID {}", device);
        Ok(device)
    }
}

/// Exclusive view of the local patch. Local writes and collections wait until it is dropped
pub struct PatchGuard {
    patch: OwnedMutexGuard<Patch>,
    _sync: OwnedRwLockWriteGuard<()>,
}

impl PatchGuard {
    /// Release the guard, equivalent to dropping it
    pub fn release(self) {}
}

impl Deref for PatchGuard {
    type Target = Patch;

    fn deref(&self) -> &Self::Target {
        &self.patch
    }
}

/// A key-value store whose contents are synchronized with other devices through a
/// [RemoteStore]
pub struct CollectiveKv {
    device: DeviceId,
    kv: Arc<dyn Kv>,
    /// Held shared by local writers and exclusively by the collector
    sync_lock: Arc<RwLock<()>>,
    patch: Arc<Mutex<Patch>>,
    queue: mpsc::UnboundedSender<PendingMutation>,
    notifier: Arc<Notifier>,
    callbacks: Arc<Callbacks>,
    collector: Arc<Collector>,
    tasks: parking_lot::Mutex<Vec<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

fn timestamp_ns(at: DateTime<Utc>) -> Result<i64, CollectiveError> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| CollectiveError::Format(format!("Timestamp {} is out of range", at)))
}

impl CollectiveKv {
    /// Load the local patch and start the writer and collector tasks
    pub async fn new(
        device: DeviceId,
        secret: SyncSecret,
        kv: Arc<dyn Kv>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self, CollectiveError> {
        let key_id = secret.key_id()?;
        let patch = match kv.get_optional(apply::TXLOG_KEY).await? {
            Some(bytes) => Patch::decode_local(device, &bytes)?,
            None => Patch::new(device),
        };
        log::debug!(
            "Opened collective store as {} with {} logged mutations",
            device,
            patch.len()
        );

        let upload_now = !patch.is_empty();
        let patch = Arc::new(Mutex::new(patch));
        let sync_lock = Arc::new(RwLock::new(()));
        let notifier = Arc::new(Notifier::new());
        let callbacks = Arc::new(Callbacks::default());
        let (queue, queue_rx) = mpsc::unbounded_channel();

        let writer = Writer {
            device,
            secret: secret.clone(),
            path: file::remote_path(&config.base_path, device, &key_id),
            kv: kv.clone(),
            remote: remote.clone(),
            patch: patch.clone(),
            notifier: notifier.clone(),
            coalesce_window: config.coalesce_window,
            coalesce_step: config.coalesce_step,
            backoff: Backoff::new(config.upload_period),
        };

        let collector = Arc::new(Collector {
            device,
            secret,
            key_id,
            base_path: config.base_path.clone(),
            peers: config.peers.clone(),
            kv: kv.clone(),
            remote,
            sync_lock: sync_lock.clone(),
            callbacks: callbacks.clone(),
            gate: Mutex::new(()),
        });

        let mut tasks = Vec::with_capacity(2);
        let (stop, stop_rx) = oneshot::channel();
        tasks.push((stop, writer.spawn(queue_rx, stop_rx, upload_now)));
        if !config.sync_epoch.is_zero() {
            let (stop, stop_rx) = oneshot::channel();
            tasks.push((stop, collector.clone().spawn(config.sync_epoch, stop_rx)));
        }

        Ok(Self {
            device,
            kv,
            sync_lock,
            patch,
            queue,
            notifier,
            callbacks,
            collector,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    #[inline]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollectiveError> {
        if !is_user_key(key) {
            return Err(CollectiveError::InvalidKey(key.to_owned()));
        }
        Ok(self.kv.get_optional(key).await?)
    }

    /// Set a key, returning once the change is stored locally and queued for upload
    pub async fn write(&self, key: &str, value: &[u8]) -> Result<(), CollectiveError> {
        self.write_at(key, value, Utc::now()).await
    }

    /// [CollectiveKv::write] with an explicit timestamp
    pub async fn write_at(
        &self,
        key: &str,
        value: &[u8],
        at: DateTime<Utc>,
    ) -> Result<(), CollectiveError> {
        self.mutate(key, Mutate::write(timestamp_ns(at)?, value.to_vec()))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CollectiveError> {
        self.delete_at(key, Utc::now()).await
    }

    pub async fn delete_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), CollectiveError> {
        self.mutate(key, Mutate::delete(timestamp_ns(at)?)).await
    }

    async fn mutate(&self, key: &str, mutate: Mutate) -> Result<(), CollectiveError> {
        if !is_user_key(key) || split_element_key(key).is_some() {
            return Err(CollectiveError::InvalidKey(key.to_owned()));
        }
        if self.queue.is_closed() {
            return Err(CollectiveError::Stopped);
        }

        let _sync = self.sync_lock.read().await;
        let undo = apply_entries(&*self.kv, self.device, vec![(key.to_owned(), mutate)]).await?;
        self.enqueue_or_revert(undo).await
    }

    /// Add and delete elements of a map in one local transaction. Either every change is
    /// applied or none is
    pub async fn write_map(
        &self,
        map: &str,
        adds: BTreeMap<String, Vec<u8>>,
        deletes: BTreeSet<String>,
    ) -> Result<MapWrite, CollectiveError> {
        let timestamp_ns = timestamp_ns(Utc::now())?;
        if !is_map_name(map) {
            return Err(CollectiveError::InvalidKey(map.to_owned()));
        }
        if let Some(el) = adds
            .keys()
            .chain(deletes.iter())
            .find(|el| el.is_empty() || (deletes.contains(*el) && adds.contains_key(*el)))
        {
            return Err(CollectiveError::InvalidKey(element_key(map, el)));
        }
        if adds.is_empty() && deletes.is_empty() {
            return Ok(MapWrite::default());
        }
        if self.queue.is_closed() {
            return Err(CollectiveError::Stopped);
        }

        let _sync = self.sync_lock.read().await;
        let (result, undo) =
            apply_map(&*self.kv, self.device, map, &adds, &deletes, timestamp_ns).await?;
        self.enqueue_or_revert(undo).await?;
        Ok(result)
    }

    /// Every live element of a map
    pub async fn get_map(&self, map: &str) -> Result<BTreeMap<String, Vec<u8>>, CollectiveError> {
        if !is_map_name(map) {
            return Err(CollectiveError::InvalidKey(map.to_owned()));
        }

        let mut elements = BTreeMap::new();
        for el in map_elements(&*self.kv, map).await? {
            if let Some(value) = self.kv.get_optional(&element_key(map, &el)).await? {
                elements.insert(el, value);
            }
        }
        Ok(elements)
    }

    /// Names of the live elements of a map
    pub async fn map_keys(&self, map: &str) -> Result<BTreeSet<String>, CollectiveError> {
        if !is_map_name(map) {
            return Err(CollectiveError::InvalidKey(map.to_owned()));
        }
        Ok(map_elements(&*self.kv, map).await?)
    }

    async fn enqueue(&self, entries: Vec<(String, Mutate)>) -> Result<(), CollectiveError> {
        let (ack, acked) = oneshot::channel();
        self.queue
            .send(PendingMutation { entries, ack })
            .map_err(|_| CollectiveError::Stopped)?;
        acked.await.map_err(|_| CollectiveError::Stopped)?
    }

    /// Log locally applied mutations, undoing them if the log could not be persisted. Nothing
    /// missing from the transaction log may remain in local storage
    async fn enqueue_or_revert(&self, undo: Undo) -> Result<(), CollectiveError> {
        let Err(e) = self.enqueue(undo.entries.clone()).await else {
            return Ok(());
        };

        if let Err(revert) = undo.revert(&*self.kv).await {
            log::error!("Failed to undo unlogged local mutation: {}", revert);
        }
        Err(e)
    }

    /// Lock the local patch for inspection. Local writes and collections block until the guard
    /// is released
    pub async fn read(&self) -> PatchGuard {
        let sync = self.sync_lock.clone().write_owned().await;
        let patch = self.patch.clone().lock_owned().await;
        PatchGuard {
            patch,
            _sync: sync,
        }
    }

    /// Whether the last upload of the local patch succeeded
    pub fn remote_up_to_date(&self) -> bool {
        self.notifier.is_connected()
    }

    /// Register a callback for changes of [CollectiveKv::remote_up_to_date], returning an ID for
    /// [CollectiveKv::remove_connectivity_callback]
    pub fn on_connectivity(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> usize {
        self.notifier.subscribe(Arc::new(callback))
    }

    pub fn remove_connectivity_callback(&self, id: usize) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Call `callback` whenever a collection changes the value of `key`, replacing any
    /// previous callback for it
    pub fn listen_on_remote_key(
        &self,
        key: &str,
        callback: impl Fn(&str, &KeyChange) + Send + Sync + 'static,
    ) -> Result<(), CollectiveError> {
        if !is_user_key(key) || split_element_key(key).is_some() {
            return Err(CollectiveError::InvalidKey(key.to_owned()));
        }
        self.callbacks.keys.insert(key.to_owned(), Arc::new(callback));
        Ok(())
    }

    /// Call `callback` whenever a collection changes elements of `map`, replacing any previous
    /// callback for it
    pub fn listen_on_remote_map(
        &self,
        map: &str,
        callback: impl Fn(&str, &BTreeMap<String, KeyChange>) + Send + Sync + 'static,
    ) -> Result<(), CollectiveError> {
        if !is_map_name(map) {
            return Err(CollectiveError::InvalidKey(map.to_owned()));
        }
        self.callbacks.maps.insert(map.to_owned(), Arc::new(callback));
        Ok(())
    }

    pub fn stop_listening(&self, key_or_map: &str) {
        self.callbacks.keys.remove(key_or_map);
        self.callbacks.maps.remove(key_or_map);
    }

    /// Merge peer patches now instead of waiting for the next epoch
    pub async fn collect_now(&self) -> Result<CollectReport, CollectiveError> {
        self.collector.collect().await
    }

    /// Applied offsets of every peer collected from so far
    pub async fn device_offsets(&self) -> Result<BTreeMap<DeviceId, DeviceOffset>, CollectiveError> {
        self.collector.offsets().await
    }

    /// Stop the background tasks. Queued mutations are committed locally first; later writes
    /// fail with [CollectiveError::Stopped]
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (stop, task) in tasks {
            let _ = stop.send(());
            if let Err(e) = task.await {
                log::error!("Collective task failed: {}", e);
            }
        }
    }
}
