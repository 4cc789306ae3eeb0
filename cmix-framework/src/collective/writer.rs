//! The background task that commits local mutations to the patch and mirrors it remotely

use std::{future::pending, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use rand::rngs::OsRng;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::Instant,
};

use super::{
    apply::TXLOG_KEY, file, file::SyncSecret, mutate::Mutate, notifier::Notifier, patch::Patch,
    CollectiveError,
};
use crate::{
    kv::Kv,
    model::id::DeviceId,
    remote::{RemoteError, RemoteStore},
};

/// Factor applied to the retry delay after every failed upload
pub const BACKOFF_MULTIPLIER: f64 = 1.5;
/// Upper bound of the retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Delay between upload attempts, growing while uploads fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        let base = base.max(Duration::from_millis(1)).min(MAX_BACKOFF);
        Self {
            base,
            current: base,
        }
    }

    #[inline]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure, returning how long to wait before the next attempt
    pub fn failed(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.mul_f64(BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Mutations made by a single facade call, committed to the patch together
pub(crate) struct PendingMutation {
    pub entries: Vec<(String, Mutate)>,
    pub ack: oneshot::Sender<Result<(), CollectiveError>>,
}

type Upload = BoxFuture<'static, Result<(), CollectiveError>>;

pub(crate) struct Writer {
    pub device: DeviceId,
    pub secret: SyncSecret,
    /// Remote path the patch is uploaded to
    pub path: String,
    pub kv: Arc<dyn Kv>,
    pub remote: Arc<dyn RemoteStore>,
    pub patch: Arc<Mutex<Patch>>,
    pub notifier: Arc<Notifier>,
    pub coalesce_window: Duration,
    pub coalesce_step: Duration,
    pub backoff: Backoff,
}

impl Writer {
    /// Start the writer task. When `upload_now` is set the current patch is uploaded
    /// immediately, covering commits that a previous run never mirrored
    pub fn spawn(
        self,
        queue: mpsc::UnboundedReceiver<PendingMutation>,
        stop: oneshot::Receiver<()>,
        upload_now: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(queue, stop, upload_now))
    }

    async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<PendingMutation>,
        mut stop: oneshot::Receiver<()>,
        upload_now: bool,
    ) {
        let mut upload_at = upload_now.then(Instant::now);
        let mut upload: Option<Upload> = None;

        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    let unsynced = upload.take().is_some() || upload_at.is_some();
                    self.shutdown(&mut queue, unsynced).await;
                    break
                },
                result = poll_upload(&mut upload) => {
                    upload = None;
                    match result {
                        Ok(()) => {
                            log::trace!("Uploaded patch of {} to {}", self.device, self.path);
                            self.backoff.reset();
                            self.notifier.set(true);
                        },
                        Err(e) => upload_at = Some(self.upload_failed(e)),
                    }
                },
                _ = sleep_until(upload_at), if upload.is_none() => {
                    upload_at = None;
                    match self.start_upload().await {
                        Ok(started) => upload = Some(started),
                        Err(e) => upload_at = Some(self.upload_failed(e)),
                    }
                },
                pending = queue.recv() => match pending {
                    Some(first) => {
                        let batch = self.coalesce(first, &mut queue).await;
                        if self.commit(batch).await {
                            upload_at.get_or_insert_with(Instant::now);
                        }
                    },
                    None => break,
                },
            }
        }

        log::debug!("Writer for {} stopped", self.device);
    }

    fn upload_failed(&mut self, e: CollectiveError) -> Instant {
        let wait = self.backoff.failed();
        log::warn!(
            "Failed to upload patch of {}, retrying in {:?}: {}",
            self.device,
            wait,
            e
        );
        self.notifier.set(false);
        Instant::now() + wait
    }

    /// Wait a short while for more mutations so that bursts are committed together. Every
    /// mutation drained shortens the window by one step
    async fn coalesce(
        &self,
        first: PendingMutation,
        queue: &mut mpsc::UnboundedReceiver<PendingMutation>,
    ) -> Vec<PendingMutation> {
        let start = Instant::now();
        let mut batch = vec![first];

        loop {
            let drained = u32::try_from(batch.len() - 1).unwrap_or(u32::MAX);
            let deadline = start + self
                .coalesce_window
                .saturating_sub(self.coalesce_step.saturating_mul(drained));
            if Instant::now() >= deadline {
                break;
            }

            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Some(pending)) => batch.push(pending),
                _ => break,
            }
        }

        batch
    }

    /// Append a batch to the patch and persist it locally, then acknowledge every mutation in
    /// it. Returns whether the patch changed
    async fn commit(&self, batch: Vec<PendingMutation>) -> bool {
        let mut patch = self.patch.lock().await;
        let mut next = patch.clone();
        let mut acks = Vec::with_capacity(batch.len());
        for pending in batch {
            for (key, mutate) in pending.entries {
                next.add_unsafe(key, mutate);
            }
            acks.push(pending.ack);
        }

        let persisted = match next.encode_local() {
            Ok(bytes) => self.kv.set(TXLOG_KEY, &bytes).await.map_err(CollectiveError::from),
            Err(e) => Err(e),
        };

        match persisted {
            Ok(()) => {
                log::trace!(
                    "Committed {} mutations, patch of {} holds {}",
                    acks.len(),
                    self.device,
                    next.len()
                );
                *patch = next;
                drop(patch);
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
                true
            }
            Err(e) => {
                log::error!("Failed to persist patch of {}: {}", self.device, e);
                let reason = e.to_string();
                for ack in acks {
                    let _ = ack.send(Err(CollectiveError::Commit(reason.clone())));
                }
                false
            }
        }
    }

    async fn start_upload(&self) -> Result<Upload, CollectiveError> {
        let serialized = self.patch.lock().await.serialize()?;
        let sealed = file::seal_patch(&self.secret, self.device, &serialized, &mut OsRng)?;

        let remote = self.remote.clone();
        let path = self.path.clone();
        let timeout = self.backoff.current();

        Ok(Box::pin(async move {
            match tokio::time::timeout(timeout, remote.write(&path, &sealed)).await {
                Ok(result) => result.map_err(CollectiveError::from),
                Err(_) => Err(CollectiveError::Remote(RemoteError::Unavailable(format!(
                    "Upload timed out after {:?}",
                    timeout
                )))),
            }
        }))
    }

    /// Commit whatever is still queued and refuse further mutations. The final state is left
    /// for the next run to upload
    /// Commit everything still queued, then make one last upload attempt if the remote copy is
    /// behind
    async fn shutdown(&self, queue: &mut mpsc::UnboundedReceiver<PendingMutation>, mut unsynced: bool) {
        queue.close();
        let mut batch = Vec::new();
        while let Ok(pending) = queue.try_recv() {
            batch.push(pending);
        }

        if !batch.is_empty() {
            unsynced |= self.commit(batch).await;
        }
        if !unsynced {
            return;
        }

        let uploaded = match self.start_upload().await {
            Ok(upload) => upload.await,
            Err(e) => Err(e),
        };
        match uploaded {
            Ok(()) => {
                log::debug!("Uploaded final patch of {} to {}", self.device, self.path);
                self.notifier.set(true);
            }
            Err(e) => log::warn!(
                "Final upload of patch of {} failed, it is retried on the next start: {}",
                self.device,
                e
            ),
        }
    }
}

async fn poll_upload(upload: &mut Option<Upload>) -> Result<(), CollectiveError> {
    match upload {
        Some(upload) => upload.await,
        None => pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
