use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{components, RemoteError, RemoteStore};

/// A [RemoteStore] held in memory, keyed by normalized path
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: DashMap<String, Vec<u8>>,
    /// Number of upcoming writes to reject with [RemoteError::Unavailable]
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to [RemoteStore::write] fail
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of write attempts made so far, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn normalize(path: &str) -> Result<String, RemoteError> {
        Ok(components(path)?.join("/"))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let path = Self::normalize(path)?;
        self.files
            .get(&path)
            .map(|data| data.clone())
            .ok_or(RemoteError::NotFound(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RemoteError::Unavailable("injected write failure".to_owned()));
        }

        let path = Self::normalize(path)?;
        if path.is_empty() {
            return Err(RemoteError::InvalidPath(path));
        }
        self.files.insert(path, data.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let prefix = Self::normalize(prefix)?;
        let children = self
            .files
            .iter()
            .filter_map(|entry| {
                let rest = match prefix.is_empty() {
                    true => entry.key().as_str(),
                    false => entry.key().strip_prefix(&prefix)?.strip_prefix('/')?,
                };
                rest.split('/').next().map(str::to_owned)
            })
            .collect::<BTreeSet<_>>();

        Ok(children.into_iter().collect())
    }
}
