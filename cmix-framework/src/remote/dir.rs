use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use super::{components, RemoteError, RemoteStore};

/// A [RemoteStore] rooted at a directory of the local filesystem, for stores mounted or synced
/// by other means
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        Ok(components(path)?
            .into_iter()
            .fold(self.root.clone(), |acc, c| acc.join(c)))
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RemoteError::NotFound(path.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        let Some(parent) = target.parent().filter(|_| target != self.root) else {
            return Err(RemoteError::InvalidPath(path.to_owned()));
        };
        tokio::fs::create_dir_all(parent).await?;

        // Write beside the target and rename so that readers never observe a partial file
        let mut temp = target.clone().into_os_string();
        temp.push(".tmp");
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, &target).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut entries = match tokio::fs::read_dir(self.resolve(prefix)?).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_owned());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
