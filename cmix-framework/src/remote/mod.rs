//! Untrusted path-addressed blob storage that devices mirror their encrypted patches to

use async_trait::async_trait;

mod dir;
mod memory;

pub use dir::DirectoryStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote file {0} not found")]
    NotFound(String),
    #[error("Invalid remote path {0}")]
    InvalidPath(String),
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("IO: {0}")]
    IO(#[from] std::io::Error),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the whole file at `path`
    async fn read(&self, path: &str) -> Result<Vec<u8>, RemoteError>;

    /// Replace the file at `path`, creating parent directories as needed
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Names of the direct children of the directory at `prefix`. Stores that cannot enumerate
    /// return an empty list
    async fn list(&self, _prefix: &str) -> Result<Vec<String>, RemoteError> {
        Ok(Vec::new())
    }
}

/// Split a path into its components, rejecting anything that could escape the store root
pub(crate) fn components(path: &str) -> Result<Vec<&str>, RemoteError> {
    let parts = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>();

    if parts.iter().any(|c| *c == ".." || c.contains('\\')) {
        return Err(RemoteError::InvalidPath(path.to_owned()));
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components() {
        assert_eq!(components("/a//b/./c").unwrap(), vec!["a", "b", "c"]);
        assert!(components("").unwrap().is_empty());
        assert!(components("a/../b").is_err());
        assert!(components("a\\b").is_err());
    }
}
