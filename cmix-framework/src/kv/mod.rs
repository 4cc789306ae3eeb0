//! Local byte-addressed key-value storage with atomic multi-key transactions

use std::collections::BTreeMap;

use async_trait::async_trait;

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

/// Values of a set of keys, `None` for keys that are absent
pub type Values = BTreeMap<String, Option<Vec<u8>>>;

/// Body of a [Kv::mutual_transaction]: given the current values of the listed keys, produce the
/// updates to apply. `Some` sets a key, `None` deletes it, and keys left out are unchanged.
/// Returning an error aborts the transaction without changes
pub type TransactionOp = Box<dyn FnOnce(&Values) -> Result<Values, KvError> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key {0} not found")]
    NotFound(String),
    #[error("Transaction aborted by a concurrent writer")]
    TransactionConflict,
    #[error("Transaction wrote key {0} that it did not list")]
    KeyNotInTransaction(String),
    #[error("Transaction aborted: {0}")]
    Aborted(String),
    #[error("Database: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("Failed to apply database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait Kv: Send + Sync {
    /// Read a key, failing with [KvError::NotFound] if it is absent
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Delete a key. Deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomically read `keys`, run `op` over their values, and apply its updates.
    /// Returns the values as they were before the transaction
    async fn mutual_transaction(
        &self,
        keys: &[String],
        op: TransactionOp,
    ) -> Result<Values, KvError>;

    /// Read a key, mapping absence to `None`
    async fn get_optional(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match self.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(KvError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Check that a transaction only touched the keys it listed
pub(crate) fn check_updates(keys: &[String], updates: &Values) -> Result<(), KvError> {
    match updates.keys().find(|k| !keys.contains(k)) {
        Some(key) => Err(KvError::KeyNotInTransaction(key.clone())),
        None => Ok(()),
    }
}
