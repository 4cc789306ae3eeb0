use std::path::Path;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};

use super::{check_updates, Kv, KvError, TransactionOp, Values};

/// Primary result codes sqlite reports when another connection holds a conflicting lock
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

const GET: &str = "select value from kv where key = ?";
const SET: &str =
    "insert into kv (key, value) values (?, ?) on conflict(key) do update set value = excluded.value";
const DELETE: &str = "delete from kv where key = ?";
const LOCK: &str = "delete from kv where 0";

/// A [Kv] stored in an sqlite database
#[derive(Debug, Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

/// Translate lock contention into [KvError::TransactionConflict]
fn map_conflict(e: sqlx::Error) -> KvError {
    if let sqlx::Error::Database(ref db) = e {
        let code = db.code().and_then(|c| c.parse::<i32>().ok());
        if let Some(code) = code {
            // Extended result codes keep the primary code in the low byte
            if matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED) {
                return KvError::TransactionConflict;
            }
        }
    }

    KvError::Sql(e)
}

impl SqliteKv {
    /// Open or create a database file at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Create a database that lives only as long as this store
    pub async fn memory() -> Result<Self, KvError> {
        // Every in-memory connection is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, applying migrations to it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, KvError> {
        sqlx::migrate!("../migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_transaction(
        conn: &mut SqliteConnection,
        keys: &[String],
        op: TransactionOp,
    ) -> Result<Values, KvError> {
        let mut old = Values::new();
        for key in keys {
            let value = sqlx::query_scalar::<_, Vec<u8>>(GET)
                .bind(key)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_conflict)?;
            old.insert(key.clone(), value);
        }

        let updates = op(&old)?;
        check_updates(keys, &updates)?;

        for (key, value) in updates {
            let query = match value {
                Some(value) => sqlx::query(SET).bind(key).bind(value),
                None => sqlx::query(DELETE).bind(key),
            };
            query.execute(&mut *conn).await.map_err(map_conflict)?;
        }

        Ok(old)
    }
}

#[async_trait]
impl Kv for SqliteKv {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        sqlx::query_scalar::<_, Vec<u8>>(GET)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KvError::NotFound(key.to_owned()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        sqlx::query(SET)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(map_conflict)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        sqlx::query(DELETE)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_conflict)?;
        Ok(())
    }

    async fn mutual_transaction(
        &self,
        keys: &[String],
        op: TransactionOp,
    ) -> Result<Values, KvError> {
        // Rolled back when dropped, including when this future is cancelled
        let mut tx = self.pool.begin().await.map_err(map_conflict)?;

        // A write with no effect takes the write lock before anything is read
        sqlx::query(LOCK)
            .execute(&mut *tx)
            .await
            .map_err(map_conflict)?;

        let old = Self::run_transaction(&mut *tx, keys, op).await?;
        tx.commit().await.map_err(map_conflict)?;
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_database() {
        let kv = SqliteKv::memory().await.unwrap();
        assert!(matches!(kv.get("k").await, Err(KvError::NotFound(_))));
        kv.set("k", b"v1").await.unwrap();
        kv.set("k", b"v2").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), b"v2");
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get_optional("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::open(dir.path().join("kv.db")).await.unwrap();
        kv.set("a", b"1").await.unwrap();

        let keys = vec!["a".to_owned(), "b".to_owned()];
        let old = kv
            .mutual_transaction(
                &keys,
                Box::new(|old: &Values| {
                    Ok(Values::from([
                        ("a".to_owned(), None),
                        ("b".to_owned(), old["a"].clone()),
                    ]))
                }),
            )
            .await
            .unwrap();
        assert_eq!(old["a"], Some(b"1".to_vec()));
        assert_eq!(old["b"], None);
        assert_eq!(kv.get_optional("a").await.unwrap(), None);
        assert_eq!(kv.get("b").await.unwrap(), b"1");

        let err = kv
            .mutual_transaction(
                &keys,
                Box::new(|_: &Values| Err(KvError::Aborted("changed my mind".to_owned()))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Aborted(_)));
        assert_eq!(kv.get("b").await.unwrap(), b"1");

        // The connection is usable again after a rollback
        kv.set("c", b"3").await.unwrap();
        drop(kv);

        let reopened = SqliteKv::open(dir.path().join("kv.db")).await.unwrap();
        assert_eq!(reopened.get("c").await.unwrap(), b"3");
    }

    async fn single_connection(path: &Path) -> SqliteKv {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_millis(50));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        SqliteKv::from_pool(pool).await.unwrap()
    }

    fn set_all(keys: &[String]) -> TransactionOp {
        let keys = keys.to_vec();
        Box::new(move |_: &Values| {
            Ok(keys
                .into_iter()
                .map(|k| (k, Some(b"x".to_vec())))
                .collect())
        })
    }

    #[tokio::test]
    async fn test_cancelled_transaction_releases_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let kv = single_connection(&path).await;
        let keys = vec!["a".to_owned(), "b".to_owned()];

        for micros in [0, 1, 10, 50, 100, 500] {
            let _ = tokio::time::timeout(
                std::time::Duration::from_micros(micros),
                kv.mutual_transaction(&keys, set_all(&keys)),
            )
            .await;
        }

        // Either both keys landed or neither did
        assert_eq!(
            kv.get_optional("a").await.unwrap(),
            kv.get_optional("b").await.unwrap()
        );

        // Written outside any transaction, so another connection sees it immediately
        kv.set("c", b"3").await.unwrap();
        let other = single_connection(&path).await;
        assert_eq!(other.get("c").await.unwrap(), b"3");
        other.set("d", b"4").await.unwrap();
        assert_eq!(kv.get("d").await.unwrap(), b"4");
    }

    #[tokio::test]
    async fn test_conflicting_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let kv = single_connection(&path).await;
        let other = single_connection(&path).await;

        let mut held = other.pool.begin().await.unwrap();
        sqlx::query(SET)
            .bind("held")
            .bind(&b"1"[..])
            .execute(&mut *held)
            .await
            .unwrap();

        let keys = vec!["a".to_owned(), "b".to_owned()];
        let err = kv
            .mutual_transaction(&keys, set_all(&keys))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::TransactionConflict));

        held.rollback().await.unwrap();
        assert_eq!(kv.get_optional("a").await.unwrap(), None);
        assert_eq!(kv.get_optional("b").await.unwrap(), None);

        kv.mutual_transaction(&keys, set_all(&keys)).await.unwrap();
        assert_eq!(other.get("b").await.unwrap(), b"x");
    }
}
