use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{check_updates, Kv, KvError, TransactionOp, Values};

/// A [Kv] held entirely in memory, transactions run under a single lock
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_owned()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.map.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn mutual_transaction(
        &self,
        keys: &[String],
        op: TransactionOp,
    ) -> Result<Values, KvError> {
        let mut map = self.map.lock();
        let old = keys
            .iter()
            .map(|k| (k.clone(), map.get(k).cloned()))
            .collect::<Values>();

        let updates = op(&old)?;
        check_updates(keys, &updates)?;

        for (key, value) in updates {
            match value {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            };
        }

        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_ops() {
        let kv = MemoryKv::new();
        assert!(matches!(kv.get("a").await, Err(KvError::NotFound(_))));
        assert_eq!(kv.get_optional("a").await.unwrap(), None);

        kv.set("a", b"1").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), b"1");
        assert_eq!(kv.len(), 1);
        kv.delete("a").await.unwrap();
        kv.delete("a").await.unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_transaction() {
        let kv = MemoryKv::new();
        kv.set("a", b"1").await.unwrap();
        kv.set("b", b"2").await.unwrap();

        let keys = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let old = kv
            .mutual_transaction(
                &keys,
                Box::new(|old: &Values| {
                    let mut updates = Values::new();
                    updates.insert("a".to_owned(), None);
                    updates.insert("c".to_owned(), old["b"].clone());
                    Ok(updates)
                }),
            )
            .await
            .unwrap();

        assert_eq!(old["a"], Some(b"1".to_vec()));
        assert_eq!(old["c"], None);
        assert_eq!(kv.get_optional("a").await.unwrap(), None);
        assert_eq!(kv.get("c").await.unwrap(), b"2");

        let err = kv
            .mutual_transaction(
                &keys[..1],
                Box::new(|_: &Values| Ok(Values::from([("z".to_owned(), Some(vec![]))]))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::KeyNotInTransaction(_)));
        assert_eq!(kv.get_optional("z").await.unwrap(), None);
    }
}
