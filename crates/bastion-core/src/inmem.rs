//! Non-durable backend for tests and tooling.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::list_push_name;
use crate::Backend;
use crate::BackendError;
use crate::Entry;
use crate::Operation;
use crate::TxnEntry;

/// In-memory [`Backend`] over a sorted map. Data is lost on drop.
#[derive(Debug, Default)]
pub struct InmemBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InmemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InmemBackend {
    async fn get(&self, key: &str) -> Result<Option<Entry>, BackendError> {
        let data = self.data.read().await;
        Ok(data.get(key).map(|value| Entry::new(key, value.clone())))
    }

    async fn put(&self, entry: Entry) -> Result<(), BackendError> {
        let mut data = self.data.write().await;
        data.insert(entry.key, entry.value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let data = self.data.read().await;
        let mut names = Vec::new();
        let range = data.range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded));
        for (key, _) in range {
            let Some(stripped) = key.strip_prefix(prefix) else {
                break;
            };
            list_push_name(&mut names, stripped);
        }
        Ok(names)
    }

    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<(), BackendError> {
        let mut data = self.data.write().await;
        for txn in txns {
            match txn.operation {
                Operation::Put => {
                    data.insert(txn.entry.key, txn.entry.value);
                }
                Operation::Delete => {
                    data.remove(&txn.entry.key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let backend = InmemBackend::new();
        backend.put(Entry::new("secret/foo", b"zork".to_vec())).await.unwrap();
        assert_eq!(backend.get("secret/foo").await.unwrap().unwrap().value, b"zork");

        backend.delete("secret/foo").await.unwrap();
        assert!(backend.get("secret/foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_emits_folders_and_leaves() {
        let backend = InmemBackend::new();
        for key in ["secret/a", "secret/sub/one", "secret/sub/two", "other"] {
            backend.put(Entry::new(key, b"x".to_vec())).await.unwrap();
        }
        assert_eq!(backend.list("secret/").await.unwrap(), vec!["a", "sub/"]);
        assert_eq!(backend.list("").await.unwrap(), vec!["other", "secret/"]);
    }

    #[tokio::test]
    async fn transaction_applies_in_order() {
        let backend = InmemBackend::new();
        backend
            .transaction(vec![
                TxnEntry::put(Entry::new("a", b"1".to_vec())),
                TxnEntry::put(Entry::new("a", b"2".to_vec())),
                TxnEntry::delete("a"),
                TxnEntry::put(Entry::new("a", b"3".to_vec())),
            ])
            .await
            .unwrap();
        assert_eq!(backend.get("a").await.unwrap().unwrap().value, b"3");
    }
}
