use super::{Collection, Store};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(Collection, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.records
            .read()
            .keys()
            .filter(|(c, _)| *c == collection)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .read()
            .get(&(collection, key.to_string()))
            .cloned())
    }

    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<()> {
        self.records
            .write()
            .insert((collection, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .remove(&(collection, key.to_string()))
            .is_some())
    }

    async fn list(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Value)>> {
        let records = self.records.read();
        Ok(records
            .range((collection, prefix.to_string())..)
            .take_while(|((c, k), _)| *c == collection && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}
