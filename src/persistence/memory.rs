//! In-process document store used by tests and local dry runs

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::store::{apply_fields, get_path, DocumentStore, Fields};
use crate::error::{Result, SpikeError};

#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
    indexes: DashMap<String, Vec<String>>,
    fail_writes: AtomicBool,
    failing_docs: DashSet<(String, String)>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes touching one document fail; a bulk write including it fails whole
    pub fn fail_writes_for(&self, collection: &str, id: &str) {
        self.failing_docs
            .insert((collection.to_string(), id.to_string()));
    }

    /// Make every operation, reads included, fail as if the server were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful write operations (a bulk write counts once)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Indexed paths for a collection
    pub fn indexes(&self, collection: &str) -> Vec<String> {
        self.indexes
            .get(collection)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SpikeError::PersistenceUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SpikeError::PersistenceWrite(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write_doc(&self, collection: &str, id: &str) -> Result<()> {
        self.check_write()?;
        if self
            .failing_docs
            .contains(&(collection.to_string(), id.to_string()))
        {
            return Err(SpikeError::PersistenceWrite(format!(
                "injected write failure for {}/{}",
                collection, id
            )));
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check_available()?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned()))
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        self.check_available()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        path: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>> {
        self.check_available()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, doc)| get_path(doc, path) == Some(value))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_fields(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.check_write_doc(collection, id)?;
        let mut coll = self.collections.entry(collection.to_string()).or_default();
        let doc = coll.entry(id.to_string()).or_insert(Value::Null);
        apply_fields(doc, fields);
        drop(coll);
        self.record_write();
        Ok(())
    }

    async fn bulk_update(&self, collection: &str, updates: &[(String, Fields)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        for (id, _) in updates {
            self.check_write_doc(collection, id)?;
        }
        let mut coll = self.collections.entry(collection.to_string()).or_default();
        for (id, fields) in updates {
            let doc = coll.entry(id.clone()).or_insert(Value::Null);
            apply_fields(doc, fields);
        }
        drop(coll);
        self.record_write();
        Ok(())
    }

    async fn replace(&self, collection: &str, id: &str, doc: &Value) -> Result<()> {
        self.check_write_doc(collection, id)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        self.record_write();
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_write()?;
        if let Some(mut coll) = self.collections.get_mut(collection) {
            coll.remove(id);
        }
        self.record_write();
        Ok(())
    }

    async fn delete_many(&self, collection: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.check_write()?;
        let removed = match self.collections.get_mut(collection) {
            Some(mut coll) => ids.iter().filter(|id| coll.remove(*id).is_some()).count() as u64,
            None => 0,
        };
        self.record_write();
        Ok(removed)
    }

    async fn create_index(&self, collection: &str, path: &str) -> Result<()> {
        self.check_available()?;
        let mut paths = self.indexes.entry(collection.to_string()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
        Ok(())
    }
}
