use super::{
    ensure_id, increment_path, is_absent, summarize, validate_collection_name, DocumentStore,
};
use crate::constants::ID_FIELD;
use crate::domain::{numeric, Document, FieldAggregate, IndexSpec};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    positions: HashMap<String, usize>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    fn push(&mut self, name: &str, mut doc: Document) -> Result<()> {
        let id = ensure_id(&mut doc);
        if self.positions.contains_key(&id) {
            return Err(EtlError::DuplicateKey {
                collection: name.to_string(),
                id,
            });
        }
        self.positions.insert(id, self.docs.len());
        self.docs.push(doc);
        Ok(())
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        let pos = *self.positions.get(id)?;
        self.docs.get_mut(pos)
    }
}

/// In-memory document store for development/testing
pub struct InMemoryStore {
    collections: Arc<Mutex<HashMap<String, Collection>>>,
    closed: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Collection>>> {
        if self.is_closed() {
            return Err(EtlError::ConnectionClosed);
        }
        self.collections.lock().map_err(|_| EtlError::LockPoisoned)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn engine(&self) -> &'static str {
        "memory"
    }

    async fn clear(&self, collection: &str) -> Result<u64> {
        validate_collection_name(collection)?;
        let mut collections = self.lock()?;
        let removed = match collections.get_mut(collection) {
            Some(coll) => {
                let n = coll.docs.len() as u64;
                coll.docs.clear();
                coll.positions.clear();
                n
            }
            None => 0,
        };
        debug!("Cleared {} documents from {}", removed, collection);
        Ok(removed)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        validate_collection_name(collection)?;
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        let n = docs.len();
        for doc in docs {
            coll.push(collection, doc)?;
        }
        debug!("Inserted {} documents into {}", n, collection);
        Ok(n)
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        validate_collection_name(collection)?;
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        validate_collection_name(collection)?;
        let collections = self.lock()?;
        Ok(collections.get(collection).and_then(|c| {
            c.positions
                .get(id)
                .and_then(|&pos| c.docs.get(pos))
                .cloned()
        }))
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        validate_collection_name(collection)?;
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|c| c.docs.len() as u64)
            .unwrap_or(0))
    }

    async fn set_if_absent(&self, collection: &str, defaults: &[(String, Value)]) -> Result<u64> {
        validate_collection_name(collection)?;
        let mut collections = self.lock()?;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut written = 0u64;
        for doc in coll.docs.iter_mut() {
            for (field, default) in defaults {
                if is_absent(doc, field) {
                    doc.insert(field.clone(), default.clone());
                    written += 1;
                }
            }
        }
        debug!("Filled {} absent fields in {}", written, collection);
        Ok(written)
    }

    async fn increment(&self, collection: &str, id: &str, path: &[&str], by: i64) -> Result<()> {
        validate_collection_name(collection)?;
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.get_mut(id).is_none() {
            let mut doc = Document::new();
            doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            coll.push(collection, doc)?;
        }
        let doc = coll
            .get_mut(id)
            .ok_or_else(|| EtlError::InvalidUpdate(format!("upsert of {id:?} did not persist")))?;
        increment_path(doc, path, by)
    }

    async fn set_field(&self, collection: &str, id: &str, field: &str, value: Value) -> Result<bool> {
        validate_collection_name(collection)?;
        if field == ID_FIELD {
            return Err(EtlError::InvalidUpdate("the _id field is immutable".to_string()));
        }
        let mut collections = self.lock()?;
        match collections.get_mut(collection).and_then(|c| c.get_mut(id)) {
            Some(doc) => {
                doc.insert(field.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_field_many(
        &self,
        collection: &str,
        field: &str,
        updates: Vec<(String, Value)>,
    ) -> Result<u64> {
        validate_collection_name(collection)?;
        if field == ID_FIELD {
            return Err(EtlError::InvalidUpdate("the _id field is immutable".to_string()));
        }
        let mut collections = self.lock()?;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut matched = 0;
        for (id, value) in updates {
            if let Some(doc) = coll.get_mut(&id) {
                doc.insert(field.to_string(), value);
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn aggregate_field(&self, collection: &str, field: &str) -> Result<FieldAggregate> {
        validate_collection_name(collection)?;
        let collections = self.lock()?;
        let docs = collections
            .get(collection)
            .map(|c| c.docs.as_slice())
            .unwrap_or(&[]);
        let values: Vec<f64> = docs
            .iter()
            .filter_map(|d| d.get(field).and_then(numeric))
            .collect();
        Ok(summarize(&values, docs.len() as u64))
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<()> {
        validate_collection_name(collection)?;
        let mut collections = self.lock()?;
        let coll = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = coll.indexes.iter().find(|i| i.name == spec.name) {
            if existing.keys != spec.keys {
                return Err(EtlError::InvalidUpdate(format!(
                    "index {} already exists with different keys",
                    spec.name
                )));
            }
            return Ok(());
        }
        coll.indexes.push(spec.clone());
        debug!("Created index {} on {}", spec.name, collection);
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        validate_collection_name(collection)?;
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("In-memory store closed");
        Ok(())
    }
}
