//! Process-local document store.
//!
//! Backs dry runs and tests. A transaction holds the store lock for its whole
//! lifetime and writes into copy-on-write snapshots of the collections it
//! touches, so nothing it does is visible until commit.
//!
//! The store can be told to fail specific operations, which is how the
//! engine's atomicity and fatal-error paths are exercised in tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    error::{DbError, DbResult},
    repos::{DocumentStore, DocumentTx, Seq, StoredDocument},
};
use crate::models::{Document, Filter, PullOutcome, document};

#[derive(Debug, Default)]
struct Collections {
    next_seq: Seq,
    collections: BTreeMap<String, Vec<StoredDocument>>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_writes: HashSet<String>,
    fail_pages_after: Option<usize>,
    pages_served: usize,
}

impl Faults {
    fn check_write(&self, collection: &str) -> DbResult<()> {
        if self.fail_writes.contains(collection) {
            return Err(DbError::Internal(format!(
                "injected write failure on '{collection}'"
            )));
        }
        Ok(())
    }
}

/// In-memory [`DocumentStore`]. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<AsyncMutex<Collections>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transactional write to `collection` fail.
    pub fn fail_writes_to(&self, collection: &str) {
        self.faults.lock().fail_writes.insert(collection.to_string());
    }

    /// Serve `pages` more pages from [`DocumentStore::fetch_page`], then fail.
    pub fn fail_pages_after(&self, pages: usize) {
        let mut faults = self.faults.lock();
        faults.fail_pages_after = Some(pages);
        faults.pages_served = 0;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Every document in a collection, in insertion order.
    pub async fn snapshot(&self, collection: &str) -> Vec<Document> {
        let data = self.data.lock().await;
        data.collections
            .get(collection)
            .map(|docs| docs.iter().map(|d| d.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self) -> DbResult<Vec<String>> {
        let data = self.data.lock().await;
        Ok(data.collections.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        let mut data = self.data.lock().await;
        data.collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> DbResult<u64> {
        let mut data = self.data.lock().await;
        let mut next_seq = data.next_seq;
        let target = data.collections.entry(collection.to_string()).or_default();
        let count = docs.len() as u64;
        for body in docs {
            next_seq += 1;
            target.push(StoredDocument {
                seq: next_seq,
                body,
            });
        }
        data.next_seq = next_seq;
        Ok(count)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> DbResult<Option<Document>> {
        let data = self.data.lock().await;
        Ok(data.collections.get(collection).and_then(|docs| {
            docs.iter()
                .find(|d| filter.matches(&d.body))
                .map(|d| d.body.clone())
        }))
    }

    async fn fetch_page(
        &self,
        collection: &str,
        after: Option<Seq>,
        limit: u32,
    ) -> DbResult<Vec<StoredDocument>> {
        {
            let mut faults = self.faults.lock();
            if let Some(max) = faults.fail_pages_after {
                if faults.pages_served >= max {
                    return Err(DbError::Internal(format!(
                        "injected cursor failure on '{collection}'"
                    )));
                }
            }
            faults.pages_served += 1;
        }

        let data = self.data.lock().await;
        let after = after.unwrap_or(Seq::MIN);
        Ok(data
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| d.seq > after)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> DbResult<u64> {
        let data = self.data.lock().await;
        Ok(data
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(&d.body)).count() as u64)
            .unwrap_or(0))
    }

    async fn begin(&self) -> DbResult<Box<dyn DocumentTx>> {
        let guard = Arc::clone(&self.data).lock_owned().await;
        let next_seq = guard.next_seq;
        Ok(Box::new(MemoryTx {
            guard,
            touched: BTreeMap::new(),
            next_seq,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Collections>,
    /// Working copies of collections written by this transaction.
    touched: BTreeMap<String, Vec<StoredDocument>>,
    next_seq: Seq,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryTx {
    fn view(&self, collection: &str) -> &[StoredDocument] {
        self.touched
            .get(collection)
            .or_else(|| self.guard.collections.get(collection))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn touch(&mut self, collection: &str) -> DbResult<&mut Vec<StoredDocument>> {
        self.faults.lock().check_write(collection)?;
        let Self { guard, touched, .. } = self;
        Ok(touched
            .entry(collection.to_string())
            .or_insert_with(|| guard.collections.get(collection).cloned().unwrap_or_default()))
    }

    fn has_match(&self, collection: &str, filter: &Filter) -> bool {
        self.view(collection).iter().any(|d| filter.matches(&d.body))
    }
}

#[async_trait]
impl DocumentTx for MemoryTx {
    async fn find_many(&mut self, collection: &str, filter: &Filter) -> DbResult<Vec<Document>> {
        Ok(self
            .view(collection)
            .iter()
            .filter(|d| filter.matches(&d.body))
            .map(|d| d.body.clone())
            .collect())
    }

    async fn insert_one(&mut self, collection: &str, doc: Document) -> DbResult<()> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.touch(collection)?
            .push(StoredDocument { seq, body: doc });
        Ok(())
    }

    async fn delete_many(&mut self, collection: &str, filter: &Filter) -> DbResult<u64> {
        if !self.has_match(collection, filter) {
            self.faults.lock().check_write(collection)?;
            return Ok(0);
        }
        let docs = self.touch(collection)?;
        let before = docs.len();
        docs.retain(|d| !filter.matches(&d.body));
        Ok((before - docs.len()) as u64)
    }

    async fn set_fields(
        &mut self,
        collection: &str,
        filter: &Filter,
        fields: &Document,
    ) -> DbResult<u64> {
        if !self.has_match(collection, filter) {
            self.faults.lock().check_write(collection)?;
            return Ok(0);
        }
        let mut modified = 0;
        for doc in self.touch(collection)?.iter_mut() {
            if filter.matches(&doc.body) {
                for (path, value) in fields {
                    document::set_path(&mut doc.body, path, value.clone());
                }
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn pull_value(
        &mut self,
        collection: &str,
        filter: &Filter,
        field: &str,
        value: &Value,
    ) -> DbResult<u64> {
        if !self.has_match(collection, filter) {
            self.faults.lock().check_write(collection)?;
            return Ok(0);
        }
        let mut modified = 0;
        for doc in self.touch(collection)?.iter_mut() {
            if !filter.matches(&doc.body) {
                continue;
            }
            match document::pull_from_path(&mut doc.body, field, value) {
                PullOutcome::Removed(_) => modified += 1,
                PullOutcome::Unchanged => {}
                PullOutcome::NotAnArray => {
                    return Err(DbError::Validation(format!(
                        "cannot pull from non-array field '{field}' in '{collection}'"
                    )));
                }
            }
        }
        Ok(modified)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let MemoryTx {
            mut guard,
            touched,
            next_seq,
            ..
        } = *self;
        guard.collections.extend(touched);
        guard.next_seq = next_seq;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}
