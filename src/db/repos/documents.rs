use async_trait::async_trait;
use serde_json::Value;

use crate::{
    db::error::DbResult,
    models::{Document, Filter},
};

/// Position of a document in its collection's insertion order.
///
/// Sequences are strictly increasing per store and never reused, which makes
/// them a stable keyset for resumable paging.
pub type Seq = i64;

/// A document together with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub seq: Seq,
    pub body: Document,
}

/// Schemaless collection store.
///
/// Reads outside a transaction see committed data only. All writes the
/// retention engine performs go through [`DocumentTx`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of all existing collections, sorted.
    async fn list_collections(&self) -> DbResult<Vec<String>>;

    /// Create a collection if it does not exist yet.
    async fn create_collection(&self, name: &str) -> DbResult<()>;

    /// Insert documents outside of any transaction (seeding, imports).
    /// Creates the collection if needed.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> DbResult<u64>;

    /// First document matching the filter, in insertion order.
    async fn find_one(&self, collection: &str, filter: &Filter) -> DbResult<Option<Document>>;

    /// Up to `limit` documents with a sequence strictly greater than `after`,
    /// in ascending sequence order.
    ///
    /// Iterating with the last returned sequence as the next `after` visits
    /// every document present when iteration began exactly once, even when
    /// visited documents are deleted along the way.
    async fn fetch_page(
        &self,
        collection: &str,
        after: Option<Seq>,
        limit: u32,
    ) -> DbResult<Vec<StoredDocument>>;

    /// Count documents matching the filter.
    async fn count(&self, collection: &str, filter: &Filter) -> DbResult<u64>;

    /// Open a unit of work. Only one should be open at a time.
    async fn begin(&self) -> DbResult<Box<dyn DocumentTx>>;
}

/// An open unit of work.
///
/// Nothing written through a transaction is visible to other readers until
/// [`commit`](DocumentTx::commit) succeeds. Dropping a transaction without
/// committing discards every write it made.
#[async_trait]
pub trait DocumentTx: Send {
    /// All documents matching the filter, as seen by this transaction.
    async fn find_many(&mut self, collection: &str, filter: &Filter) -> DbResult<Vec<Document>>;

    async fn insert_one(&mut self, collection: &str, doc: Document) -> DbResult<()>;

    /// Returns the number of documents removed.
    async fn delete_many(&mut self, collection: &str, filter: &Filter) -> DbResult<u64>;

    /// Set the given dotted-path fields on all matches.
    /// Returns the number of documents modified.
    async fn set_fields(
        &mut self,
        collection: &str,
        filter: &Filter,
        fields: &Document,
    ) -> DbResult<u64>;

    /// Remove `value` from the array at `field` on all matches.
    /// Returns the number of documents modified. A match whose `field` holds
    /// a non-array value is an error.
    async fn pull_value(
        &mut self,
        collection: &str,
        filter: &Filter,
        field: &str,
        value: &Value,
    ) -> DbResult<u64>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
