//! Document store contract.
//!
//! The board keeps all durable state in a managed realtime document store.
//! This module defines the slice of that store the client relies on: point
//! reads, simple queries, atomic write batches with field transforms, and
//! document/query subscriptions that deliver ordered snapshots with deltas.
//!
//! [`MemoryStore`](crate::memory::MemoryStore) implements the contract in
//! process; a hosted backend plugs in through the same trait.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Most ids accepted by a single id-in query.
pub const MAX_IN_QUERY_IDS: usize = 30;

/// `collection/id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

// ============================================================================
// Writes
// ============================================================================

/// A field write: a literal value or a server-side transform.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's clock (ms since epoch) at commit.
    ServerTimestamp,
    /// Append each element not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of each element.
    ArrayRemove(Vec<Value>),
}

/// Field writes keyed by field path. Dots address nested maps
/// (`reactions.heart`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a model into literal field writes.
    pub fn from_doc<T: Serialize>(doc: &T) -> Result<Self, StoreError> {
        match serde_json::to_value(doc) {
            Ok(Value::Object(map)) => Ok(Self(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::Value(v)))
                    .collect(),
            )),
            Ok(_) => Err(StoreError::InvalidArgument(
                "document must serialize to an object".into(),
            )),
            Err(e) => Err(StoreError::InvalidArgument(e.to_string())),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::Value(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldValue::ServerTimestamp);
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0
            .insert(field.into(), FieldValue::ArrayUnion(vec![value.into()]));
        self
    }

    pub fn array_remove(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0
            .insert(field.into(), FieldValue::ArrayRemove(vec![value.into()]));
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a set treats fields it does not mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Replace the whole document.
    Overwrite,
    /// Keep unmentioned fields.
    Merge,
}

/// One operation of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        path: DocPath,
        fields: Fields,
        mode: SetMode,
    },
    /// Fails the whole batch with `NotFound` if the document is missing.
    Update { path: DocPath, fields: Fields },
    Delete { path: DocPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Update { path, .. } | WriteOp::Delete { path } => {
                path
            }
        }
    }
}

/// Writes committed atomically: all apply or none do.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Set {
            path,
            fields,
            mode: SetMode::Overwrite,
        });
        self
    }

    pub fn merge(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Set {
            path,
            fields,
            mode: SetMode::Merge,
        });
        self
    }

    pub fn update(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Update { path, fields });
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ============================================================================
// Reads
// ============================================================================

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| StoreError::Decode(format!("{}: {}", self.id, e)))
    }
}

/// Query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    /// Document id is one of these (at most [`MAX_IN_QUERY_IDS`]).
    IdIn(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A collection query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_id_in(mut self, ids: Vec<String>) -> Self {
        self.filters.push(Filter::IdIn(ids));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub kind: ChangeKind,
    pub doc: Document,
}

/// Ordered result set plus the changes since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    pub docs: Vec<Document>,
    pub changes: Vec<DocChange>,
}

impl QuerySnapshot {
    pub fn added(&self) -> impl Iterator<Item = &Document> {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Added)
            .map(|c| &c.doc)
    }
}

/// Current state of a single watched document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocSnapshot {
    pub id: String,
    pub data: Option<Value>,
}

impl DocSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    inner: UnboundedReceiverStream<T>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver; `on_drop` runs when the subscription is dropped.
    pub fn new(rx: mpsc::UnboundedReceiver<T>, on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next snapshot, or `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.next().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

pub type DocSubscription = Subscription<Result<DocSnapshot, StoreError>>;
pub type QuerySubscription = Subscription<Result<QuerySnapshot, StoreError>>;

// ============================================================================
// Contract
// ============================================================================

/// Realtime document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Apply every operation atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Subscribe to one document. The current state is delivered first.
    async fn watch_doc(&self, path: &DocPath) -> DocSubscription;

    /// Subscribe to a query. The first snapshot reports every document as
    /// added.
    async fn watch_query(&self, query: &Query) -> QuerySubscription;

    async fn exists(&self, path: &DocPath) -> Result<bool, StoreError> {
        Ok(self.get(path).await?.is_some())
    }

    async fn set(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(path.clone(), fields);
        self.commit(batch).await
    }

    async fn merge(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.merge(path.clone(), fields);
        self.commit(batch).await
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.update(path.clone(), fields);
        self.commit(batch).await
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(path.clone());
        self.commit(batch).await
    }

    /// Create a document with a generated id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        self.set(&DocPath::new(collection, id.clone()), fields).await?;
        Ok(id)
    }
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("service unavailable")]
    Unavailable,

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not decode document {0}")]
    Decode(String),

    #[error("operation timed out")]
    Timeout,
}
