//! In-process document store.
//!
//! Implements [`DocumentStore`] over a map guarded by a tokio `RwLock`.
//! Commits are atomic and fan out snapshots to every affected listener
//! while the write lock is held, so subscribers observe commits in order.
//!
//! Faults and latency can be injected per operation and collection; the
//! client's failure paths (timeouts, permission denials, rollbacks) are
//! exercised this way in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use crate::Clock;
use crate::store::{
    ChangeKind, DocChange, DocPath, DocSnapshot, DocSubscription, Document, DocumentStore,
    FieldValue, Fields, Filter, Direction, Query, QuerySnapshot, QuerySubscription, SetMode,
    StoreError, Subscription, WriteBatch, WriteOp, MAX_IN_QUERY_IDS,
};

/// Matches any collection when registering a fault.
pub const ANY_COLLECTION: &str = "*";

/// Store operation, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Query,
    Commit,
    Watch,
}

type DocSender = mpsc::UnboundedSender<Result<DocSnapshot, StoreError>>;
type QuerySender = mpsc::UnboundedSender<Result<QuerySnapshot, StoreError>>;

struct DocListener {
    path: DocPath,
    tx: DocSender,
}

struct QueryListener {
    query: Query,
    tx: QuerySender,
    last: Vec<Document>,
}

struct Inner {
    docs: RwLock<BTreeMap<DocPath, Value>>,
    doc_listeners: DashMap<u64, DocListener>,
    query_listeners: DashMap<u64, QueryListener>,
    next_listener: AtomicU64,
    commits: AtomicU64,
    faults: DashMap<(StoreOp, String), StoreError>,
    latency_ms: AtomicU64,
    clock: Clock,
}

/// Thread-safe in-memory document store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using wall-clock time for server timestamps.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Utc::now().timestamp_millis()))
    }

    /// Create an empty store with a custom server clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: RwLock::new(BTreeMap::new()),
                doc_listeners: DashMap::new(),
                query_listeners: DashMap::new(),
                next_listener: AtomicU64::new(1),
                commits: AtomicU64::new(0),
                faults: DashMap::new(),
                latency_ms: AtomicU64::new(0),
                clock,
            }),
        }
    }

    // === Fault injection ===

    /// Fail `op` on `collection` (or [`ANY_COLLECTION`]) until cleared.
    pub fn fail(&self, op: StoreOp, collection: &str, err: StoreError) {
        self.inner.faults.insert((op, collection.to_string()), err);
    }

    pub fn clear_fault(&self, op: StoreOp, collection: &str) {
        self.inner.faults.remove(&(op, collection.to_string()));
    }

    pub fn clear_faults(&self) {
        self.inner.faults.clear();
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Push an error to every live subscription on `collection`.
    pub fn emit_error(&self, collection: &str, err: StoreError) {
        for listener in self.inner.query_listeners.iter() {
            if listener.query.collection == collection {
                let _ = listener.tx.send(Err(err.clone()));
            }
        }
        for listener in self.inner.doc_listeners.iter() {
            if listener.path.collection == collection {
                let _ = listener.tx.send(Err(err.clone()));
            }
        }
    }

    // === Introspection ===

    /// Raw document data, bypassing faults and latency.
    pub async fn peek(&self, path: &DocPath) -> Option<Value> {
        self.inner.docs.read().await.get(path).cloned()
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.inner
            .docs
            .read()
            .await
            .keys()
            .filter(|p| p.collection == collection)
            .count()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.inner.doc_listeners.len() + self.inner.query_listeners.len()
    }

    // === Internals ===

    fn check_fault(&self, op: StoreOp, collection: &str) -> Result<(), StoreError> {
        for key in [collection, ANY_COLLECTION] {
            if let Some(err) = self.inner.faults.get(&(op, key.to_string())) {
                debug!(?op, collection, error = %*err, "Injected store fault");
                return Err(err.clone());
            }
        }
        Ok(())
    }

    async fn delay(&self) {
        let ms = self.inner.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn next_listener_id(&self) -> u64 {
        self.inner.next_listener.fetch_add(1, Ordering::Relaxed)
    }

    fn notify(&self, docs: &BTreeMap<DocPath, Value>, touched: &[DocPath]) {
        let mut dead = Vec::new();
        for listener in self.inner.doc_listeners.iter() {
            if touched.contains(&listener.path) {
                let snapshot = DocSnapshot {
                    id: listener.path.id.clone(),
                    data: docs.get(&listener.path).cloned(),
                };
                if listener.tx.send(Ok(snapshot)).is_err() {
                    dead.push(*listener.key());
                }
            }
        }
        for id in dead.drain(..) {
            self.inner.doc_listeners.remove(&id);
        }

        for mut listener in self.inner.query_listeners.iter_mut() {
            if !touched
                .iter()
                .any(|p| p.collection == listener.query.collection)
            {
                continue;
            }
            let next = run_query(docs, &listener.query);
            let changes = diff(&listener.last, &next);
            if changes.is_empty() {
                continue;
            }
            listener.last = next.clone();
            let snapshot = QuerySnapshot {
                docs: next,
                changes,
            };
            if listener.tx.send(Ok(snapshot)).is_err() {
                dead.push(*listener.key());
            }
        }
        for id in dead {
            self.inner.query_listeners.remove(&id);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        self.delay().await;
        self.check_fault(StoreOp::Get, &path.collection)?;

        Ok(self.inner.docs.read().await.get(path).map(|data| Document {
            id: path.id.clone(),
            data: data.clone(),
        }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.delay().await;
        self.check_fault(StoreOp::Query, &query.collection)?;
        validate_query(query)?;

        Ok(run_query(&*self.inner.docs.read().await, query))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.delay().await;
        for op in batch.ops() {
            self.check_fault(StoreOp::Commit, &op.path().collection)?;
        }
        if batch.is_empty() {
            return Ok(());
        }

        let now = (self.inner.clock)();
        let mut docs = self.inner.docs.write().await;

        // Stage against a copy of the touched documents so a failing op
        // leaves the store untouched.
        let mut staged: BTreeMap<DocPath, Option<Value>> = BTreeMap::new();
        for op in batch.ops() {
            let path = op.path();
            let current = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => docs.get(path).cloned(),
            };
            let next = match op {
                WriteOp::Set { fields, mode, .. } => {
                    let mut map = match (mode, current) {
                        (SetMode::Merge, Some(Value::Object(map))) => map,
                        _ => Map::new(),
                    };
                    apply_fields(&mut map, fields, now);
                    Some(Value::Object(map))
                }
                WriteOp::Update { fields, .. } => match current {
                    Some(Value::Object(mut map)) => {
                        apply_fields(&mut map, fields, now);
                        Some(Value::Object(map))
                    }
                    _ => return Err(StoreError::NotFound(path.to_string())),
                },
                WriteOp::Delete { .. } => None,
            };
            staged.insert(path.clone(), next);
        }

        let touched: Vec<DocPath> = staged.keys().cloned().collect();
        for (path, doc) in staged {
            match doc {
                Some(data) => {
                    docs.insert(path, data);
                }
                None => {
                    docs.remove(&path);
                }
            }
        }
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        trace!(ops = batch.len(), docs = touched.len(), "Committed batch");

        self.notify(&docs, &touched);
        Ok(())
    }

    async fn watch_doc(&self, path: &DocPath) -> DocSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(err) = self.check_fault(StoreOp::Watch, &path.collection) {
            let _ = tx.send(Err(err));
            return Subscription::new(rx, || {});
        }

        let docs = self.inner.docs.read().await;
        let _ = tx.send(Ok(DocSnapshot {
            id: path.id.clone(),
            data: docs.get(path).cloned(),
        }));

        let id = self.next_listener_id();
        self.inner.doc_listeners.insert(
            id,
            DocListener {
                path: path.clone(),
                tx,
            },
        );
        drop(docs);

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(rx, move || unsubscribe_doc(&weak, id))
    }

    async fn watch_query(&self, query: &Query) -> QuerySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(err) = self
            .check_fault(StoreOp::Watch, &query.collection)
            .and_then(|_| validate_query(query))
        {
            let _ = tx.send(Err(err));
            return Subscription::new(rx, || {});
        }

        let docs = self.inner.docs.read().await;
        let initial = run_query(&docs, query);
        let _ = tx.send(Ok(QuerySnapshot {
            docs: initial.clone(),
            changes: initial
                .iter()
                .map(|doc| DocChange {
                    kind: ChangeKind::Added,
                    doc: doc.clone(),
                })
                .collect(),
        }));

        let id = self.next_listener_id();
        self.inner.query_listeners.insert(
            id,
            QueryListener {
                query: query.clone(),
                tx,
                last: initial,
            },
        );
        drop(docs);

        debug!(collection = %query.collection, listener = id, "Query subscription opened");
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(rx, move || unsubscribe_query(&weak, id))
    }
}

fn unsubscribe_doc(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.doc_listeners.remove(&id);
    }
}

fn unsubscribe_query(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.query_listeners.remove(&id);
    }
}

// ============================================================================
// Field transforms
// ============================================================================

fn apply_fields(doc: &mut Map<String, Value>, fields: &Fields, now: i64) {
    for (field, value) in fields.iter() {
        let Some(slot) = slot_mut(doc, field) else {
            continue;
        };
        match value {
            FieldValue::Value(v) => *slot = v.clone(),
            FieldValue::ServerTimestamp => *slot = Value::from(now),
            FieldValue::ArrayUnion(items) => {
                let mut arr = match slot.take() {
                    Value::Array(arr) => arr,
                    _ => Vec::new(),
                };
                for item in items {
                    if !arr.contains(item) {
                        arr.push(item.clone());
                    }
                }
                *slot = Value::Array(arr);
            }
            FieldValue::ArrayRemove(items) => {
                let mut arr = match slot.take() {
                    Value::Array(arr) => arr,
                    _ => Vec::new(),
                };
                arr.retain(|v| !items.contains(v));
                *slot = Value::Array(arr);
            }
        }
    }
}

/// Resolve a dotted field path, creating intermediate maps.
fn slot_mut<'a>(doc: &'a mut Map<String, Value>, field: &str) -> Option<&'a mut Value> {
    let parts: Vec<&str> = field.split('.').collect();
    let (last, parents) = parts.split_last()?;

    let mut map = doc;
    for part in parents {
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        map = entry.as_object_mut()?;
    }
    Some(map.entry(last.to_string()).or_insert(Value::Null))
}

fn field_value<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(data, |value, part| value.get(part))
}

// ============================================================================
// Queries
// ============================================================================

fn validate_query(query: &Query) -> Result<(), StoreError> {
    for filter in &query.filters {
        if let Filter::IdIn(ids) = filter {
            if ids.is_empty() || ids.len() > MAX_IN_QUERY_IDS {
                return Err(StoreError::InvalidArgument(format!(
                    "id-in query takes 1 to {} ids, got {}",
                    MAX_IN_QUERY_IDS,
                    ids.len()
                )));
            }
        }
    }
    Ok(())
}

fn matches(query: &Query, path: &DocPath, data: &Value) -> bool {
    if path.collection != query.collection {
        return false;
    }
    query.filters.iter().all(|filter| match filter {
        Filter::Eq { field, value } => field_value(data, field) == Some(value),
        Filter::IdIn(ids) => ids.contains(&path.id),
    })
}

fn run_query(docs: &BTreeMap<DocPath, Value>, query: &Query) -> Vec<Document> {
    let mut results: Vec<Document> = docs
        .iter()
        .filter(|(path, data)| matches(query, path, data))
        .filter(|(_, data)| match &query.order_by {
            // Documents without the ordering field are excluded.
            Some((field, _)) => field_value(data, field).is_some_and(|v| !v.is_null()),
            None => true,
        })
        .map(|(path, data)| Document {
            id: path.id.clone(),
            data: data.clone(),
        })
        .collect();

    if let Some((field, direction)) = &query.order_by {
        results.sort_by(|a, b| {
            let ord = compare_values(field_value(&a.data, field), field_value(&b.data, field));
            match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
    }
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }
    results
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn diff(prev: &[Document], next: &[Document]) -> Vec<DocChange> {
    let before: HashMap<&str, &Value> = prev.iter().map(|d| (d.id.as_str(), &d.data)).collect();
    let after: HashMap<&str, ()> = next.iter().map(|d| (d.id.as_str(), ())).collect();

    let mut changes: Vec<DocChange> = next
        .iter()
        .filter_map(|doc| {
            let kind = match before.get(doc.id.as_str()) {
                None => ChangeKind::Added,
                Some(old) if **old != doc.data => ChangeKind::Modified,
                Some(_) => return None,
            };
            Some(DocChange {
                kind,
                doc: doc.clone(),
            })
        })
        .collect();

    changes.extend(
        prev.iter()
            .filter(|doc| !after.contains_key(doc.id.as_str()))
            .map(|doc| DocChange {
                kind: ChangeKind::Removed,
                doc: doc.clone(),
            }),
    );
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_clock(ms: i64) -> Clock {
        Arc::new(move || ms)
    }

    fn path(collection: &str, id: &str) -> DocPath {
        DocPath::new(collection, id)
    }

    #[tokio::test]
    async fn set_merge_update_delete() {
        let store = MemoryStore::with_clock(fixed_clock(1_000));
        let p = path("users", "u1");

        store
            .set(&p, Fields::new().set("username", "alice").set("banned", false))
            .await
            .unwrap();
        store
            .merge(&p, Fields::new().set("banned", true))
            .await
            .unwrap();
        assert_eq!(
            store.peek(&p).await,
            Some(json!({"username": "alice", "banned": true}))
        );

        store
            .set(&p, Fields::new().server_timestamp("lastSeen"))
            .await
            .unwrap();
        assert_eq!(store.peek(&p).await, Some(json!({"lastSeen": 1_000})));

        store.delete(&p).await.unwrap();
        assert!(!store.exists(&p).await.unwrap());
    }

    #[tokio::test]
    async fn update_missing_document_fails_whole_batch() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .set(path("chat", "a"), Fields::new().set("text", "hi"))
            .update(path("chat", "missing"), Fields::new().set("edited", true));

        let err = store.commit(batch).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("chat/missing".into()));
        assert_eq!(store.count("chat").await, 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn array_transforms_on_nested_fields() {
        let store = MemoryStore::new();
        let p = path("chat", "m1");
        store.set(&p, Fields::new().set("text", "x")).await.unwrap();

        store
            .update(&p, Fields::new().array_union("reactions.heart", "u1"))
            .await
            .unwrap();
        store
            .update(&p, Fields::new().array_union("reactions.heart", "u1"))
            .await
            .unwrap();
        store
            .update(&p, Fields::new().array_union("reactions.heart", "u2"))
            .await
            .unwrap();
        store
            .update(&p, Fields::new().array_remove("reactions.heart", "u1"))
            .await
            .unwrap();

        let data = store.peek(&p).await.unwrap();
        assert_eq!(data["reactions"]["heart"], json!(["u2"]));
    }

    #[tokio::test]
    async fn query_filters_orders_and_limits() {
        let store = MemoryStore::new();
        for (id, user, ts) in [("a", "u1", 30), ("b", "u2", 10), ("c", "u1", 20)] {
            store
                .set(
                    &path("chat", id),
                    Fields::new().set("userId", user).set("timestamp", ts),
                )
                .await
                .unwrap();
        }
        store
            .set(&path("chat", "pending"), Fields::new().set("userId", "u1"))
            .await
            .unwrap();

        let ordered = store
            .query(&Query::collection("chat").order_by("timestamp", Direction::Asc))
            .await
            .unwrap();
        let ids: Vec<_> = ordered.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);

        let mine = store
            .query(&Query::collection("chat").where_eq("userId", "u1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 3);

        let limited = store
            .query(
                &Query::collection("chat")
                    .order_by("timestamp", Direction::Desc)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(limited[0].id, "a");
    }

    #[tokio::test]
    async fn id_in_query_is_capped() {
        let store = MemoryStore::new();
        let ids: Vec<String> = (0..31).map(|i| format!("u{}", i)).collect();
        let err = store
            .query(&Query::collection("users").where_id_in(ids))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn query_subscription_reports_deltas() {
        let store = MemoryStore::new();
        store
            .set(&path("chat", "a"), Fields::new().set("timestamp", 1))
            .await
            .unwrap();

        let mut sub = store
            .watch_query(&Query::collection("chat").order_by("timestamp", Direction::Asc))
            .await;
        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.docs.len(), 1);
        assert_eq!(first.added().count(), 1);

        store
            .set(&path("chat", "b"), Fields::new().set("timestamp", 2))
            .await
            .unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].kind, ChangeKind::Added);
        assert_eq!(second.changes[0].doc.id, "b");

        store.delete(&path("chat", "a")).await.unwrap();
        let third = sub.recv().await.unwrap().unwrap();
        assert_eq!(third.changes[0].kind, ChangeKind::Removed);
        assert_eq!(third.docs.len(), 1);

        // Other collections do not wake the listener.
        store
            .set(&path("users", "u1"), Fields::new().set("username", "x"))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn doc_subscription_tracks_existence() {
        let store = MemoryStore::new();
        let p = path("banned_users", "u1");
        let mut sub = store.watch_doc(&p).await;

        assert!(!sub.recv().await.unwrap().unwrap().exists());

        store
            .set(&p, Fields::new().set("reason", "spam"))
            .await
            .unwrap();
        assert!(sub.recv().await.unwrap().unwrap().exists());

        store.delete(&p).await.unwrap();
        assert!(!sub.recv().await.unwrap().unwrap().exists());

        assert_eq!(store.listener_count(), 1);
        drop(sub);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn injected_faults() {
        let store = MemoryStore::new();
        store.fail(StoreOp::Commit, "chat", StoreError::PermissionDenied);

        let err = store
            .set(&path("chat", "a"), Fields::new().set("text", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PermissionDenied);

        // Other collections unaffected.
        store
            .set(&path("users", "a"), Fields::new().set("username", "x"))
            .await
            .unwrap();

        store.fail(StoreOp::Get, ANY_COLLECTION, StoreError::Unavailable);
        assert_eq!(
            store.get(&path("users", "a")).await.unwrap_err(),
            StoreError::Unavailable
        );

        store.clear_faults();
        assert!(store.get(&path("users", "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn emitted_errors_reach_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.watch_query(&Query::collection("chat")).await;
        let _ = sub.recv().await;

        store.emit_error("chat", StoreError::Unavailable);
        assert_eq!(sub.recv().await.unwrap().unwrap_err(), StoreError::Unavailable);
    }
}
