//! In-process document store.
//!
//! [`MemoryDriver`] emulates the observable behaviour of a chosen backend
//! flavour closely enough for the persistence template to run unchanged:
//!
//! - Couchbase reports a missing key as an error with native code 13, keeps a
//!   CAS token per document, scopes collections inside one bucket by `_c`,
//!   and rejects native field merges.
//! - `MongoDB`, SQL Server and `SQLite` report a missing key as `None`.
//!
//! Every connect to the same driver value shares one store, so data survives
//! a close/open cycle the way it would on a server.

use super::{
    Cas, Document, DriverError, DriverResult, FindQuery, NativeDriver, NativeHandle,
    SchemaStatement, project,
};
use crate::config::ConnectionOptions;
use crate::connect::{BackendKind, BackendProfile, ComposedConnection};
use crate::query::{SqlDialect, mongo, n1ql};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Predicate over internal documents.
#[derive(Clone)]
pub struct MemoryFilter(Arc<dyn Fn(&Document) -> bool + Send + Sync>);

impl MemoryFilter {
    /// Wraps a predicate.
    pub fn new(predicate: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Matches documents whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        Self::new(move |doc| doc.get(&field) == Some(&value))
    }

    /// Returns true if the document matches.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        (self.0)(document)
    }
}

impl fmt::Debug for MemoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MemoryFilter(..)")
    }
}

/// Sort order over document fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySort(Vec<(String, bool)>);

impl MemorySort {
    /// Ascending by `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), true)])
    }

    /// Descending by `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), false)])
    }

    /// Adds an ascending tie-breaker.
    #[must_use]
    pub fn then_asc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), true));
        self
    }

    /// Adds a descending tie-breaker.
    #[must_use]
    pub fn then_desc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), false));
        self
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, ascending) in &self.0 {
            let ordering = compare_values(a.get(field), b.get(field));
            let ordering = if *ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

const fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[derive(Debug, Clone)]
struct Row {
    document: Document,
    cas: Cas,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, Row>>>,
    namespaces: RwLock<HashSet<String>>,
    schema_log: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl MemoryStore {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, Row>>> {
        self.tables.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Memory store lock was poisoned, recovering");
            metrics::counter!("memory_store_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, Row>>> {
        self.tables.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Memory store lock was poisoned, recovering");
            metrics::counter!("memory_store_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }

    fn schema_log(&self) -> MutexGuard<'_, Vec<String>> {
        self.schema_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// In-memory [`NativeDriver`] emulating one backend flavour.
///
/// # Example
///
/// ```rust,ignore
/// use pipconnect::driver::MemoryDriver;
/// use pipconnect::BackendKind;
///
/// let driver = MemoryDriver::new(BackendKind::Couchbase).with_namespace("test");
/// driver.set_unreachable(true); // next connect fails
/// ```
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    kind: BackendKind,
    store: Arc<MemoryStore>,
    unreachable: Arc<AtomicBool>,
    fail_close: bool,
    connect_delay: Duration,
    connects: Arc<AtomicUsize>,
}

impl MemoryDriver {
    /// Creates a driver emulating `kind`.
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            store: Arc::new(MemoryStore::default()),
            unreachable: Arc::new(AtomicBool::new(false)),
            fail_close: false,
            connect_delay: Duration::ZERO,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pre-creates a namespace (bucket).
    #[must_use]
    pub fn with_namespace(self, name: impl Into<String>) -> Self {
        self.store
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into());
        self
    }

    /// Delays every connect, to exercise connect timeouts.
    #[must_use]
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Makes every handle fail to close.
    #[must_use]
    pub const fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Simulates an unreachable server for subsequent connects.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, AtomicOrdering::SeqCst);
    }

    /// Returns how many connects succeeded.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    /// Returns true if the namespace exists.
    #[must_use]
    pub fn has_namespace(&self, name: &str) -> bool {
        self.store
            .namespaces
            .read()
            .map(|n| n.contains(name))
            .unwrap_or(false)
    }

    /// Returns the schema statements executed so far, in native form.
    #[must_use]
    pub fn executed_schema(&self) -> Vec<String> {
        self.store.schema_log().clone()
    }
}

#[async_trait]
impl NativeDriver for MemoryDriver {
    type Handle = MemoryHandle;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(
        &self,
        connection: &ComposedConnection,
        _options: &ConnectionOptions,
    ) -> DriverResult<Self::Handle> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(DriverError::connection(
                self.name(),
                format!("connection refused: {}", connection.redacted_uri()),
            ));
        }

        self.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemoryHandle {
            profile: self.kind.profile(),
            store: Arc::clone(&self.store),
            namespace: connection.database().map(ToString::to_string),
            closed: AtomicBool::new(false),
            fail_close: self.fail_close,
        })
    }
}

/// Handle to the in-memory store.
#[derive(Debug)]
pub struct MemoryHandle {
    profile: &'static BackendProfile,
    store: Arc<MemoryStore>,
    namespace: Option<String>,
    closed: AtomicBool,
    fail_close: bool,
}

impl MemoryHandle {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            Err(DriverError::connection(self.profile.name, "handle is closed"))
        } else {
            Ok(())
        }
    }

    const fn is_couchbase(&self) -> bool {
        matches!(self.profile.kind, BackendKind::Couchbase)
    }

    fn bucket(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }

    /// Store table and collection tag for a persistence table.
    fn scope(&self, table: &str) -> (String, Option<String>) {
        if self.is_couchbase() {
            (self.bucket().to_string(), Some(table.to_string()))
        } else {
            match self.namespace.as_deref() {
                Some(ns) => (format!("{ns}.{table}"), None),
                None => (table.to_string(), None),
            }
        }
    }

    fn in_scope(document: &Document, tag: Option<&str>) -> bool {
        tag.is_none_or(|tag| {
            document.get(n1ql::COLLECTION_FIELD).and_then(Value::as_str) == Some(tag)
        })
    }

    fn miss<T>(&self, key: &str) -> DriverResult<Option<T>> {
        if self.is_couchbase() {
            Err(DriverError::from_couchbase_code(
                super::COUCHBASE_KEY_NOT_FOUND,
                format!("document not found: {key}"),
            ))
        } else {
            Ok(None)
        }
    }

    fn matching<'a>(
        rows: &'a HashMap<String, Row>,
        tag: Option<&'a str>,
        filter: Option<&'a MemoryFilter>,
    ) -> impl Iterator<Item = (&'a String, &'a Row)> + 'a {
        rows.iter().filter(move |(_, row)| {
            Self::in_scope(&row.document, tag) && filter.is_none_or(|f| f.matches(&row.document))
        })
    }

    fn render_schema(&self, table: &str, statement: &SchemaStatement) -> String {
        match (self.profile.kind, statement) {
            (_, SchemaStatement::Raw(raw)) => raw.clone(),
            (BackendKind::Couchbase, _) => n1ql::create_primary_index(self.bucket()),
            (BackendKind::MongoDb, SchemaStatement::Table) => format!("{{\"create\":\"{table}\"}}"),
            (BackendKind::MongoDb, SchemaStatement::Index { name, keys, unique }) => {
                mongo::create_index(table, name, keys, *unique).to_string()
            },
            (kind, SchemaStatement::Table) => dialect(kind).create_json_table(table),
            (kind, SchemaStatement::Index { name, keys, unique }) => {
                dialect(kind).create_json_index(table, name, keys, *unique)
            },
        }
    }

    fn trace_find(&self, table: &str, query: &FindQuery<MemoryFilter, MemorySort>) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let projection = query.projection.as_deref();
        let statement = match self.profile.kind {
            BackendKind::Couchbase => n1ql::select(
                self.bucket(),
                Some(table),
                None,
                None,
                query.skip,
                query.limit,
                projection,
            ),
            BackendKind::MongoDb => {
                mongo::find(table, None, None, query.skip, query.limit, projection).to_string()
            },
            kind => dialect(kind).select(table, None, None, query.skip, query.limit),
        };
        tracing::trace!(
            driver = self.profile.name,
            statement = %statement,
            filtered = query.filter.is_some(),
            sorted = query.sort.is_some(),
            "Native find"
        );
    }
}

const fn dialect(kind: BackendKind) -> SqlDialect {
    match kind {
        BackendKind::SqlServer => SqlDialect::SqlServer,
        _ => SqlDialect::Sqlite,
    }
}

#[async_trait]
impl NativeHandle for MemoryHandle {
    type Filter = MemoryFilter;
    type Sort = MemorySort;

    async fn close(&self) -> DriverResult<()> {
        if self.fail_close {
            return Err(DriverError::connection(self.profile.name, "close failed"));
        }
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn create_namespace(&self, name: &str) -> DriverResult<()> {
        self.ensure_open()?;
        if !self.is_couchbase() {
            return Ok(());
        }
        let mut namespaces = self
            .store
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if namespaces.insert(name.to_string()) {
            Ok(())
        } else {
            Err(DriverError::already_exists(
                self.profile.name,
                format!("bucket {name} already exists"),
            ))
        }
    }

    async fn create_primary_index(&self, namespace: &str) -> DriverResult<()> {
        self.ensure_open()?;
        if self.is_couchbase() {
            self.store
                .schema_log()
                .push(n1ql::create_primary_index(namespace));
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> DriverResult<bool> {
        self.ensure_open()?;
        let (store_table, _) = self.scope(table);
        Ok(self.store.read().contains_key(&store_table))
    }

    async fn execute_schema(&self, table: &str, statement: &SchemaStatement) -> DriverResult<()> {
        self.ensure_open()?;
        let rendered = self.render_schema(table, statement);
        tracing::trace!(driver = self.profile.name, statement = %rendered, "Native schema");
        if matches!(statement, SchemaStatement::Table) {
            let (store_table, _) = self.scope(table);
            self.store.write().entry(store_table).or_default();
        }
        self.store.schema_log().push(rendered);
        Ok(())
    }

    async fn find(
        &self,
        table: &str,
        query: &FindQuery<MemoryFilter, MemorySort>,
    ) -> DriverResult<Vec<Document>> {
        self.ensure_open()?;
        self.trace_find(table, query);
        let (store_table, tag) = self.scope(table);

        let mut rows: Vec<Row> = {
            let tables = self.store.read();
            let Some(rows) = tables.get(&store_table) else {
                return Ok(Vec::new());
            };
            Self::matching(rows, tag.as_deref(), query.filter.as_ref())
                .map(|(_, row)| row.clone())
                .collect()
        };

        rows.sort_by_key(|row| row.seq);
        if let Some(sort) = &query.sort {
            rows.sort_by(|a, b| sort.compare(&a.document, &b.document));
        }

        let skip = usize::try_from(query.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let take = query
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let documents = rows.into_iter().skip(skip).take(take).map(|row| {
            match &query.projection {
                Some(fields) => project(row.document, fields, self.profile.id_field),
                None => row.document,
            }
        });

        if self.is_couchbase() && query.projection.is_none() {
            // Native SELECT * rows arrive nested under the bucket name.
            let bucket = self.bucket();
            let nested = documents
                .map(|doc| serde_json::json!({ bucket: doc }))
                .collect();
            return Ok(n1ql::unwrap_rows(bucket, nested));
        }
        Ok(documents.collect())
    }

    async fn count(&self, table: &str, filter: Option<&MemoryFilter>) -> DriverResult<u64> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let tables = self.store.read();
        let count = tables.get(&store_table).map_or(0, |rows| {
            Self::matching(rows, tag.as_deref(), filter).count()
        });
        Ok(count as u64)
    }

    async fn delete_where(&self, table: &str, filter: Option<&MemoryFilter>) -> DriverResult<u64> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let mut tables = self.store.write();
        let Some(rows) = tables.get_mut(&store_table) else {
            return Ok(0);
        };
        let keys: Vec<String> = Self::matching(rows, tag.as_deref(), filter)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            rows.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn get(&self, table: &str, key: &str) -> DriverResult<Option<(Document, Cas)>> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let found = self
            .store
            .read()
            .get(&store_table)
            .and_then(|rows| rows.get(key))
            .filter(|row| Self::in_scope(&row.document, tag.as_deref()))
            .map(|row| (row.document.clone(), row.cas));
        match found {
            Some(found) => Ok(Some(found)),
            None => self.miss(key),
        }
    }

    async fn get_many(
        &self,
        table: &str,
        keys: &[String],
    ) -> DriverResult<Vec<DriverResult<Document>>> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let tables = self.store.read();
        let rows = tables.get(&store_table);

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let found = rows
                .and_then(|rows| rows.get(key))
                .filter(|row| Self::in_scope(&row.document, tag.as_deref()));
            match found {
                Some(row) => results.push(Ok(row.document.clone())),
                None => {
                    if let Err(e) = self.miss::<()>(key) {
                        results.push(Err(e));
                    }
                },
            }
        }
        Ok(results)
    }

    async fn insert(
        &self,
        table: &str,
        key: Option<&str>,
        mut document: Document,
    ) -> DriverResult<Document> {
        self.ensure_open()?;
        let key = key.map_or_else(|| uuid::Uuid::new_v4().simple().to_string(), ToString::to_string);
        document
            .entry(self.profile.id_field)
            .or_insert_with(|| Value::String(key.clone()));

        let (store_table, _) = self.scope(table);
        let mut tables = self.store.write();
        let rows = tables.entry(store_table).or_default();
        if rows.contains_key(&key) {
            let message = format!("document already exists: {key}");
            return Err(if self.is_couchbase() {
                DriverError::from_couchbase_code(super::COUCHBASE_KEY_EXISTS, message)
            } else {
                DriverError::already_exists(self.profile.name, message)
            });
        }
        let seq = self.store.next();
        rows.insert(
            key,
            Row {
                document: document.clone(),
                cas: seq,
                seq,
            },
        );
        Ok(document)
    }

    async fn upsert(&self, table: &str, key: &str, document: Document) -> DriverResult<Document> {
        self.ensure_open()?;
        let (store_table, _) = self.scope(table);
        let next = self.store.next();
        let mut tables = self.store.write();
        let rows = tables.entry(store_table).or_default();
        let seq = rows.get(key).map_or(next, |row| row.seq);
        rows.insert(
            key.to_string(),
            Row {
                document: document.clone(),
                cas: next,
                seq,
            },
        );
        Ok(document)
    }

    async fn replace(
        &self,
        table: &str,
        key: &str,
        document: Document,
        cas: Option<Cas>,
    ) -> DriverResult<Option<Document>> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let next = self.store.next();
        let mut tables = self.store.write();
        let row = tables
            .get_mut(&store_table)
            .and_then(|rows| rows.get_mut(key))
            .filter(|row| Self::in_scope(&row.document, tag.as_deref()));
        let Some(row) = row else {
            return self.miss(key);
        };
        if let Some(expected) = cas
            && row.cas != expected
        {
            return Err(DriverError::cas_mismatch(
                self.profile.name,
                format!("document {key} was modified concurrently"),
            ));
        }
        row.document = document.clone();
        row.cas = next;
        Ok(Some(document))
    }

    async fn merge_fields(
        &self,
        table: &str,
        key: &str,
        fields: Document,
    ) -> DriverResult<Option<Document>> {
        self.ensure_open()?;
        if self.is_couchbase() {
            return Err(DriverError::other(
                self.profile.name,
                "field merge is not supported; use read-modify-write",
            ));
        }
        let (store_table, _) = self.scope(table);
        let next = self.store.next();
        let mut tables = self.store.write();
        let Some(row) = tables.get_mut(&store_table).and_then(|rows| rows.get_mut(key)) else {
            return self.miss(key);
        };
        for (field, value) in fields {
            row.document.insert(field, value);
        }
        row.cas = next;
        Ok(Some(row.document.clone()))
    }

    async fn remove(&self, table: &str, key: &str) -> DriverResult<Option<Document>> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let mut tables = self.store.write();
        let removed = tables.get_mut(&store_table).and_then(|rows| {
            let in_scope = rows
                .get(key)
                .is_some_and(|row| Self::in_scope(&row.document, tag.as_deref()));
            if in_scope { rows.remove(key) } else { None }
        });
        match removed {
            Some(row) => Ok(Some(row.document)),
            None => self.miss(key),
        }
    }

    async fn remove_many(&self, table: &str, keys: &[String]) -> DriverResult<()> {
        self.ensure_open()?;
        let (store_table, tag) = self.scope(table);
        let mut tables = self.store.write();
        if let Some(rows) = tables.get_mut(&store_table) {
            rows.retain(|key, row| {
                !(keys.contains(key) && Self::in_scope(&row.document, tag.as_deref()))
            });
        }
        Ok(())
    }

    async fn clear(&self, table: &str) -> DriverResult<()> {
        self.delete_where(table, None).await.map(|_| ())
    }
}
