//! `SQLite` driver for JSON-mode tables.
//!
//! Each persistence table has an `id` key column and a `data` column holding
//! the whole entity as JSON. Filters are `WHERE` fragments and sort orders are
//! `ORDER BY` fragments, typically built from
//! [`SqlDialect::json_field`](crate::query::SqlDialect::json_field).
//!
//! # Concurrency Model
//!
//! Uses an `Arc<Mutex<Connection>>`. Every statement runs inside
//! [`tokio::task::spawn_blocking`], so a slow file-backed query never stalls
//! the async executor. The lock is never held across an await point.

use super::{
    Cas, Document, DriverError, DriverResult, FindQuery, NativeDriver, NativeHandle,
    SchemaStatement, project,
};
use crate::config::ConnectionOptions;
use crate::connect::{BackendKind, ComposedConnection};
use crate::query::SqlDialect;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DIALECT: SqlDialect = SqlDialect::Sqlite;
const DRIVER: &str = "sqlite";

/// In-memory database name.
pub const IN_MEMORY: &str = ":memory:";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

fn map_error(err: rusqlite::Error) -> DriverError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => {
            DriverError::already_exists(DRIVER, err.to_string())
        },
        Some(rusqlite::ErrorCode::CannotOpen) => DriverError::connection(DRIVER, err.to_string()),
        _ => DriverError::other(DRIVER, err.to_string()),
    }
}

fn map_json_error(err: &serde_json::Error) -> DriverError {
    DriverError::other(DRIVER, format!("invalid JSON document: {err}"))
}

fn map_join_error(err: &tokio::task::JoinError) -> DriverError {
    DriverError::other(DRIVER, format!("blocking task failed: {err}"))
}

fn parse_document(data: &str) -> DriverResult<Document> {
    match serde_json::from_str::<Value>(data).map_err(|e| map_json_error(&e))? {
        Value::Object(document) => Ok(document),
        other => Err(DriverError::other(
            DRIVER,
            format!("expected a JSON object, got {other}"),
        )),
    }
}

/// Applies pragmas for concurrent access.
fn configure_connection(conn: &Connection, busy_timeout: Duration) {
    // journal_mode returns a row, so the results are ignored
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", busy_timeout.as_millis().to_string());
}

fn lock(conn: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("SQLite mutex was poisoned, recovering");
        metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
        poisoned.into_inner()
    })
}

/// [`NativeDriver`] over an embedded `SQLite` database.
///
/// The database file is the composed connection's database name; `:memory:`
/// or no name opens a private in-memory database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    /// Creates the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NativeDriver for SqliteDriver {
    type Handle = SqliteHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn connect(
        &self,
        connection: &ComposedConnection,
        options: &ConnectionOptions,
    ) -> DriverResult<Self::Handle> {
        let path = connection.database().map(ToString::to_string);
        let busy_timeout = options.connect_timeout;
        let conn = tokio::task::spawn_blocking(move || {
            let conn = match path.as_deref() {
                None | Some(IN_MEMORY) => Connection::open_in_memory(),
                Some(path) => Connection::open(path),
            }
            .map_err(|e| DriverError::connection(DRIVER, e.to_string()))?;
            configure_connection(&conn, busy_timeout);
            Ok::<_, DriverError>(conn)
        })
        .await
        .map_err(|e| map_join_error(&e))??;

        Ok(SqliteHandle {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

/// Open `SQLite` connection.
#[derive(Debug)]
pub struct SqliteHandle {
    conn: SharedConnection,
}

impl SqliteHandle {
    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> DriverResult<T>
    where
        F: FnOnce(&Connection) -> DriverResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn);
            let conn = guard
                .as_ref()
                .ok_or_else(|| DriverError::connection(DRIVER, "handle is closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| map_join_error(&e))?
    }

    fn select_one(conn: &Connection, table: &str, key: &str) -> DriverResult<Option<Document>> {
        let data: Option<String> = conn
            .query_row(&DIALECT.select_by_id(table), [key], |row| row.get(0))
            .optional()
            .map_err(map_error)?;
        data.as_deref().map(parse_document).transpose()
    }

    fn select_many(conn: &Connection, sql: &str, params: &[String]) -> DriverResult<Vec<Document>> {
        let mut stmt = conn.prepare(sql).map_err(map_error)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))
            .map_err(map_error)?;
        rows.map(|data| parse_document(&data.map_err(map_error)?))
            .collect()
    }

    fn encode(document: &Document) -> DriverResult<String> {
        serde_json::to_string(document).map_err(|e| map_json_error(&e))
    }
}

#[async_trait]
impl NativeHandle for SqliteHandle {
    type Filter = String;
    type Sort = String;

    async fn close(&self) -> DriverResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || match lock(&conn).take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| DriverError::connection(DRIVER, e.to_string())),
            None => Ok(()),
        })
        .await
        .map_err(|e| map_join_error(&e))?
    }

    async fn table_exists(&self, table: &str) -> DriverResult<bool> {
        let sql = DIALECT.table_exists(table);
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(map_error)?;
            Ok(count > 0)
        })
        .await
    }

    async fn execute_schema(&self, table: &str, statement: &SchemaStatement) -> DriverResult<()> {
        let sql = match statement {
            SchemaStatement::Table => DIALECT.create_json_table(table),
            SchemaStatement::Index { name, keys, unique } => {
                DIALECT.create_json_index(table, name, keys, *unique)
            },
            SchemaStatement::Raw(raw) => raw.clone(),
        };
        tracing::trace!(driver = DRIVER, statement = %sql, "Native schema");
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(map_error))
            .await
    }

    async fn find(
        &self,
        table: &str,
        query: &FindQuery<String, String>,
    ) -> DriverResult<Vec<Document>> {
        let sql = DIALECT.select(
            table,
            query.filter.as_deref(),
            query.sort.as_deref(),
            query.skip,
            query.limit,
        );
        tracing::trace!(driver = DRIVER, statement = %sql, "Native find");
        let documents = self
            .with_conn(move |conn| Self::select_many(conn, &sql, &[]))
            .await?;
        Ok(match &query.projection {
            Some(fields) => documents
                .into_iter()
                .map(|doc| project(doc, fields, "id"))
                .collect(),
            None => documents,
        })
    }

    async fn count(&self, table: &str, filter: Option<&String>) -> DriverResult<u64> {
        let sql = DIALECT.count(table, filter.map(String::as_str));
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(map_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn delete_where(&self, table: &str, filter: Option<&String>) -> DriverResult<u64> {
        let sql = DIALECT.delete(table, filter.map(String::as_str));
        self.with_conn(move |conn| {
            let removed = conn.execute(&sql, []).map_err(map_error)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn get(&self, table: &str, key: &str) -> DriverResult<Option<(Document, Cas)>> {
        let (table, key) = (table.to_string(), key.to_string());
        self.with_conn(move |conn| Ok(Self::select_one(conn, &table, &key)?.map(|doc| (doc, 0))))
            .await
    }

    async fn get_many(
        &self,
        table: &str,
        keys: &[String],
    ) -> DriverResult<Vec<DriverResult<Document>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = DIALECT.select_by_ids(table, keys.len());
        let keys = keys.to_vec();
        let documents = self
            .with_conn(move |conn| Self::select_many(conn, &sql, &keys))
            .await?;
        Ok(documents.into_iter().map(Ok).collect())
    }

    async fn insert(
        &self,
        table: &str,
        key: Option<&str>,
        mut document: Document,
    ) -> DriverResult<Document> {
        let key = key.map_or_else(|| uuid::Uuid::new_v4().simple().to_string(), ToString::to_string);
        document
            .entry("id")
            .or_insert_with(|| Value::String(key.clone()));
        let data = Self::encode(&document)?;
        let sql = DIALECT.insert(table);
        self.with_conn(move |conn| conn.execute(&sql, params![key, data]).map_err(map_error))
            .await?;
        Ok(document)
    }

    async fn upsert(&self, table: &str, key: &str, document: Document) -> DriverResult<Document> {
        let data = Self::encode(&document)?;
        let (sql, key) = (DIALECT.upsert(table), key.to_string());
        self.with_conn(move |conn| conn.execute(&sql, params![key, data]).map_err(map_error))
            .await?;
        Ok(document)
    }

    async fn replace(
        &self,
        table: &str,
        key: &str,
        document: Document,
        _cas: Option<Cas>,
    ) -> DriverResult<Option<Document>> {
        let data = Self::encode(&document)?;
        let (sql, key) = (DIALECT.replace(table), key.to_string());
        let changed = self
            .with_conn(move |conn| conn.execute(&sql, params![key, data]).map_err(map_error))
            .await?;
        Ok((changed > 0).then_some(document))
    }

    async fn merge_fields(
        &self,
        table: &str,
        key: &str,
        fields: Document,
    ) -> DriverResult<Option<Document>> {
        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
        let mut values = vec![key.to_string()];
        for value in fields.values() {
            values.push(serde_json::to_string(value).map_err(|e| map_json_error(&e))?);
        }
        let sql = DIALECT.update_json_fields(table, &names);
        let (table, key) = (table.to_string(), key.to_string());

        self.with_conn(move |conn| {
            let changed = conn
                .execute(&sql, params_from_iter(values.iter()))
                .map_err(map_error)?;
            if changed == 0 {
                return Ok(None);
            }
            Self::select_one(conn, &table, &key)
        })
        .await
    }

    async fn remove(&self, table: &str, key: &str) -> DriverResult<Option<Document>> {
        let (table, key) = (table.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let existing = Self::select_one(conn, &table, &key)?;
            if existing.is_some() {
                conn.execute(&DIALECT.delete_by_id(&table), [&key])
                    .map_err(map_error)?;
            }
            Ok(existing)
        })
        .await
    }

    async fn remove_many(&self, table: &str, keys: &[String]) -> DriverResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let sql = DIALECT.delete_by_ids(table, keys.len());
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            conn.execute(&sql, params_from_iter(keys.iter()))
                .map_err(map_error)
                .map(|_| ())
        })
        .await
    }

    async fn clear(&self, table: &str) -> DriverResult<()> {
        self.delete_where(table, None).await.map(|_| ())
    }
}
