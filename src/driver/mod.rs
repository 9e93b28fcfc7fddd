//! Native driver interface.
//!
//! The persistence template is written once against [`NativeDriver`] and
//! [`NativeHandle`]. A driver turns a [`ComposedConnection`] into a handle;
//! the handle exposes the narrow set of data-access calls the template needs.
//!
//! Filters and sort orders are associated types of the handle. The generic
//! layer passes them through untouched, so each backend keeps its own query
//! language (a closure for the in-memory store, a `WHERE` fragment for SQL).
//!
//! Documents cross this boundary in their *internal* shape: the id field may
//! be renamed (`_id`) and bookkeeping fields (`_c`) may be present.

mod memory;
mod sqlite;

pub use memory::{MemoryDriver, MemoryFilter, MemoryHandle, MemorySort};
pub use sqlite::{SqliteDriver, SqliteHandle};

use crate::config::ConnectionOptions;
use crate::connect::{BackendKind, ComposedConnection};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error as ThisError;

/// A JSON document in internal shape.
pub type Document = serde_json::Map<String, Value>;

/// Compare-and-swap token returned with point reads.
pub type Cas = u64;

/// Couchbase native code for "key not found".
pub const COUCHBASE_KEY_NOT_FOUND: i64 = 13;

/// Couchbase native code for "key already exists".
pub const COUCHBASE_KEY_EXISTS: i64 = 12;

/// Result type for native driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Classification of a native error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The key, row or namespace does not exist.
    NotFound,
    /// The key or namespace already exists.
    AlreadyExists,
    /// A conditional write lost against a concurrent writer.
    CasMismatch,
    /// The server could not be reached or the handle is closed.
    Connection,
    /// Anything else.
    Other,
}

/// An error reported by a native driver.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{driver}: {message}")]
pub struct DriverError {
    /// Classification.
    pub kind: DriverErrorKind,
    /// Native numeric code, when the driver reports one.
    pub code: Option<i64>,
    /// Native message.
    pub message: String,
    /// Driver name.
    pub driver: String,
}

impl DriverError {
    /// Creates an error of the given kind.
    pub fn new(kind: DriverErrorKind, driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            driver: driver.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::NotFound, driver, message)
    }

    /// Creates an already-exists error.
    pub fn already_exists(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::AlreadyExists, driver, message)
    }

    /// Creates a CAS mismatch error.
    pub fn cas_mismatch(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::CasMismatch, driver, message)
    }

    /// Creates a connection error.
    pub fn connection(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, driver, message)
    }

    /// Creates an unclassified error.
    pub fn other(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, driver, message)
    }

    /// Creates an error from a Couchbase status code.
    pub fn from_couchbase_code(code: i64, message: impl Into<String>) -> Self {
        let kind = match code {
            COUCHBASE_KEY_NOT_FOUND => DriverErrorKind::NotFound,
            COUCHBASE_KEY_EXISTS => DriverErrorKind::AlreadyExists,
            _ => DriverErrorKind::Other,
        };
        Self::new(kind, "couchbase", message).with_code(code)
    }

    /// Attaches a native code.
    #[must_use]
    pub const fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Returns true for not-found errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == DriverErrorKind::NotFound
    }

    /// Returns true if this is a not-found error or carries `native_code`.
    #[must_use]
    pub fn is_not_found_code(&self, native_code: Option<i64>) -> bool {
        self.is_not_found() || (native_code.is_some() && self.code == native_code)
    }
}

/// DDL queued by a persistence and executed on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatement {
    /// The JSON-mode table (`id`, `data`) for the persistence.
    Table,
    /// An index over JSON fields.
    Index {
        /// Index name.
        name: String,
        /// Indexed fields with their direction (`true` = ascending).
        keys: Vec<(String, bool)>,
        /// Whether the index is unique.
        unique: bool,
    },
    /// A raw native statement.
    Raw(String),
}

/// A filtered, sorted, paged read.
#[derive(Clone)]
pub struct FindQuery<F, S> {
    /// Native filter.
    pub filter: Option<F>,
    /// Native sort.
    pub sort: Option<S>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Maximum rows to return.
    pub limit: Option<u64>,
    /// Fields to keep; `None` keeps the whole document.
    pub projection: Option<Vec<String>>,
}

impl<F, S> Default for FindQuery<F, S> {
    fn default() -> Self {
        Self {
            filter: None,
            sort: None,
            skip: None,
            limit: None,
            projection: None,
        }
    }
}

impl<F: fmt::Debug, S: fmt::Debug> fmt::Debug for FindQuery<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindQuery")
            .field("filter", &self.filter)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("projection", &self.projection)
            .finish()
    }
}

/// Opens native handles.
#[async_trait]
pub trait NativeDriver: Send + Sync + 'static {
    /// The open handle type.
    type Handle: NativeHandle;

    /// Returns the backend this driver speaks to.
    fn kind(&self) -> BackendKind;

    /// Returns the driver name used in logs.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Connects to the server described by `connection`.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the server is unreachable or rejects the
    /// connection.
    async fn connect(
        &self,
        connection: &ComposedConnection,
        options: &ConnectionOptions,
    ) -> DriverResult<Self::Handle>;
}

/// An open native handle.
///
/// `table` is the collection, table or (for Couchbase) the collection tag
/// value; `key` is the string form of the entity id.
///
/// Point operations report a missing key either as `Ok(None)` or as a
/// not-found [`DriverError`], depending on what the native driver does.
/// Callers treat both the same way.
#[async_trait]
pub trait NativeHandle: Send + Sync + 'static {
    /// Native filter fragment.
    type Filter: Clone + fmt::Debug + Send + Sync + 'static;
    /// Native sort fragment.
    type Sort: Clone + fmt::Debug + Send + Sync + 'static;

    /// Releases the handle.
    async fn close(&self) -> DriverResult<()>;

    /// Creates a namespace (bucket).
    async fn create_namespace(&self, _name: &str) -> DriverResult<()> {
        Ok(())
    }

    /// Creates the primary index of a namespace.
    async fn create_primary_index(&self, _namespace: &str) -> DriverResult<()> {
        Ok(())
    }

    /// Returns true if the table exists.
    async fn table_exists(&self, table: &str) -> DriverResult<bool>;

    /// Executes one schema statement for `table`.
    async fn execute_schema(&self, table: &str, statement: &SchemaStatement) -> DriverResult<()>;

    /// Runs a filtered, sorted, paged read.
    async fn find(
        &self,
        table: &str,
        query: &FindQuery<Self::Filter, Self::Sort>,
    ) -> DriverResult<Vec<Document>>;

    /// Counts matching rows.
    async fn count(&self, table: &str, filter: Option<&Self::Filter>) -> DriverResult<u64>;

    /// Deletes matching rows and returns how many were removed.
    async fn delete_where(&self, table: &str, filter: Option<&Self::Filter>) -> DriverResult<u64>;

    /// Reads one document with its CAS token.
    async fn get(&self, table: &str, key: &str) -> DriverResult<Option<(Document, Cas)>>;

    /// Reads several documents, one result per requested key that the driver reports.
    async fn get_many(&self, table: &str, keys: &[String])
    -> DriverResult<Vec<DriverResult<Document>>>;

    /// Inserts a document; a missing key is generated natively.
    async fn insert(&self, table: &str, key: Option<&str>, document: Document)
    -> DriverResult<Document>;

    /// Inserts or replaces a document.
    async fn upsert(&self, table: &str, key: &str, document: Document) -> DriverResult<Document>;

    /// Replaces an existing document, conditioned on `cas` when given.
    async fn replace(
        &self,
        table: &str,
        key: &str,
        document: Document,
        cas: Option<Cas>,
    ) -> DriverResult<Option<Document>>;

    /// Merges top-level fields into an existing document.
    async fn merge_fields(
        &self,
        table: &str,
        key: &str,
        fields: Document,
    ) -> DriverResult<Option<Document>>;

    /// Removes a document and returns it.
    async fn remove(&self, table: &str, key: &str) -> DriverResult<Option<Document>>;

    /// Removes several documents; missing keys are ignored.
    async fn remove_many(&self, table: &str, keys: &[String]) -> DriverResult<()>;

    /// Removes every document of the table.
    async fn clear(&self, table: &str) -> DriverResult<()>;
}

/// Keeps only `fields` (and the id field) of a document.
#[must_use]
pub fn project(document: Document, fields: &[String], id_field: &str) -> Document {
    document
        .into_iter()
        .filter(|(k, _)| k == id_field || fields.iter().any(|f| f == k))
        .collect()
}
