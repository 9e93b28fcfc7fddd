//! Generic paged, filtered persistence.

use super::connection::Connection;
use super::mapping;
use super::metrics::timed;
use super::paging::{DEFAULT_MAX_PAGE_SIZE, DataPage, PagingParams};
use super::references::{CONNECTION, References};
use crate::config::ConfigParams;
use crate::connect::{BackendKind, BackendProfile};
use crate::driver::{DriverResult, FindQuery, NativeDriver, NativeHandle, SchemaStatement};
use crate::{Context, Error, ErrorCode, Result};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Native filter type of a driver.
pub type FilterOf<D> = <<D as NativeDriver>::Handle as NativeHandle>::Filter;

/// Native sort type of a driver.
pub type SortOf<D> = <<D as NativeDriver>::Handle as NativeHandle>::Sort;

type SchemaHook = Box<dyn Fn() -> Vec<SchemaStatement> + Send + Sync>;

/// Generic persistence over one table or collection.
///
/// Filters and sort orders are native fragments passed through to the
/// driver untouched. Rows are converted between the internal document shape
/// and `T`; rows that fail to convert are dropped.
///
/// # Connection ownership
///
/// A persistence either owns a *local* connection (created from its own
/// configuration) or borrows a *shared* one found in [`References`] under
/// `"connection"`. `close` only closes a local connection, so a shared
/// connection outlives every borrower.
///
/// # Schema
///
/// Statements queued with [`ensure_table`](Self::ensure_table),
/// [`ensure_index`](Self::ensure_index) and [`ensure_schema`](Self::ensure_schema)
/// stay queued and run again on every `open`, followed by whatever the
/// [`define_schema`](Self::define_schema) hook returns for that open. SQL
/// backends skip all of them when the table already exists.
pub struct Persistence<D: NativeDriver, T> {
    driver: Option<Arc<D>>,
    profile: &'static BackendProfile,
    config: ConfigParams,
    table_name: Option<String>,
    max_page_size: u64,
    connection: Option<Arc<Connection<D>>>,
    local_connection: bool,
    schema: Vec<SchemaStatement>,
    schema_hook: Option<SchemaHook>,
    opened: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<D, T> Persistence<D, T>
where
    D: NativeDriver,
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a persistence that opens its own connection through `driver`.
    #[must_use]
    pub fn new(driver: D) -> Self {
        let profile = driver.kind().profile();
        Self::build(Some(Arc::new(driver)), profile, None)
    }

    /// Creates a persistence that borrows `connection`.
    #[must_use]
    pub fn with_connection(connection: Arc<Connection<D>>) -> Self {
        let profile = connection.profile();
        Self::build(None, profile, Some(connection))
    }

    /// Creates a persistence that must receive its connection through
    /// [`set_references`](Self::set_references) before it can open.
    #[must_use]
    pub fn unbound(kind: BackendKind) -> Self {
        Self::build(None, kind.profile(), None)
    }

    fn build(
        driver: Option<Arc<D>>,
        profile: &'static BackendProfile,
        connection: Option<Arc<Connection<D>>>,
    ) -> Self {
        Self {
            driver,
            profile,
            config: ConfigParams::new(),
            table_name: None,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            connection,
            local_connection: false,
            schema: Vec::new(),
            schema_hook: None,
            opened: false,
            _entity: PhantomData,
        }
    }

    /// Reads `collection` (or `table`) and `options.max_page_size`, and keeps
    /// the rest for a local connection.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.config = config.clone();
        if let Some(table) = config
            .get_as_string("collection")
            .or_else(|| config.get_as_string("table"))
        {
            self.table_name = Some(table);
        }
        self.max_page_size = config
            .get_as_u64_or("options.max_page_size", self.max_page_size)
            .max(1);

        // A local connection picks up the new configuration on next open.
        if self.local_connection && !self.opened {
            self.connection = None;
            self.local_connection = false;
        }
    }

    /// Borrows the shared connection from `references`, or falls back to a
    /// local connection.
    pub fn set_references(&mut self, references: &References) {
        if let Some(shared) = references.get_one_optional::<Connection<D>>(CONNECTION) {
            self.connection = Some(shared);
            self.local_connection = false;
        } else if self.connection.is_none() {
            self.create_local_connection();
        }
    }

    fn create_local_connection(&mut self) {
        if let Some(driver) = &self.driver {
            let mut connection = Connection::from_shared_driver(Arc::clone(driver));
            connection.configure(&self.config);
            self.connection = Some(Arc::new(connection));
            self.local_connection = true;
        }
    }

    /// Sets a hook that returns schema statements, called on every `open`.
    pub fn define_schema<F>(&mut self, hook: F)
    where
        F: Fn() -> Vec<SchemaStatement> + Send + Sync + 'static,
    {
        self.schema_hook = Some(Box::new(hook));
    }

    /// Queues creation of the JSON-mode table. Re-runs on every `open`.
    pub fn ensure_table(&mut self) {
        self.schema.push(SchemaStatement::Table);
    }

    /// Queues creation of an index over fields (`true` = ascending).
    pub fn ensure_index(&mut self, name: impl Into<String>, keys: &[(&str, bool)], unique: bool) {
        self.schema.push(SchemaStatement::Index {
            name: name.into(),
            keys: keys.iter().map(|(k, asc)| ((*k).to_string(), *asc)).collect(),
            unique,
        });
    }

    /// Queues a raw native schema statement.
    pub fn ensure_schema(&mut self, statement: impl Into<String>) {
        self.schema.push(SchemaStatement::Raw(statement.into()));
    }

    /// Drops every queued schema statement and the schema hook.
    pub fn clear_schema(&mut self) {
        self.schema.clear();
        self.schema_hook = None;
    }

    /// Opens the persistence.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] with `NO_CONNECTION` if there is no connection
    /// - [`Error::Connection`] with `CONNECT_FAILED` if a borrowed connection
    ///   is not open, or a local one fails to open
    /// - [`Error::Driver`] if schema setup fails
    pub async fn open(&mut self, ctx: &Context) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        if self.connection.is_none() {
            self.create_local_connection();
        }
        let Some(connection) = self.connection.clone() else {
            return Err(Error::invalid_state(
                ErrorCode::NoConnection,
                format!("{} connection is missing", self.profile.name),
            ));
        };

        if self.local_connection {
            connection.open(ctx).await?;
        }
        if !connection.is_open() {
            return Err(Error::connection(
                ErrorCode::ConnectFailed,
                format!("{} connection is not opened", self.profile.name),
                None,
            ));
        }

        self.create_schema(&connection, ctx).await?;
        self.opened = true;

        tracing::debug!(
            backend = self.profile.name,
            table = self.table_name.as_deref().unwrap_or(""),
            local = self.local_connection,
            trace_id = ctx.trace_id_or_empty(),
            "Opened persistence"
        );
        Ok(())
    }

    async fn create_schema(&self, connection: &Connection<D>, ctx: &Context) -> Result<()> {
        let mut statements = self.schema.clone();
        if let Some(hook) = &self.schema_hook {
            statements.extend(hook());
        }
        if statements.is_empty() {
            return Ok(());
        }
        let table = self.table()?;
        let handle = connection.handle().ok_or_else(|| not_opened(self.profile))?;

        if self.profile.skip_schema_if_table_exists && handle.table_exists(table).await? {
            tracing::trace!(
                backend = self.profile.name,
                table,
                trace_id = ctx.trace_id_or_empty(),
                "Table already exists, skipping schema"
            );
            return Ok(());
        }

        for statement in &statements {
            handle.execute_schema(table, statement).await?;
        }
        tracing::debug!(
            backend = self.profile.name,
            table,
            statements = statements.len(),
            trace_id = ctx.trace_id_or_empty(),
            "Created schema"
        );
        Ok(())
    }

    /// Closes the persistence, and its connection if local.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] with `DISCONNECT_FAILED` if a local
    /// connection fails to close.
    pub async fn close(&mut self, ctx: &Context) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        if self.local_connection
            && let Some(connection) = &self.connection
        {
            connection.close(ctx).await?;
        }
        Ok(())
    }

    /// Returns true if opened and the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened && self.connection.as_ref().is_some_and(|c| c.is_open())
    }

    /// Returns the backend profile.
    #[must_use]
    pub const fn profile(&self) -> &'static BackendProfile {
        self.profile
    }

    /// Returns the configured table or collection name.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    /// Sets the table or collection name.
    pub fn set_table_name(&mut self, table: impl Into<String>) {
        self.table_name = Some(table.into());
    }

    /// Returns the page size bound.
    #[must_use]
    pub const fn max_page_size(&self) -> u64 {
        self.max_page_size
    }

    /// Returns the connection, local or shared.
    #[must_use]
    pub const fn connection(&self) -> Option<&Arc<Connection<D>>> {
        self.connection.as_ref()
    }

    /// Returns true if the connection is owned by this persistence.
    #[must_use]
    pub const fn is_local_connection(&self) -> bool {
        self.local_connection
    }

    pub(crate) fn table(&self) -> Result<&str> {
        self.table_name.as_deref().ok_or_else(|| {
            Error::config(
                ErrorCode::NoCollection,
                format!("{} table or collection is not set", self.profile.name),
            )
        })
    }

    pub(crate) fn handle(&self) -> Result<Arc<D::Handle>> {
        self.connection
            .as_ref()
            .and_then(|c| c.handle())
            .ok_or_else(|| not_opened(self.profile))
    }

    pub(crate) fn absent_on_not_found<R>(&self, result: DriverResult<Option<R>>) -> Result<Option<R>> {
        match result {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found_code(self.profile.not_found_code) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn convert(&self, document: crate::driver::Document) -> Option<T> {
        mapping::from_internal(self.profile, document)
    }

    /// Returns one page of matching rows.
    ///
    /// `take` is clamped to the maximum page size. The total is counted only
    /// when `paging.total` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn get_page_by_filter(
        &self,
        ctx: &Context,
        filter: Option<FilterOf<D>>,
        paging: PagingParams,
        sort: Option<SortOf<D>>,
        select: Option<Vec<String>>,
    ) -> Result<DataPage<T>> {
        timed(self.profile.name, "get_page_by_filter", async {
            let table = self.table()?;
            let handle = self.handle()?;
            let query = FindQuery {
                filter,
                sort,
                skip: paging.skip,
                limit: Some(paging.take_clamped(self.max_page_size)),
                projection: select,
            };

            let documents = handle.find(table, &query).await?;
            let data: Vec<T> = documents
                .into_iter()
                .filter_map(|doc| self.convert(doc))
                .collect();

            let total = if paging.total {
                Some(handle.count(table, query.filter.as_ref()).await?)
            } else {
                None
            };

            tracing::trace!(
                backend = self.profile.name,
                table,
                count = data.len(),
                trace_id = ctx.trace_id_or_empty(),
                "Retrieved page"
            );
            Ok(DataPage::new(data, total))
        })
        .await
    }

    /// Counts matching rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn get_count_by_filter(&self, ctx: &Context, filter: Option<FilterOf<D>>) -> Result<u64> {
        timed(self.profile.name, "get_count_by_filter", async {
            let table = self.table()?;
            let count = self.handle()?.count(table, filter.as_ref()).await?;
            tracing::trace!(
                backend = self.profile.name,
                table,
                count,
                trace_id = ctx.trace_id_or_empty(),
                "Counted rows"
            );
            Ok(count)
        })
        .await
    }

    /// Returns every matching row.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn get_list_by_filter(
        &self,
        ctx: &Context,
        filter: Option<FilterOf<D>>,
        sort: Option<SortOf<D>>,
        select: Option<Vec<String>>,
    ) -> Result<Vec<T>> {
        timed(self.profile.name, "get_list_by_filter", async {
            let table = self.table()?;
            let query = FindQuery {
                filter,
                sort,
                projection: select,
                ..FindQuery::default()
            };
            let documents = self.handle()?.find(table, &query).await?;
            let items: Vec<T> = documents
                .into_iter()
                .filter_map(|doc| self.convert(doc))
                .collect();
            tracing::trace!(
                backend = self.profile.name,
                table,
                count = items.len(),
                trace_id = ctx.trace_id_or_empty(),
                "Retrieved list"
            );
            Ok(items)
        })
        .await
    }

    /// Returns one matching row chosen uniformly at random.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn get_one_random(&self, ctx: &Context, filter: Option<FilterOf<D>>) -> Result<Option<T>> {
        timed(self.profile.name, "get_one_random", async {
            let table = self.table()?;
            let handle = self.handle()?;
            let count = handle.count(table, filter.as_ref()).await?;
            if count == 0 {
                return Ok(None);
            }

            let offset = rand::rng().random_range(0..count);
            let query = FindQuery {
                filter,
                skip: Some(offset),
                limit: Some(1),
                ..FindQuery::default()
            };
            let item = handle
                .find(table, &query)
                .await?
                .into_iter()
                .find_map(|doc| self.convert(doc));

            tracing::trace!(
                backend = self.profile.name,
                table,
                offset,
                trace_id = ctx.trace_id_or_empty(),
                "Retrieved random row"
            );
            Ok(item)
        })
        .await
    }

    /// Inserts an item and returns the stored shape.
    ///
    /// An item without an id gets a natively generated key.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open, the item does not
    /// serialize, or the driver fails (for example on a duplicate key).
    pub async fn create(&self, ctx: &Context, item: T) -> Result<T> {
        timed(self.profile.name, "create", async {
            let table = self.table()?;
            let document = mapping::to_internal(self.profile, table, &item)?;
            let key = document.get(self.profile.id_field).and_then(mapping::key_of);

            let stored = self
                .handle()?
                .insert(table, key.as_deref(), document)
                .await?;

            tracing::trace!(
                backend = self.profile.name,
                table,
                id = key.as_deref().unwrap_or(""),
                trace_id = ctx.trace_id_or_empty(),
                "Created item"
            );
            self.convert(stored).ok_or_else(|| conversion_failed("create"))
        })
        .await
    }

    /// Deletes every matching row.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn delete_by_filter(&self, ctx: &Context, filter: Option<FilterOf<D>>) -> Result<()> {
        timed(self.profile.name, "delete_by_filter", async {
            let table = self.table()?;
            let removed = self.handle()?.delete_where(table, filter.as_ref()).await?;
            tracing::trace!(
                backend = self.profile.name,
                table,
                removed,
                trace_id = ctx.trace_id_or_empty(),
                "Deleted rows"
            );
            Ok(())
        })
        .await
    }

    /// Deletes every row of the table.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] with `NO_COLLECTION` if no table is configured
    /// - [`Error::Connection`] with `FLUSH_FAILED` if the driver fails
    pub async fn clear(&self, ctx: &Context) -> Result<()> {
        timed(self.profile.name, "clear", async {
            let table = self.table()?;
            self.handle()?.clear(table).await.map_err(|e| {
                Error::connection(
                    ErrorCode::FlushFailed,
                    format!("Failed to clear {table}"),
                    Some(Box::new(e)),
                )
            })?;
            tracing::debug!(
                backend = self.profile.name,
                table,
                trace_id = ctx.trace_id_or_empty(),
                "Cleared table"
            );
            Ok(())
        })
        .await
    }
}

fn not_opened(profile: &BackendProfile) -> Error {
    Error::invalid_state(
        ErrorCode::NoConnection,
        format!("{} persistence is not opened", profile.name),
    )
}

pub(crate) fn conversion_failed(operation: &str) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: "stored document does not convert to the entity type".to_string(),
    }
}

impl<D: NativeDriver, T> fmt::Debug for Persistence<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("backend", &self.profile.name)
            .field("table", &self.table_name)
            .field("max_page_size", &self.max_page_size)
            .field("local_connection", &self.local_connection)
            .field("opened", &self.opened)
            .field("schema", &self.schema)
            .field("schema_hook", &self.schema_hook.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, MemoryFilter, MemorySort};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dummy {
        id: String,
        key: String,
        content: String,
    }

    fn dummy(id: &str, key: &str) -> Dummy {
        Dummy {
            id: id.into(),
            key: key.into(),
            content: format!("Content {id}"),
        }
    }

    fn mongo_config() -> ConfigParams {
        ConfigParams::from_tuples(&[
            ("collection", "dummies"),
            ("connection.host", "localhost"),
            ("connection.port", "27017"),
            ("connection.database", "test"),
        ])
    }

    async fn opened(driver: MemoryDriver) -> Persistence<MemoryDriver, Dummy> {
        let mut persistence = Persistence::new(driver);
        persistence.configure(&mongo_config());
        persistence.open(&Context::default()).await.unwrap();
        persistence
    }

    #[tokio::test]
    async fn test_page_clamps_take_and_counts_on_request() {
        let mut config = mongo_config();
        config.set("options.max_page_size", "2");
        let mut persistence = Persistence::<_, Dummy>::new(MemoryDriver::new(BackendKind::MongoDb));
        persistence.configure(&config);
        let ctx = Context::default();
        persistence.open(&ctx).await.unwrap();

        for i in 0..5 {
            persistence
                .create(&ctx, dummy(&i.to_string(), "k"))
                .await
                .unwrap();
        }

        let page = persistence
            .get_page_by_filter(&ctx, None, PagingParams::new(None, Some(10), false), None, None)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.total, None);

        let page = persistence
            .get_page_by_filter(&ctx, None, PagingParams::new(Some(4), None, true), None, None)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.total, Some(5));
    }

    #[tokio::test]
    async fn test_filter_and_sort_pass_through() {
        let persistence = opened(MemoryDriver::new(BackendKind::MongoDb)).await;
        let ctx = Context::default();
        for (id, key) in [("1", "a"), ("2", "b"), ("3", "a")] {
            persistence.create(&ctx, dummy(id, key)).await.unwrap();
        }

        let items = persistence
            .get_list_by_filter(
                &ctx,
                Some(MemoryFilter::eq("key", "a")),
                Some(MemorySort::desc("_id")),
                None,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);

        let count = persistence
            .get_count_by_filter(&ctx, Some(MemoryFilter::eq("key", "b")))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_projection_drops_unconvertible_rows() {
        let persistence = opened(MemoryDriver::new(BackendKind::MongoDb)).await;
        let ctx = Context::default();
        persistence.create(&ctx, dummy("1", "a")).await.unwrap();

        let items = persistence
            .get_list_by_filter(&ctx, None, None, Some(vec!["key".to_string()]))
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_get_one_random() {
        let persistence = opened(MemoryDriver::new(BackendKind::MongoDb)).await;
        let ctx = Context::default();
        assert!(persistence.get_one_random(&ctx, None).await.unwrap().is_none());

        persistence.create(&ctx, dummy("1", "a")).await.unwrap();
        persistence.create(&ctx, dummy("2", "b")).await.unwrap();
        let item = persistence
            .get_one_random(&ctx, Some(MemoryFilter::eq("key", "b")))
            .await
            .unwrap();
        assert_eq!(item.map(|d| d.id), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_delete_by_filter_and_clear() {
        let persistence = opened(MemoryDriver::new(BackendKind::MongoDb)).await;
        let ctx = Context::default();
        for (id, key) in [("1", "a"), ("2", "b"), ("3", "a")] {
            persistence.create(&ctx, dummy(id, key)).await.unwrap();
        }

        persistence
            .delete_by_filter(&ctx, Some(MemoryFilter::eq("key", "a")))
            .await
            .unwrap();
        assert_eq!(persistence.get_count_by_filter(&ctx, None).await.unwrap(), 1);

        persistence.clear(&ctx).await.unwrap();
        assert_eq!(persistence.get_count_by_filter(&ctx, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_without_table() {
        let mut persistence = Persistence::<_, Dummy>::new(MemoryDriver::new(BackendKind::MongoDb));
        let mut config = mongo_config();
        config.remove("collection");
        persistence.configure(&config);
        let ctx = Context::default();
        persistence.open(&ctx).await.unwrap();

        let err = persistence.clear(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCollection);
    }

    #[tokio::test]
    async fn test_unbound_open_fails_with_no_connection() {
        let mut persistence = Persistence::<MemoryDriver, Dummy>::unbound(BackendKind::MongoDb);
        persistence.configure(&mongo_config());
        let err = persistence.open(&Context::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoConnection);
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_borrowed_connection_must_be_open() {
        let mut connection = Connection::new(MemoryDriver::new(BackendKind::MongoDb));
        connection.configure(&mongo_config());
        let connection = Arc::new(connection);

        let mut persistence = Persistence::<MemoryDriver, Dummy>::unbound(BackendKind::MongoDb);
        persistence.configure(&mongo_config());
        persistence.set_references(&References::new().with(CONNECTION, Arc::clone(&connection)));

        let err = persistence.open(&Context::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectFailed);

        connection.open(&Context::default()).await.unwrap();
        persistence.open(&Context::default()).await.unwrap();
        assert!(!persistence.is_local_connection());
    }

    #[tokio::test]
    async fn test_operations_before_open_fail() {
        let mut persistence = Persistence::<_, Dummy>::new(MemoryDriver::new(BackendKind::MongoDb));
        persistence.configure(&mongo_config());
        let err = persistence
            .get_count_by_filter(&Context::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoConnection);
    }

    #[tokio::test]
    async fn test_schema_runs_once_per_open() {
        let driver = MemoryDriver::new(BackendKind::MongoDb);
        let mut persistence = Persistence::<_, Dummy>::new(driver.clone());
        persistence.configure(&mongo_config());
        persistence.ensure_index("key_1", &[("key", true)], true);
        let ctx = Context::default();

        persistence.open(&ctx).await.unwrap();
        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 1);

        persistence.close(&ctx).await.unwrap();
        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 2);
    }

    #[tokio::test]
    async fn test_schema_hook_runs_on_every_open() {
        let driver = MemoryDriver::new(BackendKind::MongoDb);
        let mut persistence = Persistence::<_, Dummy>::new(driver.clone());
        persistence.configure(&mongo_config());
        persistence.ensure_index("key_1", &[("key", true)], true);
        persistence.define_schema(|| {
            vec![SchemaStatement::Index {
                name: "content_1".to_string(),
                keys: vec![("content".to_string(), false)],
                unique: false,
            }]
        });
        let ctx = Context::default();

        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 2);

        persistence.close(&ctx).await.unwrap();
        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 4);
    }

    #[tokio::test]
    async fn test_sql_schema_skipped_when_table_exists() {
        let driver = MemoryDriver::new(BackendKind::SqlServer);
        let mut persistence = Persistence::<_, Dummy>::new(driver.clone());
        persistence.configure(&ConfigParams::from_tuples(&[
            ("table", "dummies"),
            ("connection.host", "localhost"),
            ("connection.port", "1433"),
            ("connection.database", "master"),
        ]));
        persistence.ensure_table();
        persistence.ensure_index("idx_key", &[("key", true)], false);
        let ctx = Context::default();

        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 2);
        assert!(driver.executed_schema()[0].starts_with("CREATE TABLE [dummies]"));

        persistence.close(&ctx).await.unwrap();
        persistence.open(&ctx).await.unwrap();
        assert_eq!(driver.executed_schema().len(), 2);
    }
}
