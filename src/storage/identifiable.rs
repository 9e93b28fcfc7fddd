//! Id-based persistence.

use super::mapping;
use super::metrics::timed;
use super::persistence::{Persistence, conversion_failed};
use crate::config::ConfigParams;
use crate::connect::{BackendKind, BatchDeleteMode, PartialUpdateMode};
use crate::driver::{Document, NativeDriver, NativeHandle};
use crate::storage::Connection;
use crate::{Context, Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Generates a new entity id: 32 lowercase hex characters.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Entity id type.
pub trait EntityKey: Clone + fmt::Display + Send + Sync + 'static {
    /// Generates a fresh id, or `None` if this type is never generated.
    fn generate() -> Option<Self>;
}

impl EntityKey for String {
    fn generate() -> Option<Self> {
        Some(generate_id())
    }
}

impl EntityKey for i64 {
    fn generate() -> Option<Self> {
        None
    }
}

impl EntityKey for u64 {
    fn generate() -> Option<Self> {
        None
    }
}

/// An entity with an `id` field.
///
/// The serialized form must be a JSON object whose `id` field holds the key.
pub trait Identifiable: Serialize + DeserializeOwned + Send + Sync {
    /// Id type.
    type Key: EntityKey;

    /// Returns the id, or `None` if it is not set.
    fn id(&self) -> Option<&Self::Key>;

    /// Sets the id.
    fn set_id(&mut self, id: Self::Key);
}

/// [`Persistence`] with id-based operations.
///
/// Dereferences to the base persistence for lifecycle and filter-based calls.
///
/// Partial updates and batch deletes follow the backend profile:
///
/// - native field merge, or read-modify-write conditioned on the CAS token
///   (single attempt; a concurrent writer makes the call fail)
/// - one native batch delete, or one delete per id skipping missing ids
pub struct IdentifiablePersistence<D: NativeDriver, T> {
    base: Persistence<D, T>,
    auto_generate_id: bool,
}

impl<D, T> IdentifiablePersistence<D, T>
where
    D: NativeDriver,
    T: Identifiable,
{
    /// Creates a persistence that opens its own connection through `driver`.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self::from_base(Persistence::new(driver))
    }

    /// Creates a persistence that borrows `connection`.
    #[must_use]
    pub fn with_connection(connection: Arc<Connection<D>>) -> Self {
        Self::from_base(Persistence::with_connection(connection))
    }

    /// Creates a persistence wired later through references.
    #[must_use]
    pub fn unbound(kind: BackendKind) -> Self {
        Self::from_base(Persistence::unbound(kind))
    }

    /// Wraps a base persistence.
    #[must_use]
    pub const fn from_base(base: Persistence<D, T>) -> Self {
        Self {
            base,
            auto_generate_id: true,
        }
    }

    /// Enables or disables id generation for items without an id.
    #[must_use]
    pub const fn with_auto_generate_id(mut self, enabled: bool) -> Self {
        self.auto_generate_id = enabled;
        self
    }

    /// Configures the base persistence.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.base.configure(config);
    }

    fn with_generated_id(&self, mut item: T) -> T {
        if item.id().is_none()
            && self.auto_generate_id
            && let Some(id) = T::Key::generate()
        {
            item.set_id(id);
        }
        item
    }

    fn keys(ids: &[T::Key]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    /// Returns the item with `id`, or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails
    /// for a reason other than a missing key.
    pub async fn get_one_by_id(&self, ctx: &Context, id: &T::Key) -> Result<Option<T>> {
        let profile = self.base.profile();
        timed(profile.name, "get_one_by_id", async {
            let table = self.base.table()?;
            let key = id.to_string();
            let found = self.base.handle()?.get(table, &key).await;
            let item = self
                .base
                .absent_on_not_found(found)?
                .and_then(|(doc, _)| self.base.convert(doc));

            tracing::trace!(
                backend = profile.name,
                table,
                id = %key,
                found = item.is_some(),
                trace_id = ctx.trace_id_or_empty(),
                "Retrieved by id"
            );
            Ok(item)
        })
        .await
    }

    /// Returns the items with the given ids; missing ids are dropped.
    ///
    /// A batch in which every key fails is an empty result. Otherwise any
    /// failure other than a missing key is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn get_list_by_ids(&self, ctx: &Context, ids: &[T::Key]) -> Result<Vec<T>> {
        let profile = self.base.profile();
        timed(profile.name, "get_list_by_ids", async {
            let table = self.base.table()?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let results = self.base.handle()?.get_many(table, &Self::keys(ids)).await?;
            if !results.is_empty() && results.iter().all(std::result::Result::is_err) {
                return Ok(Vec::new());
            }

            let mut items = Vec::with_capacity(results.len());
            for result in results {
                match result {
                    Ok(doc) => items.extend(self.base.convert(doc)),
                    Err(e) if e.is_not_found_code(profile.not_found_code) => {},
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::trace!(
                backend = profile.name,
                table,
                requested = ids.len(),
                count = items.len(),
                trace_id = ctx.trace_id_or_empty(),
                "Retrieved by ids"
            );
            Ok(items)
        })
        .await
    }

    /// Inserts an item, generating an id when absent and enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn create(&self, ctx: &Context, item: T) -> Result<T> {
        let item = self.with_generated_id(item);
        self.base.create(ctx, item).await
    }

    /// Inserts or replaces an item, generating an id when absent and enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the item still has no id, or an
    /// error if the persistence is not open or the driver fails.
    pub async fn set(&self, ctx: &Context, item: T) -> Result<T> {
        let profile = self.base.profile();
        let item = self.with_generated_id(item);
        timed(profile.name, "set", async {
            let table = self.base.table()?;
            let key = item
                .id()
                .map(ToString::to_string)
                .ok_or_else(|| Error::InvalidInput("cannot set an item without an id".into()))?;
            let document = mapping::to_internal(profile, table, &item)?;
            let stored = self.base.handle()?.upsert(table, &key, document).await?;

            tracing::trace!(
                backend = profile.name,
                table,
                id = %key,
                trace_id = ctx.trace_id_or_empty(),
                "Set item"
            );
            self.base.convert(stored).ok_or_else(|| conversion_failed("set"))
        })
        .await
    }

    /// Replaces an existing item.
    ///
    /// Returns `None` when the item has no id or no row has its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    pub async fn update(&self, ctx: &Context, item: T) -> Result<Option<T>> {
        let profile = self.base.profile();
        timed(profile.name, "update", async {
            let Some(key) = item.id().map(ToString::to_string) else {
                return Ok(None);
            };
            let table = self.base.table()?;
            let document = mapping::to_internal(profile, table, &item)?;
            let replaced = self
                .base
                .handle()?
                .replace(table, &key, document, None)
                .await;
            let item = self
                .base
                .absent_on_not_found(replaced)?
                .and_then(|doc| self.base.convert(doc));

            tracing::trace!(
                backend = profile.name,
                table,
                id = %key,
                updated = item.is_some(),
                trace_id = ctx.trace_id_or_empty(),
                "Updated item"
            );
            Ok(item)
        })
        .await
    }

    /// Merges only the given fields into the item with `id`.
    ///
    /// `id` and bookkeeping fields in `data` are ignored. Returns `None` when
    /// no row has the id.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails.
    /// On read-modify-write backends a concurrent change between the read
    /// and the conditional replace fails the call with a CAS mismatch.
    pub async fn update_partially(
        &self,
        ctx: &Context,
        id: &T::Key,
        data: Document,
    ) -> Result<Option<T>> {
        let profile = self.base.profile();
        timed(profile.name, "update_partially", async {
            let table = self.base.table()?;
            let handle = self.base.handle()?;
            let key = id.to_string();
            let fields = mapping::update_fields(profile, data);

            let updated = match profile.partial_update {
                PartialUpdateMode::Native => {
                    let merged = handle.merge_fields(table, &key, fields).await;
                    self.base.absent_on_not_found(merged)?
                },
                PartialUpdateMode::ReadModifyWrite => {
                    let current = handle.get(table, &key).await;
                    match self.base.absent_on_not_found(current)? {
                        None => None,
                        Some((mut document, cas)) => {
                            document.extend(fields);
                            let replaced = handle.replace(table, &key, document, Some(cas)).await;
                            self.base.absent_on_not_found(replaced)?
                        },
                    }
                },
            };
            let item = updated.and_then(|doc| self.base.convert(doc));

            tracing::trace!(
                backend = profile.name,
                table,
                id = %key,
                updated = item.is_some(),
                trace_id = ctx.trace_id_or_empty(),
                "Partially updated item"
            );
            Ok(item)
        })
        .await
    }

    /// Deletes the item with `id` and returns it, or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails
    /// for a reason other than a missing key.
    pub async fn delete_by_id(&self, ctx: &Context, id: &T::Key) -> Result<Option<T>> {
        let profile = self.base.profile();
        timed(profile.name, "delete_by_id", async {
            let table = self.base.table()?;
            let key = id.to_string();
            let removed = self.base.handle()?.remove(table, &key).await;
            let item = self
                .base
                .absent_on_not_found(removed)?
                .and_then(|doc| self.base.convert(doc));

            tracing::trace!(
                backend = profile.name,
                table,
                id = %key,
                deleted = item.is_some(),
                trace_id = ctx.trace_id_or_empty(),
                "Deleted by id"
            );
            Ok(item)
        })
        .await
    }

    /// Deletes the items with the given ids; missing ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence is not open or the driver fails
    /// for a reason other than a missing key.
    pub async fn delete_by_ids(&self, ctx: &Context, ids: &[T::Key]) -> Result<()> {
        let profile = self.base.profile();
        timed(profile.name, "delete_by_ids", async {
            let table = self.base.table()?;
            let handle = self.base.handle()?;
            let keys = Self::keys(ids);

            match profile.batch_delete {
                BatchDeleteMode::Native => handle.remove_many(table, &keys).await?,
                BatchDeleteMode::OneByOne => {
                    for key in &keys {
                        let removed = handle.remove(table, key).await;
                        self.base.absent_on_not_found(removed)?;
                    }
                },
            }

            tracing::trace!(
                backend = profile.name,
                table,
                count = keys.len(),
                trace_id = ctx.trace_id_or_empty(),
                "Deleted by ids"
            );
            Ok(())
        })
        .await
    }
}

impl<D: NativeDriver, T> Deref for IdentifiablePersistence<D, T> {
    type Target = Persistence<D, T>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<D: NativeDriver, T> DerefMut for IdentifiablePersistence<D, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl<D: NativeDriver, T> fmt::Debug for IdentifiablePersistence<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifiablePersistence")
            .field("base", &self.base)
            .field("auto_generate_id", &self.auto_generate_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dummy {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        key: String,
        content: String,
    }

    impl Identifiable for Dummy {
        type Key = String;

        fn id(&self) -> Option<&String> {
            Some(&self.id).filter(|id| !id.is_empty())
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    fn dummy(key: &str) -> Dummy {
        Dummy {
            id: String::new(),
            key: key.into(),
            content: "Content".into(),
        }
    }

    async fn opened(kind: BackendKind) -> IdentifiablePersistence<MemoryDriver, Dummy> {
        let mut persistence = IdentifiablePersistence::new(MemoryDriver::new(kind));
        persistence.configure(&ConfigParams::from_tuples(&[
            ("collection", "dummies"),
            ("connection.host", "localhost"),
            ("connection.port", "1"),
            ("connection.database", "test"),
        ]));
        persistence.open(&Context::default()).await.unwrap();
        persistence
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let persistence = opened(BackendKind::MongoDb).await;
        let created = persistence.create(&Context::default(), dummy("a")).await.unwrap();
        assert_eq!(created.id.len(), 32);
    }

    #[tokio::test]
    async fn test_create_without_generation_uses_native_key() {
        let persistence = opened(BackendKind::MongoDb)
            .await
            .with_auto_generate_id(false);
        let created = persistence.create(&Context::default(), dummy("a")).await.unwrap();
        assert!(!created.id.is_empty());
    }

    #[tokio::test]
    async fn test_update_without_id_is_none() {
        let persistence = opened(BackendKind::MongoDb).await;
        let updated = persistence.update(&Context::default(), dummy("a")).await.unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_none() {
        for kind in [BackendKind::MongoDb, BackendKind::Couchbase] {
            let persistence = opened(kind).await;
            let mut item = dummy("a");
            item.id = "missing".into();
            let updated = persistence.update(&Context::default(), item).await.unwrap();
            assert!(updated.is_none());
        }
    }

    #[tokio::test]
    async fn test_set_upserts() {
        let persistence = opened(BackendKind::Couchbase).await;
        let ctx = Context::default();
        let mut item = persistence.set(&ctx, dummy("a")).await.unwrap();
        item.content = "Changed".into();
        persistence.set(&ctx, item.clone()).await.unwrap();

        let found = persistence.get_one_by_id(&ctx, &item.id).await.unwrap();
        assert_eq!(found.map(|d| d.content), Some("Changed".to_string()));
    }

    #[tokio::test]
    async fn test_couchbase_partial_update_via_cas() {
        let persistence = opened(BackendKind::Couchbase).await;
        let ctx = Context::default();
        let created = persistence.create(&ctx, dummy("a")).await.unwrap();

        let mut data = Document::new();
        data.insert("content".into(), json!("Partial"));
        data.insert("id".into(), json!("ignored"));
        let updated = persistence
            .update_partially(&ctx, &created.id, data)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.key, "a");
        assert_eq!(updated.content, "Partial");

        let missing = persistence
            .update_partially(&ctx, &"nope".to_string(), Document::new())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_couchbase_batch_of_missing_ids_is_empty() {
        let persistence = opened(BackendKind::Couchbase).await;
        let items = persistence
            .get_list_by_ids(&Context::default(), &["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_ids_one_by_one() {
        let persistence = opened(BackendKind::Couchbase).await;
        let ctx = Context::default();
        let created = persistence.create(&ctx, dummy("a")).await.unwrap();

        persistence
            .delete_by_ids(&ctx, &[created.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert!(persistence.get_one_by_id(&ctx, &created.id).await.unwrap().is_none());
    }
}
