//! End-to-end persistence tests across backend flavours.
//!
//! The same scenario runs against the in-memory driver in Couchbase, MongoDB
//! and SQL Server flavour, and against a real embedded `SQLite` database.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use pipconnect::config::ConfigParams;
use pipconnect::driver::{Document, MemoryFilter, SqliteDriver};
use pipconnect::query::SqlDialect;
use pipconnect::storage::{CONNECTION, FilterOf};
use pipconnect::{
    BackendKind, Connection, Context, Identifiable, IdentifiablePersistence, MemoryDriver,
    NativeDriver, PagingParams, References,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dummy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    key: String,
    content: String,
}

impl Dummy {
    fn new(key: &str, content: &str) -> Self {
        Self {
            id: String::new(),
            key: key.to_string(),
            content: content.to_string(),
        }
    }
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

fn config_for(kind: BackendKind) -> ConfigParams {
    let mut pairs = vec![("collection", "dummies")];
    pairs.extend_from_slice(match kind {
        BackendKind::Couchbase => &[
            ("connection.host", "localhost"),
            ("connection.port", "8091"),
            ("connection.bucket", "test"),
            ("credential.username", "Administrator"),
            ("credential.password", "password"),
        ][..],
        BackendKind::MongoDb => &[
            ("connection.host", "localhost"),
            ("connection.port", "27017"),
            ("connection.database", "test"),
        ][..],
        BackendKind::SqlServer => &[
            ("connection.host", "localhost"),
            ("connection.port", "1433"),
            ("connection.database", "master"),
            ("credential.username", "sa"),
            ("credential.password", "sqlserver_123"),
        ][..],
        _ => &[("connection.database", ":memory:")][..],
    });
    ConfigParams::from_tuples(&pairs)
}

async fn open<D: NativeDriver>(driver: D) -> IdentifiablePersistence<D, Dummy> {
    let mut persistence = IdentifiablePersistence::new(driver);
    persistence.configure(&config_for(persistence.profile().kind));
    persistence.ensure_table();
    persistence.open(&Context::new("test")).await.unwrap();
    persistence
}

/// Create, update, partially update, delete and query three dummies.
async fn run_crud_scenario<D: NativeDriver>(
    persistence: &IdentifiablePersistence<D, Dummy>,
    key_filter: impl Fn(&str) -> FilterOf<D>,
) {
    let ctx = Context::new("scenario");

    let dummy1 = persistence
        .create(&ctx, Dummy::new("Key 1", "Content 1"))
        .await
        .unwrap();
    assert!(!dummy1.id.is_empty());
    assert_eq!(dummy1.key, "Key 1");
    assert_eq!(dummy1.content, "Content 1");

    let dummy2 = persistence
        .create(&ctx, Dummy::new("Key 2", "Content 2"))
        .await
        .unwrap();
    let dummy3 = persistence
        .create(&ctx, Dummy::new("Key 3", "Content 3"))
        .await
        .unwrap();

    let found = persistence.get_one_by_id(&ctx, &dummy1.id).await.unwrap();
    assert_eq!(found.as_ref(), Some(&dummy1));

    let mut changed = dummy1.clone();
    changed.content = "Updated Content 1".to_string();
    let updated = persistence.update(&ctx, changed).await.unwrap().unwrap();
    assert_eq!(updated.id, dummy1.id);
    assert_eq!(updated.key, "Key 1");
    assert_eq!(updated.content, "Updated Content 1");

    let mut data = Document::new();
    data.insert("content".to_string(), json!("Partially Updated Content 1"));
    let patched = persistence
        .update_partially(&ctx, &dummy1.id, data)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patched.id, dummy1.id);
    assert_eq!(patched.key, "Key 1");
    assert_eq!(patched.content, "Partially Updated Content 1");

    let deleted = persistence.delete_by_id(&ctx, &dummy1.id).await.unwrap();
    assert_eq!(deleted, Some(patched));
    assert!(persistence.get_one_by_id(&ctx, &dummy1.id).await.unwrap().is_none());

    assert_eq!(persistence.get_count_by_filter(&ctx, None).await.unwrap(), 2);

    let page = persistence
        .get_page_by_filter(
            &ctx,
            Some(key_filter("Key 2")),
            PagingParams::new(None, None, true),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(page.data, vec![dummy2.clone()]);
    assert_eq!(page.total, Some(1));

    let listed = persistence
        .get_list_by_ids(
            &ctx,
            &[dummy2.id.clone(), dummy3.id.clone(), "missing".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    persistence
        .delete_by_ids(&ctx, &[dummy2.id.clone(), "missing".to_string()])
        .await
        .unwrap();
    assert!(persistence.get_one_by_id(&ctx, &dummy2.id).await.unwrap().is_none());
    assert!(
        persistence
            .get_one_by_id(&ctx, &"unknown".to_string())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(persistence.get_count_by_filter(&ctx, None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_couchbase_flavour() {
    let persistence = open(MemoryDriver::new(BackendKind::Couchbase)).await;
    run_crud_scenario(&persistence, |key| MemoryFilter::eq("key", key)).await;
}

#[tokio::test]
async fn test_mongodb_flavour() {
    let persistence = open(MemoryDriver::new(BackendKind::MongoDb)).await;
    run_crud_scenario(&persistence, |key| MemoryFilter::eq("key", key)).await;
}

#[tokio::test]
async fn test_sqlserver_flavour() {
    let persistence = open(MemoryDriver::new(BackendKind::SqlServer)).await;
    run_crud_scenario(&persistence, |key| MemoryFilter::eq("key", key)).await;
}

#[tokio::test]
async fn test_sqlite() {
    let persistence = open(SqliteDriver::new()).await;
    run_crud_scenario(&persistence, |key| {
        format!("{} = '{key}'", SqlDialect::Sqlite.json_field("key"))
    })
    .await;
}

#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dummies.db");
    let mut config = config_for(BackendKind::Sqlite);
    config.set("connection.database", path.to_string_lossy());
    let ctx = Context::default();

    let mut persistence: IdentifiablePersistence<_, Dummy> =
        IdentifiablePersistence::new(SqliteDriver::new());
    persistence.configure(&config);
    persistence.ensure_table();
    persistence.open(&ctx).await.unwrap();
    let created = persistence
        .create(&ctx, Dummy::new("Key 1", "Content 1"))
        .await
        .unwrap();
    persistence.close(&ctx).await.unwrap();

    persistence.open(&ctx).await.unwrap();
    let found = persistence.get_one_by_id(&ctx, &created.id).await.unwrap();
    assert_eq!(found, Some(created));
}

#[tokio::test]
async fn test_shared_connection_outlives_borrower() {
    let ctx = Context::default();
    let mut connection = Connection::new(MemoryDriver::new(BackendKind::MongoDb));
    connection.configure(&config_for(BackendKind::MongoDb));
    let connection = Arc::new(connection);
    connection.open(&ctx).await.unwrap();

    let references = References::new().with(CONNECTION, Arc::clone(&connection));
    let mut first: IdentifiablePersistence<MemoryDriver, Dummy> =
        IdentifiablePersistence::unbound(BackendKind::MongoDb);
    first.configure(&config_for(BackendKind::MongoDb));
    first.set_references(&references);
    first.open(&ctx).await.unwrap();
    assert!(!first.is_local_connection());

    let created = first
        .create(&ctx, Dummy::new("Key 1", "Content 1"))
        .await
        .unwrap();
    first.close(&ctx).await.unwrap();
    assert!(connection.is_open());

    let mut second: IdentifiablePersistence<MemoryDriver, Dummy> =
        IdentifiablePersistence::unbound(BackendKind::MongoDb);
    second.configure(&config_for(BackendKind::MongoDb));
    second.set_references(&references);
    second.open(&ctx).await.unwrap();
    let found = second.get_one_by_id(&ctx, &created.id).await.unwrap();
    assert_eq!(found, Some(created));
}

#[tokio::test]
async fn test_take_is_clamped_to_max_page_size() {
    let mut config = config_for(BackendKind::MongoDb);
    config.set("options.max_page_size", "2");
    let mut persistence: IdentifiablePersistence<_, Dummy> =
        IdentifiablePersistence::new(MemoryDriver::new(BackendKind::MongoDb));
    persistence.configure(&config);
    let ctx = Context::default();
    persistence.open(&ctx).await.unwrap();
    for i in 0..5 {
        persistence
            .create(&ctx, Dummy::new(&format!("Key {i}"), "Content"))
            .await
            .unwrap();
    }

    let page = persistence
        .get_page_by_filter(&ctx, None, PagingParams::new(None, Some(50), false), None, None)
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page.total, None);
}
