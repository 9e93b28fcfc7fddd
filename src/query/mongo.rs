//! `MongoDB` command documents.
//!
//! Commands are built as JSON in database-command form (`find`, `count`,
//! `findAndModify`, ...), ready to be converted to BSON by a driver.

use crate::driver::Document;
use serde_json::{Map, Value, json};

/// `find` command.
#[must_use]
pub fn find(
    collection: &str,
    filter: Option<&Value>,
    sort: Option<&Value>,
    skip: Option<u64>,
    limit: Option<u64>,
    projection: Option<&[String]>,
) -> Value {
    let mut command = Map::new();
    command.insert("find".into(), json!(collection));
    command.insert("filter".into(), filter.cloned().unwrap_or_else(|| json!({})));
    if let Some(sort) = sort {
        command.insert("sort".into(), sort.clone());
    }
    if let Some(skip) = skip {
        command.insert("skip".into(), json!(skip));
    }
    if let Some(limit) = limit {
        command.insert("limit".into(), json!(limit));
    }
    if let Some(fields) = projection.filter(|f| !f.is_empty()) {
        let projection: Map<String, Value> =
            fields.iter().map(|f| (f.clone(), json!(1))).collect();
        command.insert("projection".into(), Value::Object(projection));
    }
    Value::Object(command)
}

/// `count` command.
#[must_use]
pub fn count(collection: &str, filter: Option<&Value>) -> Value {
    json!({
        "count": collection,
        "query": filter.cloned().unwrap_or_else(|| json!({})),
    })
}

/// `findAndModify` with `$set` of the given fields, returning the new document.
#[must_use]
pub fn find_and_set(collection: &str, id: &Value, fields: &Document) -> Value {
    json!({
        "findAndModify": collection,
        "query": {"_id": id},
        "update": {"$set": fields},
        "new": true,
    })
}

/// `findAndModify` that removes the document, returning it.
#[must_use]
pub fn find_and_remove(collection: &str, id: &Value) -> Value {
    json!({
        "findAndModify": collection,
        "query": {"_id": id},
        "remove": true,
    })
}

/// `update` with `upsert` replacing a whole document.
#[must_use]
pub fn replace_one(collection: &str, id: &Value, document: &Document, upsert: bool) -> Value {
    json!({
        "update": collection,
        "updates": [{"q": {"_id": id}, "u": document, "upsert": upsert}],
    })
}

/// `delete` of every matching document.
#[must_use]
pub fn delete_many(collection: &str, filter: Option<&Value>) -> Value {
    json!({
        "delete": collection,
        "deletes": [{"q": filter.cloned().unwrap_or_else(|| json!({})), "limit": 0}],
    })
}

/// Filter matching any of `ids`.
#[must_use]
pub fn ids_filter(ids: &[String]) -> Value {
    json!({"_id": {"$in": ids}})
}

/// `createIndexes` command.
#[must_use]
pub fn create_index(collection: &str, name: &str, keys: &[(String, bool)], unique: bool) -> Value {
    let key: Map<String, Value> = keys
        .iter()
        .map(|(field, ascending)| (field.clone(), json!(if *ascending { 1 } else { -1 })))
        .collect();
    json!({
        "createIndexes": collection,
        "indexes": [{"key": key, "name": name, "unique": unique}],
    })
}
