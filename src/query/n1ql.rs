//! Couchbase N1QL statements.
//!
//! Several persistences may share one bucket. Their documents are told apart
//! by the `_c` field, so every statement for a collection is scoped with
//! `_c="collection"` before the caller's filter is applied.

use crate::driver::Document;
use serde_json::Value;

/// Name of the collection tag field.
pub const COLLECTION_FIELD: &str = "_c";

/// Quotes a bucket or field name.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quotes a string literal.
#[must_use]
pub fn quote_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn where_clause(collection: Option<&str>, filter: Option<&str>) -> String {
    let mut conditions = Vec::new();
    if let Some(collection) = collection {
        conditions.push(format!("{COLLECTION_FIELD}={}", quote_string(collection)));
    }
    if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
        conditions.push(format!("({filter})"));
    }
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

/// `SELECT` scoped to a collection.
#[must_use]
pub fn select(
    bucket: &str,
    collection: Option<&str>,
    filter: Option<&str>,
    sort: Option<&str>,
    skip: Option<u64>,
    take: Option<u64>,
    fields: Option<&[String]>,
) -> String {
    let projection = match fields {
        Some(fields) if !fields.is_empty() => fields
            .iter()
            .map(|f| quote_identifier(f))
            .collect::<Vec<_>>()
            .join(","),
        _ => "*".to_string(),
    };
    let mut n1ql = format!(
        "SELECT {projection} FROM {}{}",
        quote_identifier(bucket),
        where_clause(collection, filter)
    );
    if let Some(sort) = sort.filter(|s| !s.trim().is_empty()) {
        n1ql.push_str(" ORDER BY ");
        n1ql.push_str(sort);
    }
    if let Some(take) = take {
        n1ql.push_str(&format!(" LIMIT {take}"));
    }
    if let Some(skip) = skip {
        n1ql.push_str(&format!(" OFFSET {skip}"));
    }
    n1ql
}

/// `SELECT COUNT(*)` scoped to a collection.
#[must_use]
pub fn count(bucket: &str, collection: Option<&str>, filter: Option<&str>) -> String {
    format!(
        "SELECT COUNT(*) FROM {}{}",
        quote_identifier(bucket),
        where_clause(collection, filter)
    )
}

/// `DELETE` scoped to a collection.
#[must_use]
pub fn delete(bucket: &str, collection: Option<&str>, filter: Option<&str>) -> String {
    format!(
        "DELETE FROM {}{}",
        quote_identifier(bucket),
        where_clause(collection, filter)
    )
}

/// Primary index DDL.
#[must_use]
pub fn create_primary_index(bucket: &str) -> String {
    format!("CREATE PRIMARY INDEX ON {}", quote_identifier(bucket))
}

/// Unwraps `SELECT *` rows, which come back nested under the bucket name.
///
/// Rows whose payload is null are dropped; rows that are not nested
/// (projections) are returned as they are.
#[must_use]
pub fn unwrap_rows(bucket: &str, rows: Vec<Value>) -> Vec<Document> {
    rows.into_iter()
        .filter_map(|row| match row {
            Value::Object(mut map) => match map.remove(bucket) {
                Some(Value::Object(inner)) => Some(inner),
                Some(_) => None,
                None => Some(map),
            },
            _ => None,
        })
        .collect()
}
