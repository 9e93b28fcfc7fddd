//! Conversion between public entities and internal documents.
//!
//! | Backend | Internal differences |
//! |---------|----------------------|
//! | `MongoDB` | `id` stored as `_id` |
//! | Couchbase | `_c` collection tag added |
//! | SQL (JSON mode) | none; the document is the `data` column |

use crate::connect::BackendProfile;
use crate::driver::Document;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Public name of the id field.
pub const ID_FIELD: &str = "id";

/// Converts a public entity into its internal document.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the entity does not serialize to a
/// JSON object.
pub fn to_internal<T: Serialize>(
    profile: &BackendProfile,
    table: &str,
    item: &T,
) -> Result<Document> {
    let value = serde_json::to_value(item).map_err(|e| Error::OperationFailed {
        operation: "serialize_entity".to_string(),
        cause: e.to_string(),
    })?;
    let Value::Object(mut document) = value else {
        return Err(Error::InvalidInput(
            "entity must serialize to a JSON object".to_string(),
        ));
    };

    if profile.id_field != ID_FIELD
        && let Some(id) = document.remove(ID_FIELD)
    {
        document.insert(profile.id_field.to_string(), id);
    }
    if let Some(tag) = profile.collection_tag {
        document.insert(tag.to_string(), Value::String(table.to_string()));
    }
    Ok(document)
}

/// Converts an internal document back into its public shape.
#[must_use]
pub fn to_public(profile: &BackendProfile, mut document: Document) -> Document {
    if let Some(tag) = profile.collection_tag {
        document.remove(tag);
    }
    if profile.id_field != ID_FIELD
        && let Some(id) = document.remove(profile.id_field)
    {
        document.insert(ID_FIELD.to_string(), id);
    }
    document
}

/// Converts an internal document into an entity.
///
/// Documents that do not deserialize are logged and dropped.
pub fn from_internal<T: DeserializeOwned>(profile: &BackendProfile, document: Document) -> Option<T> {
    let public = to_public(profile, document);
    match serde_json::from_value(Value::Object(public)) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(
                backend = profile.name,
                error = %e,
                "Dropping row that does not convert to the entity type"
            );
            None
        },
    }
}

/// Returns the string key of an id value.
#[must_use]
pub fn key_of(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strips id and bookkeeping fields from partial-update data.
#[must_use]
pub fn update_fields(profile: &BackendProfile, mut data: Document) -> Document {
    data.remove(ID_FIELD);
    data.remove(profile.id_field);
    if let Some(tag) = profile.collection_tag {
        data.remove(tag);
    }
    data
}
