//! Typed view of an inbound function request.

use crate::{Error, Result};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::BTreeMap;

/// Body and query keys that name the command.
const COMMAND_KEY: &str = "cmd";
/// Keys that carry the trace id, in lookup order.
const TRACE_ID_KEYS: [&str; 2] = ["trace_id", "correlation_id"];

/// An inbound function request, populated once from raw request parts.
///
/// The command is read from the body `cmd` field, then the query. The trace
/// id is read from `trace_id` or `correlation_id` in the body, then the query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundEnvelope {
    command: Option<String>,
    trace_id: Option<String>,
    body: Value,
    query: BTreeMap<String, String>,
}

fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn query_str<'a>(query: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    query.get(key).map(String::as_str).filter(|s| !s.is_empty())
}

impl InboundEnvelope {
    /// Builds an envelope from a decoded body and query parameters.
    #[must_use]
    pub fn new(body: Value, query: BTreeMap<String, String>) -> Self {
        let command = body_str(&body, COMMAND_KEY)
            .or_else(|| query_str(&query, COMMAND_KEY))
            .map(ToString::to_string);
        let trace_id = TRACE_ID_KEYS
            .iter()
            .find_map(|k| body_str(&body, k))
            .or_else(|| TRACE_ID_KEYS.iter().find_map(|k| query_str(&query, k)))
            .map(ToString::to_string);
        Self {
            command,
            trace_id,
            body,
            query,
        }
    }

    /// Parses a raw JSON body and a URL query string (`a=1&b=x%20y`).
    ///
    /// An empty body is `null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the body is not valid JSON.
    pub fn parse(body: &[u8], query: &str) -> Result<Self> {
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|e| Error::InvalidInput(format!("request body is not valid JSON: {e}")))?
        };
        Ok(Self::new(body, parse_query(query)))
    }

    /// Returns the command name.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Returns the trace id.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Returns the decoded body.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Returns the query parameters.
    #[must_use]
    pub const fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }
}

/// Decodes a URL query string; `+` is a space and later keys win.
#[must_use]
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let decode = |s: &str| {
        let spaced = s.replace('+', " ");
        percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
    };
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect()
}
