//! Configuration management.
//!
//! Configuration is a flat map of dotted keys (`connection.host`,
//! `connections.0.port`, `options.connect_timeout`). Nested TOML, YAML and
//! JSON documents are flattened into that shape when loaded, so every
//! component reads its settings the same way regardless of file format.

mod options;

pub use options::ConnectionOptions;

use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Default prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "PIPCONNECT";

/// Flat dotted-key configuration map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigParams {
    values: BTreeMap<String, String>,
}

impl ConfigParams {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from key/value pairs.
    #[must_use]
    pub fn from_tuples(pairs: &[(&str, &str)]) -> Self {
        pairs.iter().copied().collect()
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Removes a value and returns it.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns a non-empty string value.
    #[must_use]
    pub fn get_as_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    }

    /// Returns a string value or the default.
    #[must_use]
    pub fn get_as_string_or(&self, key: &str, default: &str) -> String {
        self.get_as_string(key)
            .unwrap_or_else(|| default.to_string())
    }

    /// Returns an unsigned integer value; unparsable values read as absent.
    #[must_use]
    pub fn get_as_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Returns an unsigned integer value or the default.
    #[must_use]
    pub fn get_as_u64_or(&self, key: &str, default: u64) -> u64 {
        self.get_as_u64(key).unwrap_or(default)
    }

    /// Returns a boolean value (`true/false`, `1/0`, `yes/no`, `on/off`).
    #[must_use]
    pub fn get_as_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .and_then(|v| match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" | "y" | "t" => Some(true),
                "false" | "0" | "no" | "off" | "n" | "f" => Some(false),
                _ => None,
            })
    }

    /// Returns a boolean value or the default.
    #[must_use]
    pub fn get_as_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_as_bool(key).unwrap_or(default)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the entries under `name.`, with the prefix stripped.
    #[must_use]
    pub fn get_section(&self, name: &str) -> Self {
        let prefix = format!("{name}.");
        self.values
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Returns the distinct section names (the part of dotted keys before the first dot).
    ///
    /// Numeric names sort numerically ahead of other names, so `connections.10`
    /// follows `connections.2`.
    #[must_use]
    pub fn section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .values
            .keys()
            .filter_map(|k| k.split_once('.').map(|(head, _)| head.to_string()))
            .collect();
        names.sort_by_key(|n| (n.parse::<u64>().map_or((1, 0), |v| (0, v)), n.clone()));
        names.dedup();
        names
    }

    /// Returns a copy with `other` applied on top.
    #[must_use]
    pub fn override_with(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (k, v) in &other.values {
            merged.values.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Returns a copy where missing keys are filled from `defaults`.
    #[must_use]
    pub fn set_defaults(&self, defaults: &Self) -> Self {
        defaults.override_with(self)
    }

    /// Flattens a JSON document into dotted keys.
    #[must_use]
    pub fn from_json_value(value: &Value) -> Self {
        let mut config = Self::new();
        flatten_into(&mut config.values, String::new(), value);
        config
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the document cannot be parsed.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(contents).map_err(|e| parse_error("toml", e))?;
        let value = serde_json::to_value(table).map_err(|e| parse_error("toml", e))?;
        Ok(Self::from_json_value(&value))
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the document cannot be parsed.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let value: Value =
            serde_yaml_ng::from_str(contents).map_err(|e| parse_error("yaml", e))?;
        Ok(Self::from_json_value(&value))
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the document cannot be parsed.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(contents).map_err(|e| parse_error("json", e))?;
        Ok(Self::from_json_value(&value))
    }

    /// Loads configuration from a file, choosing the format by extension.
    ///
    /// `.yaml`/`.yml` and `.json` are recognised; anything else is read as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        let config = match extension.as_deref() {
            Some("yaml" | "yml") => Self::from_yaml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            _ => Self::from_toml_str(&contents)?,
        };

        tracing::debug!(path = %path.display(), keys = config.len(), "Loaded configuration file");
        Ok(config)
    }

    /// Applies environment variable overrides with the default prefix.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(ENV_PREFIX, std::env::vars())
    }

    /// Applies overrides from `PREFIX_SECTION__KEY=value` pairs.
    ///
    /// The part after the prefix is lower-cased and `__` becomes `.`, so
    /// `PIPCONNECT_CONNECTION__HOST` overrides `connection.host`.
    #[must_use]
    pub fn with_overrides_from<I>(mut self, prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{prefix}_");
        for (name, value) in vars {
            if let Some(rest) = name.strip_prefix(&prefix) {
                let key = rest.to_lowercase().replace("__", ".");
                if !key.is_empty() {
                    self.values.insert(key, value);
                }
            }
        }
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: String, value: &Value) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match value {
        Value::Null => {},
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(out, join(k), v);
            }
        },
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(out, join(&i.to_string()), v);
            }
        },
        Value::String(s) => {
            out.insert(prefix, s.clone());
        },
        Value::Bool(_) | Value::Number(_) => {
            out.insert(prefix, value.to_string());
        },
    }
}

fn parse_error(format: &str, e: impl std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: format!("parse_{format}_config"),
        cause: e.to_string(),
    }
}
