//! Backend quirks.
//!
//! Every backend composes its connection and stores its entities with the same
//! algorithms; what differs is captured here as data.
//!
//! | Backend | URI | Auth | Encoding | Id field | Partial update | Batch delete |
//! |---------|-----|------|----------|----------|----------------|--------------|
//! | Couchbase | `couchbase://h1:p1,h2/bucket?k=v` | separate fields | no | `id` + `_c` tag | read-modify-write (CAS) | one by one |
//! | MongoDB | `mongodb://u:p@h:p/db?k=v` | in URI | yes | `_id` | native `$set` | native |
//! | SQLServer | `mssql://u:p@h:p/db?k=v` | in URI and fields | no | `id` | `JSON_MODIFY` | native |
//! | SQLite | `sqlite:///path` | separate fields | no | `id` | `json_set` | native |
//! | MQTT | `mqtt://h:1883` | separate fields | no | - | - | - |
//! | HTTP | `http://h:p` | separate fields | no | - | - | - |

use std::fmt;

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Couchbase (N1QL, buckets).
    Couchbase,
    /// `MongoDB`.
    MongoDb,
    /// Microsoft SQL Server in JSON mode.
    SqlServer,
    /// Embedded `SQLite` in JSON mode.
    Sqlite,
    /// MQTT broker.
    Mqtt,
    /// HTTP/REST endpoint.
    Http,
}

impl BackendKind {
    /// All backends.
    pub const ALL: [Self; 6] = [
        Self::Couchbase,
        Self::MongoDb,
        Self::SqlServer,
        Self::Sqlite,
        Self::Mqtt,
        Self::Http,
    ];

    /// Returns the quirk profile for this backend.
    #[must_use]
    pub const fn profile(self) -> &'static BackendProfile {
        match self {
            Self::Couchbase => &BackendProfile::COUCHBASE,
            Self::MongoDb => &BackendProfile::MONGODB,
            Self::SqlServer => &BackendProfile::SQLSERVER,
            Self::Sqlite => &BackendProfile::SQLITE,
            Self::Mqtt => &BackendProfile::MQTT,
            Self::Http => &BackendProfile::HTTP,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.profile().name
    }

    /// Parses a backend name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "couchbase" => Some(Self::Couchbase),
            "mongodb" | "mongo" => Some(Self::MongoDb),
            "sqlserver" | "mssql" => Some(Self::SqlServer),
            "sqlite" => Some(Self::Sqlite),
            "mqtt" => Some(Self::Mqtt),
            "http" | "rest" => Some(Self::Http),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where credentials go in the composed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlacement {
    /// `user:pass@` inside the URI only.
    InUri,
    /// Separate `username`/`password` fields only.
    SeparateFields,
    /// Both in the URI and as separate fields.
    Both,
}

impl AuthPlacement {
    /// Returns true if credentials are embedded in the URI.
    #[must_use]
    pub const fn in_uri(self) -> bool {
        matches!(self, Self::InUri | Self::Both)
    }

    /// Returns true if credentials are kept as separate fields.
    #[must_use]
    pub const fn in_fields(self) -> bool {
        matches!(self, Self::SeparateFields | Self::Both)
    }
}

/// How partial updates are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialUpdateMode {
    /// The driver merges fields natively.
    Native,
    /// Read with CAS, merge locally, replace conditioned on the CAS.
    ReadModifyWrite,
}

/// How batches of ids are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDeleteMode {
    /// One native call for the whole batch.
    Native,
    /// One call per id, skipping ids that are not found.
    OneByOne,
}

/// Quirks of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendProfile {
    /// Backend kind.
    pub kind: BackendKind,
    /// Name used in logs and metrics.
    pub name: &'static str,
    /// Default URI scheme.
    pub scheme: &'static str,
    /// Allowed `protocol` overrides; empty means no override is accepted.
    pub protocols: &'static [&'static str],
    /// Whether each descriptor needs a host.
    pub require_host: bool,
    /// Whether each descriptor needs a port.
    pub require_port: bool,
    /// Port used when a descriptor has none.
    pub default_port: Option<u16>,
    /// Whether a database/bucket name is mandatory.
    pub require_database: bool,
    /// Keys that name the target namespace, in priority order.
    pub database_keys: &'static [&'static str],
    /// Where credentials go.
    pub auth: AuthPlacement,
    /// Whether query-string keys, values and credentials are percent-encoded.
    pub percent_encode: bool,
    /// Whether only the first descriptor is used.
    pub single_host: bool,
    /// Internal name of the `id` field.
    pub id_field: &'static str,
    /// Bookkeeping field tagging documents with their collection.
    pub collection_tag: Option<&'static str>,
    /// Partial update strategy.
    pub partial_update: PartialUpdateMode,
    /// Batch delete strategy.
    pub batch_delete: BatchDeleteMode,
    /// Whether queued DDL is skipped when the table already exists.
    pub skip_schema_if_table_exists: bool,
    /// Native error code meaning "key not found".
    pub not_found_code: Option<i64>,
}

impl BackendProfile {
    /// Couchbase.
    pub const COUCHBASE: Self = Self {
        kind: BackendKind::Couchbase,
        name: "couchbase",
        scheme: "couchbase",
        protocols: &[],
        require_host: true,
        require_port: false,
        default_port: None,
        require_database: false,
        database_keys: &["bucket", "database"],
        auth: AuthPlacement::SeparateFields,
        percent_encode: false,
        single_host: false,
        id_field: "id",
        collection_tag: Some("_c"),
        partial_update: PartialUpdateMode::ReadModifyWrite,
        batch_delete: BatchDeleteMode::OneByOne,
        skip_schema_if_table_exists: false,
        not_found_code: Some(crate::driver::COUCHBASE_KEY_NOT_FOUND),
    };

    /// `MongoDB`.
    pub const MONGODB: Self = Self {
        kind: BackendKind::MongoDb,
        name: "mongodb",
        scheme: "mongodb",
        protocols: &[],
        require_host: true,
        require_port: true,
        default_port: None,
        require_database: true,
        database_keys: &["database"],
        auth: AuthPlacement::InUri,
        percent_encode: true,
        single_host: false,
        id_field: "_id",
        collection_tag: None,
        partial_update: PartialUpdateMode::Native,
        batch_delete: BatchDeleteMode::Native,
        skip_schema_if_table_exists: false,
        not_found_code: None,
    };

    /// SQL Server.
    pub const SQLSERVER: Self = Self {
        kind: BackendKind::SqlServer,
        name: "sqlserver",
        scheme: "mssql",
        protocols: &[],
        require_host: true,
        require_port: true,
        default_port: None,
        require_database: true,
        database_keys: &["database"],
        auth: AuthPlacement::Both,
        percent_encode: false,
        single_host: false,
        id_field: "id",
        collection_tag: None,
        partial_update: PartialUpdateMode::Native,
        batch_delete: BatchDeleteMode::Native,
        skip_schema_if_table_exists: true,
        not_found_code: None,
    };

    /// `SQLite`.
    pub const SQLITE: Self = Self {
        kind: BackendKind::Sqlite,
        name: "sqlite",
        scheme: "sqlite",
        protocols: &[],
        require_host: false,
        require_port: false,
        default_port: None,
        require_database: false,
        database_keys: &["database", "file"],
        auth: AuthPlacement::SeparateFields,
        percent_encode: false,
        single_host: true,
        id_field: "id",
        collection_tag: None,
        partial_update: PartialUpdateMode::Native,
        batch_delete: BatchDeleteMode::Native,
        skip_schema_if_table_exists: true,
        not_found_code: None,
    };

    /// MQTT.
    pub const MQTT: Self = Self {
        kind: BackendKind::Mqtt,
        name: "mqtt",
        scheme: "mqtt",
        protocols: &["mqtt", "mqtts", "tcp", "ssl", "ws", "wss"],
        require_host: true,
        require_port: false,
        default_port: Some(1883),
        require_database: false,
        database_keys: &[],
        auth: AuthPlacement::SeparateFields,
        percent_encode: false,
        single_host: true,
        id_field: "id",
        collection_tag: None,
        partial_update: PartialUpdateMode::Native,
        batch_delete: BatchDeleteMode::Native,
        skip_schema_if_table_exists: false,
        not_found_code: None,
    };

    /// HTTP.
    pub const HTTP: Self = Self {
        kind: BackendKind::Http,
        name: "http",
        scheme: "http",
        protocols: &["http", "https"],
        require_host: true,
        require_port: false,
        default_port: None,
        require_database: false,
        database_keys: &[],
        auth: AuthPlacement::SeparateFields,
        percent_encode: false,
        single_host: true,
        id_field: "id",
        collection_tag: None,
        partial_update: PartialUpdateMode::Native,
        batch_delete: BatchDeleteMode::Native,
        skip_schema_if_table_exists: false,
        not_found_code: None,
    };

    /// Keys consumed by composition and therefore excluded from the query string.
    #[must_use]
    pub fn is_consumed_key(&self, key: &str) -> bool {
        matches!(
            key,
            "uri" | "host" | "port" | "database" | "username" | "password"
        ) || self.database_keys.contains(&key)
            || (!self.protocols.is_empty() && key == "protocol")
    }

    /// Returns true if `protocol` is an accepted override.
    #[must_use]
    pub fn accepts_protocol(&self, protocol: &str) -> bool {
        self.protocols
            .iter()
            .any(|p| p.eq_ignore_ascii_case(protocol))
    }
}
