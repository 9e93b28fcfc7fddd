//! # pipconnect
//!
//! Connection resolution, persistence templates and messaging adapters for
//! component-based microservices.
//!
//! Every backend follows the same shape:
//!
//! - a **composer** turns connection and credential descriptors into a single
//!   validated [`ComposedConnection`](connect::ComposedConnection)
//! - a **connection** owns one native driver handle and its open/close lifecycle
//! - a **persistence** (or **queue**) layers generic paging, filtering and CRUD
//!   (or messaging) on top of the handle
//!
//! Backend differences are captured by [`BackendProfile`](connect::BackendProfile)
//! constants rather than per-backend copies of the same algorithm.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipconnect::config::ConfigParams;
//! use pipconnect::driver::MemoryDriver;
//! use pipconnect::storage::IdentifiablePersistence;
//! use pipconnect::{BackendKind, Context};
//!
//! let config = ConfigParams::from_tuples(&[
//!     ("collection", "dummies"),
//!     ("connection.host", "localhost"),
//!     ("connection.port", "27017"),
//!     ("connection.database", "test"),
//! ]);
//!
//! let mut persistence = IdentifiablePersistence::new(MemoryDriver::new(BackendKind::MongoDb));
//! persistence.configure(&config);
//! persistence.open(&Context::default()).await?;
//! let created = persistence.create(&Context::default(), dummy).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod connect;
pub mod container;
pub mod driver;
pub mod messaging;
pub mod observability;
pub mod query;
pub mod rest;
pub mod storage;

// Re-exports for convenience
pub use config::{ConfigParams, ConnectionOptions};
pub use connect::{
    BackendKind, BackendProfile, ComposedConnection, ConnectionComposer, ConnectionDescriptor,
    CredentialDescriptor,
};
pub use driver::{DriverError, DriverErrorKind, MemoryDriver, NativeDriver, NativeHandle};
pub use storage::{
    Connection, DataPage, Identifiable, IdentifiablePersistence, PagingParams, Persistence,
    References,
};

/// Stable machine-readable error codes.
///
/// The string form (`NO_HOST`, `CONNECT_FAILED`, ...) is what callers and
/// tests branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No connection descriptors were configured, or the connection object is missing.
    NoConnection,
    /// A descriptor without a literal URI has no host.
    NoHost,
    /// A descriptor without a literal URI has no port where one is required.
    NoPort,
    /// No database, bucket or schema name where one is required.
    NoDatabase,
    /// The protocol override was blank.
    NoProtocol,
    /// The protocol override is not supported by the backend.
    UnsupportedProtocol,
    /// No table or collection name was configured.
    NoCollection,
    /// The native driver failed to connect.
    ConnectFailed,
    /// The native driver failed to disconnect.
    DisconnectFailed,
    /// The native driver failed to flush or clear data.
    FlushFailed,
    /// Caller supplied invalid input.
    InvalidInput,
    /// A local operation failed (I/O, parsing).
    OperationFailed,
    /// The native driver reported a data-access error.
    NativeError,
}

impl ErrorCode {
    /// Returns the upper-snake string form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoConnection => "NO_CONNECTION",
            Self::NoHost => "NO_HOST",
            Self::NoPort => "NO_PORT",
            Self::NoDatabase => "NO_DATABASE",
            Self::NoProtocol => "NO_PROTOCOL",
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::NoCollection => "NO_COLLECTION",
            Self::ConnectFailed => "CONNECT_FAILED",
            Self::DisconnectFailed => "DISCONNECT_FAILED",
            Self::FlushFailed => "FLUSH_FAILED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::NativeError => "NATIVE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boxed native error kept as the cause of a connection failure.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for pipconnect operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Config` | Descriptors fail validation before any I/O |
/// | `Connection` | The native driver fails to connect, disconnect or flush |
/// | `InvalidState` | An object is used in the wrong lifecycle state |
/// | `InvalidInput` | Malformed envelopes, unknown commands, bad payloads |
/// | `OperationFailed` | Local I/O or parsing fails (config files, serialization) |
/// | `Driver` | A native data-access call fails (passed through unwrapped) |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Bad or missing configuration, detected synchronously.
    #[error("configuration error [{code}]: {message}")]
    Config {
        /// Error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// The native driver failed at the connection-lifecycle boundary.
    #[error("connection error [{code}]: {message}")]
    Connection {
        /// Error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
        /// The native cause, when there is one.
        #[source]
        cause: Option<BoxedCause>,
    },

    /// Operation attempted in the wrong lifecycle state.
    #[error("invalid state [{code}]: {message}")]
    InvalidState {
        /// Error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A local operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A native data-access error.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Error {
    /// Creates a configuration error.
    pub fn config(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    /// Creates a connection error wrapping an optional native cause.
    pub fn connection(
        code: ErrorCode,
        message: impl Into<String>,
        cause: Option<BoxedCause>,
    ) -> Self {
        Self::Connection {
            code,
            message: message.into(),
            cause,
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::InvalidState {
            code,
            message: message.into(),
        }
    }

    /// Returns the machine-readable code of this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Config { code, .. }
            | Self::Connection { code, .. }
            | Self::InvalidState { code, .. } => *code,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::OperationFailed { .. } => ErrorCode::OperationFailed,
            Self::Driver(_) => ErrorCode::NativeError,
        }
    }
}

/// Result type alias for pipconnect operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-call execution context.
///
/// Carries the trace id that is attached to log events and outgoing requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    trace_id: Option<String>,
}

impl Context {
    /// Creates a context with the given trace id.
    #[must_use]
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
        }
    }

    /// Returns the trace id, if any.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Returns the trace id or an empty string, for log fields.
    #[must_use]
    pub fn trace_id_or_empty(&self) -> &str {
        self.trace_id.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config(ErrorCode::NoHost, "Connection host is not set");
        assert_eq!(
            err.to_string(),
            "configuration error [NO_HOST]: Connection host is not set"
        );

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::invalid_state(ErrorCode::NoConnection, "missing").code(),
            ErrorCode::NoConnection
        );
        assert_eq!(
            Error::InvalidInput("x".to_string()).code().as_str(),
            "INVALID_INPUT"
        );
        let driver = DriverError::not_found("memory", "gone");
        assert_eq!(Error::from(driver).code(), ErrorCode::NativeError);
    }

    #[test]
    fn test_connection_error_keeps_cause() {
        use std::error::Error as _;

        let cause = DriverError::connection("memory", "refused");
        let err = Error::connection(
            ErrorCode::ConnectFailed,
            "Connection to memory failed",
            Some(Box::new(cause)),
        );
        assert_eq!(err.code(), ErrorCode::ConnectFailed);
        let source = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(source.contains("refused"));
    }

    #[test]
    fn test_context_trace_id() {
        assert_eq!(Context::new("abc").trace_id(), Some("abc"));
        assert_eq!(Context::default().trace_id_or_empty(), "");
    }
}
