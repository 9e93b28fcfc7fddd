//! Native connection lifecycle.

use crate::config::{ConfigParams, ConnectionOptions};
use crate::connect::{BackendProfile, ComposedConnection, ConnectionComposer};
use crate::driver::{DriverErrorKind, NativeDriver, NativeHandle};
use crate::{Context, Error, ErrorCode, Result};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct OpenState<H> {
    handle: Arc<H>,
    composed: ComposedConnection,
}

/// Owns one native driver handle.
///
/// ```text
/// Closed ──open──► Open ──close──► Closed
/// ```
///
/// `open` on an open connection and `close` on a closed one are no-ops.
/// Methods take `&self` so one connection can be shared behind an `Arc`
/// by several persistences. Concurrent `open` and `close` calls are
/// serialized, so only one native handle is ever connected.
pub struct Connection<D: NativeDriver> {
    driver: Arc<D>,
    composer: ConnectionComposer,
    config: ConfigParams,
    options: ConnectionOptions,
    state: RwLock<Option<OpenState<D::Handle>>>,
    transition: tokio::sync::Mutex<()>,
}

impl<D: NativeDriver> Connection<D> {
    /// Creates a closed connection for `driver`.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self::from_shared_driver(Arc::new(driver))
    }

    /// Creates a closed connection for a shared driver.
    #[must_use]
    pub fn from_shared_driver(driver: Arc<D>) -> Self {
        let composer = ConnectionComposer::for_backend(driver.kind());
        Self {
            driver,
            composer,
            config: ConfigParams::new(),
            options: ConnectionOptions::default(),
            state: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Stores the configuration and merges `options.*` over the defaults.
    ///
    /// Takes effect on the next `open`.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.config = config.clone();
        self.options = ConnectionOptions::default().configure(config);
    }

    /// Replaces the connection options.
    pub fn set_options(&mut self, options: ConnectionOptions) {
        self.options = options;
    }

    /// Returns the effective options.
    #[must_use]
    pub const fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Returns the backend profile.
    #[must_use]
    pub const fn profile(&self) -> &'static BackendProfile {
        self.composer.profile()
    }

    /// Returns the driver.
    #[must_use]
    pub const fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Option<OpenState<D::Handle>>> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<OpenState<D::Handle>>> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns true if a native handle is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.read_state().is_some()
    }

    /// Returns the native handle, or `None` when closed.
    #[must_use]
    pub fn handle(&self) -> Option<Arc<D::Handle>> {
        self.read_state().as_ref().map(|s| Arc::clone(&s.handle))
    }

    /// Returns the database, bucket or file name, or `None` when closed.
    #[must_use]
    pub fn database_name(&self) -> Option<String> {
        self.read_state()
            .as_ref()
            .and_then(|s| s.composed.database().map(ToString::to_string))
    }

    /// Returns the composed connection, or `None` when closed.
    #[must_use]
    pub fn composed(&self) -> Option<ComposedConnection> {
        self.read_state().as_ref().map(|s| s.composed.clone())
    }

    /// Composes the connection and connects the native driver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate, or
    /// [`Error::Connection`] with `CONNECT_FAILED` if the driver fails, times
    /// out, or the namespace bootstrap fails. No handle is retained on failure.
    pub async fn open(&self, ctx: &Context) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let profile = self.profile();
        let composed = self.composer.resolve(&self.config)?;
        let timeout = self.options.connect_timeout;

        let connected =
            tokio::time::timeout(timeout, self.driver.connect(&composed, &self.options)).await;
        let handle = match connected {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::error!(
                    backend = profile.name,
                    trace_id = ctx.trace_id_or_empty(),
                    error = %e,
                    "Connection failed"
                );
                return Err(Error::connection(
                    ErrorCode::ConnectFailed,
                    format!("Connection to {} failed", profile.name),
                    Some(Box::new(e)),
                ));
            },
            Err(elapsed) => {
                tracing::error!(
                    backend = profile.name,
                    trace_id = ctx.trace_id_or_empty(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Connection timed out"
                );
                return Err(Error::connection(
                    ErrorCode::ConnectFailed,
                    format!(
                        "Connection to {} timed out after {}ms",
                        profile.name,
                        timeout.as_millis()
                    ),
                    Some(Box::new(elapsed)),
                ));
            },
        };

        if let Err(e) = self.bootstrap(&handle, &composed, ctx).await {
            let _ = handle.close().await;
            return Err(e);
        }

        tracing::debug!(
            backend = profile.name,
            target = composed.target_name(),
            trace_id = ctx.trace_id_or_empty(),
            "Connected"
        );
        metrics::counter!("connection_open_total", "backend" => profile.name).increment(1);

        *self.write_state() = Some(OpenState {
            handle: Arc::new(handle),
            composed,
        });
        Ok(())
    }

    /// Creates the namespace and primary index when requested.
    async fn bootstrap(
        &self,
        handle: &D::Handle,
        composed: &ComposedConnection,
        ctx: &Context,
    ) -> Result<()> {
        let Some(namespace) = composed.database() else {
            return Ok(());
        };
        let profile = self.profile();

        if self.options.auto_create {
            match handle.create_namespace(namespace).await {
                Ok(()) => {
                    tracing::debug!(
                        backend = profile.name,
                        namespace,
                        trace_id = ctx.trace_id_or_empty(),
                        "Created namespace"
                    );
                    let delay = self.options.auto_create_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                },
                Err(e) if e.kind == DriverErrorKind::AlreadyExists => {},
                Err(e) => {
                    return Err(Error::connection(
                        ErrorCode::ConnectFailed,
                        format!("Failed to create {} namespace {namespace}", profile.name),
                        Some(Box::new(e)),
                    ));
                },
            }
        }

        if self.options.auto_index {
            handle
                .create_primary_index(namespace)
                .await
                .map_err(|e| {
                    Error::connection(
                        ErrorCode::ConnectFailed,
                        format!("Failed to create primary index on {namespace}"),
                        Some(Box::new(e)),
                    )
                })?;
        }
        Ok(())
    }

    /// Releases the native handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] with `DISCONNECT_FAILED` if the native
    /// close fails. The handle is released either way.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let _transition = self.transition.lock().await;
        let state = self.write_state().take();
        let Some(state) = state else {
            return Ok(());
        };
        let profile = self.profile();

        state.handle.close().await.map_err(|e| {
            Error::connection(
                ErrorCode::DisconnectFailed,
                format!("Disconnect from {} failed", profile.name),
                Some(Box::new(e)),
            )
        })?;

        tracing::debug!(
            backend = profile.name,
            target = state.composed.target_name(),
            trace_id = ctx.trace_id_or_empty(),
            "Disconnected"
        );
        Ok(())
    }
}

impl<D: NativeDriver> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("backend", &self.profile().name)
            .field("options", &self.options)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
