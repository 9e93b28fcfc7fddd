//! Function container.
//!
//! The host owns the lifecycle: it builds a [`FunctionContainer`], opens it,
//! feeds it [`InboundEnvelope`]s and closes it on shutdown. Nothing here
//! installs process-wide signal handlers.

mod envelope;
mod router;

pub use envelope::{InboundEnvelope, parse_query};
pub use router::{Command, CommandRouter};

use crate::driver::NativeDriver;
use crate::messaging::{MqttConnection, MqttMessageQueue, MqttTransport};
use crate::storage::Connection;
use crate::{Context, Error, ErrorCode, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::Instrument;

/// A component with an explicit open/close lifecycle.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Opens the component.
    async fn open(&self, ctx: &Context) -> Result<()>;

    /// Closes the component.
    async fn close(&self, ctx: &Context) -> Result<()>;
}

#[async_trait]
impl<D: NativeDriver> Lifecycle for Connection<D> {
    async fn open(&self, ctx: &Context) -> Result<()> {
        Self::open(self, ctx).await
    }

    async fn close(&self, ctx: &Context) -> Result<()> {
        Self::close(self, ctx).await
    }
}

#[async_trait]
impl<T: MqttTransport> Lifecycle for MqttConnection<T> {
    async fn open(&self, ctx: &Context) -> Result<()> {
        Self::open(self, ctx).await
    }

    async fn close(&self, ctx: &Context) -> Result<()> {
        Self::close(self, ctx).await
    }
}

#[async_trait]
impl<T: MqttTransport> Lifecycle for MqttMessageQueue<T> {
    async fn open(&self, ctx: &Context) -> Result<()> {
        Self::open(self, ctx).await
    }

    async fn close(&self, ctx: &Context) -> Result<()> {
        Self::close(self, ctx).await
    }
}

/// Hosts commands and the components they use.
///
/// Components open in registration order and close in reverse. A failed
/// open closes the components already opened.
pub struct FunctionContainer {
    name: String,
    components: Vec<Arc<dyn Lifecycle>>,
    router: CommandRouter,
    opened: AtomicBool,
}

impl FunctionContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            router: CommandRouter::new(),
            opened: AtomicBool::new(false),
        }
    }

    /// Adds a lifecycle component.
    pub fn add_component(&mut self, component: Arc<dyn Lifecycle>) {
        self.components.push(component);
    }

    /// Returns the command router for registration.
    pub const fn router_mut(&mut self) -> &mut CommandRouter {
        &mut self.router
    }

    /// Returns the container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the container is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Opens every component.
    ///
    /// # Errors
    ///
    /// Returns the first open error, after closing the components that were
    /// already opened.
    pub async fn open(&self, ctx: &Context) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        for (index, component) in self.components.iter().enumerate() {
            if let Err(e) = component.open(ctx).await {
                tracing::error!(
                    container = %self.name,
                    component = index,
                    error = %e,
                    trace_id = ctx.trace_id_or_empty(),
                    "Component failed to open"
                );
                for opened in self.components[..index].iter().rev() {
                    let _ = opened.close(ctx).await;
                }
                return Err(e);
            }
        }
        self.opened.store(true, Ordering::SeqCst);
        tracing::info!(
            container = %self.name,
            components = self.components.len(),
            commands = ?self.router.names(),
            "Container opened"
        );
        Ok(())
    }

    /// Closes every component in reverse order.
    ///
    /// # Errors
    ///
    /// Returns the first close error; the remaining components are still
    /// closed.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for component in self.components.iter().rev() {
            if let Err(e) = component.close(ctx).await {
                tracing::warn!(
                    container = %self.name,
                    error = %e,
                    trace_id = ctx.trace_id_or_empty(),
                    "Component failed to close"
                );
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(container = %self.name, "Container closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Handles one invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the container is not open, or the
    /// dispatch error.
    pub async fn handle(&self, envelope: InboundEnvelope) -> Result<Value> {
        if !self.is_open() {
            return Err(Error::invalid_state(
                ErrorCode::NoConnection,
                format!("Container {} is not opened", self.name),
            ));
        }
        let ctx = envelope
            .trace_id()
            .map_or_else(Context::default, Context::new);
        let command = envelope.command().unwrap_or("").to_string();
        let span = tracing::info_span!(
            "function.invoke",
            container = %self.name,
            command = %command,
            trace_id = ctx.trace_id_or_empty()
        );

        let start = Instant::now();
        let result = self
            .router
            .dispatch(&ctx, &envelope)
            .instrument(span)
            .await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("function_invocations_total", "status" => status).increment(1);
        metrics::histogram!("function_invocation_duration_ms", "status" => status)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &result {
            tracing::warn!(command = %command, error = %e, "Invocation failed");
        }
        result
    }
}

impl std::fmt::Debug for FunctionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionContainer")
            .field("name", &self.name)
            .field("components", &self.components.len())
            .field("router", &self.router)
            .field("open", &self.is_open())
            .finish()
    }
}
