//! Named command dispatch.

use super::envelope::InboundEnvelope;
use crate::{Context, Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// An action invoked by command name.
#[async_trait]
pub trait Command: Send + Sync {
    /// Runs the action.
    async fn execute(&self, ctx: &Context, envelope: &InboundEnvelope) -> Result<Value>;
}

struct FnCommand<F>(F);

#[async_trait]
impl<F, Fut> Command for FnCommand<F>
where
    F: Fn(Context, InboundEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, ctx: &Context, envelope: &InboundEnvelope) -> Result<Value> {
        (self.0)(ctx.clone(), envelope.clone()).await
    }
}

/// Registry of commands keyed by name.
#[derive(Default, Clone)]
pub struct CommandRouter {
    commands: BTreeMap<String, Arc<dyn Command>>,
}

impl CommandRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the name is empty or taken.
    pub fn register(&mut self, name: &str, command: Arc<dyn Command>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidInput("command name is empty".to_string()));
        }
        if self.commands.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "command '{name}' is already registered"
            )));
        }
        self.commands.insert(name.to_string(), command);
        Ok(())
    }

    /// Registers an async closure as a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the name is empty or taken.
    pub fn register_fn<F, Fut>(&mut self, name: &str, action: F) -> Result<()>
    where
        F: Fn(Context, InboundEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnCommand(action)))
    }

    /// Returns the registered names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    /// Runs the command named by the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the envelope has no command or the
    /// command is unknown, or the error of the command itself.
    pub async fn dispatch(&self, ctx: &Context, envelope: &InboundEnvelope) -> Result<Value> {
        let name = envelope
            .command()
            .ok_or_else(|| Error::InvalidInput("command is missing".to_string()))?;
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("command '{name}' is not registered")))?;
        command.execute(ctx, envelope).await
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> CommandRouter {
        let mut router = CommandRouter::new();
        router
            .register_fn("echo", |_ctx, envelope| async move {
                Ok(envelope.body().clone())
            })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_dispatch() {
        let envelope = InboundEnvelope::new(json!({"cmd": "echo", "x": 1}), BTreeMap::new());
        let result = router().dispatch(&Context::default(), &envelope).await.unwrap();
        assert_eq!(result, json!({"cmd": "echo", "x": 1}));
    }

    #[tokio::test]
    async fn test_missing_and_unknown_command() {
        let router = router();
        let ctx = Context::default();
        let missing = InboundEnvelope::new(json!({}), BTreeMap::new());
        assert!(matches!(
            router.dispatch(&ctx, &missing).await,
            Err(Error::InvalidInput(_))
        ));
        let unknown = InboundEnvelope::new(json!({"cmd": "nope"}), BTreeMap::new());
        assert!(matches!(
            router.dispatch(&ctx, &unknown).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut router = router();
        let result = router.register_fn("echo", |_ctx, _envelope| async { Ok(Value::Null) });
        assert!(result.is_err());
        assert_eq!(router.names(), ["echo"]);
    }
}
