//! Event handler trait and registration tables.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use synapse_core::{BusResult, Scope, ScopeKind, SubscriptionId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::envelope::EventEnvelope;
use crate::pattern::Pattern;

/// Failure reported by a handler.
///
/// Handler failures never reach the emitter; the dispatcher logs and counts
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler tried and failed.
    #[error("handler failed: {0}")]
    Failed(String),
    /// The handler refused the event.
    #[error("handler rejected event: {0}")]
    Rejected(String),
}

/// Result type for handler invocations.
pub type HandlerResult = Result<(), HandlerError>;

/// Per-delivery information passed alongside the envelope.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// The subscription being served.
    pub subscription_id: SubscriptionId,
    /// Partition the subscription lives in.
    pub scope: Scope,
    /// Cancelled when the delivery exceeds its timeout.
    pub cancellation: CancellationToken,
    /// Whether the event arrived over a direct peer link.
    pub via_peer: bool,
}

impl DeliveryContext {
    /// Context for a registry delivery.
    #[must_use]
    pub fn subscription(id: SubscriptionId, scope: Scope) -> Self {
        Self {
            subscription_id: id,
            scope,
            cancellation: CancellationToken::new(),
            via_peer: false,
        }
    }

    /// Context for a delivery on a peer link.
    #[must_use]
    pub fn peer(id: SubscriptionId, scope: Scope) -> Self {
        Self {
            via_peer: true,
            ..Self::subscription(id, scope)
        }
    }

    /// Whether the bus has given up waiting on this delivery.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Trait implemented by every event subscriber.
///
/// Handlers run on tokio tasks and may be invoked concurrently for
/// different events. Returning an error, or panicking, affects only the
/// current delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, envelope: Arc<EventEnvelope>, ctx: DeliveryContext) -> HandlerResult;

    /// Optional name for logs.
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Non-owning handler reference stored by the registry.
pub type HandlerRef = Weak<dyn EventHandler>;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: Arc<EventEnvelope>, _ctx: DeliveryContext) -> HandlerResult {
        (self.func)(envelope).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a handler from an async closure.
///
/// # Example
///
/// ```rust
/// use synapse_events::{EventHandler, handler_fn};
///
/// let handler = handler_fn("audit", |envelope| async move {
///     assert!(!envelope.name().as_str().is_empty());
///     Ok(())
/// });
/// assert_eq!(handler.name(), "audit");
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        func,
    })
}

/// One row of an agent's registration table.
///
/// Agents declare their handlers as a static list instead of having them
/// discovered at runtime.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Pattern text, validated at registration.
    pub pattern: String,
    /// Partition kind.
    pub kind: ScopeKind,
    /// Partition key. Ignored for the agent's own scope.
    pub key: Option<String>,
    /// The handler, owned by the agent once registered.
    pub handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("pattern", &self.pattern)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("handler", &self.handler.name())
            .finish()
    }
}

impl HandlerEntry {
    fn new(
        pattern: impl Into<String>,
        kind: ScopeKind,
        key: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            key,
            handler,
        }
    }

    /// Entry in the agent's private scope.
    #[must_use]
    pub fn agent(pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self::new(pattern, ScopeKind::Agent, None, handler)
    }

    /// Entry in the global scope.
    #[must_use]
    pub fn global(pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self::new(pattern, ScopeKind::Global, None, handler)
    }

    /// Entry in a channel scope.
    #[must_use]
    pub fn channel(
        channel: impl Into<String>,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self::new(pattern, ScopeKind::Channel, Some(channel.into()), handler)
    }

    /// Entry in a role scope.
    #[must_use]
    pub fn role(
        role: impl Into<String>,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self::new(pattern, ScopeKind::Role, Some(role.into()), handler)
    }

    /// Entry in a namespace scope.
    #[must_use]
    pub fn namespace(
        namespace: impl Into<String>,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self::new(
            pattern,
            ScopeKind::Namespace,
            Some(namespace.into()),
            handler,
        )
    }

    /// Validate the pattern.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::InvalidPattern`] when malformed.
    pub fn parse_pattern(&self) -> BusResult<Pattern> {
        Pattern::parse(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = handler_fn("echo", |envelope| async move {
            if envelope.name().as_str() == "fail.now" {
                Err(HandlerError::Failed("asked to".into()))
            } else {
                Ok(())
            }
        });
        let ctx = DeliveryContext::subscription(SubscriptionId::new(), Scope::global());

        let ok = Arc::new(EventEnvelope::named("a.b", Payload::new()).unwrap());
        assert!(handler.handle(ok, ctx.clone()).await.is_ok());

        let bad = Arc::new(EventEnvelope::named("fail.now", Payload::new()).unwrap());
        assert_eq!(
            handler.handle(bad, ctx).await,
            Err(HandlerError::Failed("asked to".into()))
        );
        assert_eq!(handler.name(), "echo");
    }

    #[test]
    fn test_handler_entry_constructors() {
        let handler = handler_fn("noop", |_| async { Ok(()) });

        let entry = HandlerEntry::channel("ops", "any.alert", Arc::clone(&handler));
        assert_eq!(entry.kind, ScopeKind::Channel);
        assert_eq!(entry.key.as_deref(), Some("ops"));
        assert!(entry.parse_pattern().is_ok());

        let entry = HandlerEntry::agent("bad..pattern", handler);
        assert_eq!(entry.kind, ScopeKind::Agent);
        assert!(entry.parse_pattern().is_err());
    }

    #[test]
    fn test_delivery_context() {
        let ctx = DeliveryContext::peer(SubscriptionId::new(), Scope::global());
        assert!(ctx.via_peer);
        assert!(!ctx.is_cancelled());
        ctx.cancellation.cancel();
        assert!(ctx.is_cancelled());
    }
}
