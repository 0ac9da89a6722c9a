//! The event bus: an explicit, cloneable handle over the registry,
//! dispatcher, agent registrar and peering manager.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use synapse_core::{
    AgentId, BusError, BusResult, PeerConnectionId, Scope, ScopeKind, SubscriptionId,
};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::agents::{AgentInfo, AgentRegistrar};
use crate::dispatch::{DeliveryOrdering, DispatchConfig, Dispatcher};
use crate::envelope::{EventEnvelope, EventName, Payload};
use crate::handler::{EventHandler, HandlerEntry};
use crate::peering::{
    CapabilityMatchPolicy, DeliveryFailure, DeliveryResult, PeerCapabilities, PeerConnection,
    PeeringConfig, PeeringManager, PeeringPolicy, PeeringRequirements,
};
use crate::registry::{Audience, ScopeRegistry};
use crate::stats::{BusMetrics, BusStats, StatsConfig};

struct BusInner {
    registry: Arc<ScopeRegistry>,
    agents: Arc<AgentRegistrar>,
    dispatcher: Dispatcher,
    peering: Arc<PeeringManager>,
    metrics: Arc<BusMetrics>,
}

impl BusInner {
    fn route(&self, envelope: &Arc<EventEnvelope>, audience: &Audience) -> usize {
        let subscriptions = self.registry.resolve_in(audience, envelope.name());
        if subscriptions.is_empty() {
            BusMetrics::incr(&self.metrics.events_unrouted);
            debug!(
                event_id = %envelope.id(),
                event_name = %envelope.name(),
                "No subscribers for event"
            );
            return 0;
        }
        self.dispatcher.dispatch(envelope, subscriptions)
    }

    fn dispose_agent(&self, agent: AgentId) -> bool {
        self.peering.close_for_agent(agent);
        let Some(owned) = self.agents.dispose(agent) else {
            return false;
        };
        for id in owned {
            self.dispatcher.close_lane(id);
        }
        true
    }
}

/// How a directed emission was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Accepted onto an active peer link.
    Peer(PeerConnectionId),
    /// Resolved through the registry, restricted to the target's
    /// subscriptions.
    Bus {
        /// Deliveries scheduled.
        scheduled: usize,
        /// The peer failure that caused the fallback, if a link was tried.
        fallback: Option<DeliveryFailure>,
    },
    /// The event name was malformed; nothing was sent.
    Dropped,
}

/// A fully described emission, for when `emit` is not enough.
///
/// # Example
///
/// ```rust
/// use synapse_events::{Audience, Emission, EventBus};
///
/// # async fn example() {
/// let bus = EventBus::new();
/// let scheduled = bus.publish(
///     Emission::new("deploy.finished")
///         .field("service", "billing")
///         .to(Audience::channel("ops")),
/// );
/// assert_eq!(scheduled, 0);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Emission {
    name: String,
    payload: Payload,
    source: Option<AgentId>,
    correlation_id: Option<Uuid>,
    audience: Audience,
}

impl Emission {
    /// Start an emission with an empty payload, broadcast to everyone.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::new(),
            source: None,
            correlation_id: None,
            audience: Audience::Broadcast,
        }
    }

    /// Replace the payload.
    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Add one payload field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the emitting agent.
    #[must_use]
    pub fn source(mut self, agent: AgentId) -> Self {
        self.source = Some(agent);
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Continue the causal chain of `parent`.
    #[must_use]
    pub fn caused_by(mut self, parent: &EventEnvelope) -> Self {
        self.correlation_id = Some(parent.correlation_id().unwrap_or_else(|| parent.id()));
        self
    }

    /// Restrict resolution to an audience.
    #[must_use]
    pub fn to(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    dispatch: DispatchConfig,
    peering: PeeringConfig,
    stats: StatsConfig,
    runtime: Option<Handle>,
    policy: Option<Arc<dyn PeeringPolicy>>,
}

impl fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("dispatch", &self.dispatch)
            .field("peering", &self.peering)
            .field("stats", &self.stats)
            .field("has_runtime", &self.runtime.is_some())
            .field("has_policy", &self.policy.is_some())
            .finish()
    }
}

impl EventBusBuilder {
    /// Builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dispatcher configuration.
    #[must_use]
    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    /// Replace the peering configuration.
    #[must_use]
    pub fn peering_config(mut self, config: PeeringConfig) -> Self {
        self.peering = config;
        self
    }

    /// Replace the statistics configuration.
    #[must_use]
    pub fn stats_config(mut self, config: StatsConfig) -> Self {
        self.stats = config;
        self
    }

    /// Set the delivery ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: DeliveryOrdering) -> Self {
        self.dispatch.ordering = ordering;
        self
    }

    /// Set the per-handler timeout.
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch.handler_timeout = Some(timeout);
        self
    }

    /// Bound the number of handlers running at once.
    #[must_use]
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.dispatch.max_concurrent_handlers = Some(limit);
        self
    }

    /// Run deliveries on this runtime instead of the caller's.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Replace the peering policy.
    #[must_use]
    pub fn peering_policy(mut self, policy: Arc<dyn PeeringPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the bus.
    #[must_use]
    pub fn build(self) -> EventBus {
        let metrics = Arc::new(BusMetrics::new(&self.stats));
        let registry = Arc::new(ScopeRegistry::new());
        let agents = Arc::new(AgentRegistrar::new(Arc::clone(&registry)));
        let dispatcher = Dispatcher::new(self.dispatch, Arc::clone(&metrics), self.runtime.clone());
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(CapabilityMatchPolicy));
        let peering = Arc::new(PeeringManager::new(
            self.peering,
            Arc::clone(&agents),
            policy,
            dispatcher.executor(),
            Arc::clone(&metrics),
            self.runtime,
        ));

        debug!(
            ordering = ?dispatcher.config().ordering,
            peering_enabled = peering.config().enabled,
            "Event bus created"
        );

        EventBus {
            inner: Arc::new(BusInner {
                registry,
                agents,
                dispatcher,
                peering,
                metrics,
            }),
        }
    }
}

/// Scoped publish/subscribe event bus.
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Example
///
/// ```rust
/// use synapse_core::ScopeKind;
/// use synapse_events::{EventBus, Payload, handler_fn};
///
/// # async fn example() {
/// let bus = EventBus::new();
/// let billing = bus.register_agent("billing");
/// bus.register_handler(
///     billing,
///     "order.created",
///     ScopeKind::Agent,
///     None,
///     handler_fn("on-order", |_envelope| async { Ok(()) }),
/// )
/// .unwrap();
///
/// assert_eq!(bus.emit("order.created", Payload::new(), None), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscription_count", &self.inner.registry.len())
            .field("agent_count", &self.inner.agents.len())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with default settings.
    #[must_use]
    pub fn new() -> Self {
        EventBusBuilder::new().build()
    }

    /// Start a builder.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Emit an event to every matching subscription.
    ///
    /// Returns once deliveries are scheduled, with their count. Never
    /// fails: malformed names and unrouted events are logged and counted.
    pub fn emit(&self, name: &str, payload: Payload, source: Option<AgentId>) -> usize {
        let Some(name) = self.parse_name(name) else {
            return 0;
        };
        let mut envelope = EventEnvelope::new(name, payload);
        if let Some(source) = source {
            envelope = envelope.with_source(source);
        }
        self.emit_envelope(envelope)
    }

    /// Emit a prebuilt envelope.
    pub fn emit_envelope(&self, envelope: EventEnvelope) -> usize {
        self.inner.metrics.record_emit();
        let envelope = Arc::new(envelope);
        trace!(event_id = %envelope.id(), event_name = %envelope.name(), "Emitting event");
        self.inner.route(&envelope, &Audience::Broadcast)
    }

    /// Emit a fully described emission.
    pub fn publish(&self, emission: Emission) -> usize {
        let Some(name) = self.parse_name(&emission.name) else {
            return 0;
        };
        let mut envelope = EventEnvelope::new(name, emission.payload);
        if let Some(source) = emission.source {
            envelope = envelope.with_source(source);
        }
        if let Some(correlation_id) = emission.correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }

        self.inner.metrics.record_emit();
        self.inner.route(&Arc::new(envelope), &emission.audience)
    }

    /// Emit from `source` directly to `target`.
    ///
    /// Uses the active peer link for the pair when there is one; otherwise,
    /// or when the link refuses, resolves through the registry restricted to
    /// the target's subscriptions.
    pub fn emit_to(&self, source: AgentId, target: AgentId, name: &str, payload: Payload) -> Routed {
        let Some(name) = self.parse_name(name) else {
            return Routed::Dropped;
        };
        let envelope = Arc::new(EventEnvelope::new(name, payload).with_source(source));
        self.inner.metrics.record_emit();

        let mut fallback = None;
        let mut envelope = envelope;
        if let Some(connection) = self.inner.peering.route_for(source, target) {
            match self.inner.peering.send_via_peer(connection, envelope) {
                DeliveryResult::Delivered => return Routed::Peer(connection),
                DeliveryResult::Failed {
                    failure,
                    envelope: returned,
                } => {
                    BusMetrics::incr(&self.inner.metrics.peer_fallbacks);
                    debug!(
                        connection_id = %connection,
                        event_id = %returned.id(),
                        failure = %failure,
                        "Peer delivery failed, resubmitting on the bus"
                    );
                    fallback = Some(failure);
                    envelope = returned;
                },
            }
        }

        let scheduled = self.inner.route(&envelope, &Audience::Agent(target));
        Routed::Bus {
            scheduled,
            fallback,
        }
    }

    fn parse_name(&self, name: &str) -> Option<EventName> {
        match EventName::parse(name) {
            Ok(name) => Some(name),
            Err(error) => {
                BusMetrics::incr(&self.inner.metrics.invalid_events);
                warn!(error = %error, "Rejected emission");
                None
            },
        }
    }

    /// Register a new agent.
    pub fn register_agent(&self, display_name: impl Into<String>) -> AgentId {
        self.inner.agents.register_agent(display_name)
    }

    /// Register a new agent tied to the returned handle's lifetime.
    #[must_use]
    pub fn spawn_agent(&self, display_name: impl Into<String>) -> AgentHandle {
        AgentHandle {
            id: self.register_agent(display_name),
            bus: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Attach a handler to an agent.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::InvalidPattern`],
    /// [`synapse_core::BusError::InvalidScope`] or
    /// [`synapse_core::BusError::AgentNotFound`].
    pub fn register_handler(
        &self,
        agent: AgentId,
        pattern: &str,
        kind: ScopeKind,
        key: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        self.inner
            .agents
            .register_handler(agent, pattern, kind, key, handler)
    }

    /// Register an agent's handler table.
    ///
    /// # Errors
    ///
    /// Returns the first invalid entry's error, or
    /// [`synapse_core::BusError::AgentNotFound`].
    pub fn register_table(
        &self,
        agent: AgentId,
        entries: &[HandlerEntry],
    ) -> BusResult<Vec<SubscriptionId>> {
        self.inner.agents.register_table(agent, entries)
    }

    /// Subscribe without an owning agent.
    ///
    /// The bus only keeps a weak reference: the subscription stops
    /// receiving once the caller drops `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::InvalidPattern`] or
    /// [`synapse_core::BusError::InvalidScope`].
    pub fn subscribe(
        &self,
        scope: Scope,
        pattern: &str,
        handler: &Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        self.inner
            .registry
            .register_str(scope, pattern, Arc::downgrade(handler), None)
    }

    /// Remove one subscription. Idempotent.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let removed = match self.inner.registry.owner_of(id) {
            Some(agent) => self.inner.agents.unregister_handler(agent, id),
            None => self.inner.registry.unregister(id),
        };
        self.inner.dispatcher.close_lane(id);
        removed
    }

    /// Dispose an agent: close its peer links and remove every subscription
    /// it owns. Idempotent.
    pub fn dispose_agent(&self, agent: AgentId) -> bool {
        self.inner.dispose_agent(agent)
    }

    /// Declare an agent's peering capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::AgentNotFound`].
    pub fn declare_capabilities(
        &self,
        agent: AgentId,
        capabilities: PeerCapabilities,
    ) -> BusResult<()> {
        self.inner.agents.set_capabilities(agent, capabilities)
    }

    /// Negotiate a peer connection.
    ///
    /// # Errors
    ///
    /// See [`PeeringManager::request_peering`].
    pub async fn request_peering(
        &self,
        initiator: AgentId,
        target: AgentId,
        requirements: PeeringRequirements,
    ) -> BusResult<PeerConnectionId> {
        self.inner
            .peering
            .request_peering(initiator, target, requirements)
            .await
    }

    /// Send one envelope over a peer connection.
    ///
    /// The caller owns the fallback: a failed result returns the envelope.
    pub fn send_via_peer(&self, id: PeerConnectionId, envelope: EventEnvelope) -> DeliveryResult {
        self.inner.peering.send_via_peer(id, Arc::new(envelope))
    }

    /// Close a peer connection. Idempotent.
    pub fn close_peering(&self, id: PeerConnectionId) -> bool {
        self.inner.peering.close_peering(id)
    }

    /// Snapshot of one open peer connection.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::ConnectionNotFound`] if the
    /// connection is unknown or closed.
    pub fn peer_connection(&self, id: PeerConnectionId) -> BusResult<PeerConnection> {
        self.inner
            .peering
            .connection(id)
            .ok_or_else(|| BusError::ConnectionNotFound {
                connection_id: id.to_string(),
            })
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.inner.metrics.snapshot(
            self.inner.registry.len(),
            self.inner.agents.len(),
            self.inner.peering.active_count(),
        )
    }

    /// Snapshot of every agent.
    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.inner.agents.list_agents()
    }

    /// The scope registry.
    #[must_use]
    pub fn registry(&self) -> &ScopeRegistry {
        &self.inner.registry
    }

    /// The agent registrar.
    #[must_use]
    pub fn agents(&self) -> &AgentRegistrar {
        &self.inner.agents
    }

    /// The peering manager.
    #[must_use]
    pub fn peering(&self) -> &Arc<PeeringManager> {
        &self.inner.peering
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

/// Owning handle for an agent created with [`EventBus::spawn_agent`].
///
/// Dropping the handle disposes the agent. The handle only holds a weak
/// reference to the bus, so it never keeps the bus alive.
pub struct AgentHandle {
    id: AgentId,
    bus: Weak<BusInner>,
    detached: bool,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

impl AgentHandle {
    /// The agent's identifier.
    #[must_use]
    pub fn id(&self) -> AgentId {
        self.id
    }

    fn bus(&self) -> Option<EventBus> {
        self.bus.upgrade().map(|inner| EventBus { inner })
    }

    /// Attach a handler to this agent.
    ///
    /// # Errors
    ///
    /// See [`EventBus::register_handler`]. Fails with
    /// [`synapse_core::BusError::AgentNotFound`] once the bus is gone.
    pub fn register_handler(
        &self,
        pattern: &str,
        kind: ScopeKind,
        key: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        match self.bus() {
            Some(bus) => bus.register_handler(self.id, pattern, kind, key, handler),
            None => Err(BusError::AgentNotFound {
                agent_id: self.id.to_string(),
            }),
        }
    }

    /// Register a handler table for this agent.
    ///
    /// # Errors
    ///
    /// See [`EventBus::register_table`].
    pub fn register_table(&self, entries: &[HandlerEntry]) -> BusResult<Vec<SubscriptionId>> {
        match self.bus() {
            Some(bus) => bus.register_table(self.id, entries),
            None => Err(BusError::AgentNotFound {
                agent_id: self.id.to_string(),
            }),
        }
    }

    /// Emit with this agent as the source.
    pub fn emit(&self, name: &str, payload: Payload) -> usize {
        self.bus()
            .map_or(0, |bus| bus.emit(name, payload, Some(self.id)))
    }

    /// Release ownership without disposing the agent.
    #[must_use]
    pub fn detach(mut self) -> AgentId {
        self.detached = true;
        self.id
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.dispose_agent(self.id);
        }
    }
}
