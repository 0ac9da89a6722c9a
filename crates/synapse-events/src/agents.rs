//! Agent registrar: lifecycle of dynamically created subscribers.
//!
//! The registrar owns the strong handler references of every agent. The
//! scope registry only sees weak ones, so disposing an agent releases its
//! handlers even if a stale weak reference is still being resolved.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use synapse_core::{AgentId, BusError, BusResult, Scope, ScopeKind, SubscriptionId, Timestamp};
use tracing::{debug, info};

use crate::envelope::EventName;
use crate::handler::{EventHandler, HandlerEntry};
use crate::pattern::Pattern;
use crate::peering::PeerCapabilities;
use crate::registry::{ResolvedSubscription, ScopeRegistry};

struct OwnedHandler {
    id: SubscriptionId,
    pattern: Pattern,
    scope: Scope,
    handler: Arc<dyn EventHandler>,
}

struct AgentRecord {
    display_name: String,
    registered_at: Timestamp,
    capabilities: PeerCapabilities,
    handlers: Vec<OwnedHandler>,
}

/// Read-only view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent identifier.
    pub id: AgentId,
    /// Human-readable name.
    pub display_name: String,
    /// Registration time.
    pub registered_at: Timestamp,
    /// Subscriptions the agent owns.
    pub subscription_count: usize,
    /// Declared peering capabilities.
    pub capabilities: PeerCapabilities,
}

/// Registry of live agents and their handler tables.
pub struct AgentRegistrar {
    agents: DashMap<AgentId, AgentRecord>,
    registry: Arc<ScopeRegistry>,
}

impl fmt::Debug for AgentRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistrar")
            .field("agent_count", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl AgentRegistrar {
    /// Create a registrar writing into `registry`.
    #[must_use]
    pub fn new(registry: Arc<ScopeRegistry>) -> Self {
        Self {
            agents: DashMap::new(),
            registry,
        }
    }

    /// Register a new agent.
    pub fn register_agent(&self, display_name: impl Into<String>) -> AgentId {
        let id = AgentId::new();
        let display_name = display_name.into();

        info!(agent_id = %id, display_name = %display_name, "Agent registered");

        self.agents.insert(
            id,
            AgentRecord {
                display_name,
                registered_at: Timestamp::now(),
                capabilities: PeerCapabilities::default(),
                handlers: Vec::new(),
            },
        );
        id
    }

    /// Resolve the scope a handler of `agent` registers into.
    ///
    /// An agent-kind scope always means the agent's own partition; naming
    /// another agent's key is rejected.
    fn scope_for(agent: AgentId, kind: ScopeKind, key: Option<String>) -> BusResult<Scope> {
        if kind != ScopeKind::Agent {
            return Scope::new(kind, key);
        }

        let own = Scope::agent(agent);
        match key {
            None => Ok(own),
            Some(key) if own.key.as_deref() == Some(key.as_str()) => Ok(own),
            Some(key) => Err(BusError::InvalidScope(format!(
                "agent {agent} cannot register into agent scope '{key}'"
            ))),
        }
    }

    /// Attach a handler to an agent.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidPattern`], [`BusError::InvalidScope`] or
    /// [`BusError::AgentNotFound`].
    pub fn register_handler(
        &self,
        agent: AgentId,
        pattern: &str,
        kind: ScopeKind,
        key: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        let pattern = Pattern::parse(pattern)?;
        let scope = Self::scope_for(agent, kind, key)?;

        // Held across the registry write so disposal cannot interleave.
        let mut record = self.agents.get_mut(&agent).ok_or_else(|| not_found(agent))?;
        Self::attach(&self.registry, agent, &mut record, pattern, scope, handler)
    }

    fn attach(
        registry: &ScopeRegistry,
        agent: AgentId,
        record: &mut AgentRecord,
        pattern: Pattern,
        scope: Scope,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        let id = registry.register(
            scope.clone(),
            pattern.clone(),
            Arc::downgrade(&handler),
            Some(agent),
        )?;

        debug!(
            agent_id = %agent,
            subscription_id = %id,
            handler = %handler.name(),
            "Handler attached"
        );

        record.handlers.push(OwnedHandler {
            id,
            pattern,
            scope,
            handler,
        });
        Ok(id)
    }

    /// Register a whole handler table.
    ///
    /// Every entry is validated before any is registered, so a bad entry
    /// leaves the agent unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first validation error, or [`BusError::AgentNotFound`].
    pub fn register_table(
        &self,
        agent: AgentId,
        entries: &[HandlerEntry],
    ) -> BusResult<Vec<SubscriptionId>> {
        let prepared = entries
            .iter()
            .map(|entry| {
                Ok((
                    entry.parse_pattern()?,
                    Self::scope_for(agent, entry.kind, entry.key.clone())?,
                    Arc::clone(&entry.handler),
                ))
            })
            .collect::<BusResult<Vec<_>>>()?;

        let mut record = self.agents.get_mut(&agent).ok_or_else(|| not_found(agent))?;
        prepared
            .into_iter()
            .map(|(pattern, scope, handler)| {
                Self::attach(&self.registry, agent, &mut record, pattern, scope, handler)
            })
            .collect()
    }

    /// Detach one handler. Returns `false` if the agent does not own it.
    pub fn unregister_handler(&self, agent: AgentId, id: SubscriptionId) -> bool {
        let Some(mut record) = self.agents.get_mut(&agent) else {
            return false;
        };
        let Some(position) = record.handlers.iter().position(|h| h.id == id) else {
            return false;
        };
        record.handlers.remove(position);
        self.registry.unregister(id);

        debug!(agent_id = %agent, subscription_id = %id, "Handler detached");
        true
    }

    /// Dispose an agent, returning the subscriptions it owned.
    ///
    /// `None` when the agent was unknown or already disposed.
    pub(crate) fn dispose(&self, agent: AgentId) -> Option<Vec<SubscriptionId>> {
        let (_, record) = self.agents.remove(&agent)?;

        let own_scope = Scope::agent(agent);
        self.registry.unregister_all(&own_scope);
        for owned in record.handlers.iter().filter(|h| h.scope != own_scope) {
            self.registry.unregister(owned.id);
        }

        info!(
            agent_id = %agent,
            display_name = %record.display_name,
            subscriptions = record.handlers.len(),
            "Agent disposed"
        );

        Some(record.handlers.iter().map(|h| h.id).collect())
    }

    /// Remove an agent and every subscription it owns.
    ///
    /// Safe to call repeatedly; later calls return `false`.
    pub fn dispose_agent(&self, agent: AgentId) -> bool {
        self.dispose(agent).is_some()
    }

    /// Declare the peering capabilities of an agent.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AgentNotFound`].
    pub fn set_capabilities(&self, agent: AgentId, capabilities: PeerCapabilities) -> BusResult<()> {
        let mut record = self.agents.get_mut(&agent).ok_or_else(|| not_found(agent))?;
        record.capabilities = capabilities;
        Ok(())
    }

    /// Declared capabilities of an agent.
    #[must_use]
    pub fn capabilities(&self, agent: AgentId) -> Option<PeerCapabilities> {
        self.agents.get(&agent).map(|r| r.capabilities.clone())
    }

    /// Handlers of `agent` whose pattern matches `name`, in registration
    /// order.
    ///
    /// Reads the agent's own table rather than the shared registry.
    #[must_use]
    pub fn handlers_for(&self, agent: AgentId, name: &EventName) -> Vec<ResolvedSubscription> {
        let Some(record) = self.agents.get(&agent) else {
            return Vec::new();
        };
        record
            .handlers
            .iter()
            .filter(|h| h.pattern.matches(name))
            .map(|h| ResolvedSubscription {
                id: h.id,
                scope: h.scope.clone(),
                owner: Some(agent),
                handler: Arc::clone(&h.handler),
            })
            .collect()
    }

    /// Subscriptions owned by an agent.
    #[must_use]
    pub fn subscriptions_of(&self, agent: AgentId) -> Vec<SubscriptionId> {
        self.agents
            .get(&agent)
            .map(|r| r.handlers.iter().map(|h| h.id).collect())
            .unwrap_or_default()
    }

    /// Snapshot of one agent.
    #[must_use]
    pub fn agent_info(&self, agent: AgentId) -> Option<AgentInfo> {
        self.agents.get(&agent).map(|r| info_of(agent, &r))
    }

    /// Snapshot of every agent, oldest first.
    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .iter()
            .map(|entry| info_of(*entry.key(), entry.value()))
            .collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents
    }

    /// Whether an agent is registered.
    #[must_use]
    pub fn contains(&self, agent: AgentId) -> bool {
        self.agents.contains_key(&agent)
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agents are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn info_of(id: AgentId, record: &AgentRecord) -> AgentInfo {
    AgentInfo {
        id,
        display_name: record.display_name.clone(),
        registered_at: record.registered_at,
        subscription_count: record.handlers.len(),
        capabilities: record.capabilities.clone(),
    }
}

fn not_found(agent: AgentId) -> BusError {
    BusError::AgentNotFound {
        agent_id: agent.to_string(),
    }
}
