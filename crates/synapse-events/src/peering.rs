//! Direct peer-to-peer fast path between two agents.
//!
//! A peer connection is negotiated through a [`PeeringPolicy`], then carries
//! events from its initiator to its target over a bounded in-process link.
//! The link worker delivers straight into the target's own handler table,
//! bypassing registry resolution and the dispatcher pool. Any failure hands
//! the envelope back to the caller so it can be resubmitted on the bus.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use synapse_core::{
    AgentId, BusError, BusResult, PeerConnectionId, RetryConfig, RetryOutcome, Timestamp, retry,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

use crate::agents::AgentRegistrar;
use crate::dispatch::{Delivery, Executor, Outcome};
use crate::envelope::{EventEnvelope, EventName};
use crate::stats::BusMetrics;

/// Whether `prefix` is a whole-segment prefix of `text`.
fn segment_prefix(text: &str, prefix: &str) -> bool {
    match text.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// What an agent offers as a peering target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Worst-case delivery latency the agent promises.
    pub max_latency: Duration,
    /// Sustainable events per second.
    pub throughput: u32,
    /// Topic prefixes accepted over a peer link. Empty accepts every topic.
    pub topic_prefixes: Vec<String>,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(5),
            throughput: 10_000,
            topic_prefixes: Vec::new(),
        }
    }
}

impl PeerCapabilities {
    /// Whether an event name falls inside the accepted topics.
    #[must_use]
    pub fn covers(&self, name: &EventName) -> bool {
        self.topic_prefixes.is_empty() || self.topic_prefixes.iter().any(|p| name.has_prefix(p))
    }

    /// Whether a required topic prefix is inside the accepted topics.
    #[must_use]
    pub fn covers_prefix(&self, prefix: &str) -> bool {
        self.topic_prefixes.is_empty()
            || self
                .topic_prefixes
                .iter()
                .any(|p| segment_prefix(prefix, p))
    }
}

/// What an initiator requires from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringRequirements {
    /// Latency budget per delivery.
    pub max_latency: Duration,
    /// Minimum events per second.
    pub min_throughput: u32,
    /// Topics the link must carry. Empty means whatever the target accepts.
    pub topic_prefixes: Vec<String>,
}

impl Default for PeeringRequirements {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(50),
            min_throughput: 0,
            topic_prefixes: Vec::new(),
        }
    }
}

/// Input to a peering policy.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    /// Requesting agent.
    pub initiator: AgentId,
    /// Requested peer.
    pub target: AgentId,
    /// Capabilities declared by the initiator.
    pub initiator_capabilities: PeerCapabilities,
    /// Capabilities declared by the target.
    pub target_capabilities: PeerCapabilities,
    /// What the initiator asks for.
    pub requirements: PeeringRequirements,
}

/// Policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Open the link with these negotiated capabilities.
    Accept(PeerCapabilities),
    /// Refuse with a reason.
    Deny(String),
}

/// Decides whether two agents may peer.
///
/// No trust model is assumed; deployments plug in their own policy.
#[async_trait]
pub trait PeeringPolicy: Send + Sync {
    /// Evaluate a negotiation request.
    async fn evaluate(&self, request: &NegotiationRequest) -> Negotiation;
}

/// Accepts when the target's declared capabilities satisfy the
/// requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityMatchPolicy;

#[async_trait]
impl PeeringPolicy for CapabilityMatchPolicy {
    async fn evaluate(&self, request: &NegotiationRequest) -> Negotiation {
        let offered = &request.target_capabilities;
        let wanted = &request.requirements;

        if offered.max_latency > wanted.max_latency {
            return Negotiation::Deny(format!(
                "target latency {}ms exceeds budget {}ms",
                offered.max_latency.as_millis(),
                wanted.max_latency.as_millis()
            ));
        }
        if offered.throughput < wanted.min_throughput {
            return Negotiation::Deny(format!(
                "target throughput {}/s below required {}/s",
                offered.throughput, wanted.min_throughput
            ));
        }
        if let Some(missing) = wanted
            .topic_prefixes
            .iter()
            .find(|p| !offered.covers_prefix(p))
        {
            return Negotiation::Deny(format!("target does not accept topic '{missing}'"));
        }

        let topic_prefixes = if wanted.topic_prefixes.is_empty() {
            offered.topic_prefixes.clone()
        } else {
            wanted.topic_prefixes.clone()
        };

        Negotiation::Accept(PeerCapabilities {
            max_latency: wanted.max_latency,
            throughput: offered.throughput,
            topic_prefixes,
        })
    }
}

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Policy evaluation in progress.
    Negotiating,
    /// Carrying traffic.
    Active,
    /// Failing; traffic goes through the bus while recovery runs.
    Degraded,
    /// Terminal. A closed connection is removed from the manager at once,
    /// so snapshots never report this state.
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConnection {
    /// Connection identifier.
    pub id: PeerConnectionId,
    /// Sending agent.
    pub initiator: AgentId,
    /// Receiving agent.
    pub target: AgentId,
    /// Negotiated capabilities.
    pub capabilities: PeerCapabilities,
    /// Current state.
    pub state: PeerState,
    /// When negotiation started.
    pub opened_at: Timestamp,
    /// Envelopes delivered by the link worker.
    pub delivered: u64,
    /// Sends refused because the link was full or closed.
    pub failures: u64,
    /// Sends handed back to the caller for any reason.
    pub fallbacks: u64,
    /// Deliveries that exceeded the latency budget.
    pub late_deliveries: u64,
}

/// Why a peered send was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The link backlog is at capacity.
    #[error("peer link is full")]
    Full,
    /// The link worker is gone.
    #[error("peer link is closed")]
    Closed,
    /// The connection is not carrying traffic.
    #[error("peer connection is {0}")]
    NotActive(PeerState),
    /// The envelope's source is not the connection's initiator.
    #[error("envelope source does not match the connection initiator")]
    WrongPair,
    /// The event is outside the negotiated topics.
    #[error("event is outside the negotiated topics")]
    OutOfScope,
    /// No such connection.
    #[error("unknown peer connection")]
    UnknownConnection,
}

/// Result of a peered send.
#[derive(Debug, Clone)]
pub enum DeliveryResult {
    /// Accepted onto the link.
    Delivered,
    /// Not accepted; the envelope is handed back for resubmission.
    Failed {
        /// Why.
        failure: DeliveryFailure,
        /// The untouched envelope.
        envelope: Arc<EventEnvelope>,
    },
}

impl DeliveryResult {
    /// Whether the link accepted the envelope.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Peering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeeringConfig {
    /// Whether new connections may be negotiated.
    pub enabled: bool,
    /// Time budget for policy evaluation.
    pub negotiation_timeout: Duration,
    /// Bounded backlog of each link.
    pub channel_capacity: usize,
    /// Consecutive link failures before a connection degrades. Refused
    /// sends, failed or timed-out handlers and deliveries over the latency
    /// budget all count; a healthy delivery resets the count.
    pub failure_threshold: u32,
    /// Backoff used to restore a degraded connection.
    pub retry: RetryConfig,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            negotiation_timeout: Duration::from_millis(250),
            channel_capacity: 256,
            failure_threshold: 3,
            retry: RetryConfig::peering(),
        }
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    delivered: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    late: AtomicU64,
}

struct Link {
    initiator: AgentId,
    target: AgentId,
    capabilities: PeerCapabilities,
    state: PeerState,
    sender: Option<mpsc::Sender<Arc<EventEnvelope>>>,
    consecutive_failures: u32,
    opened_at: Timestamp,
    counters: Arc<LinkCounters>,
}

impl Link {
    fn snapshot(&self, id: PeerConnectionId) -> PeerConnection {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PeerConnection {
            id,
            initiator: self.initiator,
            target: self.target,
            capabilities: self.capabilities.clone(),
            state: self.state,
            opened_at: self.opened_at,
            delivered: load(&self.counters.delivered),
            failures: load(&self.counters.failures),
            fallbacks: load(&self.counters.fallbacks),
            late_deliveries: load(&self.counters.late),
        }
    }
}

/// Why a recovery probe did not restore the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeError {
    Backlogged,
    Gone,
}

/// Owns every peer connection. The only writer of connection state.
pub struct PeeringManager {
    config: PeeringConfig,
    links: DashMap<PeerConnectionId, Link>,
    routes: DashMap<(AgentId, AgentId), PeerConnectionId>,
    agents: Arc<AgentRegistrar>,
    policy: Arc<dyn PeeringPolicy>,
    executor: Executor,
    metrics: Arc<BusMetrics>,
    runtime: Option<Handle>,
}

impl fmt::Debug for PeeringManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeeringManager")
            .field("config", &self.config)
            .field("connections", &self.links.len())
            .finish_non_exhaustive()
    }
}

impl PeeringManager {
    pub(crate) fn new(
        config: PeeringConfig,
        agents: Arc<AgentRegistrar>,
        policy: Arc<dyn PeeringPolicy>,
        executor: Executor,
        metrics: Arc<BusMetrics>,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            config,
            links: DashMap::new(),
            routes: DashMap::new(),
            agents,
            policy,
            executor,
            metrics,
            runtime,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &PeeringConfig {
        &self.config
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    fn capabilities_of(&self, agent: AgentId) -> BusResult<PeerCapabilities> {
        self.agents
            .capabilities(agent)
            .ok_or_else(|| BusError::AgentNotFound {
                agent_id: agent.to_string(),
            })
    }

    /// Negotiate a connection from `initiator` to `target`.
    ///
    /// Returns the existing connection when the pair is already active.
    ///
    /// # Errors
    ///
    /// - [`BusError::AgentNotFound`] if either agent is unknown
    /// - [`BusError::PeeringDenied`] if peering is disabled, the agents are
    ///   the same, or the policy refuses
    /// - [`BusError::PeeringTimeout`] if the policy does not answer in time
    pub async fn request_peering(
        self: &Arc<Self>,
        initiator: AgentId,
        target: AgentId,
        requirements: PeeringRequirements,
    ) -> BusResult<PeerConnectionId> {
        if !self.config.enabled {
            return Err(BusError::PeeringDenied {
                reason: "peering is disabled".to_string(),
            });
        }
        if initiator == target {
            return Err(BusError::PeeringDenied {
                reason: "an agent cannot peer with itself".to_string(),
            });
        }

        let initiator_capabilities = self.capabilities_of(initiator)?;
        let target_capabilities = self.capabilities_of(target)?;

        if let Some(existing) = self.route_for(initiator, target)
            && self
                .links
                .get(&existing)
                .is_some_and(|l| l.state == PeerState::Active)
        {
            return Ok(existing);
        }

        let id = PeerConnectionId::new();
        self.links.insert(
            id,
            Link {
                initiator,
                target,
                capabilities: target_capabilities.clone(),
                state: PeerState::Negotiating,
                sender: None,
                consecutive_failures: 0,
                opened_at: Timestamp::now(),
                counters: Arc::new(LinkCounters::default()),
            },
        );

        debug!(
            connection_id = %id,
            initiator = %initiator,
            target = %target,
            "Peering negotiation started"
        );

        let request = NegotiationRequest {
            initiator,
            target,
            initiator_capabilities,
            target_capabilities,
            requirements,
        };
        let limit = self.config.negotiation_timeout;
        let decision = tokio::time::timeout(limit, self.policy.evaluate(&request)).await;

        let capabilities = match decision {
            Ok(Negotiation::Accept(capabilities)) => capabilities,
            Ok(Negotiation::Deny(reason)) => {
                self.links.remove(&id);
                info!(connection_id = %id, reason = %reason, "Peering denied");
                return Err(BusError::PeeringDenied { reason });
            },
            Err(_) => {
                self.links.remove(&id);
                let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(connection_id = %id, timeout_ms, "Peering negotiation timed out");
                return Err(BusError::PeeringTimeout { timeout_ms });
            },
        };

        self.activate(id, capabilities)?;

        if let Some(previous) = self.routes.insert((initiator, target), id)
            && previous != id
        {
            self.close_peering(previous);
        }

        info!(
            connection_id = %id,
            initiator = %initiator,
            target = %target,
            "Peer connection active"
        );
        Ok(id)
    }

    fn activate(
        self: &Arc<Self>,
        id: PeerConnectionId,
        capabilities: PeerCapabilities,
    ) -> BusResult<()> {
        let Some(runtime) = self.runtime() else {
            self.links.remove(&id);
            return Err(BusError::PeeringDenied {
                reason: "no async runtime for the peer link".to_string(),
            });
        };

        // Closed while negotiating (e.g. an agent was disposed).
        let Some(mut link) = self.links.get_mut(&id) else {
            return Err(BusError::PeeringDenied {
                reason: "connection closed during negotiation".to_string(),
            });
        };

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        runtime.spawn(run_link(
            id,
            link.target,
            receiver,
            Arc::downgrade(self),
            Arc::clone(&self.agents),
            self.executor.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&link.counters),
            capabilities.max_latency,
        ));

        link.capabilities = capabilities;
        link.sender = Some(sender);
        link.state = PeerState::Active;
        Ok(())
    }

    /// Send one envelope over a connection.
    ///
    /// Never blocks. The envelope's source must be the connection's
    /// initiator. On failure the envelope is returned for resubmission.
    pub fn send_via_peer(
        self: &Arc<Self>,
        id: PeerConnectionId,
        envelope: Arc<EventEnvelope>,
    ) -> DeliveryResult {
        let Some(mut link) = self.links.get_mut(&id) else {
            return DeliveryResult::Failed {
                failure: DeliveryFailure::UnknownConnection,
                envelope,
            };
        };

        let refused = if link.state != PeerState::Active {
            Some(DeliveryFailure::NotActive(link.state))
        } else if envelope.source() != Some(link.initiator) {
            Some(DeliveryFailure::WrongPair)
        } else if !link.capabilities.covers(envelope.name()) {
            Some(DeliveryFailure::OutOfScope)
        } else {
            None
        };
        if let Some(failure) = refused {
            BusMetrics::incr(&link.counters.fallbacks);
            return DeliveryResult::Failed { failure, envelope };
        }

        let sent = match &link.sender {
            Some(sender) => sender.try_send(envelope),
            None => Err(TrySendError::Closed(envelope)),
        };

        let (failure, envelope) = match sent {
            Ok(()) => {
                trace!(connection_id = %id, "Envelope sent over peer link");
                return DeliveryResult::Delivered;
            },
            Err(TrySendError::Full(envelope)) => (DeliveryFailure::Full, envelope),
            Err(TrySendError::Closed(envelope)) => (DeliveryFailure::Closed, envelope),
        };

        BusMetrics::incr(&link.counters.failures);
        BusMetrics::incr(&link.counters.fallbacks);

        if self.count_failure(id, &mut link, &failure.to_string()) {
            drop(link);
            self.spawn_recovery(id);
        }

        DeliveryResult::Failed { failure, envelope }
    }

    /// Feed one finished link delivery into the connection's health.
    fn record_delivery(self: &Arc<Self>, id: PeerConnectionId, healthy: bool) {
        let Some(mut link) = self.links.get_mut(&id) else {
            return;
        };
        if link.state != PeerState::Active {
            return;
        }
        if healthy {
            link.consecutive_failures = 0;
            return;
        }
        if self.count_failure(id, &mut link, "delivery failed or exceeded its latency budget") {
            drop(link);
            self.spawn_recovery(id);
        }
    }

    /// Count one consecutive failure. Returns whether the link just
    /// degraded.
    fn count_failure(&self, id: PeerConnectionId, link: &mut Link, cause: &str) -> bool {
        link.consecutive_failures = link.consecutive_failures.saturating_add(1);
        if link.consecutive_failures < self.config.failure_threshold.max(1) {
            return false;
        }
        link.state = PeerState::Degraded;
        warn!(
            connection_id = %id,
            cause,
            consecutive_failures = link.consecutive_failures,
            "Peer connection degraded"
        );
        true
    }

    fn spawn_recovery(self: &Arc<Self>, id: PeerConnectionId) {
        let Some(runtime) = self.runtime() else {
            self.close_peering(id);
            return;
        };

        let manager = Arc::downgrade(self);
        let policy = self.config.retry.clone();
        runtime.spawn(async move {
            // Give the link one backoff step before the first probe.
            tokio::time::sleep(policy.initial_delay).await;
            let outcome = retry(
                &policy,
                |_attempt| std::future::ready(Self::probe(&manager, id)),
                |error| *error == ProbeError::Backlogged,
            )
            .await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            match outcome {
                RetryOutcome::Success(()) => manager.restore(id),
                RetryOutcome::Exhausted { attempts, .. } => {
                    warn!(connection_id = %id, attempts, "Peer connection could not recover");
                    manager.close_peering(id);
                },
                RetryOutcome::Aborted { .. } => {
                    manager.close_peering(id);
                },
            }
        });
    }

    /// A degraded link is healthy again once its backlog is at most half
    /// full and the target is still alive.
    fn probe(manager: &Weak<Self>, id: PeerConnectionId) -> Result<(), ProbeError> {
        let manager = manager.upgrade().ok_or(ProbeError::Gone)?;
        let link = manager.links.get(&id).ok_or(ProbeError::Gone)?;
        if link.state != PeerState::Degraded || !manager.agents.contains(link.target) {
            return Err(ProbeError::Gone);
        }
        let sender = link.sender.as_ref().ok_or(ProbeError::Gone)?;
        if sender.is_closed() {
            return Err(ProbeError::Gone);
        }
        if sender.capacity().saturating_mul(2) >= sender.max_capacity() {
            Ok(())
        } else {
            Err(ProbeError::Backlogged)
        }
    }

    fn restore(&self, id: PeerConnectionId) {
        if let Some(mut link) = self.links.get_mut(&id)
            && link.state == PeerState::Degraded
        {
            link.state = PeerState::Active;
            link.consecutive_failures = 0;
            info!(connection_id = %id, "Peer connection restored");
        }
    }

    /// Close a connection. Already-queued envelopes are still delivered.
    ///
    /// The connection is removed right away; afterwards
    /// [`connection`](Self::connection) returns `None` for it.
    /// Returns `false` if the connection was unknown or already closed.
    pub fn close_peering(&self, id: PeerConnectionId) -> bool {
        let Some((_, mut link)) = self.links.remove(&id) else {
            return false;
        };

        // Dropping the sender lets the worker drain and exit.
        link.sender = None;
        self.routes
            .remove_if(&(link.initiator, link.target), |_, route| *route == id);

        info!(
            connection_id = %id,
            initiator = %link.initiator,
            target = %link.target,
            delivered = link.counters.delivered.load(Ordering::Relaxed),
            "Peer connection closed"
        );
        true
    }

    /// Close every connection an agent takes part in.
    pub fn close_for_agent(&self, agent: AgentId) -> usize {
        let ids: Vec<PeerConnectionId> = self
            .links
            .iter()
            .filter(|entry| entry.initiator == agent || entry.target == agent)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter().filter(|id| self.close_peering(*id)).count()
    }

    /// The connection routing `sender -> receiver`, if any.
    #[must_use]
    pub fn route_for(&self, sender: AgentId, receiver: AgentId) -> Option<PeerConnectionId> {
        self.routes.get(&(sender, receiver)).map(|r| *r)
    }

    /// Snapshot of one connection.
    #[must_use]
    pub fn connection(&self, id: PeerConnectionId) -> Option<PeerConnection> {
        self.links.get(&id).map(|link| link.snapshot(id))
    }

    /// Snapshot of every open connection.
    #[must_use]
    pub fn connections(&self) -> Vec<PeerConnection> {
        let mut all: Vec<PeerConnection> = self
            .links
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        all.sort_by_key(|c| c.opened_at);
        all
    }

    /// Number of connections in the `Active` state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.links
            .iter()
            .filter(|entry| entry.state == PeerState::Active)
            .count()
    }
}

/// Link worker: delivers each envelope to the target's handlers in order,
/// then drains whatever is queued once the sender is dropped.
#[allow(clippy::too_many_arguments)]
async fn run_link(
    id: PeerConnectionId,
    target: AgentId,
    mut receiver: mpsc::Receiver<Arc<EventEnvelope>>,
    manager: Weak<PeeringManager>,
    agents: Arc<AgentRegistrar>,
    executor: Executor,
    metrics: Arc<BusMetrics>,
    counters: Arc<LinkCounters>,
    budget: Duration,
) {
    while let Some(envelope) = receiver.recv().await {
        let started = Instant::now();
        let mut handlers_ok = true;
        for subscription in agents.handlers_for(target, envelope.name()) {
            let delivery = Delivery {
                envelope: Arc::clone(&envelope),
                subscription,
            };
            let outcome = executor.execute(delivery, true, None).await;
            handlers_ok &= outcome == Outcome::Succeeded;
        }

        let elapsed = started.elapsed();
        let late = elapsed > budget;
        if late {
            BusMetrics::incr(&counters.late);
            debug!(
                connection_id = %id,
                event_id = %envelope.id(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Peer delivery exceeded latency budget"
            );
        }
        if let Some(manager) = manager.upgrade() {
            manager.record_delivery(id, handlers_ok && !late);
        }

        BusMetrics::incr(&counters.delivered);
        BusMetrics::incr(&metrics.peer_deliveries);
    }
    debug!(connection_id = %id, "Peer link drained");
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchConfig, Dispatcher};
    use crate::envelope::Payload;
    use crate::handler::{DeliveryContext, EventHandler, HandlerEntry, HandlerResult};
    use crate::registry::ScopeRegistry;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct Gated {
        gate: Semaphore,
        seen: AtomicUsize,
    }

    impl Gated {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                seen: AtomicUsize::new(0),
            })
        }

        fn open() -> Arc<Self> {
            let gated = Self::closed();
            gated.release();
            gated
        }

        fn release(&self) {
            self.gate.add_permits(1_000_000);
        }

        fn seen(&self) -> usize {
            self.seen.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for Gated {
        async fn handle(&self, _: Arc<EventEnvelope>, ctx: DeliveryContext) -> HandlerResult {
            assert!(ctx.via_peer);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Takes a fixed time per delivery, or fails outright.
    struct Sluggish {
        delay: Duration,
        fail: bool,
        seen: AtomicUsize,
    }

    impl Sluggish {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail,
                seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Sluggish {
        async fn handle(&self, _: Arc<EventEnvelope>, _: DeliveryContext) -> HandlerResult {
            tokio::time::sleep(self.delay).await;
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::handler::HandlerError::Failed("overloaded".into()))
            } else {
                Ok(())
            }
        }
    }

    struct SlowPolicy;

    #[async_trait]
    impl PeeringPolicy for SlowPolicy {
        async fn evaluate(&self, _: &NegotiationRequest) -> Negotiation {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Negotiation::Deny("too late".into())
        }
    }

    struct Fixture {
        agents: Arc<AgentRegistrar>,
        manager: Arc<PeeringManager>,
        metrics: Arc<BusMetrics>,
        sender: AgentId,
        receiver: AgentId,
    }

    fn fixture(
        config: PeeringConfig,
        policy: Arc<dyn PeeringPolicy>,
        handler: Arc<dyn EventHandler>,
    ) -> Fixture {
        let metrics = Arc::new(BusMetrics::default());
        let registry = Arc::new(ScopeRegistry::new());
        let agents = Arc::new(AgentRegistrar::new(registry));
        let dispatcher = Dispatcher::new(DispatchConfig::default(), Arc::clone(&metrics), None);

        let sender = agents.register_agent("sender");
        let receiver = agents.register_agent("receiver");
        agents
            .register_table(receiver, &[HandlerEntry::agent("order.any", handler)])
            .unwrap();

        let manager = Arc::new(PeeringManager::new(
            config,
            Arc::clone(&agents),
            policy,
            dispatcher.executor(),
            Arc::clone(&metrics),
            None,
        ));

        Fixture {
            agents,
            manager,
            metrics,
            sender,
            receiver,
        }
    }

    fn envelope(name: &str, source: AgentId) -> Arc<EventEnvelope> {
        Arc::new(
            EventEnvelope::named(name, Payload::new())
                .unwrap()
                .with_source(source),
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn request(
        offered: u32,
        wanted: u32,
        offered_topics: &[&str],
        wanted_topics: &[&str],
    ) -> NegotiationRequest {
        NegotiationRequest {
            initiator: AgentId::new(),
            target: AgentId::new(),
            initiator_capabilities: PeerCapabilities::default(),
            target_capabilities: PeerCapabilities {
                throughput: offered,
                topic_prefixes: offered_topics.iter().map(ToString::to_string).collect(),
                ..PeerCapabilities::default()
            },
            requirements: PeeringRequirements {
                min_throughput: wanted,
                topic_prefixes: wanted_topics.iter().map(ToString::to_string).collect(),
                ..PeeringRequirements::default()
            },
        }
    }

    #[tokio::test]
    async fn test_capability_policy() {
        let policy = CapabilityMatchPolicy;

        let accepted = policy.evaluate(&request(100, 50, &[], &["order"])).await;
        let Negotiation::Accept(caps) = accepted else {
            panic!("expected accept");
        };
        assert_eq!(caps.topic_prefixes, vec!["order".to_string()]);
        assert_eq!(caps.max_latency, Duration::from_millis(50));

        assert!(matches!(
            policy.evaluate(&request(10, 50, &[], &[])).await,
            Negotiation::Deny(_)
        ));
        assert!(matches!(
            policy.evaluate(&request(100, 0, &["order"], &["orders"])).await,
            Negotiation::Deny(_)
        ));
        assert!(matches!(
            policy.evaluate(&request(100, 0, &["order"], &["order.created"])).await,
            Negotiation::Accept(_)
        ));

        let mut slow = request(100, 0, &[], &[]);
        slow.target_capabilities.max_latency = Duration::from_millis(500);
        assert!(matches!(policy.evaluate(&slow).await, Negotiation::Deny(_)));
    }

    #[test]
    fn test_topic_coverage() {
        let caps = PeerCapabilities {
            topic_prefixes: vec!["order".into(), "billing.invoice".into()],
            ..PeerCapabilities::default()
        };
        let name = |s: &str| EventName::parse(s).unwrap();
        assert!(caps.covers(&name("order.created")));
        assert!(caps.covers(&name("billing.invoice.sent")));
        assert!(!caps.covers(&name("orders.created")));
        assert!(!caps.covers(&name("billing.refund")));
        assert!(PeerCapabilities::default().covers(&name("anything.at.all")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peering_delivers_to_target() {
        let handler = Gated::open();
        let f = fixture(PeeringConfig::default(), Arc::new(CapabilityMatchPolicy), Arc::<Gated>::clone(&handler));

        let id = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();
        assert_eq!(f.manager.route_for(f.sender, f.receiver), Some(id));
        assert_eq!(f.manager.active_count(), 1);

        let result = f.manager.send_via_peer(id, envelope("order.created", f.sender));
        assert!(result.is_delivered());

        wait_for(|| handler.seen() == 1).await;
        wait_for(|| f.manager.connection(id).unwrap().delivered == 1).await;
        assert_eq!(f.metrics.peer_deliveries.load(Ordering::Relaxed), 1);

        let same = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();
        assert_eq!(same, id);
    }

    #[tokio::test]
    async fn test_peering_refusals() {
        let f = fixture(PeeringConfig::default(), Arc::new(CapabilityMatchPolicy), Gated::open());

        let strict = PeeringRequirements {
            min_throughput: u32::MAX,
            ..PeeringRequirements::default()
        };
        let err = f
            .manager
            .request_peering(f.sender, f.receiver, strict)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PeeringDenied { .. }));
        assert!(f.manager.connections().is_empty());

        let err = f
            .manager
            .request_peering(f.sender, f.sender, PeeringRequirements::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PeeringDenied { .. }));

        let err = f
            .manager
            .request_peering(f.sender, AgentId::new(), PeeringRequirements::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_peering_disabled() {
        let config = PeeringConfig {
            enabled: false,
            ..PeeringConfig::default()
        };
        let f = fixture(config, Arc::new(CapabilityMatchPolicy), Gated::open());
        let err = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap_err();
        assert!(err.is_peering_error());
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let config = PeeringConfig {
            negotiation_timeout: Duration::from_millis(20),
            ..PeeringConfig::default()
        };
        let f = fixture(config, Arc::new(SlowPolicy), Gated::open());

        let err = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap_err();
        assert_eq!(err, BusError::PeeringTimeout { timeout_ms: 20 });
        assert!(f.manager.connections().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_refusals() {
        let f = fixture(PeeringConfig::default(), Arc::new(CapabilityMatchPolicy), Gated::open());
        let requirements = PeeringRequirements {
            topic_prefixes: vec!["order".into()],
            ..PeeringRequirements::default()
        };
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, requirements)
            .await
            .unwrap();

        let failure_of = |result: DeliveryResult| match result {
            DeliveryResult::Failed { failure, .. } => Some(failure),
            DeliveryResult::Delivered => None,
        };

        assert_eq!(
            failure_of(f.manager.send_via_peer(id, envelope("order.created", f.receiver))),
            Some(DeliveryFailure::WrongPair)
        );
        assert_eq!(
            failure_of(f.manager.send_via_peer(id, envelope("user.created", f.sender))),
            Some(DeliveryFailure::OutOfScope)
        );
        assert_eq!(
            failure_of(
                f.manager
                    .send_via_peer(PeerConnectionId::new(), envelope("order.created", f.sender))
            ),
            Some(DeliveryFailure::UnknownConnection)
        );
        assert_eq!(f.manager.connection(id).unwrap().fallbacks, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_degrades_and_recovers() {
        let handler = Gated::closed();
        let config = PeeringConfig {
            channel_capacity: 1,
            failure_threshold: 1,
            retry: RetryConfig::new(50, Duration::from_millis(5), Duration::from_millis(20), 2.0),
            ..PeeringConfig::default()
        };
        let f = fixture(config, Arc::new(CapabilityMatchPolicy), Arc::<Gated>::clone(&handler));
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();

        let mut failure = None;
        for _ in 0..10 {
            if let DeliveryResult::Failed {
                failure: why,
                envelope: returned,
            } = f.manager.send_via_peer(id, envelope("order.created", f.sender))
            {
                assert_eq!(returned.name().as_str(), "order.created");
                failure = Some(why);
                break;
            }
        }
        assert_eq!(failure, Some(DeliveryFailure::Full));
        assert_eq!(f.manager.connection(id).unwrap().state, PeerState::Degraded);
        assert_eq!(f.manager.active_count(), 0);

        let refused = f.manager.send_via_peer(id, envelope("order.created", f.sender));
        assert!(matches!(
            refused,
            DeliveryResult::Failed {
                failure: DeliveryFailure::NotActive(PeerState::Degraded),
                ..
            }
        ));

        handler.release();
        wait_for(|| f.manager.connection(id).is_some_and(|c| c.state == PeerState::Active)).await;
        assert!(handler.seen() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_drains_queue() {
        let handler = Gated::closed();
        let f = fixture(PeeringConfig::default(), Arc::new(CapabilityMatchPolicy), Arc::<Gated>::clone(&handler));
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(
                f.manager
                    .send_via_peer(id, envelope("order.created", f.sender))
                    .is_delivered()
            );
        }

        assert!(f.manager.close_peering(id));
        assert!(!f.manager.close_peering(id));
        assert!(f.manager.connection(id).is_none());
        assert_eq!(f.manager.route_for(f.sender, f.receiver), None);

        handler.release();
        wait_for(|| handler.seen() == 3).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_for_agent() {
        let f = fixture(PeeringConfig::default(), Arc::new(CapabilityMatchPolicy), Gated::open());
        f.manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();
        f.manager
            .request_peering(f.receiver, f.sender, PeeringRequirements::default())
            .await
            .unwrap();
        assert_eq!(f.manager.connections().len(), 2);

        assert_eq!(f.manager.close_for_agent(f.receiver), 2);
        assert!(f.manager.connections().is_empty());
        assert!(f.agents.contains(f.receiver));
    }

    /// Sends one envelope at a time, waiting for each delivery, until the
    /// link refuses. Returns how many went over the link.
    async fn send_until_refused(f: &Fixture, id: PeerConnectionId, limit: u64) -> u64 {
        for sent in 0..limit {
            if !f
                .manager
                .send_via_peer(id, envelope("order.created", f.sender))
                .is_delivered()
            {
                return sent;
            }
            wait_for(|| f.manager.connection(id).unwrap().delivered == sent + 1).await;
        }
        limit
    }

    fn slow_recovery() -> PeeringConfig {
        PeeringConfig {
            failure_threshold: 3,
            retry: RetryConfig::new(1, Duration::from_secs(30), Duration::from_secs(30), 2.0),
            ..PeeringConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_deliveries_degrade_link() {
        let handler = Sluggish::new(Duration::from_millis(60), false);
        let f = fixture(slow_recovery(), Arc::new(CapabilityMatchPolicy), handler.clone());
        let requirements = PeeringRequirements {
            max_latency: Duration::from_millis(10),
            ..PeeringRequirements::default()
        };
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, requirements)
            .await
            .unwrap();

        assert_eq!(send_until_refused(&f, id, 8).await, 3);

        let snapshot = f.manager.connection(id).unwrap();
        assert_eq!(snapshot.state, PeerState::Degraded);
        assert_eq!(snapshot.late_deliveries, 3);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_handler_degrades_link() {
        let handler = Sluggish::new(Duration::ZERO, true);
        let f = fixture(slow_recovery(), Arc::new(CapabilityMatchPolicy), handler);
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();

        assert_eq!(send_until_refused(&f, id, 8).await, 3);
        assert_eq!(
            f.manager.connection(id).unwrap().state,
            PeerState::Degraded
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_healthy_delivery_resets_failure_count() {
        let handler = Sluggish::new(Duration::ZERO, false);
        let f = fixture(slow_recovery(), Arc::new(CapabilityMatchPolicy), handler);
        let id = f
            .manager
            .request_peering(f.sender, f.receiver, PeeringRequirements::default())
            .await
            .unwrap();

        f.manager.record_delivery(id, false);
        f.manager.record_delivery(id, false);
        f.manager.record_delivery(id, true);
        f.manager.record_delivery(id, false);
        f.manager.record_delivery(id, false);
        assert_eq!(f.manager.connection(id).unwrap().state, PeerState::Active);

        f.manager.record_delivery(id, false);
        assert_eq!(
            f.manager.connection(id).unwrap().state,
            PeerState::Degraded
        );
    }
}
