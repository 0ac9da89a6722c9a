//! Scope registry: subscriptions partitioned by scope.
//!
//! Each partition lives under its own `DashMap` shard entry, so writers to
//! different partitions never contend and readers see a partition either
//! before or after an update. The registry holds only weak handler
//! references; the owning agent (or direct caller) keeps handlers alive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use synapse_core::{AgentId, BusResult, Scope, ScopeKind, SubscriptionId};
use tracing::{debug, trace};

use crate::envelope::EventName;
use crate::handler::{EventHandler, HandlerRef};
use crate::pattern::Pattern;

/// A registered subscription.
#[derive(Clone)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Validated pattern.
    pub pattern: Pattern,
    /// Partition the subscription lives in.
    pub scope: Scope,
    /// Agent on whose behalf it exists.
    pub owner: Option<AgentId>,
    /// Weak handler reference.
    pub handler: HandlerRef,
    seq: u64,
}

impl Subscription {
    /// Whether the handler has been dropped.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.handler.strong_count() == 0
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("scope", &self.scope)
            .field("owner", &self.owner)
            .field("alive", &!self.is_dead())
            .finish()
    }
}

/// A subscription whose handler was alive at resolution time.
#[derive(Clone)]
pub struct ResolvedSubscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Partition it was found in.
    pub scope: Scope,
    /// Owning agent.
    pub owner: Option<AgentId>,
    /// Strong handler reference for the duration of the delivery.
    pub handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for ResolvedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSubscription")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("owner", &self.owner)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Which subscriptions an emission is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every partition.
    Broadcast,
    /// One partition only.
    Scope(Scope),
    /// Only subscriptions owned by one agent, in any partition.
    Agent(AgentId),
}

impl Audience {
    /// A channel partition.
    #[must_use]
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Scope(Scope::channel(name))
    }

    /// A role partition.
    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Self::Scope(Scope::role(name))
    }

    /// A namespace partition.
    #[must_use]
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Scope(Scope::namespace(name))
    }
}

/// Subscriptions of one scope plus a cheap pre-filter.
#[derive(Debug, Default)]
struct Partition {
    subscriptions: Vec<Subscription>,
    /// Segment count -> number of patterns with that count.
    lengths: HashMap<usize, usize>,
    /// First literal segment -> number of patterns starting with it.
    first_literals: HashMap<String, usize>,
    /// Number of patterns starting with `any`.
    leading_wildcards: usize,
}

impl Partition {
    fn insert(&mut self, subscription: Subscription) {
        let pattern = &subscription.pattern;
        bump(&mut self.lengths, pattern.segment_count());
        match pattern.first_literal() {
            Some(first) => bump(&mut self.first_literals, first.to_string()),
            None => self.leading_wildcards = self.leading_wildcards.saturating_add(1),
        }
        self.subscriptions.push(subscription);
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(index) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = self.subscriptions.remove(index);
        let pattern = &removed.pattern;
        drop_count(&mut self.lengths, &pattern.segment_count());
        match pattern.first_literal() {
            Some(first) => drop_count(&mut self.first_literals, first),
            None => self.leading_wildcards = self.leading_wildcards.saturating_sub(1),
        }
        true
    }

    /// Drop subscriptions whose handler is gone, returning their IDs.
    fn prune_dead(&mut self) -> Vec<SubscriptionId> {
        let dead: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|s| s.is_dead())
            .map(|s| s.id)
            .collect();
        for id in &dead {
            self.remove(*id);
        }
        dead
    }

    fn live_count(&self) -> usize {
        self.subscriptions.iter().filter(|s| !s.is_dead()).count()
    }

    /// Conservative check: `false` means no pattern here can match.
    fn could_match(&self, name: &EventName) -> bool {
        self.lengths.contains_key(&name.segment_count())
            && (self.leading_wildcards > 0
                || self.first_literals.contains_key(name.first_segment()))
    }

    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

fn bump<K: std::hash::Hash + Eq>(counts: &mut HashMap<K, usize>, key: K) {
    let entry = counts.entry(key).or_insert(0);
    *entry = entry.saturating_add(1);
}

fn drop_count<K, Q>(counts: &mut HashMap<K, usize>, key: &Q)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Concurrent store of subscriptions partitioned by [`Scope`].
pub struct ScopeRegistry {
    partitions: DashMap<Scope, Partition>,
    index: DashMap<SubscriptionId, Scope>,
    sequence: AtomicU64,
}

impl fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("subscription_count", &self.len())
            .field("partition_count", &self.partition_count())
            .finish()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            index: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Register a subscription.
    ///
    /// Visible to every `resolve` that starts after this returns.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::InvalidScope`] when the scope key
    /// does not fit its kind.
    pub fn register(
        &self,
        scope: Scope,
        pattern: Pattern,
        handler: HandlerRef,
        owner: Option<AgentId>,
    ) -> BusResult<SubscriptionId> {
        scope.validate()?;

        let id = SubscriptionId::new();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        debug!(
            subscription_id = %id,
            scope = %scope,
            pattern = %pattern,
            "Subscription registered"
        );

        // Index first so a concurrent unregister of this id finds the scope.
        self.index.insert(id, scope.clone());
        let pruned = {
            let mut partition = self.partitions.entry(scope.clone()).or_default();
            let pruned = partition.prune_dead();
            partition.insert(Subscription {
                id,
                pattern,
                scope,
                owner,
                handler,
                seq,
            });
            pruned
        };
        self.forget(&pruned);

        Ok(id)
    }

    /// Parse the pattern text and register.
    ///
    /// # Errors
    ///
    /// Returns [`synapse_core::BusError::InvalidPattern`] or
    /// [`synapse_core::BusError::InvalidScope`].
    pub fn register_str(
        &self,
        scope: Scope,
        pattern: &str,
        handler: HandlerRef,
        owner: Option<AgentId>,
    ) -> BusResult<SubscriptionId> {
        let pattern = Pattern::parse(pattern)?;
        self.register(scope, pattern, handler, owner)
    }

    /// Remove one subscription. Returns `false` if it was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let Some((_, scope)) = self.index.remove(&id) else {
            return false;
        };

        let (removed, pruned) = match self.partitions.get_mut(&scope) {
            Some(mut partition) => (partition.remove(id), partition.prune_dead()),
            None => (false, Vec::new()),
        };
        self.partitions.remove_if(&scope, |_, p| p.is_empty());
        self.forget(&pruned);

        if removed {
            debug!(subscription_id = %id, scope = %scope, "Subscription unregistered");
        }
        removed
    }

    fn forget(&self, pruned: &[SubscriptionId]) {
        if pruned.is_empty() {
            return;
        }
        for id in pruned {
            self.index.remove(id);
        }
        debug!(pruned = pruned.len(), "Dropped subscriptions with dead handlers");
    }

    /// Remove a whole partition atomically, returning the removed IDs.
    pub fn unregister_all(&self, scope: &Scope) -> Vec<SubscriptionId> {
        let Some((_, partition)) = self.partitions.remove(scope) else {
            return Vec::new();
        };

        let ids: Vec<SubscriptionId> = partition.subscriptions.iter().map(|s| s.id).collect();
        for id in &ids {
            self.index.remove(id);
        }

        debug!(scope = %scope, removed = ids.len(), "Partition cleared");
        ids
    }

    /// Every live subscription matching `name`, across all partitions.
    ///
    /// Ordered by scope kind (global, agent, channel, role, namespace) and
    /// then by registration order. Never mutates the registry.
    #[must_use]
    pub fn resolve(&self, name: &EventName) -> Vec<ResolvedSubscription> {
        self.resolve_in(&Audience::Broadcast, name)
    }

    /// Resolve against a restricted audience.
    #[must_use]
    pub fn resolve_in(&self, audience: &Audience, name: &EventName) -> Vec<ResolvedSubscription> {
        let mut found: Vec<(ScopeKind, u64, ResolvedSubscription)> = Vec::new();

        let mut collect = |partition: &Partition, owner: Option<AgentId>| {
            for sub in &partition.subscriptions {
                if owner.is_some() && sub.owner != owner {
                    continue;
                }
                if !sub.pattern.matches(name) {
                    continue;
                }
                // Dead references are skipped here and pruned by the next
                // write to this partition.
                let Some(handler) = sub.handler.upgrade() else {
                    continue;
                };
                found.push((
                    sub.scope.kind,
                    sub.seq,
                    ResolvedSubscription {
                        id: sub.id,
                        scope: sub.scope.clone(),
                        owner: sub.owner,
                        handler,
                    },
                ));
            }
        };

        match audience {
            Audience::Scope(scope) => {
                if let Some(partition) = self.partitions.get(scope)
                    && partition.could_match(name)
                {
                    collect(&partition, None);
                }
            },
            Audience::Broadcast | Audience::Agent(_) => {
                let owner = match audience {
                    Audience::Agent(agent) => Some(*agent),
                    _ => None,
                };
                for entry in &self.partitions {
                    // The global partition is always scanned.
                    if entry.key().is_global() || entry.value().could_match(name) {
                        collect(entry.value(), owner);
                    }
                }
            },
        }

        found.sort_by_key(|(kind, seq, _)| (*kind, *seq));

        trace!(
            event_name = %name,
            audience = ?audience,
            matched = found.len(),
            "Resolved subscriptions"
        );

        found.into_iter().map(|(_, _, resolved)| resolved).collect()
    }

    /// The owner of a subscription.
    #[must_use]
    pub fn owner_of(&self, id: SubscriptionId) -> Option<AgentId> {
        let scope = self.index.get(&id)?.clone();
        let partition = self.partitions.get(&scope)?;
        partition
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| s.owner)
    }

    /// Whether a subscription is registered.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of subscriptions whose handler is still alive.
    ///
    /// Dead entries stay in their partition until the next write to it, but
    /// are never counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.value().live_count()).sum()
    }

    /// Whether no live subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Every partition with its live subscription count, sorted by scope.
    #[must_use]
    pub fn partitions(&self) -> Vec<(Scope, usize)> {
        let mut listing: Vec<(Scope, usize)> = self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().live_count()))
            .collect();
        listing.sort();
        listing
    }

    /// Snapshot of one partition's subscriptions in registration order.
    #[must_use]
    pub fn subscriptions_in(&self, scope: &Scope) -> Vec<Subscription> {
        self.partitions
            .get(scope)
            .map(|p| p.subscriptions.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DeliveryContext, HandlerResult};
    use crate::envelope::EventEnvelope;
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _: Arc<EventEnvelope>, _: DeliveryContext) -> HandlerResult {
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    fn handler(name: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(Noop(name))
    }

    fn name(s: &str) -> EventName {
        EventName::parse(s).unwrap()
    }

    fn names(resolved: &[ResolvedSubscription]) -> Vec<&str> {
        resolved.iter().map(|r| r.handler.name()).collect()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ScopeRegistry::new();
        let h = handler("critical");
        registry
            .register_str(Scope::global(), "any.critical", Arc::downgrade(&h), None)
            .unwrap();

        assert_eq!(registry.resolve(&name("system.critical")).len(), 1);
        assert_eq!(registry.resolve(&name("alerts.critical")).len(), 1);
        assert!(registry.resolve(&name("system.alerts.critical")).is_empty());
        assert!(registry.resolve(&name("system.warning")).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_registration() {
        let registry = ScopeRegistry::new();
        let h = handler("x");

        let err = registry
            .register_str(Scope::global(), "a..b", Arc::downgrade(&h), None)
            .unwrap_err();
        assert!(matches!(err, synapse_core::BusError::InvalidPattern { .. }));

        let bad_scope = Scope {
            kind: ScopeKind::Channel,
            key: None,
        };
        let err = registry
            .register_str(bad_scope, "a.b", Arc::downgrade(&h), None)
            .unwrap_err();
        assert!(matches!(err, synapse_core::BusError::InvalidScope(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolution_order() {
        let registry = ScopeRegistry::new();
        let agent = AgentId::new();
        let handlers: Vec<_> = ["ns", "role", "agent", "global2", "channel", "global1"]
            .into_iter()
            .map(handler)
            .collect();

        let scopes = [
            Scope::namespace("billing"),
            Scope::role("auditor"),
            Scope::agent(agent),
            Scope::global(),
            Scope::channel("orders"),
            Scope::global(),
        ];
        for (scope, h) in scopes.into_iter().zip(&handlers) {
            registry
                .register_str(scope, "order.any", Arc::downgrade(h), Some(agent))
                .unwrap();
        }

        let resolved = registry.resolve(&name("order.created"));
        assert_eq!(
            names(&resolved),
            vec!["global2", "global1", "agent", "channel", "role", "ns"]
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ScopeRegistry::new();
        let h = handler("x");
        let id = registry
            .register_str(Scope::channel("ops"), "a.b", Arc::downgrade(&h), None)
            .unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.resolve(&name("a.b")).is_empty());
        assert_eq!(registry.partition_count(), 0);
    }

    #[test]
    fn test_unregister_all() {
        let registry = ScopeRegistry::new();
        let agent = AgentId::new();
        let h = handler("x");
        let scope = Scope::agent(agent);

        let a = registry
            .register_str(scope.clone(), "a.b", Arc::downgrade(&h), Some(agent))
            .unwrap();
        let b = registry
            .register_str(scope.clone(), "any.b", Arc::downgrade(&h), Some(agent))
            .unwrap();
        let other = registry
            .register_str(Scope::global(), "a.b", Arc::downgrade(&h), None)
            .unwrap();

        let mut removed = registry.unregister_all(&scope);
        removed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(removed, expected);

        assert!(registry.unregister_all(&scope).is_empty());
        assert!(!registry.contains(a));
        assert!(registry.contains(other));
        assert_eq!(registry.resolve(&name("a.b")).len(), 1);
    }

    #[test]
    fn test_dead_handlers_are_skipped() {
        let registry = ScopeRegistry::new();
        let h = handler("gone");
        registry
            .register_str(Scope::global(), "a.b", Arc::downgrade(&h), None)
            .unwrap();
        drop(h);

        assert!(registry.resolve(&name("a.b")).is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.subscriptions_in(&Scope::global())[0].is_dead());
    }

    #[test]
    fn test_dead_handlers_are_pruned_on_write() {
        let registry = ScopeRegistry::new();
        let mut last = None;
        for _ in 0..1000 {
            let h = handler("short");
            last = Some(
                registry
                    .register_str(Scope::global(), "x.y", Arc::downgrade(&h), None)
                    .unwrap(),
            );
        }

        assert_eq!(registry.len(), 0);
        assert_eq!(registry.partitions(), vec![(Scope::global(), 0)]);
        // Each registration pruned its predecessors.
        assert_eq!(registry.subscriptions_in(&Scope::global()).len(), 1);

        let keep = handler("keep");
        let kept = registry
            .register_str(Scope::global(), "x.y", Arc::downgrade(&keep), None)
            .unwrap();
        assert_eq!(registry.subscriptions_in(&Scope::global()).len(), 1);
        assert!(!registry.contains(last.unwrap()));
        assert!(registry.contains(kept));
        assert_eq!(registry.len(), 1);

        drop(keep);
        assert!(registry.unregister(kept));
        assert_eq!(registry.partition_count(), 0);
    }

    #[test]
    fn test_prefilter_does_not_hide_matches() {
        let registry = ScopeRegistry::new();
        let literal = handler("literal");
        let wildcard = handler("wildcard");
        let scope = Scope::role("ops");

        registry
            .register_str(scope.clone(), "deploy.done", Arc::downgrade(&literal), None)
            .unwrap();
        registry
            .register_str(scope.clone(), "any.failed", Arc::downgrade(&wildcard), None)
            .unwrap();

        assert_eq!(names(&registry.resolve(&name("deploy.done"))), vec!["literal"]);
        assert_eq!(names(&registry.resolve(&name("build.failed"))), vec!["wildcard"]);
        assert!(registry.resolve(&name("build.done")).is_empty());
        assert!(registry.resolve(&name("deploy.done.twice")).is_empty());
    }

    #[test]
    fn test_resolve_in_audience() {
        let registry = ScopeRegistry::new();
        let alice = AgentId::new();
        let bob = AgentId::new();
        let a = handler("alice");
        let b = handler("bob");

        registry
            .register_str(Scope::agent(alice), "ping", Arc::downgrade(&a), Some(alice))
            .unwrap();
        registry
            .register_str(Scope::channel("lobby"), "ping", Arc::downgrade(&b), Some(bob))
            .unwrap();

        let ping = name("ping");
        assert_eq!(registry.resolve(&ping).len(), 2);
        assert_eq!(
            names(&registry.resolve_in(&Audience::Agent(alice), &ping)),
            vec!["alice"]
        );
        assert_eq!(
            names(&registry.resolve_in(&Audience::channel("lobby"), &ping)),
            vec!["bob"]
        );
        assert!(
            registry
                .resolve_in(&Audience::role("nobody"), &ping)
                .is_empty()
        );
    }

    #[test]
    fn test_introspection() {
        let registry = ScopeRegistry::new();
        let agent = AgentId::new();
        let h = handler("x");
        let id = registry
            .register_str(Scope::channel("c"), "a.b", Arc::downgrade(&h), Some(agent))
            .unwrap();
        registry
            .register_str(Scope::global(), "a.b", Arc::downgrade(&h), None)
            .unwrap();

        assert_eq!(registry.owner_of(id), Some(agent));
        assert_eq!(
            registry.partitions(),
            vec![(Scope::global(), 1), (Scope::channel("c"), 1)]
        );
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(ScopeRegistry::new());
        let h = handler("shared");

        std::thread::scope(|s| {
            for t in 0..8 {
                let registry = Arc::clone(&registry);
                let weak = Arc::downgrade(&h);
                s.spawn(move || {
                    for _ in 0..100 {
                        let scope = Scope::channel(format!("c{}", t % 3));
                        registry
                            .register_str(scope, "x.any", weak.clone(), None)
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(registry.len(), 800);
        assert_eq!(registry.resolve(&name("x.y")).len(), 800);
    }
}
