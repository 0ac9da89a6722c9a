//! Mock handlers and peering policies.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use synapse_events::{
    DeliveryContext, EventEnvelope, EventHandler, HandlerError, HandlerResult, Negotiation,
    NegotiationRequest, PeeringPolicy,
};

/// One delivery observed by a [`RecordingHandler`].
#[derive(Debug, Clone)]
pub struct Received {
    /// The delivered envelope.
    pub envelope: Arc<EventEnvelope>,
    /// The delivery context.
    pub context: DeliveryContext,
}

/// Handler that records every delivery.
///
/// Uses `std::sync::Mutex` internally so the accessors work without a
/// runtime.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    name: String,
    received: Mutex<Vec<Received>>,
    notify: Notify,
}

impl RecordingHandler {
    /// Create a named recorder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Deliveries so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Every delivery so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Event names so far, in arrival order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|r| r.envelope.name().to_string())
            .collect()
    }

    /// The most recent envelope.
    #[must_use]
    pub fn last(&self) -> Option<Arc<EventEnvelope>> {
        self.received
            .lock()
            .ok()
            .and_then(|r| r.last().map(|d| Arc::clone(&d.envelope)))
    }

    /// Wait until at least `n` deliveries arrived. Returns `false` on
    /// timeout.
    pub async fn wait_for(&self, n: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, envelope: Arc<EventEnvelope>, context: DeliveryContext) -> HandlerResult {
        if let Ok(mut guard) = self.received.lock() {
            guard.push(Received { envelope, context });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handler that always returns an error.
#[derive(Debug, Default)]
pub struct FailingHandler {
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Create a failing handler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, envelope: Arc<EventEnvelope>, _: DeliveryContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed(format!(
            "refusing {}",
            envelope.name()
        )))
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "failing"
    }
}

/// Handler that panics on every delivery.
#[derive(Debug, Default)]
pub struct PanickingHandler;

impl PanickingHandler {
    /// Create a panicking handler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn handle(&self, envelope: Arc<EventEnvelope>, _: DeliveryContext) -> HandlerResult {
        panic!("handler exploded on {}", envelope.name());
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "panicking"
    }
}

/// Handler that takes a fixed time, stopping early when cancelled.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    started: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl SlowHandler {
    /// Create a handler that sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        })
    }

    /// Invocations started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Invocations that slept the full delay.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Invocations that observed cancellation.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(&self, _: Arc<EventEnvelope>, ctx: DeliveryContext) -> HandlerResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            () = ctx.cancellation.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Rejected("cancelled".to_string()))
            },
        }
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "slow"
    }
}

/// Handler that blocks every delivery until opened, then records it.
#[derive(Debug)]
pub struct GatedHandler {
    gate: Semaphore,
    inner: Arc<RecordingHandler>,
}

impl GatedHandler {
    /// Create a closed gate.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            inner: RecordingHandler::new("gated"),
        })
    }

    /// Let every pending and future delivery through.
    pub fn open(&self) {
        self.gate.close();
    }

    /// Deliveries completed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.count()
    }

    /// Event names completed, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }

    /// Wait until at least `n` deliveries completed.
    pub async fn wait_for(&self, n: usize, limit: Duration) -> bool {
        self.inner.wait_for(n, limit).await
    }
}

#[async_trait]
impl EventHandler for GatedHandler {
    async fn handle(&self, envelope: Arc<EventEnvelope>, ctx: DeliveryContext) -> HandlerResult {
        // A closed semaphore means the gate is open.
        if let Ok(permit) = self.gate.acquire().await {
            drop(permit);
        }
        self.inner.handle(envelope, ctx).await
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "gated"
    }
}

/// Peering policy that always returns the same decision, optionally after
/// a delay.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    decision: Negotiation,
    delay: Option<Duration>,
    evaluations: Arc<AtomicUsize>,
}

impl StaticPolicy {
    /// Accept every request with the target's declared capabilities.
    #[must_use]
    pub fn accept_all() -> Self {
        Self {
            decision: Negotiation::Accept(synapse_events::PeerCapabilities::default()),
            delay: None,
            evaluations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deny every request.
    #[must_use]
    pub fn deny_all(reason: impl Into<String>) -> Self {
        Self {
            decision: Negotiation::Deny(reason.into()),
            delay: None,
            evaluations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer only after `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests evaluated.
    #[must_use]
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeeringPolicy for StaticPolicy {
    async fn evaluate(&self, request: &NegotiationRequest) -> Negotiation {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.decision {
            Negotiation::Accept(_) => Negotiation::Accept(request.target_capabilities.clone()),
            deny @ Negotiation::Deny(_) => deny.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::{Scope, SubscriptionId};
    use synapse_events::{EventName, Payload};

    fn envelope(name: &str) -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope::new(
            EventName::parse(name).unwrap(),
            Payload::new(),
        ))
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext::subscription(SubscriptionId::new(), Scope::global())
    }

    #[tokio::test]
    async fn test_recording_handler() {
        let handler = RecordingHandler::new("rec");
        handler.handle(envelope("a.b"), ctx()).await.unwrap();
        handler.handle(envelope("c.d"), ctx()).await.unwrap();

        assert_eq!(handler.count(), 2);
        assert_eq!(handler.names(), vec!["a.b", "c.d"]);
        assert_eq!(handler.last().unwrap().name().as_str(), "c.d");
        assert!(handler.wait_for(2, Duration::from_millis(10)).await);
        assert!(!handler.wait_for(3, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_failing_handler() {
        let handler = FailingHandler::new();
        assert!(handler.handle(envelope("a"), ctx()).await.is_err());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_observes_cancellation() {
        let handler = SlowHandler::new(Duration::from_secs(30));
        let context = ctx();
        context.cancellation.cancel();

        let result = handler.handle(envelope("a"), context).await;
        assert!(result.is_err());
        assert_eq!(handler.cancelled(), 1);
        assert_eq!(handler.completed(), 0);
    }

    #[tokio::test]
    async fn test_gated_handler() {
        let handler = GatedHandler::new();
        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(envelope("a"), ctx()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.count(), 0);

        handler.open();
        task.await.unwrap().unwrap();
        assert_eq!(handler.count(), 1);
    }
}
