//! Fire-and-forget handler dispatch.
//!
//! `dispatch` only schedules work and returns. Each delivery runs inside a
//! panic boundary; errors, panics and timeouts are logged and counted and
//! never reach the emitter or other deliveries.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use synapse_core::SubscriptionId;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, trace, warn};

use crate::envelope::EventEnvelope;
use crate::handler::{DeliveryContext, HandlerError};
use crate::registry::ResolvedSubscription;
use crate::stats::BusMetrics;

/// Delivery ordering guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrdering {
    /// Every delivery is an independent task. No ordering guarantee.
    #[default]
    Concurrent,
    /// Deliveries to the same subscription run one at a time, in emission
    /// order.
    PerSubscriptionFifo,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ordering guarantee.
    pub ordering: DeliveryOrdering,
    /// Time after which a delivery is logged as timed out and its
    /// cancellation token fired.
    pub handler_timeout: Option<Duration>,
    /// Upper bound on handlers running at once.
    pub max_concurrent_handlers: Option<usize>,
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(HandlerError),
    Panicked(String),
    TimedOut,
}

pub(crate) struct Delivery {
    pub(crate) envelope: Arc<EventEnvelope>,
    pub(crate) subscription: ResolvedSubscription,
}

/// Runs single deliveries. Shared by the dispatcher and peer links.
#[derive(Clone)]
pub(crate) struct Executor {
    timeout: Option<Duration>,
    limiter: Option<Arc<Semaphore>>,
    metrics: Arc<BusMetrics>,
}

impl Executor {
    /// Acquire a concurrency permit, then execute.
    async fn run(&self, delivery: Delivery) -> Outcome {
        let permit = match &self.limiter {
            Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    BusMetrics::incr(&self.metrics.deliveries_dropped);
                    return Outcome::Failed(HandlerError::Rejected("limiter closed".into()));
                },
            },
            None => None,
        };
        self.execute(delivery, false, permit).await
    }

    /// Invoke the handler inside the panic and timeout boundary.
    ///
    /// The permit is released when the handler itself finishes, which may be
    /// after a timeout has already been reported.
    pub(crate) async fn execute(
        &self,
        delivery: Delivery,
        via_peer: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Outcome {
        let Delivery {
            envelope,
            subscription,
        } = delivery;

        let ctx = if via_peer {
            DeliveryContext::peer(subscription.id, subscription.scope.clone())
        } else {
            DeliveryContext::subscription(subscription.id, subscription.scope.clone())
        };
        let token = ctx.cancellation.clone();
        let handler = Arc::clone(&subscription.handler);
        let handler_envelope = Arc::clone(&envelope);

        let invocation = async move {
            let _permit = permit;
            AssertUnwindSafe(handler.handle(handler_envelope, ctx))
                .catch_unwind()
                .await
        };

        let result = match self.timeout {
            None => invocation.await,
            Some(limit) => {
                // A separate task keeps running past the timeout; only its
                // token is cancelled.
                let mut task = tokio::spawn(invocation);
                match tokio::time::timeout(limit, &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Ok(Err(HandlerError::Failed(format!(
                        "handler task ended abnormally: {join_error}"
                    )))),
                    Err(_) => {
                        token.cancel();
                        BusMetrics::incr(&self.metrics.handler_timeouts);
                        warn!(
                            subscription_id = %subscription.id,
                            event_id = %envelope.id(),
                            event_name = %envelope.name(),
                            handler = %subscription.handler.name(),
                            timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            "Handler timed out"
                        );
                        return Outcome::TimedOut;
                    },
                }
            },
        };

        let outcome = match result {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(error)) => Outcome::Failed(error),
            Err(payload) => Outcome::Panicked(panic_message(&*payload)),
        };
        self.metrics.record_latency(envelope.age());

        match &outcome {
            Outcome::Succeeded => {
                BusMetrics::incr(&self.metrics.deliveries_succeeded);
                trace!(
                    subscription_id = %subscription.id,
                    event_id = %envelope.id(),
                    "Delivery completed"
                );
            },
            Outcome::Failed(error) => {
                BusMetrics::incr(&self.metrics.handler_failures);
                warn!(
                    subscription_id = %subscription.id,
                    event_id = %envelope.id(),
                    event_name = %envelope.name(),
                    handler = %subscription.handler.name(),
                    error = %error,
                    "Handler failed"
                );
            },
            Outcome::Panicked(message) => {
                BusMetrics::incr(&self.metrics.handler_failures);
                warn!(
                    subscription_id = %subscription.id,
                    event_id = %envelope.id(),
                    event_name = %envelope.name(),
                    handler = %subscription.handler.name(),
                    panic = %message,
                    "Handler panicked"
                );
            },
            Outcome::TimedOut => {},
        }

        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Schedules handler invocations on the tokio runtime.
pub struct Dispatcher {
    config: DispatchConfig,
    runtime: Option<Handle>,
    executor: Executor,
    lanes: DashMap<SubscriptionId, mpsc::UnboundedSender<Delivery>>,
    metrics: Arc<BusMetrics>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("has_runtime", &self.runtime.is_some())
            .field("lanes", &self.lanes.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// Without an explicit runtime handle, the runtime current at each
    /// `dispatch` call is used.
    #[must_use]
    pub fn new(config: DispatchConfig, metrics: Arc<BusMetrics>, runtime: Option<Handle>) -> Self {
        let limiter = config
            .max_concurrent_handlers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            executor: Executor {
                timeout: config.handler_timeout,
                limiter,
                metrics: Arc::clone(&metrics),
            },
            config,
            runtime,
            lanes: DashMap::new(),
            metrics,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub(crate) fn executor(&self) -> Executor {
        self.executor.clone()
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    /// Schedule one delivery per subscription and return immediately.
    ///
    /// Returns the number of deliveries scheduled. With no runtime
    /// available, deliveries are dropped and counted.
    pub fn dispatch(
        &self,
        envelope: &Arc<EventEnvelope>,
        subscriptions: Vec<ResolvedSubscription>,
    ) -> usize {
        if subscriptions.is_empty() {
            return 0;
        }

        let Some(runtime) = self.runtime() else {
            BusMetrics::add(&self.metrics.deliveries_dropped, subscriptions.len());
            warn!(
                event_id = %envelope.id(),
                event_name = %envelope.name(),
                dropped = subscriptions.len(),
                "No tokio runtime available, deliveries dropped"
            );
            return 0;
        };

        let mut scheduled: usize = 0;
        for subscription in subscriptions {
            let delivery = Delivery {
                envelope: Arc::clone(envelope),
                subscription,
            };
            let accepted = match self.config.ordering {
                DeliveryOrdering::Concurrent => {
                    let executor = self.executor.clone();
                    runtime.spawn(async move {
                        executor.run(delivery).await;
                    });
                    true
                },
                DeliveryOrdering::PerSubscriptionFifo => self.enqueue(&runtime, delivery),
            };
            if accepted {
                scheduled = scheduled.saturating_add(1);
            }
        }

        BusMetrics::add(&self.metrics.deliveries_scheduled, scheduled);
        trace!(
            event_id = %envelope.id(),
            event_name = %envelope.name(),
            scheduled,
            "Deliveries scheduled"
        );
        scheduled
    }

    fn enqueue(&self, runtime: &Handle, delivery: Delivery) -> bool {
        let id = delivery.subscription.id;
        let sent = {
            let lane = self.lanes.entry(id).or_insert_with(|| {
                let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();
                let executor = self.executor.clone();
                runtime.spawn(async move {
                    while let Some(delivery) = receiver.recv().await {
                        executor.run(delivery).await;
                    }
                });
                debug!(subscription_id = %id, "Delivery lane opened");
                sender
            });
            lane.send(delivery).is_ok()
        };

        if !sent {
            // The lane worker is gone (runtime shut down).
            self.lanes.remove(&id);
            BusMetrics::incr(&self.metrics.deliveries_dropped);
        }
        sent
    }

    /// Close the FIFO lane of a subscription. Queued deliveries still run.
    pub fn close_lane(&self, id: SubscriptionId) -> bool {
        let closed = self.lanes.remove(&id).is_some();
        if closed {
            debug!(subscription_id = %id, "Delivery lane closed");
        }
        closed
    }

    /// Number of open FIFO lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}
