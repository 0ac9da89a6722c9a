//! Bus counters and the statistics snapshot.
//!
//! All counters are relaxed atomics; a snapshot is eventually consistent
//! and never blocks the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Statistics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Window over which events per second are averaged.
    pub throughput_window: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            throughput_window: Duration::from_secs(10),
        }
    }
}

/// Low half of a bucket word holds the count, high half the second.
const COUNT_MASK: u64 = 0xFFFF_FFFF;

/// A bucket that has never been written.
const EMPTY_BUCKET: u64 = u64::MAX;

fn pack(second: u64, count: u64) -> u64 {
    (second & COUNT_MASK).wrapping_shl(32) | (count & COUNT_MASK)
}

fn unpack(word: u64) -> (u64, u64) {
    (word.wrapping_shr(32), word & COUNT_MASK)
}

/// Per-second event counts over a sliding window.
#[derive(Debug)]
pub(crate) struct ThroughputMeter {
    origin: Instant,
    /// One packed `(second, count)` word per slot, so a rollover and an
    /// increment can never interleave.
    buckets: Box<[AtomicU64]>,
}

impl ThroughputMeter {
    pub(crate) fn new(window: Duration) -> Self {
        let slots = usize::try_from(window.as_secs()).unwrap_or(1).max(1);
        Self {
            origin: Instant::now(),
            buckets: (0..slots).map(|_| AtomicU64::new(EMPTY_BUCKET)).collect(),
        }
    }

    fn current_second(&self) -> u64 {
        self.origin.elapsed().as_secs() & COUNT_MASK
    }

    fn slot(&self, second: u64) -> usize {
        let len = u64::try_from(self.buckets.len()).unwrap_or(1);
        usize::try_from(second.checked_rem(len).unwrap_or(0)).unwrap_or(0)
    }

    pub(crate) fn record(&self) {
        self.record_at(self.current_second());
    }

    fn record_at(&self, second: u64) {
        let bucket = &self.buckets[self.slot(second)];
        let mut current = bucket.load(Ordering::Relaxed);
        loop {
            let (stamp, count) = unpack(current);
            // A slot already moved to a later second keeps counting there.
            let next = if current != EMPTY_BUCKET && stamp >= second {
                pack(stamp, count.saturating_add(1).min(COUNT_MASK.saturating_sub(1)))
            } else {
                pack(second, 1)
            };
            match bucket.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Events counted in slots still inside the window ending at `now`.
    fn total_at(&self, now: u64) -> u64 {
        let window = self.buckets.len() as u64;
        self.buckets
            .iter()
            .filter_map(|bucket| {
                let word = bucket.load(Ordering::Acquire);
                let (second, count) = unpack(word);
                (word != EMPTY_BUCKET && second.saturating_add(window) > now).then_some(count)
            })
            .sum()
    }

    /// Average events per second over the window.
    ///
    /// Before a full window has elapsed the divisor is the elapsed time,
    /// with a floor of one second.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn rate(&self) -> f64 {
        let total = self.total_at(self.current_second());
        let window = self.buckets.len() as f64;
        let span = self.origin.elapsed().as_secs_f64().clamp(1.0, window);
        total as f64 / span
    }
}

/// Lock-free counters updated by the bus components.
#[derive(Debug)]
pub struct BusMetrics {
    pub(crate) events_emitted: AtomicU64,
    pub(crate) events_unrouted: AtomicU64,
    pub(crate) invalid_events: AtomicU64,
    pub(crate) deliveries_scheduled: AtomicU64,
    pub(crate) deliveries_succeeded: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) handler_timeouts: AtomicU64,
    pub(crate) deliveries_dropped: AtomicU64,
    pub(crate) peer_deliveries: AtomicU64,
    pub(crate) peer_fallbacks: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
    throughput: ThroughputMeter,
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new(&StatsConfig::default())
    }
}

impl BusMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            events_emitted: AtomicU64::new(0),
            events_unrouted: AtomicU64::new(0),
            invalid_events: AtomicU64::new(0),
            deliveries_scheduled: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_timeouts: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            peer_deliveries: AtomicU64::new(0),
            peer_fallbacks: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            throughput: ThroughputMeter::new(config.throughput_window),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn record_emit(&self) {
        Self::incr(&self.events_emitted);
        self.throughput.record();
    }

    /// Record emit-to-completion latency of one delivery.
    pub(crate) fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        Self::incr(&self.latency_samples);
    }

    #[allow(clippy::cast_precision_loss)]
    fn average_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_micros.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
    }

    /// Snapshot of the counters, combined with gauges owned elsewhere.
    #[must_use]
    pub fn snapshot(
        &self,
        subscription_count: usize,
        agent_count: usize,
        active_peer_connections: usize,
    ) -> BusStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusStats {
            subscription_count,
            agent_count,
            active_peer_connections,
            events_emitted_total: load(&self.events_emitted),
            events_unrouted: load(&self.events_unrouted),
            invalid_events: load(&self.invalid_events),
            events_per_second: self.throughput.rate(),
            deliveries_scheduled: load(&self.deliveries_scheduled),
            deliveries_succeeded: load(&self.deliveries_succeeded),
            handler_failures: load(&self.handler_failures),
            handler_timeouts: load(&self.handler_timeouts),
            deliveries_dropped: load(&self.deliveries_dropped),
            peer_deliveries: load(&self.peer_deliveries),
            peer_fallbacks: load(&self.peer_fallbacks),
            average_handler_latency_ms: self.average_latency_ms(),
        }
    }
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    /// Registered subscriptions.
    pub subscription_count: usize,
    /// Registered agents.
    pub agent_count: usize,
    /// Peer connections in the `Active` state.
    pub active_peer_connections: usize,
    /// Valid events emitted since start.
    pub events_emitted_total: u64,
    /// Emitted events that matched no subscription.
    pub events_unrouted: u64,
    /// Emissions rejected for a malformed name.
    pub invalid_events: u64,
    /// Average emission rate over the throughput window.
    pub events_per_second: f64,
    /// Handler invocations scheduled by the dispatcher.
    pub deliveries_scheduled: u64,
    /// Handler invocations that returned `Ok`.
    pub deliveries_succeeded: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Handler invocations that exceeded the timeout.
    pub handler_timeouts: u64,
    /// Deliveries dropped for lack of a runtime or a closed lane.
    pub deliveries_dropped: u64,
    /// Events delivered over peer links.
    pub peer_deliveries: u64,
    /// Peer sends that fell back to the bus.
    pub peer_fallbacks: u64,
    /// Mean emit-to-completion latency of finished deliveries.
    pub average_handler_latency_ms: f64,
}
