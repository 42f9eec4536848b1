//! Metric events, per-relay circuit breakers and the host observer seam.

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::BusError;

/// Consecutive relay failures before the circuit opens.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

pub mod names {
    pub const RELAY_CONNECT: &str = "relay.connect";
    pub const RELAY_DISCONNECT: &str = "relay.disconnect";
    pub const RELAY_AUTH_SUCCESS: &str = "relay.auth.success";
    pub const RELAY_AUTH_FAILURE: &str = "relay.auth.failure";
    pub const RELAY_AUTH_TIMEOUT: &str = "relay.auth.timeout";
    pub const RELAY_CIRCUIT_OPEN: &str = "relay.circuit_breaker.open";
    pub const RELAY_CIRCUIT_CLOSE: &str = "relay.circuit_breaker.close";
    pub const RELAY_EOSE: &str = "relay.eose";
    pub const EVENT_RECEIVED: &str = "event.received";
    pub const EVENT_REJECTED: &str = "event.rejected";
    pub const EVENT_DELIVERED: &str = "event.delivered";
    pub const EVENT_DROPPED: &str = "event.dropped";
    pub const STATE_PERSIST_FAILURE: &str = "state.persist.failure";
    pub const MESSAGE_SENT: &str = "message.sent";
}

/// A named, labeled observability event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEvent {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl MetricEvent {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Counter key: the name, plus the `reason` label when present.
    fn counter_key(&self) -> String {
        match self.label("reason") {
            Some(reason) => format!("{}.{}", self.name, reason),
            None => self.name.clone(),
        }
    }
}

/// Host-side callbacks. Every method defaults to a no-op.
pub trait BusObserver: Send + Sync {
    fn on_connect(&self, _relay: &str) {}
    fn on_disconnect(&self, _relay: &str) {}
    fn on_eose(&self, _relay: &str) {}
    fn on_error(&self, _error: &BusError, _context: &str) {}
    fn on_metric(&self, _event: &MetricEvent) {}
}

/// Default observer: everything goes to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    account: String,
}

impl TracingObserver {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }
}

impl BusObserver for TracingObserver {
    fn on_connect(&self, relay: &str) {
        debug!("[{}] Connected to relay: {}", self.account, relay);
    }

    fn on_disconnect(&self, relay: &str) {
        debug!("[{}] Disconnected from relay: {}", self.account, relay);
    }

    fn on_eose(&self, relay: &str) {
        debug!("[{}] EOSE received from relay: {}", self.account, relay);
    }

    fn on_error(&self, error: &BusError, context: &str) {
        warn!("[{}] NIP-29 error ({}): {}", self.account, context, error);
    }

    fn on_metric(&self, event: &MetricEvent) {
        match event.name.as_str() {
            names::RELAY_CIRCUIT_OPEN => warn!(
                "[{}] Circuit breaker opened for relay: {}",
                self.account,
                event.label("relay").unwrap_or("?")
            ),
            names::RELAY_CIRCUIT_CLOSE => info!(
                "[{}] Circuit breaker closed for relay: {}",
                self.account,
                event.label("relay").unwrap_or("?")
            ),
            _ => debug!(
                "[{}] Metric: {} {:?}",
                self.account, event.name, event.labels
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Opens after `threshold` consecutive failures, closes on the next success.
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    state: CircuitState,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
            state: CircuitState::Closed,
        }
    }

    /// Returns true when this failure opened the circuit.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::Closed && self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            return true;
        }
        false
    }

    /// Returns true when this success closed the circuit.
    fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        if self.state == CircuitState::Open {
            self.state = CircuitState::Closed;
            return true;
        }
        false
    }
}

/// Point-in-time copy of the bus counters and circuit states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub circuits: BTreeMap<String, CircuitState>,
}

impl MetricsSnapshot {
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }
}

/// Counter store plus fan-out to the observer. Shared by every task of a bus.
pub struct Metrics {
    observer: Arc<dyn BusObserver>,
    counters: SyncMutex<BTreeMap<String, u64>>,
    circuits: SyncMutex<HashMap<String, CircuitBreaker>>,
    threshold: u32,
}

impl Metrics {
    pub fn new(observer: Arc<dyn BusObserver>) -> Self {
        Self::with_threshold(observer, CIRCUIT_FAILURE_THRESHOLD)
    }

    pub fn with_threshold(observer: Arc<dyn BusObserver>, threshold: u32) -> Self {
        Self {
            observer,
            counters: SyncMutex::new(BTreeMap::new()),
            circuits: SyncMutex::new(HashMap::new()),
            threshold: threshold.max(1),
        }
    }

    pub fn observer(&self) -> &Arc<dyn BusObserver> {
        &self.observer
    }

    /// Count and forward a metric event.
    pub fn emit(&self, name: &str, labels: &[(&str, &str)]) {
        let event = MetricEvent::new(name, labels);
        *self.counters.lock().entry(event.counter_key()).or_insert(0) += 1;
        self.observer.on_metric(&event);
    }

    /// Forward an error to the observer.
    pub fn error(&self, error: &BusError, context: &str) {
        self.observer.on_error(error, context);
    }

    /// A relay failed to connect or dropped.
    pub fn relay_failure(&self, relay: &str) {
        let opened = self
            .circuits
            .lock()
            .entry(relay.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold))
            .record_failure();
        if opened {
            self.emit(names::RELAY_CIRCUIT_OPEN, &[("relay", relay)]);
        }
    }

    /// A relay connected successfully.
    pub fn relay_success(&self, relay: &str) {
        let closed = self
            .circuits
            .lock()
            .entry(relay.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold))
            .record_success();
        if closed {
            self.emit(names::RELAY_CIRCUIT_CLOSE, &[("relay", relay)]);
        }
    }

    pub fn circuit_state(&self, relay: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(relay)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().clone(),
            circuits: self
                .circuits
                .lock()
                .iter()
                .map(|(relay, c)| (relay.clone(), c.state))
                .collect(),
        }
    }
}
