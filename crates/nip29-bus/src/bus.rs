//! Bus orchestrator: one relay connection per distinct relay URL, one
//! dispatch task per account, and the outbound "send to group" surface.

use futures_util::future::join_all;
use nostr_sdk::{Event, Keys};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::{Cursor, Dispatcher, InboundHandler};
use crate::error::{BusError, Result};
use crate::keys::{derive_identity, Identity};
use crate::metrics::{names, BusObserver, Metrics, MetricsSnapshot};
use crate::protocol;
use crate::relay::{ConnectionState, RelayConfig, RelayConnection, RelayNotification};
use crate::scheduler::{Debounce, PERSIST_DEBOUNCE};
use crate::seen::{SeenConfig, SeenTracker, SEEN_SWEEP_INTERVAL};
use crate::state::{compute_since_timestamp, now_secs, BusState, StateStore, STARTUP_LOOKBACK_SECS};

/// Subscription ID used for the group filter on every relay.
pub const GROUP_SUBSCRIPTION_ID: &str = "nip29-groups";

/// A group and the relay that hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBinding {
    pub group_id: String,
    pub relay_url: String,
    #[serde(default)]
    pub mention_only: Option<bool>,
}

impl GroupBinding {
    pub fn new(group_id: impl Into<String>, relay_url: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            relay_url: relay_url.into(),
            mention_only: None,
        }
    }
}

/// Check that every group is bound exactly once, so it maps to one relay.
pub fn validate_bindings(groups: &[GroupBinding]) -> Result<()> {
    let mut relays: HashMap<&str, String> = HashMap::new();
    for binding in groups {
        let relay = protocol::normalize_relay_url(&binding.relay_url);
        if let Some(first) = relays.insert(&binding.group_id, relay.clone()) {
            return Err(BusError::InvalidConfig(format!(
                "group {} is bound more than once ({} and {})",
                binding.group_id, first, relay
            )));
        }
    }
    Ok(())
}

/// Where the first subscription starts after a (re)start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Replay from the persisted cursor (or start time) minus the lookback.
    #[default]
    Lookback,
    /// Only events from now on; anything sent while down is missed.
    LiveOnly,
}

impl ResumePolicy {
    pub fn since(self, prior: Option<&BusState>, started_at: u64, lookback_secs: u64) -> u64 {
        match self {
            Self::Lookback => {
                compute_since_timestamp(prior, started_at).saturating_sub(lookback_secs)
            }
            Self::LiveOnly => started_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// `nsec` secret key
    pub secret_key: String,
    /// Account identifier; defaults to the first 16 hex chars of the pubkey
    pub account_id: Option<String>,
    pub groups: Vec<GroupBinding>,
    pub resume: ResumePolicy,
    pub lookback_secs: u64,
    pub persist_debounce: Duration,
    pub seen: SeenConfig,
    pub relay: RelayConfig,
}

impl BusConfig {
    pub fn new(secret_key: impl Into<String>, groups: Vec<GroupBinding>) -> Self {
        Self {
            secret_key: secret_key.into(),
            account_id: None,
            groups,
            resume: ResumePolicy::default(),
            lookback_secs: STARTUP_LOOKBACK_SECS,
            persist_debounce: PERSIST_DEBOUNCE,
            seen: SeenConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Signs and publishes group messages on the relay that owns the group.
/// Cheap to clone; handed to inbound handlers for replies.
#[derive(Clone)]
pub struct Outbound {
    keys: Keys,
    group_relays: Arc<HashMap<String, String>>,
    relays: Arc<HashMap<String, RelayConnection>>,
    metrics: Arc<Metrics>,
}

impl Outbound {
    pub(crate) fn new(
        keys: Keys,
        group_relays: HashMap<String, String>,
        relays: HashMap<String, RelayConnection>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            keys,
            group_relays: Arc::new(group_relays),
            relays: Arc::new(relays),
            metrics,
        }
    }

    pub fn relay_for_group(&self, group_id: &str) -> Option<&str> {
        self.group_relays.get(group_id).map(String::as_str)
    }

    /// The bus metrics, for handlers that reject messages themselves.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Publish a kind-9 message to `group_id` and return the signed event.
    pub async fn send_group_message(&self, group_id: &str, text: &str) -> Result<Event> {
        let relay_url = self
            .group_relays
            .get(group_id)
            .ok_or_else(|| BusError::UnknownGroup(group_id.to_string()))?;
        let connection = self
            .relays
            .get(relay_url)
            .filter(|c| c.is_established())
            .ok_or_else(|| BusError::NotConnected(relay_url.clone()))?;

        let event = protocol::build_group_message(&self.keys, group_id, text)?;
        if let Err(e) = connection.publish(&event).await {
            warn!("Failed to publish to {} via {}: {}", group_id, relay_url, e);
            self.metrics.error(&e, "publish");
            return Err(e);
        }

        self.metrics
            .emit(names::MESSAGE_SENT, &[("relay", relay_url), ("group", group_id)]);
        info!("Sent message to group {} via {}", group_id, relay_url);
        Ok(event)
    }
}

/// A running NIP-29 bus for one account.
pub struct Nip29Bus {
    identity: Identity,
    account_key: String,
    outbound: Outbound,
    relays: Arc<HashMap<String, RelayConnection>>,
    groups_by_relay: BTreeMap<String, Vec<String>>,
    bindings: HashMap<String, GroupBinding>,
    notify: mpsc::UnboundedSender<RelayNotification>,
    shutdown: watch::Sender<bool>,
    dispatcher: SyncMutex<Option<JoinHandle<()>>>,
    cursor: Arc<AtomicU64>,
    lookback_secs: u64,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
}

impl Nip29Bus {
    /// Derive the identity, restore state, connect every relay concurrently,
    /// and start dispatching. Only an invalid key is fatal; relay failures
    /// are reported through the observer and leave that relay closed.
    pub async fn start(
        config: BusConfig,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn InboundHandler>,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let identity = derive_identity(&config.secret_key)?;
        validate_bindings(&config.groups)?;
        let account_id = config
            .account_id
            .clone()
            .unwrap_or_else(|| identity.public_key[..16].to_string());
        let account_key = format!("nip29-{account_id}");
        let metrics = Arc::new(Metrics::new(observer));

        let started_at = now_secs();
        let prior = match store.read(&account_key) {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read state for {}: {}", account_key, e);
                metrics.error(&e, "persist");
                None
            }
        };
        let since = config
            .resume
            .since(prior.as_ref(), started_at, config.lookback_secs);

        let cursor = Cursor::resume(prior.as_ref(), started_at);
        if let Err(e) = store.write(&account_key, &cursor.to_state()) {
            warn!("Failed to write initial state for {}: {}", account_key, e);
            metrics.emit(names::STATE_PERSIST_FAILURE, &[]);
            metrics.error(&e, "persist");
        }

        let mut seen = SeenTracker::new(config.seen);
        if let Some(state) = &prior {
            seen.seed(&state.recent_event_ids);
        }

        let mut groups_by_relay: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut group_relays = HashMap::new();
        let mut bindings = HashMap::new();
        for binding in &config.groups {
            let relay = protocol::normalize_relay_url(&binding.relay_url);
            let groups = groups_by_relay.entry(relay.clone()).or_default();
            if !groups.contains(&binding.group_id) {
                groups.push(binding.group_id.clone());
            }
            group_relays.insert(binding.group_id.clone(), relay.clone());
            bindings.insert(
                binding.group_id.clone(),
                GroupBinding {
                    relay_url: relay,
                    ..binding.clone()
                },
            );
        }

        let relays: HashMap<String, RelayConnection> = groups_by_relay
            .keys()
            .map(|url| {
                let conn = RelayConnection::new(
                    url,
                    identity.keys.clone(),
                    config.relay.clone(),
                    metrics.clone(),
                );
                (url.clone(), conn)
            })
            .collect();
        let outbound = Outbound::new(
            identity.keys.clone(),
            group_relays,
            relays.clone(),
            metrics.clone(),
        );

        let cursor_mirror = Arc::new(AtomicU64::new(cursor.last_processed_at()));
        let (notify, notifications) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            own_pubkey: identity.public_key.clone(),
            groups_by_relay: groups_by_relay
                .iter()
                .map(|(url, groups)| (url.clone(), groups.iter().cloned().collect::<HashSet<_>>()))
                .collect(),
            seen,
            cursor,
            debounce: Debounce::new(config.persist_debounce),
            sweep_interval: SEEN_SWEEP_INTERVAL,
            store,
            state_key: account_key.clone(),
            handler,
            outbound: outbound.clone(),
            metrics: metrics.clone(),
            cursor_mirror: cursor_mirror.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(notifications, shutdown_rx));

        let bus = Self {
            identity,
            account_key,
            outbound,
            relays: Arc::new(relays),
            groups_by_relay,
            bindings,
            notify,
            shutdown,
            dispatcher: SyncMutex::new(Some(dispatcher)),
            cursor: cursor_mirror,
            lookback_secs: config.lookback_secs,
            metrics,
            closed: AtomicBool::new(false),
        };

        info!(
            "[{}] Starting NIP-29 bus for {} group(s) on {} relay(s), since {}",
            bus.account_key,
            bus.bindings.len(),
            bus.relays.len(),
            since
        );
        join_all(bus.relays.keys().map(|url| bus.setup_relay(url, since))).await;

        Ok(bus)
    }

    /// Connect, wait for AUTH (bounded) and subscribe. Failures stay local
    /// to this relay.
    async fn setup_relay(&self, url: &str, since: u64) {
        let Some(connection) = self.relays.get(url) else {
            return;
        };
        if connection.connect(self.notify.clone()).await.is_err() {
            // Already reported by the connection
            return;
        }
        connection.await_auth().await;

        let groups = self.groups_by_relay.get(url).cloned().unwrap_or_default();
        let filter = protocol::group_filter(&groups, since);
        if let Err(e) = connection.subscribe(GROUP_SUBSCRIPTION_ID, &filter) {
            warn!("Failed to subscribe on {}: {}", url, e);
            self.metrics.error(&e, "subscription");
        }
    }

    /// Re-establish one relay and resubscribe from the current cursor minus
    /// the lookback.
    pub async fn reconnect(&self, relay_url: &str) -> Result<()> {
        let url = protocol::normalize_relay_url(relay_url);
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected(url));
        }
        let connection = self
            .relays
            .get(&url)
            .ok_or_else(|| BusError::NotConnected(url.clone()))?;

        let since = self
            .cursor
            .load(Ordering::Relaxed)
            .saturating_sub(self.lookback_secs);
        self.setup_relay(&url, since).await;
        if connection.is_established() {
            Ok(())
        } else {
            Err(BusError::NotConnected(url))
        }
    }

    pub async fn send_group_message(&self, group_id: &str, text: &str) -> Result<Event> {
        self.outbound.send_group_message(group_id, text).await
    }

    /// Close every relay, stop dispatching and write the final cursor.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Closing NIP-29 bus", self.account_key);

        join_all(self.relays.values().map(|c| c.close())).await;
        self.shutdown.send_replace(true);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!("[{}] Dispatcher task failed: {}", self.account_key, e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn public_key(&self) -> &str {
        &self.identity.public_key
    }

    pub fn account_key(&self) -> &str {
        &self.account_key
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupBinding> {
        self.bindings.get(group_id)
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.keys().cloned().collect()
    }

    pub fn relay_state(&self, relay_url: &str) -> Option<ConnectionState> {
        self.relays
            .get(&protocol::normalize_relay_url(relay_url))
            .map(RelayConnection::state)
    }

    /// Current resume cursor.
    pub fn last_processed_at(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Nip29Bus {
    fn drop(&mut self) {
        // Best effort: the dispatcher flushes on shutdown, sockets close when
        // their connections drop
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
        }
    }
}
