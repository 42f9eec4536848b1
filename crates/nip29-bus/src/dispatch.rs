//! Inbound event pipeline: dedup, self-echo and group filtering, delivery to
//! the handler, cursor advance and debounced persistence.
//!
//! One `Dispatcher` task per bus receives notifications from every relay
//! socket task and exclusively owns the seen tracker, the cursor and the
//! debounce timer.

use async_trait::async_trait;
use nostr_sdk::Event;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bus::Outbound;
use crate::error::BusError;
use crate::metrics::{names, Metrics};
use crate::protocol;
use crate::relay::RelayNotification;
use crate::scheduler::Debounce;
use crate::seen::SeenTracker;
use crate::state::{BusState, StateStore, MAX_PERSISTED_EVENT_IDS};

/// Payload delivered to the host for each accepted group event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub group_id: String,
    pub relay_url: String,
    pub sender_pubkey: String,
    pub text: String,
    pub kind: u16,
    pub event_id: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: u64,
}

impl InboundMessage {
    fn from_event(event: &Event, group_id: String, relay_url: &str) -> Self {
        Self {
            group_id,
            relay_url: relay_url.to_string(),
            sender_pubkey: event.pubkey.to_hex(),
            text: event.content.clone(),
            kind: event.kind.as_u16(),
            event_id: event.id.to_hex(),
            tags: protocol::tag_lists(event),
            created_at: event.created_at.as_secs(),
        }
    }
}

/// Consumer of inbound group messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage, outbound: &Outbound) -> anyhow::Result<()>;
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Duplicate,
    SelfEcho,
    ForeignGroup,
    Delivered,
    Failed,
}

/// In-memory resume cursor: newest processed timestamp plus a FIFO window
/// of recently processed IDs.
#[derive(Debug, Clone)]
pub(crate) struct Cursor {
    last_processed_at: u64,
    gateway_started_at: u64,
    recent: VecDeque<String>,
}

impl Cursor {
    pub(crate) fn resume(prior: Option<&BusState>, gateway_started_at: u64) -> Self {
        let (last_processed_at, ids) = match prior {
            Some(s) => (s.last_processed_at, s.recent_event_ids.as_slice()),
            None => (gateway_started_at, &[][..]),
        };
        let skip = ids.len().saturating_sub(MAX_PERSISTED_EVENT_IDS);
        Self {
            last_processed_at,
            gateway_started_at,
            recent: ids[skip..].iter().cloned().collect(),
        }
    }

    pub(crate) fn advance(&mut self, created_at: u64, event_id: String) {
        self.last_processed_at = self.last_processed_at.max(created_at);
        self.recent.push_back(event_id);
        while self.recent.len() > MAX_PERSISTED_EVENT_IDS {
            self.recent.pop_front();
        }
    }

    pub(crate) fn last_processed_at(&self) -> u64 {
        self.last_processed_at
    }

    pub(crate) fn to_state(&self) -> BusState {
        BusState {
            last_processed_at: self.last_processed_at,
            gateway_started_at: self.gateway_started_at,
            recent_event_ids: self.recent.iter().cloned().collect(),
        }
    }
}

pub(crate) struct Dispatcher {
    pub(crate) own_pubkey: String,
    pub(crate) groups_by_relay: HashMap<String, HashSet<String>>,
    pub(crate) seen: SeenTracker,
    pub(crate) cursor: Cursor,
    pub(crate) debounce: Debounce,
    pub(crate) sweep_interval: Duration,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) state_key: String,
    pub(crate) handler: Arc<dyn InboundHandler>,
    pub(crate) outbound: Outbound,
    pub(crate) metrics: Arc<Metrics>,
    /// Mirror of the cursor for resubscribing from outside the task.
    pub(crate) cursor_mirror: Arc<AtomicU64>,
}

impl Dispatcher {
    pub(crate) async fn handle_event(&mut self, relay: &str, event: Event) -> Disposition {
        let id = event.id.to_hex();
        self.metrics.emit(names::EVENT_RECEIVED, &[("relay", relay)]);

        if self.seen.peek(&id) {
            debug!("Duplicate event {} from {}", id, relay);
            self.reject("duplicate", relay);
            return Disposition::Duplicate;
        }
        self.seen.add(&id);

        if event.pubkey.to_hex() == self.own_pubkey {
            self.reject("self", relay);
            return Disposition::SelfEcho;
        }

        let subscribed = self.groups_by_relay.get(relay);
        let group_id = match protocol::extract_group(&event) {
            Some(g) if subscribed.is_some_and(|set| set.contains(&g)) => g,
            other => {
                debug!("Event {} for unsubscribed group {:?} on {}", id, other, relay);
                self.reject("group", relay);
                return Disposition::ForeignGroup;
            }
        };

        let message = InboundMessage::from_event(&event, group_id, relay);
        match self.handler.on_message(message, &self.outbound).await {
            Ok(()) => {
                self.metrics.emit(names::EVENT_DELIVERED, &[("relay", relay)]);
                self.cursor.advance(event.created_at.as_secs(), id);
                self.cursor_mirror
                    .store(self.cursor.last_processed_at(), Ordering::Relaxed);
                self.debounce.schedule();
                Disposition::Delivered
            }
            Err(e) => {
                warn!("Inbound handler failed for {}: {:#}", id, e);
                self.metrics
                    .error(&BusError::Handler(format!("{e:#}")), "dispatch");
                Disposition::Failed
            }
        }
    }

    fn reject(&self, reason: &str, relay: &str) {
        self.metrics
            .emit(names::EVENT_REJECTED, &[("reason", reason), ("relay", relay)]);
    }

    fn handle_eose(&self, relay: &str) {
        self.metrics.emit(names::RELAY_EOSE, &[("relay", relay)]);
        self.metrics.observer().on_eose(relay);
    }

    /// Write the current cursor. Failures are reported, never fatal.
    pub(crate) fn persist(&self) {
        let state = self.cursor.to_state();
        if let Err(e) = self.store.write(&self.state_key, &state) {
            warn!("Failed to persist state for {}: {}", self.state_key, e);
            self.metrics.emit(names::STATE_PERSIST_FAILURE, &[]);
            self.metrics.error(&e, "persist");
        }
    }

    /// Process notifications until shutdown is signalled or every sender is
    /// gone, then stop the seen tracker and write the final cursor.
    ///
    /// A handler still running when shutdown arrives is dropped; its event
    /// does not advance the cursor and is replayed by the lookback on the
    /// next start. Notifications still queued are counted and dropped.
    pub(crate) async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<RelayNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let start = tokio::time::Instant::now() + self.sweep_interval;
        let mut sweep = tokio::time::interval_at(start, self.sweep_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                notification = notifications.recv() => match notification {
                    Some(RelayNotification::Event { relay, event }) => {
                        let id = event.id;
                        let abandoned = tokio::select! {
                            biased;
                            _ = shutdown_requested(&mut shutdown) => true,
                            _ = self.handle_event(&relay, *event) => false,
                        };
                        if abandoned {
                            warn!("Shutdown while handling {}, abandoning handler", id);
                            self.drop_on_shutdown(&relay);
                            break;
                        }
                    }
                    Some(RelayNotification::Eose { relay, .. }) => self.handle_eose(&relay),
                    None => break,
                },
                _ = self.debounce.wait() => {
                    self.debounce.cancel();
                    self.persist();
                }
                _ = sweep.tick(), if !self.seen.is_stopped() => {
                    let removed = self.seen.sweep();
                    if removed > 0 {
                        debug!("Swept {} expired event ids", removed);
                    }
                }
            }
        }

        let mut dropped = 0;
        while let Ok(notification) = notifications.try_recv() {
            if let RelayNotification::Event { relay, .. } = notification {
                self.drop_on_shutdown(&relay);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Dropped {} queued events on shutdown", dropped);
        }

        self.seen.stop();
        self.debounce.cancel();
        self.persist();
        debug!("Dispatcher for {} stopped", self.state_key);
    }

    fn drop_on_shutdown(&self, relay: &str) {
        self.metrics
            .emit(names::EVENT_DROPPED, &[("reason", "shutdown"), ("relay", relay)]);
    }
}

/// Resolves once shutdown is signalled or the bus is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as BusResult;
    use crate::metrics::BusObserver;
    use crate::seen::{SeenConfig, SEEN_SWEEP_INTERVAL};
    use nostr_sdk::{EventBuilder, Keys, Kind, Tag, TagKind, Timestamp};
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingStore {
        writes: SyncMutex<Vec<BusState>>,
        fail: bool,
    }

    impl StateStore for RecordingStore {
        fn read(&self, _key: &str) -> BusResult<Option<BusState>> {
            Ok(self.writes.lock().last().cloned())
        }

        fn write(&self, _key: &str, state: &BusState) -> BusResult<()> {
            if self.fail {
                return Err(BusError::PersistenceFailure("disk full".into()));
            }
            self.writes.lock().push(state.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect {
        messages: SyncMutex<Vec<InboundMessage>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl InboundHandler for Collect {
        async fn on_message(&self, message: InboundMessage, _outbound: &Outbound) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            self.messages.lock().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Contexts(SyncMutex<Vec<String>>);

    impl BusObserver for Contexts {
        fn on_error(&self, _error: &BusError, context: &str) {
            self.0.lock().push(context.to_string());
        }
    }

    const RELAY: &str = "wss://relay.test";

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<RecordingStore>,
        handler: Arc<Collect>,
        contexts: Arc<Contexts>,
        metrics: Arc<Metrics>,
        bot: Keys,
    }

    fn fixture(store: RecordingStore, handler: Collect) -> Fixture {
        let bot = Keys::generate();
        let contexts = Arc::new(Contexts::default());
        let metrics = Arc::new(Metrics::new(contexts.clone()));
        let store = Arc::new(store);
        let handler = Arc::new(handler);
        let groups_by_relay = HashMap::from([(
            RELAY.to_string(),
            HashSet::from(["g".to_string()]),
        )]);
        let dispatcher = Dispatcher {
            own_pubkey: bot.public_key().to_hex(),
            groups_by_relay,
            seen: SeenTracker::new(SeenConfig::default()),
            cursor: Cursor::resume(None, 1_000),
            debounce: Debounce::new(Duration::from_millis(5000)),
            sweep_interval: SEEN_SWEEP_INTERVAL,
            store: store.clone(),
            state_key: "nip29-test".to_string(),
            handler: handler.clone(),
            outbound: Outbound::new(bot.clone(), HashMap::new(), HashMap::new(), metrics.clone()),
            metrics: metrics.clone(),
            cursor_mirror: Arc::new(AtomicU64::new(1_000)),
        };
        Fixture {
            dispatcher,
            store,
            handler,
            contexts,
            metrics,
            bot,
        }
    }

    fn group_event(keys: &Keys, group: Option<&str>, created_at: u64, text: &str) -> Event {
        let mut builder = EventBuilder::new(Kind::Custom(9), text)
            .custom_created_at(Timestamp::from(created_at));
        if let Some(g) = group {
            builder = builder.tag(Tag::custom(TagKind::h(), vec![g.to_string()]));
        }
        builder.sign_with_keys(keys).unwrap()
    }

    #[tokio::test]
    async fn delivers_once_and_advances_cursor() {
        let mut f = fixture(RecordingStore::default(), Collect::default());
        let peer = Keys::generate();
        let event = group_event(&peer, Some("g"), 2_000, "hello");

        assert_eq!(f.dispatcher.handle_event(RELAY, event.clone()).await, Disposition::Delivered);
        assert_eq!(f.dispatcher.handle_event(RELAY, event.clone()).await, Disposition::Duplicate);

        let messages = f.handler.messages.lock();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.group_id, "g");
        assert_eq!(m.relay_url, RELAY);
        assert_eq!(m.sender_pubkey, peer.public_key().to_hex());
        assert_eq!(m.text, "hello");
        assert_eq!(m.kind, 9);
        assert_eq!(m.event_id, event.id.to_hex());
        assert_eq!(m.created_at, 2_000);

        assert_eq!(f.dispatcher.cursor.last_processed_at(), 2_000);
        assert_eq!(f.dispatcher.cursor_mirror.load(Ordering::Relaxed), 2_000);
        assert!(f.dispatcher.debounce.is_pending());
        assert_eq!(f.metrics.snapshot().counter("event.rejected.duplicate"), 1);
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let mut f = fixture(RecordingStore::default(), Collect::default());
        let peer = Keys::generate();
        f.dispatcher
            .handle_event(RELAY, group_event(&peer, Some("g"), 3_000, "new"))
            .await;
        f.dispatcher
            .handle_event(RELAY, group_event(&peer, Some("g"), 2_500, "old"))
            .await;

        let state = f.dispatcher.cursor.to_state();
        assert_eq!(state.last_processed_at, 3_000);
        assert_eq!(state.recent_event_ids.len(), 2);
    }

    #[tokio::test]
    async fn self_echo_and_foreign_groups_are_dropped() {
        let mut f = fixture(RecordingStore::default(), Collect::default());
        let bot = f.bot.clone();
        let peer = Keys::generate();

        let own = group_event(&bot, Some("g"), 2_000, "me");
        assert_eq!(f.dispatcher.handle_event(RELAY, own).await, Disposition::SelfEcho);

        let other_group = group_event(&peer, Some("elsewhere"), 2_000, "x");
        assert_eq!(
            f.dispatcher.handle_event(RELAY, other_group).await,
            Disposition::ForeignGroup
        );

        let untagged = group_event(&peer, None, 2_000, "x");
        assert_eq!(f.dispatcher.handle_event(RELAY, untagged).await, Disposition::ForeignGroup);

        // Group "g" is only subscribed on RELAY
        let wrong_relay = group_event(&peer, Some("g"), 2_000, "x");
        assert_eq!(
            f.dispatcher.handle_event("wss://other", wrong_relay).await,
            Disposition::ForeignGroup
        );

        assert!(f.handler.messages.lock().is_empty());
        assert_eq!(f.dispatcher.cursor.last_processed_at(), 1_000);
        let snap = f.metrics.snapshot();
        assert_eq!(snap.counter("event.rejected.self"), 1);
        assert_eq!(snap.counter("event.rejected.group"), 3);
    }

    #[tokio::test]
    async fn handler_error_is_reported_and_cursor_stays() {
        let mut f = fixture(
            RecordingStore::default(),
            Collect {
                fail: true,
                ..Default::default()
            },
        );
        let peer = Keys::generate();
        let event = group_event(&peer, Some("g"), 5_000, "boom");

        assert_eq!(f.dispatcher.handle_event(RELAY, event).await, Disposition::Failed);
        assert_eq!(f.dispatcher.cursor.last_processed_at(), 1_000);
        assert!(!f.dispatcher.debounce.is_pending());
        assert_eq!(f.contexts.0.lock().as_slice(), ["dispatch"]);
    }

    #[tokio::test]
    async fn persist_failure_is_reported_not_fatal() {
        let mut f = fixture(
            RecordingStore {
                fail: true,
                ..Default::default()
            },
            Collect::default(),
        );
        let peer = Keys::generate();
        f.dispatcher
            .handle_event(RELAY, group_event(&peer, Some("g"), 2_000, "a"))
            .await;
        f.dispatcher.persist();
        f.dispatcher
            .handle_event(RELAY, group_event(&peer, Some("g"), 2_100, "b"))
            .await;

        assert_eq!(f.dispatcher.cursor.last_processed_at(), 2_100);
        assert_eq!(f.contexts.0.lock().as_slice(), ["persist"]);
        assert_eq!(f.metrics.snapshot().counter("state.persist.failure"), 1);
    }

    #[test]
    fn cursor_window_is_capped_fifo() {
        let mut cursor = Cursor::resume(None, 10);
        for i in 0..MAX_PERSISTED_EVENT_IDS + 3 {
            cursor.advance(10, format!("id{i}"));
        }
        let state = cursor.to_state();
        assert_eq!(state.recent_event_ids.len(), MAX_PERSISTED_EVENT_IDS);
        assert_eq!(state.recent_event_ids[0], "id3");
        assert_eq!(
            state.recent_event_ids.last().map(String::as_str),
            Some(format!("id{}", MAX_PERSISTED_EVENT_IDS + 2).as_str())
        );
    }

    #[test]
    fn cursor_resumes_from_prior_state() {
        let prior = BusState {
            last_processed_at: 500,
            gateway_started_at: 1,
            recent_event_ids: vec!["a".into(), "b".into()],
        };
        let state = Cursor::resume(Some(&prior), 900).to_state();
        assert_eq!(state.last_processed_at, 500);
        assert_eq!(state.gateway_started_at, 900);
        assert_eq!(state.recent_event_ids, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_coalesces_into_one_write() {
        let f = fixture(RecordingStore::default(), Collect::default());
        let store = f.store.clone();
        let peer = Keys::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.dispatcher.run(rx, shutdown_rx));

        let mut last_id = String::new();
        for i in 0..5u64 {
            let event = group_event(&peer, Some("g"), 2_000 + i, "burst");
            last_id = event.id.to_hex();
            tx.send(RelayNotification::Event {
                relay: RELAY.to_string(),
                event: Box::new(event),
            })
            .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        // Last event arrived ~0.8 s in; the window closes 5 s after it
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(store.writes.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        {
            let writes = store.writes.lock();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].last_processed_at, 2_004);
            assert_eq!(writes[0].recent_event_ids.len(), 5);
            assert_eq!(writes[0].recent_event_ids.last(), Some(&last_id));
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        // Final flush on shutdown
        assert_eq!(store.writes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_write_and_stops() {
        let f = fixture(RecordingStore::default(), Collect::default());
        let store = f.store.clone();
        let peer = Keys::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.dispatcher.run(rx, shutdown_rx));

        tx.send(RelayNotification::Event {
            relay: RELAY.to_string(),
            event: Box::new(group_event(&peer, Some("g"), 7_000, "pending")),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.writes.lock().is_empty());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let writes = store.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].last_processed_at, 7_000);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_slow_handler_and_still_flushes() {
        let f = fixture(
            RecordingStore::default(),
            Collect {
                delay: Some(Duration::from_secs(600)),
                ..Default::default()
            },
        );
        let store = f.store.clone();
        let handler = f.handler.clone();
        let metrics = f.metrics.clone();
        let peer = Keys::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.dispatcher.run(rx, shutdown_rx));

        tx.send(RelayNotification::Event {
            relay: RELAY.to_string(),
            event: Box::new(group_event(&peer, Some("g"), 9_000, "slow")),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher should stop without waiting for the handler")
            .unwrap();

        assert!(handler.messages.lock().is_empty());
        let writes = store.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].last_processed_at, 1_000);
        assert!(writes[0].recent_event_ids.is_empty());
        assert_eq!(metrics.snapshot().counter("event.dropped.shutdown"), 1);
    }

    #[tokio::test]
    async fn queued_events_are_counted_when_shutdown_wins() {
        let f = fixture(RecordingStore::default(), Collect::default());
        let handler = f.handler.clone();
        let metrics = f.metrics.clone();
        let peer = Keys::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..3u64 {
            tx.send(RelayNotification::Event {
                relay: RELAY.to_string(),
                event: Box::new(group_event(&peer, Some("g"), 2_000 + i, "queued")),
            })
            .unwrap();
        }
        tx.send(RelayNotification::Eose {
            relay: RELAY.to_string(),
            subscription_id: "s".to_string(),
        })
        .unwrap();
        shutdown_tx.send(true).unwrap();
        f.dispatcher.run(rx, shutdown_rx).await;

        assert!(handler.messages.lock().is_empty());
        let snap = metrics.snapshot();
        assert_eq!(snap.counter("event.dropped.shutdown"), 3);
        assert_eq!(snap.counter("relay.eose"), 0);
    }

    #[tokio::test]
    async fn eose_reaches_observer() {
        #[derive(Default)]
        struct Eose(SyncMutex<Vec<String>>);
        impl BusObserver for Eose {
            fn on_eose(&self, relay: &str) {
                self.0.lock().push(relay.to_string());
            }
        }

        let mut f = fixture(RecordingStore::default(), Collect::default());
        let observer = Arc::new(Eose::default());
        f.dispatcher.metrics = Arc::new(Metrics::new(observer.clone()));
        let metrics = f.dispatcher.metrics.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(RelayNotification::Eose {
            relay: RELAY.to_string(),
            subscription_id: "s".to_string(),
        })
        .unwrap();
        drop(tx);
        f.dispatcher.run(rx, shutdown_rx).await;

        assert_eq!(observer.0.lock().as_slice(), [RELAY]);
        assert_eq!(metrics.snapshot().counter("relay.eose"), 1);
    }
}
