//! One websocket connection to one relay, with NIP-42 AUTH.
//!
//! A socket task exclusively owns the websocket halves. Callers talk to it
//! through a command channel; connection state is published on a `watch`
//! channel. AUTH challenges are answered by the socket task as soon as they
//! are read, so a challenge sent during the handshake is handled before any
//! caller gets to wait for it.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nostr_sdk::{Event, Keys};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::metrics::{names, Metrics};
use crate::protocol::{self, RelayMessage};

/// Bounded wait for the AUTH handshake after connecting.
pub const AUTH_WAIT: Duration = Duration::from_millis(2000);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unauthenticated,
    ChallengeReceived,
    Authenticating,
    Authenticated,
    Closed,
}

impl ConnectionState {
    /// The websocket is open, whatever the AUTH outcome.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::Unauthenticated
                | Self::ChallengeReceived
                | Self::Authenticating
                | Self::Authenticated
        )
    }

    /// The AUTH handshake has an outcome (or can no longer have one).
    fn auth_settled(self) -> bool {
        matches!(
            self,
            Self::Authenticated | Self::Unauthenticated | Self::Closed | Self::Disconnected
        )
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            auth_timeout: AUTH_WAIT,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }
}

/// What a socket task hands to the dispatch loop.
#[derive(Debug)]
pub enum RelayNotification {
    Event { relay: String, event: Box<Event> },
    Eose { relay: String, subscription_id: String },
}

enum Command {
    Send(String),
    Publish {
        event: Box<Event>,
        ack: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// State shared with the socket task. Holds no command sender, so dropping
/// every `RelayConnection` ends the task.
struct Shared {
    url: String,
    keys: Keys,
    config: RelayConfig,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConnectionState>,
    challenge: SyncMutex<Option<String>>,
    subscriptions: SyncMutex<BTreeSet<String>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.url, previous, state);
        }
    }
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
    session: Arc<SyncMutex<Option<Session>>>,
}

impl RelayConnection {
    pub fn new(url: &str, keys: Keys, config: RelayConfig, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url: url.to_string(),
                keys,
                config,
                metrics,
                state,
                challenge: SyncMutex::new(None),
                subscriptions: SyncMutex::new(BTreeSet::new()),
            }),
            session: Arc::new(SyncMutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    /// Most recent challenge issued by the relay.
    pub fn challenge(&self) -> Option<String> {
        self.shared.challenge.lock().clone()
    }

    /// Open the websocket and start the socket task. Any previous session is
    /// shut down first. Events and EOSE are delivered on `notify`.
    pub async fn connect(&self, notify: mpsc::UnboundedSender<RelayNotification>) -> Result<()> {
        self.shutdown_session().await;

        let url = self.shared.url.clone();
        *self.shared.challenge.lock() = None;
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {}...", url);

        let ws = match tokio::time::timeout(self.shared.config.connect_timeout, connect_async(url.as_str()))
            .await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => return Err(self.connect_failed("connect timed out".to_string())),
        };

        self.shared.set_state(ConnectionState::Connected);
        info!("Connected to '{}'", url);
        let metrics = &self.shared.metrics;
        metrics.relay_success(&url);
        metrics.emit(names::RELAY_CONNECT, &[("relay", &url)]);
        metrics.observer().on_connect(&url);

        let (write, read) = ws.split();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = SocketTask {
            shared: self.shared.clone(),
            write,
            notify,
            pending: HashMap::new(),
            auth_event_id: None,
        };
        let handle = tokio::spawn(task.run(read, command_rx));

        *self.session.lock() = Some(Session {
            commands,
            task: handle,
        });
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> BusError {
        let url = &self.shared.url;
        warn!("Failed to connect to {}: {}", url, reason);
        self.shared.set_state(ConnectionState::Closed);
        let err = BusError::ConnectFailure {
            relay: url.clone(),
            reason,
        };
        self.shared.metrics.relay_failure(url);
        self.shared.metrics.error(&err, "connect");
        err
    }

    /// Wait, bounded, for the AUTH handshake to settle.
    ///
    /// Returns immediately when a challenge was already answered. When no
    /// challenge arrives in time the connection degrades to
    /// `Unauthenticated`; this is reported but not fatal. A handshake still
    /// awaiting the relay's OK is left `Authenticating` and not reported.
    pub async fn await_auth(&self) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let settled = match tokio::time::timeout(
            self.shared.config.auth_timeout,
            rx.wait_for(|s| s.auth_settled()),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        if let Some(state) = settled {
            return state;
        }

        // Only a connection that never saw a challenge degrades here; an
        // in-flight handshake may still complete later.
        let degraded = self.shared.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Unauthenticated;
                true
            } else {
                false
            }
        });

        let url = &self.shared.url;
        if !degraded {
            debug!("AUTH still pending on {}, not waiting further", url);
            return self.state();
        }
        warn!("AUTH timeout on {}, proceeding without auth", url);
        let metrics = &self.shared.metrics;
        metrics.emit(names::RELAY_AUTH_TIMEOUT, &[("relay", url)]);
        metrics.error(&BusError::AuthTimeout { relay: url.clone() }, "auth");
        self.state()
    }

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        if !self.is_established() {
            return Err(BusError::NotConnected(self.shared.url.clone()));
        }
        self.session
            .lock()
            .as_ref()
            .map(|s| s.commands.clone())
            .ok_or_else(|| BusError::NotConnected(self.shared.url.clone()))
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.commands()?
            .send(command)
            .map_err(|_| BusError::NotConnected(self.shared.url.clone()))
    }

    /// Open (or replace) a subscription.
    pub fn subscribe(&self, subscription_id: &str, filter: &Value) -> Result<()> {
        self.send_command(Command::Send(protocol::req_message(subscription_id, filter)))?;
        self.shared
            .subscriptions
            .lock()
            .insert(subscription_id.to_string());
        info!("Subscribed '{}' on {}", subscription_id, self.shared.url);
        Ok(())
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.shared.subscriptions.lock().remove(subscription_id);
        self.send_command(Command::Send(protocol::close_message(subscription_id)))
    }

    /// Send an event and wait for the relay's OK.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.send_command(Command::Publish {
            event: Box::new(event.clone()),
            ack,
        })?;

        let relay = self.shared.url.clone();
        match tokio::time::timeout(self.shared.config.publish_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ConnectionLost {
                relay,
                reason: "connection closed before OK".to_string(),
            }),
            Err(_) => Err(BusError::PublishTimeout { relay }),
        }
    }

    /// Close all subscriptions and the socket. Safe to call repeatedly.
    pub async fn close(&self) {
        let subscriptions: Vec<String> =
            std::mem::take(&mut *self.shared.subscriptions.lock()).into_iter().collect();
        if let Ok(commands) = self.commands() {
            for id in subscriptions {
                let _ = commands.send(Command::Send(protocol::close_message(&id)));
            }
        }
        self.shutdown_session().await;
        self.shared.set_state(ConnectionState::Closed);
    }

    async fn shutdown_session(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let Session { commands, mut task } = session;
        let _ = commands.send(Command::Close);
        drop(commands);
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            debug!("Socket task for {} did not stop in time, aborting", self.shared.url);
            task.abort();
        }
    }
}

enum Exit {
    Local,
    Lost(String),
}

struct SocketTask {
    shared: Arc<Shared>,
    write: WsSink,
    notify: mpsc::UnboundedSender<RelayNotification>,
    pending: HashMap<String, oneshot::Sender<Result<()>>>,
    auth_event_id: Option<String>,
}

impl SocketTask {
    async fn run(mut self, mut read: WsSource, mut commands: mpsc::UnboundedReceiver<Command>) {
        let exit = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = self.write.send(WsMessage::Text(text.into())).await {
                            break Exit::Lost(e.to_string());
                        }
                    }
                    Some(Command::Publish { event, ack }) => {
                        let id = event.id.to_hex();
                        let frame = protocol::event_message(&event);
                        if let Err(e) = self.write.send(WsMessage::Text(frame.into())).await {
                            let _ = ack.send(Err(BusError::ConnectionLost {
                                relay: self.shared.url.clone(),
                                reason: e.to_string(),
                            }));
                            break Exit::Lost(e.to_string());
                        }
                        self.pending.insert(id, ack);
                    }
                    Some(Command::Close) | None => {
                        let _ = self.write.close().await;
                        break Exit::Local;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(t))) => {
                        if let Err(e) = self.handle_text(&t).await {
                            break Exit::Lost(e.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Ping(d))) => {
                        self.write.send(WsMessage::Pong(d)).await.ok();
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Relay {} sent close frame", self.shared.url);
                        break Exit::Lost("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Lost(e.to_string()),
                    None => break Exit::Lost("stream ended".to_string()),
                },
            }
        };

        self.finish(exit);
    }

    fn finish(self, exit: Exit) {
        let url = &self.shared.url;
        self.shared.set_state(ConnectionState::Closed);
        let metrics = &self.shared.metrics;
        if let Exit::Lost(reason) = exit {
            warn!("Connection to {} lost: {}", url, reason);
            metrics.relay_failure(url);
            metrics.error(
                &BusError::ConnectionLost {
                    relay: url.clone(),
                    reason,
                },
                "connection",
            );
        }
        metrics.emit(names::RELAY_DISCONNECT, &[("relay", url)]);
        metrics.observer().on_disconnect(url);
        // Dropping `pending` fails any publish still waiting for OK
    }

    async fn handle_text(&mut self, text: &str) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
        let Some(message) = RelayMessage::parse(text) else {
            debug!("Ignoring relay frame from {}: {}", self.shared.url, text);
            return Ok(());
        };

        match message {
            RelayMessage::Auth { challenge } => self.answer_challenge(challenge).await?,
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.handle_ok(event_id, accepted, message),
            RelayMessage::Event { event, .. } => {
                self.forward(RelayNotification::Event {
                    relay: self.shared.url.clone(),
                    event,
                });
            }
            RelayMessage::Eose { subscription_id } => {
                info!("End of stored events for sub '{}'", subscription_id);
                self.forward(RelayNotification::Eose {
                    relay: self.shared.url.clone(),
                    subscription_id,
                });
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Subscription '{}' closed by {}: {}",
                    subscription_id, self.shared.url, message
                );
                self.shared.subscriptions.lock().remove(&subscription_id);
                self.shared.metrics.error(
                    &BusError::SubscriptionClosed {
                        relay: self.shared.url.clone(),
                        reason: message,
                    },
                    "subscription",
                );
            }
            RelayMessage::Notice { message } => {
                warn!("Relay notice from {}: {}", self.shared.url, message);
            }
        }
        Ok(())
    }

    async fn answer_challenge(
        &mut self,
        challenge: String,
    ) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
        debug!("AUTH challenge from {}: {}", self.shared.url, challenge);
        *self.shared.challenge.lock() = Some(challenge.clone());
        self.shared.set_state(ConnectionState::ChallengeReceived);

        let event = match protocol::build_auth_event(&self.shared.keys, &self.shared.url, &challenge)
        {
            Ok(event) => event,
            Err(e) => {
                self.shared.set_state(ConnectionState::Unauthenticated);
                self.shared.metrics.emit(
                    names::RELAY_AUTH_FAILURE,
                    &[("relay", &self.shared.url)],
                );
                self.shared.metrics.error(&e, "auth");
                return Ok(());
            }
        };

        self.auth_event_id = Some(event.id.to_hex());
        self.write
            .send(WsMessage::Text(protocol::auth_message(&event).into()))
            .await?;
        self.shared.set_state(ConnectionState::Authenticating);
        info!("Sent AUTH response to {}", self.shared.url);
        Ok(())
    }

    fn handle_ok(&mut self, event_id: String, accepted: bool, message: String) {
        let url = self.shared.url.clone();
        if self.auth_event_id.as_deref() == Some(event_id.as_str()) {
            self.auth_event_id = None;
            let metrics = &self.shared.metrics;
            if accepted {
                self.shared.set_state(ConnectionState::Authenticated);
                info!("Authenticated to relay {}", url);
                metrics.emit(names::RELAY_AUTH_SUCCESS, &[("relay", &url)]);
            } else {
                self.shared.set_state(ConnectionState::Unauthenticated);
                warn!("AUTH rejected by {}: {}", url, message);
                metrics.emit(names::RELAY_AUTH_FAILURE, &[("relay", &url)]);
                metrics.error(
                    &BusError::AuthFailure {
                        relay: url,
                        reason: message,
                    },
                    "auth",
                );
            }
            return;
        }

        if let Some(ack) = self.pending.remove(&event_id) {
            let result = if accepted {
                Ok(())
            } else {
                Err(BusError::PublishRejected {
                    relay: url,
                    reason: message,
                })
            };
            let _ = ack.send(result);
        } else {
            debug!("Unmatched OK for {} from {}", event_id, url);
        }
    }

    fn forward(&self, notification: RelayNotification) {
        if self.notify.send(notification).is_err() {
            debug!("Dispatch loop gone, dropping notification from {}", self.shared.url);
        }
    }
}
