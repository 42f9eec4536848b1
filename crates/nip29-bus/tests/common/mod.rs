//! In-process mock relay and recording test doubles.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nip29_bus::{BusError, BusObserver, InboundHandler, InboundMessage, MetricEvent, Outbound};
use nostr_sdk::{Event, EventBuilder, Keys, Kind, Tag, TagKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct MockRelayOptions {
    /// Send `["AUTH", challenge]` as the first frame after the handshake
    pub challenge_on_connect: Option<String>,
    /// Answer AUTH events with OK true
    pub accept_auth: bool,
    /// Send any OK at all for AUTH events
    pub answer_auth: bool,
    /// Answer every REQ with `["CLOSED", sub, reason]`
    pub close_subscriptions: Option<String>,
}

impl Default for MockRelayOptions {
    fn default() -> Self {
        Self {
            challenge_on_connect: Some("challenge-1".to_string()),
            accept_auth: true,
            answer_auth: true,
            close_subscriptions: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    connections: AtomicUsize,
    stored: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    auth_events: Mutex<Vec<Event>>,
    reqs: Mutex<Vec<(String, Value)>>,
    closes: Mutex<Vec<String>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    /// (client channel, subscription id)
    subscribers: Mutex<Vec<(mpsc::UnboundedSender<String>, String)>>,
}

#[derive(Clone)]
pub struct MockRelay {
    pub url: String,
    state: Arc<MockState>,
}

impl MockRelay {
    pub async fn start(options: MockRelayOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        serve_client(ws, state, options).await;
                    }
                });
            }
        });

        Self { url, state }
    }

    /// Events replayed to every new subscription before EOSE.
    pub fn store(&self, event: Event) {
        self.state.stored.lock().push(event);
    }

    /// Push an event to every live subscription.
    pub fn broadcast(&self, event: &Event) {
        broadcast(&self.state, event);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Event> {
        self.state.published.lock().clone()
    }

    pub fn auth_events(&self) -> Vec<Event> {
        self.state.auth_events.lock().clone()
    }

    pub fn reqs(&self) -> Vec<(String, Value)> {
        self.state.reqs.lock().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state.closes.lock().clone()
    }

    /// Send `["AUTH", challenge]` to every connected client.
    pub fn challenge(&self, challenge: &str) {
        for client in self.state.clients.lock().iter() {
            let _ = client.send(json!(["AUTH", challenge]).to_string());
        }
    }
}

fn broadcast(state: &MockState, event: &Event) {
    for (client, sub) in state.subscribers.lock().iter() {
        let _ = client.send(json!(["EVENT", sub, event]).to_string());
    }
}

async fn serve_client(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<MockState>,
    options: MockRelayOptions,
) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    state.clients.lock().push(tx.clone());
    if let Some(challenge) = &options.challenge_on_connect {
        let _ = tx.send(json!(["AUTH", challenge]).to_string());
    }

    while let Some(Ok(frame)) = read.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match arr.first().and_then(Value::as_str) {
            Some("AUTH") => {
                let Ok(event) = serde_json::from_value::<Event>(arr[1].clone()) else {
                    continue;
                };
                let accepted = options.accept_auth;
                let message = if accepted { "" } else { "auth-required: not a member" };
                state.auth_events.lock().push(event.clone());
                if !options.answer_auth {
                    continue;
                }
                let _ = tx.send(json!(["OK", event.id.to_hex(), accepted, message]).to_string());
            }
            Some("REQ") => {
                let sub = arr[1].as_str().unwrap_or_default().to_string();
                state.reqs.lock().push((sub.clone(), arr[2].clone()));
                if let Some(reason) = &options.close_subscriptions {
                    let _ = tx.send(json!(["CLOSED", sub, reason]).to_string());
                    continue;
                }
                for event in state.stored.lock().iter() {
                    let _ = tx.send(json!(["EVENT", sub, event]).to_string());
                }
                let _ = tx.send(json!(["EOSE", sub]).to_string());
                state.subscribers.lock().push((tx.clone(), sub));
            }
            Some("EVENT") => {
                let Ok(event) = serde_json::from_value::<Event>(arr[1].clone()) else {
                    continue;
                };
                state.published.lock().push(event.clone());
                let _ = tx.send(json!(["OK", event.id.to_hex(), true, ""]).to_string());
                broadcast(&state, &event);
            }
            Some("CLOSE") => {
                let sub = arr[1].as_str().unwrap_or_default().to_string();
                state.closes.lock().push(sub);
            }
            _ => {}
        }
    }
}

/// A relay address that accepts TCP but never completes the websocket
/// handshake. Accepted sockets stay open for the life of the listener task.
pub async fn stalled_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    url
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn group_event(keys: &Keys, group: &str, text: &str, extra_tags: Vec<Tag>) -> Event {
    EventBuilder::new(Kind::Custom(9), text)
        .tag(Tag::custom(TagKind::h(), vec![group.to_string()]))
        .tags(extra_tags)
        .sign_with_keys(keys)
        .unwrap()
}

#[derive(Default)]
pub struct Collector {
    pub messages: Mutex<Vec<InboundMessage>>,
}

impl Collector {
    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl InboundHandler for Collector {
    async fn on_message(&self, message: InboundMessage, _outbound: &Outbound) -> anyhow::Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct Recorder {
    pub errors: Mutex<Vec<(BusError, String)>>,
    pub metrics: Mutex<Vec<MetricEvent>>,
    pub eose: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn contexts(&self) -> Vec<String> {
        self.errors.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn metric_count(&self, name: &str) -> usize {
        self.metrics.lock().iter().filter(|m| m.name == name).count()
    }
}

impl BusObserver for Recorder {
    fn on_eose(&self, relay: &str) {
        self.eose.lock().push(relay.to_string());
    }

    fn on_error(&self, error: &BusError, context: &str) {
        self.errors.lock().push((error.clone(), context.to_string()));
    }

    fn on_metric(&self, event: &MetricEvent) {
        self.metrics.lock().push(event.clone());
    }
}
