//! Webhook-backed host: inbound group messages are POSTed to an agent
//! endpoint, and any replies it returns are published back to the group.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nip29_bus::{Host, InboundMessage, Route};
use parking_lot::Mutex as SyncMutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

use crate::config::WebhookConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub r#type: &'static str,
    pub agent_id: &'a str,
    pub session_key: &'a str,
    #[serde(flatten)]
    pub message: &'a InboundMessage,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    replies: Vec<String>,
}

/// Last activity seen on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub group_id: String,
    pub last_sender: String,
    pub last_event_id: String,
    pub updated_at: u64,
}

pub struct WebhookHost {
    client: Client,
    url: String,
    token: Option<String>,
    agent_id: String,
    retry_delay: Duration,
    sessions: SyncMutex<HashMap<String, SessionMeta>>,
}

impl WebhookHost {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
            agent_id: config.agent_id.clone(),
            retry_delay: BASE_RETRY_DELAY,
            sessions: SyncMutex::new(HashMap::new()),
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn session(&self, session_key: &str) -> Option<SessionMeta> {
        self.sessions.lock().get(session_key).cloned()
    }

    async fn deliver_payload(&self, payload: &WebhookPayload<'_>) -> Result<String> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Webhook delivery attempt {} to {}", attempt, self.url);

            let mut request = self.client.post(&self.url).json(payload);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        debug!("Webhook delivered to {} (attempt {})", self.url, attempt);
                        return Ok(body);
                    } else if status.is_client_error() {
                        // 4xx errors - don't retry
                        error!("Webhook delivery failed with client error {}: {}", status, body);
                        return Err(anyhow!(
                            "Webhook delivery failed with status {}: {}",
                            status,
                            body
                        ));
                    }

                    warn!(
                        "Webhook delivery failed with server error {} (attempt {}): {}",
                        status, attempt, body
                    );
                    if attempt >= MAX_RETRIES {
                        return Err(anyhow!(
                            "Webhook delivery failed after {} attempts, last status: {}",
                            MAX_RETRIES,
                            status
                        ));
                    }
                }
                Err(e) => {
                    warn!("Webhook request error (attempt {}): {}", attempt, e);
                    if attempt >= MAX_RETRIES {
                        return Err(anyhow!(
                            "Webhook delivery failed after {} attempts: {}",
                            MAX_RETRIES,
                            e
                        ));
                    }
                }
            }

            let delay = self.retry_delay * attempt;
            debug!("Retrying webhook in {:?}", delay);
            sleep(delay).await;
        }
    }
}

/// Replies from a webhook response body. Empty or non-JSON bodies mean no
/// reply.
fn parse_replies(body: &str) -> Vec<String> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<WebhookResponse>(body) {
        Ok(response) => response.replies,
        Err(e) => {
            debug!("Ignoring non-reply webhook body: {}", e);
            Vec::new()
        }
    }
}

#[async_trait]
impl Host for WebhookHost {
    async fn resolve_route(&self, account_id: &str, group_id: &str) -> Result<Route> {
        Ok(Route {
            agent_id: self.agent_id.clone(),
            session_key: format!("nip29:{account_id}:{group_id}"),
        })
    }

    async fn record_session(&self, route: &Route, message: &InboundMessage) -> Result<()> {
        self.sessions.lock().insert(
            route.session_key.clone(),
            SessionMeta {
                group_id: message.group_id.clone(),
                last_sender: message.sender_pubkey.clone(),
                last_event_id: message.event_id.clone(),
                updated_at: message.created_at,
            },
        );
        Ok(())
    }

    async fn dispatch_inbound(&self, route: &Route, message: &InboundMessage) -> Result<Vec<String>> {
        let payload = WebhookPayload {
            r#type: "group_message",
            agent_id: &route.agent_id,
            session_key: &route.session_key,
            message,
        };
        let body = self
            .deliver_payload(&payload)
            .await
            .with_context(|| format!("Failed to deliver event {}", message.event_id))?;
        Ok(parse_replies(&body))
    }
}
