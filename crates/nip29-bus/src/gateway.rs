//! Account gateway: mention gating and sender allowlist in front of a host
//! pipeline that routes messages to an agent and returns its replies.
//!
//! The host is passed in explicitly as an `Arc<dyn Host>`; nothing is read
//! from process-wide state.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusConfig, Nip29Bus, Outbound};
use crate::dispatch::{InboundHandler, InboundMessage};
use crate::error::Result;
use crate::keys::derive_identity;
use crate::mention::check_mention;
use crate::metrics::{names, BusObserver};
use crate::state::StateStore;

/// Per-account gating settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub account_id: String,
    /// Bot display name, matched case-insensitively for mentions
    pub name: Option<String>,
    /// Default for groups without their own `mention_only`
    pub require_mention: bool,
    /// Hex pubkeys allowed to address the bot; `"*"` allows everyone
    pub allow_from: Vec<String>,
}

impl AccountSettings {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            name: None,
            require_mention: true,
            allow_from: vec!["*".to_string()],
        }
    }

    pub fn allows(&self, sender_pubkey: &str) -> bool {
        self.allow_from
            .iter()
            .any(|entry| entry == "*" || entry == sender_pubkey)
    }
}

/// Where the host routes a group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub agent_id: String,
    pub session_key: String,
}

/// The host pipeline the gateway drives.
#[async_trait]
pub trait Host: Send + Sync {
    async fn resolve_route(&self, account_id: &str, group_id: &str) -> anyhow::Result<Route>;

    async fn record_session(&self, route: &Route, message: &InboundMessage) -> anyhow::Result<()>;

    /// Hand the message to the agent; returns reply texts in order.
    async fn dispatch_inbound(
        &self,
        route: &Route,
        message: &InboundMessage,
    ) -> anyhow::Result<Vec<String>>;
}

/// Inbound handler applying the account's gating rules before the host.
pub struct GroupGate {
    settings: AccountSettings,
    bot_pubkey: String,
    mention_only: HashMap<String, Option<bool>>,
    host: Arc<dyn Host>,
}

impl GroupGate {
    pub fn new(
        settings: AccountSettings,
        bot_pubkey: impl Into<String>,
        mention_only: HashMap<String, Option<bool>>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            settings,
            bot_pubkey: bot_pubkey.into(),
            mention_only,
            host,
        }
    }

    fn requires_mention(&self, group_id: &str) -> bool {
        self.mention_only
            .get(group_id)
            .copied()
            .flatten()
            .unwrap_or(self.settings.require_mention)
    }
}

#[async_trait]
impl InboundHandler for GroupGate {
    async fn on_message(&self, message: InboundMessage, outbound: &Outbound) -> anyhow::Result<()> {
        let aid = &self.settings.account_id;
        let group_id = message.group_id.clone();

        if self.requires_mention(&group_id) {
            let result = check_mention(
                &message.tags,
                &message.text,
                &self.bot_pubkey,
                self.settings.name.as_deref(),
            );
            debug!(
                "[{}] Mention check group={}: p_tag={} text={} name={}",
                aid,
                group_id,
                result.p_tag,
                result.text_hex || result.text_bech32,
                result.name
            );
            if !result.mentioned {
                outbound.metrics().emit(
                    names::EVENT_REJECTED,
                    &[("reason", "mention"), ("relay", &message.relay_url)],
                );
                return Ok(());
            }
        }

        let short = message
            .sender_pubkey
            .get(..8)
            .unwrap_or(&message.sender_pubkey);
        if !self.settings.allows(&message.sender_pubkey) {
            debug!("[{}] Sender {} not in allow_from", aid, short);
            outbound.metrics().emit(
                names::EVENT_REJECTED,
                &[("reason", "allowlist"), ("relay", &message.relay_url)],
            );
            return Ok(());
        }

        info!("[{}] Inbound from {} in group {}", aid, short, group_id);

        let route = self
            .host
            .resolve_route(aid, &group_id)
            .await
            .with_context(|| format!("Failed to resolve route for group {group_id}"))?;
        debug!(
            "[{}] Resolved route: agent={} session={}",
            aid, route.agent_id, route.session_key
        );

        if let Err(e) = self.host.record_session(&route, &message).await {
            warn!("[{}] Failed updating session meta: {:#}", aid, e);
        }

        let replies = self
            .host
            .dispatch_inbound(&route, &message)
            .await
            .with_context(|| format!("Reply dispatch failed for session {}", route.session_key))?;

        for reply in replies.iter().filter(|r| !r.trim().is_empty()) {
            debug!(
                "[{}] Delivering reply to group={} ({} chars)",
                aid,
                group_id,
                reply.len()
            );
            if let Err(e) = outbound.send_group_message(&group_id, reply).await {
                warn!("[{}] Reply delivery to {} failed: {}", aid, group_id, e);
            }
        }
        Ok(())
    }
}

/// One running account: a bus wired to a [`GroupGate`].
pub struct Gateway {
    settings: AccountSettings,
    bus: Arc<Nip29Bus>,
}

impl Gateway {
    pub async fn start(
        settings: AccountSettings,
        mut config: BusConfig,
        store: Arc<dyn StateStore>,
        host: Arc<dyn Host>,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let identity = derive_identity(&config.secret_key)?;
        info!(
            "[{}] Starting NIP-29 gateway (pubkey: {})",
            settings.account_id, identity.public_key
        );
        if config.groups.is_empty() {
            warn!("[{}] No groups configured, gateway will idle", settings.account_id);
        }

        config.account_id = Some(settings.account_id.clone());
        let mention_only = config
            .groups
            .iter()
            .map(|g| (g.group_id.clone(), g.mention_only))
            .collect();
        let gate = GroupGate::new(
            settings.clone(),
            identity.public_key,
            mention_only,
            host,
        );

        let bus = Nip29Bus::start(config, store, Arc::new(gate), observer).await?;
        info!(
            "[{}] NIP-29 gateway started on {}",
            settings.account_id,
            bus.relay_urls().join(", ")
        );
        Ok(Self {
            settings,
            bus: Arc::new(bus),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.settings.account_id
    }

    pub fn bus(&self) -> &Arc<Nip29Bus> {
        &self.bus
    }

    /// Run until `token` is cancelled, then close the bus.
    pub async fn run_until_cancelled(&self, token: CancellationToken) {
        token.cancelled().await;
        self.bus.close().await;
        info!("[{}] NIP-29 gateway stopped", self.settings.account_id);
    }
}
