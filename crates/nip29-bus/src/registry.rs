//! Running buses indexed by account.

use futures_util::future::join_all;
use nostr_sdk::Event;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::Nip29Bus;
use crate::error::{BusError, Result};
use crate::metrics::MetricsSnapshot;

const GROUP_TARGET_PREFIX: &str = "group:";

/// Parse a `group:<id>` outbound target.
pub fn parse_group_target(target: &str) -> Result<&str> {
    match target.trim().strip_prefix(GROUP_TARGET_PREFIX) {
        Some(group) if !group.is_empty() => Ok(group),
        _ => Err(BusError::InvalidTarget(target.to_string())),
    }
}

#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<HashMap<String, Arc<Nip29Bus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bus, returning any bus previously held for the account.
    pub async fn insert(&self, account_id: &str, bus: Arc<Nip29Bus>) -> Option<Arc<Nip29Bus>> {
        self.buses.write().await.insert(account_id.to_string(), bus)
    }

    pub async fn remove(&self, account_id: &str) -> Option<Arc<Nip29Bus>> {
        self.buses.write().await.remove(account_id)
    }

    pub async fn get(&self, account_id: &str) -> Option<Arc<Nip29Bus>> {
        self.buses.read().await.get(account_id).cloned()
    }

    pub async fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buses.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send `text` to a `group:<id>` target through the account's bus.
    pub async fn send_text(&self, account_id: &str, target: &str, text: &str) -> Result<Event> {
        let group_id = parse_group_target(target)?;
        let bus = self
            .get(account_id)
            .await
            .ok_or_else(|| BusError::AccountNotRunning(account_id.to_string()))?;
        info!("[{}] Publishing kind 9 to group={}", account_id, group_id);
        bus.send_group_message(group_id, text).await
    }

    pub async fn metrics(&self, account_id: &str) -> Option<MetricsSnapshot> {
        self.get(account_id).await.map(|bus| bus.metrics())
    }

    /// Close and drop every registered bus.
    pub async fn close_all(&self) {
        let buses: Vec<Arc<Nip29Bus>> = self.buses.write().await.drain().map(|(_, b)| b).collect();
        join_all(buses.iter().map(|bus| bus.close())).await;
    }
}
