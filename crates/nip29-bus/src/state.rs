//! Persisted resume cursor per account.
//!
//! The bus writes `{lastProcessedAt, gatewayStartedAt, recentEventIds}` so a
//! restart can resubscribe from where it left off and re-seed the dedup
//! window. The JSON file backend lives here; the SQLite backend is in
//! `state_sqlite`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{BusError, Result};

/// Maximum event IDs kept in the persisted recent window.
pub const MAX_PERSISTED_EVENT_IDS: usize = 5000;

/// Seconds subtracted from the resume cursor before the first subscription.
pub const STARTUP_LOOKBACK_SECS: u64 = 60;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusState {
    pub last_processed_at: u64,
    pub gateway_started_at: u64,
    #[serde(default)]
    pub recent_event_ids: Vec<String>,
}

/// On-disk record: the state plus the key it belongs to.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    version: u32,
    account_key: String,
    #[serde(flatten)]
    state: BusState,
}

/// Durable storage for bus state, keyed by account key.
pub trait StateStore: Send + Sync {
    fn read(&self, account_key: &str) -> Result<Option<BusState>>;
    fn write(&self, account_key: &str, state: &BusState) -> Result<()>;
}

/// Where to resume a subscription from: the persisted cursor if there is
/// one, otherwise the gateway start time.
pub fn compute_since_timestamp(state: Option<&BusState>, gateway_started_at: u64) -> u64 {
    match state {
        Some(s) => s.last_processed_at,
        None => gateway_started_at,
    }
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// One JSON file per account key under a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// File for `account_key`. ASCII alphanumerics and `-` are kept, every
    /// other byte becomes `_xx` hex, so distinct keys never share a file.
    pub fn path_for(&self, account_key: &str) -> PathBuf {
        let mut safe = String::with_capacity(account_key.len());
        for byte in account_key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                safe.push(char::from(byte));
            } else {
                safe.push_str(&format!("_{byte:02x}"));
            }
        }
        self.dir.join(format!("bus-state-{safe}.json"))
    }
}

impl StateStore for JsonFileStore {
    fn read(&self, account_key: &str) -> Result<Option<BusState>> {
        let path = self.path_for(account_key);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BusError::PersistenceFailure(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        let record: StateRecord = serde_json::from_str(&json).map_err(|e| {
            BusError::PersistenceFailure(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(record.state))
    }

    fn write(&self, account_key: &str, state: &BusState) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            BusError::PersistenceFailure(format!(
                "Failed to create state dir {}: {e}",
                self.dir.display()
            ))
        })?;

        let record = StateRecord {
            version: STATE_VERSION,
            account_key: account_key.to_string(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| BusError::PersistenceFailure(e.to_string()))?;

        // Write-then-rename so a crash never leaves a truncated file
        let path = self.path_for(account_key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                BusError::PersistenceFailure(format!("Failed to write {}: {e}", path.display()))
            })?;

        debug!(
            "Persisted bus state for {} (lastProcessedAt={}, {} recent ids)",
            account_key,
            state.last_processed_at,
            state.recent_event_ids.len()
        );
        Ok(())
    }
}
