use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use nip29_bus::{
    derive_identity, validate_bindings, AccountSettings, BusConfig, GroupBinding, ResumePolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

/// Env var consulted when an account carries no key of its own.
pub const PRIVATE_KEY_ENV: &str = "NIP29_PRIVATE_KEY";
pub const WEBHOOK_TOKEN_ENV: &str = "WEBHOOK_TOKEN";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub state: StateConfig,
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: String,
    #[serde(default)]
    pub backend: StateBackend,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccountConfig {
    pub id: String,
    pub name: Option<String>,
    pub private_key: Option<String>,
    pub private_key_file: Option<String>,
    /// Default relay for groups that don't name their own
    pub relay: Option<String>,
    #[serde(default = "default_true")]
    pub require_mention: bool,
    #[serde(default = "default_allow_from")]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub resume: ResumePolicy,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GroupConfig {
    pub id: String,
    pub relay: Option<String>,
    pub mention_only: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            backend: StateBackend::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_id() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_allow_from() -> Vec<String> {
    vec!["*".to_string()]
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "nip29-bridge")
}

fn default_state_dir() -> String {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "~/.nip29-bridge/state".to_string())
}

/// `<config dir>/nip29-bridge/config.toml` for the current platform.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("nip29-bridge.toml"))
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("wss://") || url.starts_with("ws://")
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::parse(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    /// Fill the webhook token and missing account keys from the environment.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(webhook) = &mut self.webhook {
            if webhook.token.is_none() {
                webhook.token = env(WEBHOOK_TOKEN_ENV);
            }
        }
        for account in &mut self.accounts {
            if account.private_key.is_none() && account.private_key_file.is_none() {
                account.private_key = env(PRIVATE_KEY_ENV);
            }
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.state.dir).as_ref())
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("No [[accounts]] configured");
        }

        if let Some(webhook) = &self.webhook {
            if !is_http_url(&webhook.url) {
                bail!("Webhook URL must start with http:// or https://");
            }
        }

        let mut ids = HashSet::new();
        for account in &self.accounts {
            if !ids.insert(account.id.as_str()) {
                bail!("Duplicate account id: {}", account.id);
            }
            account
                .validate()
                .with_context(|| format!("Invalid account {}", account.id))?;
        }
        Ok(())
    }
}

impl AccountConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("Account id must not be empty");
        }
        let secret = self.secret_key()?;
        derive_identity(&secret)?;

        if let Some(relay) = &self.relay {
            if !is_ws_url(relay) {
                bail!("Relay URL must start with ws:// or wss://: {}", relay);
            }
        }
        // Surfaces groups without a relay and bad group relay URLs
        let bindings = self.bindings()?;
        for binding in &bindings {
            if !is_ws_url(&binding.relay_url) {
                bail!(
                    "Relay URL for group {} must start with ws:// or wss://: {}",
                    binding.group_id,
                    binding.relay_url
                );
            }
        }
        validate_bindings(&bindings)?;
        Ok(())
    }

    /// The account's `nsec`, inline or read from `private_key_file`.
    pub fn secret_key(&self) -> Result<String> {
        if let Some(key) = &self.private_key {
            return Ok(key.trim().to_string());
        }
        if let Some(path) = &self.private_key_file {
            let expanded_path = shellexpand::tilde(path);
            let content = fs::read_to_string(expanded_path.as_ref())
                .with_context(|| format!("Failed to read key file: {}", path))?;
            return Ok(content.trim().to_string());
        }
        bail!(
            "No private_key, private_key_file or {} for account {}",
            PRIVATE_KEY_ENV,
            self.id
        )
    }

    pub fn bindings(&self) -> Result<Vec<GroupBinding>> {
        self.groups
            .iter()
            .map(|group| {
                let relay = group
                    .relay
                    .as_ref()
                    .or(self.relay.as_ref())
                    .with_context(|| format!("Group {} has no relay", group.id))?;
                Ok(GroupBinding {
                    group_id: group.id.clone(),
                    relay_url: relay.clone(),
                    mention_only: group.mention_only,
                })
            })
            .collect()
    }

    pub fn settings(&self) -> AccountSettings {
        AccountSettings {
            account_id: self.id.clone(),
            name: self.name.clone(),
            require_mention: self.require_mention,
            allow_from: self.allow_from.clone(),
        }
    }

    pub fn bus_config(&self) -> Result<BusConfig> {
        let mut config = BusConfig::new(self.secret_key()?, self.bindings()?);
        config.account_id = Some(self.id.clone());
        config.resume = self.resume;
        Ok(config)
    }
}
