use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use nip29_bus::{
    derive_identity, BusRegistry, Gateway, Host, InboundHandler, InboundMessage, JsonFileStore,
    Nip29Bus, Outbound, ResumePolicy, SqliteStateStore, StateStore, TracingObserver,
};
use nostr_sdk::ToBech32;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod webhook;

use config::{default_config_path, AccountConfig, Config, StateBackend};
use webhook::WebhookHost;

#[derive(Parser)]
#[command(name = "nip29-bridge")]
#[command(about = "NIP-29 group chat bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured account until SIGINT/SIGTERM
    Run,
    /// Publish one message to a group and exit
    Send {
        /// Account to send from; may be omitted when only one is configured
        #[arg(long)]
        account: Option<String>,
        /// Target in the form group:<id>
        target: String,
        /// Message text
        text: String,
    },
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli
        .config
        .unwrap_or_else(|| default_config_path().to_string_lossy().into_owned());
    let config = Config::load_from_file(&path)
        .with_context(|| format!("Failed to load config from {}", path))?;

    init_logging(&config.logging.level);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::Send {
            account,
            target,
            text,
        } => send_message(&config, account.as_deref(), &target, &text).await,
        Commands::Check => check_config(&config),
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    let dir = config.state_dir();
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Json => Arc::new(JsonFileStore::new(&dir)),
        StateBackend::Sqlite => Arc::new(
            SqliteStateStore::open(&dir)
                .with_context(|| format!("Failed to open state db in {}", dir.display()))?,
        ),
    };
    Ok(store)
}

async fn run_bridge(config: Config) -> Result<()> {
    tracing::info!("Starting nip29-bridge v{}", env!("CARGO_PKG_VERSION"));

    let webhook = config
        .webhook
        .as_ref()
        .context("`run` needs a [webhook] section")?;
    let host: Arc<dyn Host> = Arc::new(WebhookHost::new(webhook)?);
    let store = open_store(&config)?;

    let registry = BusRegistry::new();
    let mut gateways = Vec::new();
    for account in &config.accounts {
        match start_gateway(account, store.clone(), host.clone()).await {
            Ok(gateway) => {
                registry.insert(&account.id, gateway.bus().clone()).await;
                gateways.push(gateway);
            }
            Err(e) => {
                registry.close_all().await;
                return Err(e);
            }
        }
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::error!("Signal handling failed, falling back to Ctrl+C: {:#}", e);
            let _ = signal::ctrl_c().await;
        }
        tracing::info!("Received shutdown signal, stopping bridge...");
        signal_token.cancel();
    });

    join_all(gateways.iter().map(|g| g.run_until_cancelled(token.clone()))).await;
    registry.close_all().await;
    tracing::info!("Bridge stopped");
    Ok(())
}

async fn start_gateway(
    account: &AccountConfig,
    store: Arc<dyn StateStore>,
    host: Arc<dyn Host>,
) -> Result<Gateway> {
    Gateway::start(
        account.settings(),
        account.bus_config()?,
        store,
        host,
        Arc::new(TracingObserver::new(account.id.clone())),
    )
    .await
    .with_context(|| format!("Failed to start account {}", account.id))
}

/// Drops everything; `send` only publishes.
struct Discard;

#[async_trait]
impl InboundHandler for Discard {
    async fn on_message(&self, _message: InboundMessage, _outbound: &Outbound) -> Result<()> {
        Ok(())
    }
}

async fn send_message(
    config: &Config,
    account: Option<&str>,
    target: &str,
    text: &str,
) -> Result<()> {
    let account = match account {
        Some(id) => config
            .account(id)
            .with_context(|| format!("Unknown account {}", id))?,
        None => match config.accounts.as_slice() {
            [only] => only,
            _ => anyhow::bail!("Several accounts configured, pass --account"),
        },
    };

    let mut bus_config = account.bus_config()?;
    bus_config.resume = ResumePolicy::LiveOnly;
    // In-memory state so a one-shot send never touches the gateway's cursor
    let store = Arc::new(SqliteStateStore::in_memory()?);
    let bus = Nip29Bus::start(
        bus_config,
        store,
        Arc::new(Discard),
        Arc::new(TracingObserver::new(account.id.clone())),
    )
    .await
    .with_context(|| format!("Failed to start account {}", account.id))?;

    let registry = BusRegistry::new();
    registry.insert(&account.id, Arc::new(bus)).await;
    let result = registry.send_text(&account.id, target, text).await;
    registry.close_all().await;

    let event = result.with_context(|| format!("Failed to send to {}", target))?;
    println!("{}", event.id.to_hex());
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    println!("✓ Configuration is valid");
    println!("  State: {} ({:?})", config.state_dir().display(), config.state.backend);
    match &config.webhook {
        Some(webhook) => println!("  Webhook: {} (agent {})", webhook.url, webhook.agent_id),
        None => println!("⚠ No [webhook] configured; only `send` will work"),
    }

    for account in &config.accounts {
        let identity = derive_identity(&account.secret_key()?)?;
        let npub = identity
            .keys
            .public_key()
            .to_bech32()
            .unwrap_or_else(|_| identity.public_key.clone());
        println!("✓ Account {}: {}", account.id, npub);
        for binding in account.bindings()? {
            println!("    group {} on {}", binding.group_id, binding.relay_url);
        }
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C");
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();
}
