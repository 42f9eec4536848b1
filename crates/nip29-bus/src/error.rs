//! Bus error types

use thiserror::Error;

/// Errors surfaced by the relay bus.
///
/// Per-relay variants carry the relay URL so the host can attribute them;
/// none of them abort other relays managed by the same bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The secret key is not a well-formed `nsec` encoding
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Websocket connection to a relay failed
    #[error("Failed to connect to {relay}: {reason}")]
    ConnectFailure { relay: String, reason: String },

    /// The relay rejected our AUTH event
    #[error("AUTH rejected by {relay}: {reason}")]
    AuthFailure { relay: String, reason: String },

    /// No AUTH handshake completed within the bounded wait
    #[error("AUTH timeout on {relay}, proceeding without auth")]
    AuthTimeout { relay: String },

    /// The relay closed our subscription
    #[error("Subscription closed by {relay}: {reason}")]
    SubscriptionClosed { relay: String, reason: String },

    /// The relay connection dropped
    #[error("Connection to {relay} lost: {reason}")]
    ConnectionLost { relay: String, reason: String },

    /// No relay is configured for the group
    #[error("No relay configured for group {0}")]
    UnknownGroup(String),

    /// The relay owning the group is not connected
    #[error("Not connected to relay {0}")]
    NotConnected(String),

    /// The relay answered OK=false to a published event
    #[error("Publish rejected by {relay}: {reason}")]
    PublishRejected { relay: String, reason: String },

    /// The relay did not acknowledge a published event in time
    #[error("Publish to {relay} timed out")]
    PublishTimeout { relay: String },

    /// Reading or writing persisted bus state failed
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Building or signing an event failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The inbound handler returned an error
    #[error("Inbound handler failed: {0}")]
    Handler(String),

    /// Outbound target is not a `group:<id>` address
    #[error("Unsupported target {0}, expected group:<id>")]
    InvalidTarget(String),

    /// The group bindings are inconsistent
    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    /// No bus is registered for the account
    #[error("No bus running for account {0}")]
    AccountNotRunning(String),
}

impl BusError {
    /// The relay this error belongs to, if any.
    pub fn relay(&self) -> Option<&str> {
        match self {
            Self::ConnectFailure { relay, .. }
            | Self::AuthFailure { relay, .. }
            | Self::AuthTimeout { relay }
            | Self::SubscriptionClosed { relay, .. }
            | Self::ConnectionLost { relay, .. }
            | Self::PublishRejected { relay, .. }
            | Self::PublishTimeout { relay } => Some(relay),
            Self::NotConnected(relay) => Some(relay),
            _ => None,
        }
    }
}

/// Bus result type
pub type Result<T> = std::result::Result<T, BusError>;
