//! NIP-29 relay bus
//!
//! Authenticated relay connections (NIP-42), group-chat subscriptions with
//! dedup and resumable cursor state, mention detection, and a gateway that
//! gates inbound messages before handing them to a host pipeline.

pub mod bus;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod mention;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod seen;
pub mod state;
pub mod state_sqlite;

// Re-export commonly used types
pub use bus::{validate_bindings, BusConfig, GroupBinding, Nip29Bus, Outbound, ResumePolicy};
pub use dispatch::{InboundHandler, InboundMessage};
pub use error::{BusError, Result};
pub use gateway::{AccountSettings, Gateway, GroupGate, Host, Route};
pub use keys::{derive_identity, Identity};
pub use mention::{check_mention, MentionResult};
pub use metrics::{BusObserver, MetricEvent, MetricsSnapshot, TracingObserver};
pub use registry::{parse_group_target, BusRegistry};
pub use relay::{ConnectionState, RelayConfig};
pub use seen::{SeenConfig, SeenTracker};
pub use state::{compute_since_timestamp, BusState, JsonFileStore, StateStore};
pub use state_sqlite::SqliteStateStore;
