//! Wire-level helpers: relay message parsing, client messages, group filter
//! and event construction for NIP-29 group chat.

use nostr_sdk::{Event, EventBuilder, Keys, Kind, Tag, TagKind};
use serde_json::{json, Value};

use crate::error::{BusError, Result};

/// Group message
pub const KIND_GROUP_MESSAGE: u16 = 9;
/// Group thread root
pub const KIND_GROUP_THREAD: u16 = 11;
/// Group thread reply
pub const KIND_GROUP_THREAD_REPLY: u16 = 12;
/// NIP-42 client authentication
pub const KIND_CLIENT_AUTH: u16 = 22242;

pub const GROUP_KINDS: [u16; 3] = [KIND_GROUP_MESSAGE, KIND_GROUP_THREAD, KIND_GROUP_THREAD_REPLY];

/// A message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    /// Parse a relay frame. Returns None for malformed frames and message
    /// types the bus does not use.
    pub fn parse(text: &str) -> Option<Self> {
        let parsed: Value = serde_json::from_str(text).ok()?;
        let arr = parsed.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);

        match arr.first()?.as_str()? {
            "EVENT" => {
                let event: Event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
                Some(Self::Event {
                    subscription_id: str_at(1)?,
                    event: Box::new(event),
                })
            }
            "OK" => Some(Self::Ok {
                event_id: str_at(1)?,
                accepted: arr.get(2)?.as_bool()?,
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" => Some(Self::Eose {
                subscription_id: str_at(1)?,
            }),
            "CLOSED" => Some(Self::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(Self::Notice {
                message: str_at(1).unwrap_or_default(),
            }),
            "AUTH" => Some(Self::Auth {
                challenge: str_at(1)?,
            }),
            _ => None,
        }
    }
}

/// Filter for all group-chat kinds in the given groups since a timestamp.
pub fn group_filter(groups: &[String], since: u64) -> Value {
    json!({
        "kinds": GROUP_KINDS,
        "#h": groups,
        "since": since,
    })
}

pub fn req_message(subscription_id: &str, filter: &Value) -> String {
    json!(["REQ", subscription_id, filter]).to_string()
}

pub fn close_message(subscription_id: &str) -> String {
    json!(["CLOSE", subscription_id]).to_string()
}

pub fn event_message(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

pub fn auth_message(event: &Event) -> String {
    json!(["AUTH", event]).to_string()
}

/// Signed kind-9 message tagged with the group.
pub fn build_group_message(keys: &Keys, group_id: &str, content: &str) -> Result<Event> {
    EventBuilder::new(Kind::Custom(KIND_GROUP_MESSAGE), content)
        .tag(Tag::custom(TagKind::h(), vec![group_id.to_string()]))
        .sign_with_keys(keys)
        .map_err(|e| BusError::Signing(e.to_string()))
}

/// Signed NIP-42 response bound to a relay and its challenge.
pub fn build_auth_event(keys: &Keys, relay_url: &str, challenge: &str) -> Result<Event> {
    EventBuilder::new(Kind::Custom(KIND_CLIENT_AUTH), "")
        .tag(Tag::custom(
            TagKind::Custom("relay".into()),
            vec![relay_url.to_string()],
        ))
        .tag(Tag::custom(
            TagKind::Custom("challenge".into()),
            vec![challenge.to_string()],
        ))
        .sign_with_keys(keys)
        .map_err(|e| BusError::Signing(e.to_string()))
}

/// Group ID from the first `h` tag.
pub fn extract_group(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let s = tag.as_slice();
        match (s.first().map(String::as_str), s.get(1)) {
            (Some("h"), Some(group)) => Some(group.clone()),
            _ => None,
        }
    })
}

/// Tags as plain string lists.
pub fn tag_lists(event: &Event) -> Vec<Vec<String>> {
    event.tags.iter().map(|t| t.as_slice().to_vec()).collect()
}

/// Relay URLs compare equal after trimming a trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
