//! Mention detection for NIP-29 group messages.
//!
//! Checks, in order: p-tags, hex pubkey in text, `nostr:npub`/`nostr:nprofile`
//! URIs, bot name. The URI scan is skipped when the hex check already hit,
//! which is why `text_bech32` stays false in that case.

use nostr_sdk::nips::nip19::{FromBech32, Nip19};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static NOSTR_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)nostr:(nprofile|npub)1[a-z0-9]+").unwrap());

const URI_SCHEME: &str = "nostr:";

/// Which detection paths fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MentionResult {
    pub mentioned: bool,
    pub p_tag: bool,
    pub text_hex: bool,
    pub text_bech32: bool,
    pub name: bool,
}

/// Check whether a message addresses the bot.
pub fn check_mention(
    tags: &[Vec<String>],
    text: &str,
    bot_pubkey: &str,
    bot_name: Option<&str>,
) -> MentionResult {
    let p_tag = tags.iter().any(|tag| {
        tag.first().map(String::as_str) == Some("p")
            && tag.get(1).map(String::as_str) == Some(bot_pubkey)
    });

    let text_hex = text.contains(bot_pubkey);

    let text_bech32 = !text_hex && text_mentions_bech32(text, bot_pubkey);

    let name = match bot_name {
        Some(n) if !n.is_empty() => text.to_lowercase().contains(&n.to_lowercase()),
        _ => false,
    };

    MentionResult {
        mentioned: p_tag || text_hex || text_bech32 || name,
        p_tag,
        text_hex,
        text_bech32,
        name,
    }
}

fn text_mentions_bech32(text: &str, bot_pubkey: &str) -> bool {
    NOSTR_URI_RE.find_iter(text).any(|m| {
        // The regex guarantees an ASCII "nostr:" prefix in some casing
        let bech32 = &m.as_str()[URI_SCHEME.len()..];
        decoded_pubkey(bech32).is_some_and(|pk| pk == bot_pubkey)
    })
}

/// Public key (hex) carried by an npub or nprofile; None for anything else
/// or when decoding fails.
fn decoded_pubkey(bech32: &str) -> Option<String> {
    match Nip19::from_bech32(bech32).ok()? {
        Nip19::Pubkey(pk) => Some(pk.to_hex()),
        Nip19::Profile(profile) => Some(profile.public_key.to_hex()),
        _ => None,
    }
}
