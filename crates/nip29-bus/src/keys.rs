//! Identity derivation from an `nsec` secret key.

use nostr_sdk::nips::nip19::{FromBech32, Nip19};
use nostr_sdk::Keys;

use crate::error::{BusError, Result};

/// The bus identity: raw secret bytes, hex public key and signing keys.
#[derive(Clone)]
pub struct Identity {
    pub secret_key: [u8; 32],
    pub public_key: String,
    pub keys: Keys,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Decode an `nsec` and derive the matching public identity.
pub fn derive_identity(secret_encoding: &str) -> Result<Identity> {
    let trimmed = secret_encoding.trim();
    let decoded = Nip19::from_bech32(trimmed)
        .map_err(|e| BusError::InvalidKeyEncoding(e.to_string()))?;

    let secret = match decoded {
        Nip19::Secret(secret) => secret,
        Nip19::Pubkey(_) => {
            return Err(BusError::InvalidKeyEncoding(
                "expected nsec, got npub".to_string(),
            ))
        }
        Nip19::Profile(_) => {
            return Err(BusError::InvalidKeyEncoding(
                "expected nsec, got nprofile".to_string(),
            ))
        }
        _ => {
            return Err(BusError::InvalidKeyEncoding(
                "expected nsec, got another NIP-19 entity".to_string(),
            ))
        }
    };

    let secret_key = secret.to_secret_bytes();
    let keys = Keys::new(secret);
    let public_key = keys.public_key().to_hex();

    Ok(Identity {
        secret_key,
        public_key,
        keys,
    })
}
