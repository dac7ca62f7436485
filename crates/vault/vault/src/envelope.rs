//! Versioned encryption envelope, the at-rest form of every secret.
//!
//! Stored text looks like `v2:aGVsbG8...`: a key-version tag followed by
//! the base64 of `nonce || ciphertext`. The tag records which ring key
//! produced the ciphertext but is advisory only; decryption always walks
//! the full ring, so a stale tag can never make a secret unreadable.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use hubsync_core::{CrmError, CrmResult};

use crate::cipher;
use crate::keyring::KeyRing;

/// An encrypted secret in its stored form.
///
/// `key_version = None` marks a legacy value written before envelopes
/// carried version tags; `reencrypt` upgrades those in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub key_version: Option<u32>,
    pub ciphertext: Vec<u8>,
}

impl EncryptedSecret {
    /// Encrypts plaintext under the ring's current key and tags the
    /// envelope with its version.
    pub fn seal(ring: &KeyRing, plaintext: &[u8]) -> CrmResult<Self> {
        let ciphertext = cipher::seal(ring.current(), plaintext)?;
        Ok(Self {
            key_version: Some(ring.current_version()),
            ciphertext,
        })
    }

    /// Decrypts by trying every ring key oldest first. `resource` names
    /// what failed in the error; it never reaches the ciphertext.
    pub fn open(&self, ring: &KeyRing, resource: &str) -> CrmResult<Vec<u8>> {
        for (_, key) in ring.decryption_keys() {
            if let Ok(plaintext) = cipher::open(key, &self.ciphertext) {
                return Ok(plaintext);
            }
        }
        Err(CrmError::decryption(resource))
    }

    /// Serializes to the stored `v<N>:<base64>` form. Legacy envelopes
    /// render without a prefix.
    pub fn encode(&self) -> String {
        let encoded = STANDARD.encode(&self.ciphertext);
        match self.key_version {
            Some(version) => format!("v{version}:{encoded}"),
            None => encoded,
        }
    }

    /// Parses the stored form. Text without a `v<N>:` prefix is accepted
    /// as a legacy envelope with no version tag.
    pub fn decode(stored: &str) -> CrmResult<Self> {
        let (key_version, body) = match split_version_prefix(stored) {
            Some((version, rest)) => (Some(version), rest),
            None => (None, stored),
        };
        let ciphertext = STANDARD
            .decode(body)
            .map_err(|err| CrmError::InvalidField {
                field: "encrypted_secret".to_string(),
                reason: format!("invalid base64: {err}"),
            })?;
        Ok(Self {
            key_version,
            ciphertext,
        })
    }
}

fn split_version_prefix(stored: &str) -> Option<(u32, &str)> {
    let rest = stored.strip_prefix('v')?;
    let colon = rest.find(':')?;
    let version = rest[..colon].parse().ok()?;
    Some((version, &rest[colon + 1..]))
}
