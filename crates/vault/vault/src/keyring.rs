//! Encryption key ring with rotation support.
//!
//! The ring holds every key trusted for decryption, oldest first. The
//! newest key is "current" and encrypts all new secrets; rotating in a
//! new key keeps the old ones readable until they are dropped from the
//! configuration. Key versions are 1-based ring positions, so the
//! current version always equals the ring length.

use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroizing;

use hubsync_core::{CrmError, CrmResult};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// A single 32-byte symmetric key, zeroized on drop.
pub struct EncryptionKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl EncryptionKey {
    /// Parses a key from base64 text. Standard and URL-safe alphabets are
    /// both accepted; the decoded material must be exactly 32 bytes.
    pub fn parse(encoded: &str) -> CrmResult<Self> {
        let trimmed = encoded.trim();
        let decoded = STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .map_err(|err| CrmError::KeyParse {
                reason: format!("not valid base64: {err}"),
            })?;
        let bytes: [u8; KEY_SIZE] =
            decoded
                .try_into()
                .map_err(|decoded: Vec<u8>| CrmError::KeyParse {
                    reason: format!("expected {KEY_SIZE} bytes, got {}", decoded.len()),
                })?;
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Encodes the key as standard base64, a form `parse` accepts.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes.as_slice())
    }

    /// Raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material in debug output.
        f.debug_struct("EncryptionKey").finish_non_exhaustive()
    }
}

/// The ordered set of keys trusted for decryption.
///
/// Immutable after construction; rotating keys means restarting with new
/// configuration. Ciphertext produced by any ring key stays readable for
/// as long as that key remains in the ring.
pub struct KeyRing {
    retired: Vec<EncryptionKey>,
    current: EncryptionKey,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material in debug output.
        f.debug_struct("KeyRing")
            .field("key_count", &self.key_count())
            .finish_non_exhaustive()
    }
}

static GLOBAL_RING: OnceLock<Arc<KeyRing>> = OnceLock::new();

impl KeyRing {
    /// Builds a ring from configured key material.
    ///
    /// `rotation` holds previously-current keys oldest first; `primary`
    /// is the current key. A malformed primary is fatal. A malformed
    /// rotation key is logged and skipped so one bad retired key cannot
    /// take the service down.
    pub fn from_config(primary: &str, rotation: &[String]) -> CrmResult<Self> {
        let current = EncryptionKey::parse(primary)
            .map_err(|err| CrmError::config(format!("primary encryption key unusable: {err}")))?;

        let mut retired = Vec::with_capacity(rotation.len());
        for (index, encoded) in rotation.iter().enumerate() {
            match EncryptionKey::parse(encoded) {
                Ok(key) => retired.push(key),
                Err(err) => {
                    tracing::warn!(index, error = %err, "Skipping unusable rotation key");
                }
            }
        }

        Ok(Self { retired, current })
    }

    /// Builds a ring holding a single key and no rotation history.
    pub fn single(current: EncryptionKey) -> Self {
        Self {
            retired: Vec::new(),
            current,
        }
    }

    /// Builds a single-key ring around a freshly generated key. Handy in
    /// tests and local development.
    pub fn generate() -> Self {
        Self::single(EncryptionKey::generate())
    }

    /// The key used for new encryptions.
    pub fn current(&self) -> &EncryptionKey {
        &self.current
    }

    /// Version tag written into new envelopes: the 1-based ring position
    /// of the current key.
    pub fn current_version(&self) -> u32 {
        self.retired.len() as u32 + 1
    }

    /// Number of keys in the ring.
    pub fn key_count(&self) -> usize {
        self.retired.len() + 1
    }

    /// Every ring key paired with its version, oldest first. Decryption
    /// walks this order deterministically.
    pub fn decryption_keys(&self) -> impl Iterator<Item = (u32, &EncryptionKey)> {
        self.retired
            .iter()
            .chain(std::iter::once(&self.current))
            .enumerate()
            .map(|(index, key)| (index as u32 + 1, key))
    }

    /// Publishes a ring as the process-wide singleton. The first call
    /// wins; later calls return the already-published ring unchanged.
    pub fn init_global(ring: KeyRing) -> Arc<KeyRing> {
        GLOBAL_RING.get_or_init(|| Arc::new(ring)).clone()
    }

    /// The published singleton, when `init_global` has run.
    pub fn global() -> Option<Arc<KeyRing>> {
        GLOBAL_RING.get().cloned()
    }
}
