//! AES-256-GCM encryption for credential secrets.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use hubsync_core::{CrmError, CrmResult};

use crate::keyring::EncryptionKey;

/// 12-byte nonce, the standard AES-GCM size.
pub const NONCE_SIZE: usize = 12;

/// Encrypts plaintext under one key, returning `nonce || ciphertext` so
/// the output carries everything needed to decrypt it later.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> CrmResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|err| CrmError::internal(format!("invalid AES key: {err}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|err| CrmError::internal(format!("encryption failed: {err}")))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts a `nonce || ciphertext` buffer produced by `seal`. Fails when
/// the key does not match or the buffer was tampered with; callers walking
/// a key ring treat a single mismatch as "try the next key".
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> CrmResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(CrmError::decryption("ciphertext"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|err| CrmError::internal(format!("invalid AES key: {err}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CrmError::decryption("ciphertext"))
}
