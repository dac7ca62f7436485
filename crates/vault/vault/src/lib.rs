//! # HubSync Vault
//!
//! Envelope encryption for third-party credentials: a rotating key ring,
//! an AES-256-GCM cipher, the versioned at-rest envelope, and the
//! credential vault tying them to storage, expiry enforcement, and
//! decrypt auditing.

pub mod cipher;
pub mod envelope;
pub mod keyring;
pub mod vault;

// Re-export commonly used items at the crate root
pub use envelope::EncryptedSecret;
pub use keyring::{EncryptionKey, KeyRing, KEY_SIZE};
pub use vault::{CredentialVault, NewCredential};
