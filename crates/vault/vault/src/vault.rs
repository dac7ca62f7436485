//! Credential storage with envelope encryption and decrypt auditing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use hubsync_core::{
    secret_preview, AuditEventType, AuditLog, AuditRecord, Clock, CrmError, CrmResult, Credential,
    DecryptedCredential, Provider, StorageAdapter,
};

use crate::envelope::EncryptedSecret;
use crate::keyring::KeyRing;

/// Inputs for storing a credential. The secrets arrive as plaintext and
/// are encrypted before anything touches storage.
pub struct NewCredential {
    pub tenant_id: String,
    pub provider: Provider,
    pub secret: String,
    pub refresh_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub account_id: Option<String>,
}

impl NewCredential {
    /// Creates a minimal non-expiring credential input.
    pub fn new(
        tenant_id: impl Into<String>,
        provider: Provider,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider,
            secret: secret.into(),
            refresh_secret: None,
            expires_at: None,
            scope: None,
            account_id: None,
        }
    }

    /// Sets the refresh secret.
    pub fn with_refresh_secret(mut self, refresh_secret: impl Into<String>) -> Self {
        self.refresh_secret = Some(refresh_secret.into());
        self
    }

    /// Sets the access secret expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the scope tag.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the provider-side account id.
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Encrypts, stores, retrieves, and removes third-party credentials.
///
/// Every successful decrypt leaves exactly one audit entry carrying a
/// truncated secret preview; a decryption failure is logged with
/// tenant/provider context and surfaces as a typed error, never as
/// garbage plaintext.
pub struct CredentialVault {
    storage: Arc<dyn StorageAdapter>,
    ring: Arc<KeyRing>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
}

impl CredentialVault {
    /// Creates a vault over the given storage, key ring, and clock.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        ring: Arc<KeyRing>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLog::new(storage.clone());
        Self {
            storage,
            ring,
            clock,
            audit,
        }
    }

    /// Encrypts and upserts the credential for `(tenant, provider)`.
    ///
    /// Reconnecting overwrites the stored secrets in place; the row's
    /// identity and `created_at` survive. No audit entry is written here,
    /// connect flows audit with their own event types.
    pub async fn store(&self, input: NewCredential) -> CrmResult<Credential> {
        let encrypted_secret =
            EncryptedSecret::seal(&self.ring, input.secret.as_bytes())?.encode();
        let encrypted_refresh_secret = match &input.refresh_secret {
            Some(refresh) => Some(EncryptedSecret::seal(&self.ring, refresh.as_bytes())?.encode()),
            None => None,
        };

        let mut credential = Credential::new(input.tenant_id, input.provider, encrypted_secret);
        credential.encrypted_refresh_secret = encrypted_refresh_secret;
        credential.expires_at = input.expires_at;
        credential.scope = input.scope;
        credential.account_id = input.account_id;

        let stored = self.storage.upsert_credential(&credential).await?;
        tracing::info!(
            tenant_id = %stored.tenant_id,
            provider = %stored.provider,
            key_version = self.ring.current_version(),
            "Stored encrypted credential"
        );
        Ok(stored)
    }

    /// Decrypts and returns the credential for `(tenant, provider)`.
    ///
    /// An absent row is `NotConnected`; an expiry strictly in the past is
    /// `CredentialExpired` and the ciphertext is never touched.
    pub async fn retrieve(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> CrmResult<DecryptedCredential> {
        let credential = self.require_credential(tenant_id, provider).await?;

        if credential.is_expired(self.clock.now()) {
            return Err(CrmError::expired(tenant_id, provider.as_str()));
        }

        let secret = self
            .decrypt_field(&credential, &credential.encrypted_secret, "token")
            .await?;

        Ok(DecryptedCredential {
            credential_id: credential.id,
            tenant_id: credential.tenant_id,
            provider: credential.provider,
            secret,
            scope: credential.scope,
            account_id: credential.account_id,
            expires_at: credential.expires_at,
            last_synced_at: credential.last_synced_at,
        })
    }

    /// Decrypts the stored refresh secret.
    ///
    /// No expiry check: refresh happens precisely because the access
    /// secret has expired. `NotConnected` when the credential or its
    /// refresh secret is absent.
    pub async fn retrieve_refresh_secret(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> CrmResult<String> {
        let credential = self.require_credential(tenant_id, provider).await?;

        let stored = credential
            .encrypted_refresh_secret
            .clone()
            .ok_or_else(|| CrmError::not_connected(tenant_id, provider.as_str()))?;

        self.decrypt_field(&credential, &stored, "refresh_token")
            .await
    }

    /// Re-encrypts a credential's secrets under the ring's current key,
    /// refreshing the envelope version tags. The operational follow-up to
    /// a key rotation; works on expired credentials too since it only
    /// rewrites what is already stored.
    pub async fn reencrypt(&self, tenant_id: &str, provider: Provider) -> CrmResult<Credential> {
        let mut credential = self.require_credential(tenant_id, provider).await?;

        let stored_secret = credential.encrypted_secret.clone();
        let secret = self
            .decrypt_field(&credential, &stored_secret, "token")
            .await?;
        credential.encrypted_secret =
            EncryptedSecret::seal(&self.ring, secret.as_bytes())?.encode();

        if let Some(stored_refresh) = credential.encrypted_refresh_secret.clone() {
            let refresh = self
                .decrypt_field(&credential, &stored_refresh, "refresh_token")
                .await?;
            credential.encrypted_refresh_secret =
                Some(EncryptedSecret::seal(&self.ring, refresh.as_bytes())?.encode());
        }

        credential.updated_at = self.clock.now();
        let stored = self.storage.upsert_credential(&credential).await?;
        tracing::info!(
            tenant_id = %stored.tenant_id,
            provider = %stored.provider,
            key_version = self.ring.current_version(),
            "Re-encrypted credential under current key"
        );
        Ok(stored)
    }

    /// Deletes the credential. Returns whether one existed; removing an
    /// already-absent credential is not an error.
    pub async fn remove(&self, tenant_id: &str, provider: Provider) -> CrmResult<bool> {
        self.storage.delete_credential(tenant_id, provider).await
    }

    async fn require_credential(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> CrmResult<Credential> {
        self.storage
            .get_credential(tenant_id, provider)
            .await?
            .ok_or_else(|| CrmError::not_connected(tenant_id, provider.as_str()))
    }

    /// Decrypts one envelope field and audits the successful decrypt.
    async fn decrypt_field(
        &self,
        credential: &Credential,
        stored: &str,
        token_kind: &str,
    ) -> CrmResult<String> {
        let resource = format!("{}_{}", credential.provider, token_kind);

        let envelope = EncryptedSecret::decode(stored)?;
        let plaintext = envelope.open(&self.ring, &resource).inspect_err(|_| {
            tracing::error!(
                tenant_id = %credential.tenant_id,
                provider = %credential.provider,
                credential_id = %credential.id,
                resource = %resource,
                "Failed to decrypt stored credential"
            );
        })?;
        let secret =
            String::from_utf8(plaintext).map_err(|_| CrmError::decryption(resource.as_str()))?;

        self.audit
            .record(
                AuditRecord::new(
                    credential.tenant_id.clone(),
                    AuditEventType::TokenDecrypted,
                )
                .with_resource(resource, credential.id.clone())
                .with_details(json!({
                    "key_version": envelope.key_version,
                    "token_prefix": secret_preview(&secret),
                    "token_length": secret.len(),
                })),
            )
            .await;

        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::EncryptionKey;
    use chrono::Duration;
    use hubsync_core::ManualClock;
    use hubsync_memory_adapter::MemoryAdapter;

    fn vault_with_ring(ring: KeyRing) -> (CredentialVault, Arc<MemoryAdapter>, Arc<ManualClock>) {
        let storage = Arc::new(MemoryAdapter::new());
        let clock = Arc::new(ManualClock::starting_now());
        let vault = CredentialVault::new(storage.clone(), Arc::new(ring), clock.clone());
        (vault, storage, clock)
    }

    fn test_vault() -> (CredentialVault, Arc<MemoryAdapter>, Arc<ManualClock>) {
        vault_with_ring(KeyRing::single(EncryptionKey::generate()))
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (vault, storage, _) = test_vault();

        let stored = vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_123"))
            .await
            .unwrap();
        assert!(stored.encrypted_secret.starts_with("v1:"));
        assert_ne!(stored.encrypted_secret, "sk_test_123");

        let decrypted = vault.retrieve("org_1", Provider::Stripe).await.unwrap();
        assert_eq!(decrypted.secret, "sk_test_123");
        assert_eq!(decrypted.provider, Provider::Stripe);

        let audit = storage.list_audit("org_1", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        let entry = &audit[0];
        assert_eq!(entry.event_type, AuditEventType::TokenDecrypted);
        assert_eq!(entry.resource_type.as_deref(), Some("stripe_token"));
        assert_eq!(entry.details["token_prefix"], "sk_test_12...");
        assert_eq!(entry.details["token_length"], 11);
        assert_eq!(entry.details["key_version"], 1);
    }

    #[tokio::test]
    async fn test_retrieve_absent_is_not_connected() {
        let (vault, _, _) = test_vault();

        let err = vault.retrieve("org_1", Provider::Stripe).await.unwrap_err();
        assert!(matches!(err, CrmError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_expired_credential_is_rejected_without_decrypting() {
        let (vault, storage, clock) = test_vault();

        vault
            .store(
                NewCredential::new("org_1", Provider::Stripe, "oauth_token")
                    .with_expiry(clock.now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        let err = vault.retrieve("org_1", Provider::Stripe).await.unwrap_err();
        assert!(matches!(err, CrmError::CredentialExpired { .. }));

        // No decrypt happened, so no audit entry either.
        let audit = storage.list_audit("org_1", 10).await.unwrap();
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_rotation_is_transparent_to_retrieve() {
        let old = EncryptionKey::generate();
        let old_b64 = old.to_base64();
        let (vault, storage, clock) = vault_with_ring(KeyRing::single(old));

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_123"))
            .await
            .unwrap();

        // Rotate: the old key retires, a new primary takes over.
        let rotated = KeyRing::from_config(
            &EncryptionKey::generate().to_base64(),
            std::slice::from_ref(&old_b64),
        )
        .unwrap();
        let vault2 = CredentialVault::new(storage.clone(), Arc::new(rotated), clock.clone());

        let decrypted = vault2.retrieve("org_1", Provider::Stripe).await.unwrap();
        assert_eq!(decrypted.secret, "sk_test_123");

        // Finishing the rotation rewrites the envelope under the new key.
        let reencrypted = vault2.reencrypt("org_1", Provider::Stripe).await.unwrap();
        assert!(reencrypted.encrypted_secret.starts_with("v2:"));
        let decrypted = vault2.retrieve("org_1", Provider::Stripe).await.unwrap();
        assert_eq!(decrypted.secret, "sk_test_123");
    }

    #[tokio::test]
    async fn test_unknown_key_is_decryption_failure_with_no_audit() {
        let (vault, storage, clock) = test_vault();

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_123"))
            .await
            .unwrap();

        // A vault holding an unrelated ring cannot open the envelope.
        let other = CredentialVault::new(
            storage.clone(),
            Arc::new(KeyRing::single(EncryptionKey::generate())),
            clock.clone(),
        );
        let err = other.retrieve("org_1", Provider::Stripe).await.unwrap_err();
        assert!(matches!(err, CrmError::DecryptionFailed { .. }));

        let audit = storage.list_audit("org_1", 10).await.unwrap();
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_secret_roundtrip() {
        let (vault, storage, _) = test_vault();

        vault
            .store(
                NewCredential::new("org_1", Provider::CalCom, "access_abc")
                    .with_refresh_secret("refresh_xyz_123"),
            )
            .await
            .unwrap();

        let refresh = vault
            .retrieve_refresh_secret("org_1", Provider::CalCom)
            .await
            .unwrap();
        assert_eq!(refresh, "refresh_xyz_123");

        let audit = storage.list_audit("org_1", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(
            audit[0].resource_type.as_deref(),
            Some("calcom_refresh_token")
        );
    }

    #[tokio::test]
    async fn test_refresh_secret_absent_is_not_connected() {
        let (vault, _, _) = test_vault();

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_123"))
            .await
            .unwrap();

        let err = vault
            .retrieve_refresh_secret("org_1", Provider::Stripe)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (vault, _, _) = test_vault();

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_123"))
            .await
            .unwrap();

        assert!(vault.remove("org_1", Provider::Stripe).await.unwrap());
        assert!(!vault.remove("org_1", Provider::Stripe).await.unwrap());

        let err = vault.retrieve("org_1", Provider::Stripe).await.unwrap_err();
        assert!(matches!(err, CrmError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_overwrites_secret() {
        let (vault, _, _) = test_vault();

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_old"))
            .await
            .unwrap();
        let first = vault.retrieve("org_1", Provider::Stripe).await.unwrap();

        vault
            .store(NewCredential::new("org_1", Provider::Stripe, "sk_test_new"))
            .await
            .unwrap();
        let second = vault.retrieve("org_1", Provider::Stripe).await.unwrap();

        assert_eq!(second.secret, "sk_test_new");
        assert_eq!(second.credential_id, first.credential_id);
    }
}
