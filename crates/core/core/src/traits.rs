//! Core traits for HubSync.
//!
//! This module defines the trait seams between the pipeline and the
//! outside world: `StorageAdapter` for persistence and `ProviderClient`
//! for the third-party APIs (which are opaque HTTP services as far as
//! the core is concerned).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CrmResult;
use crate::types::{
    AuditRecord, ClientRecord, Credential, Payment, Provider, RawEvent, Recommendation,
    Subscription,
};

/// Trait for storage adapters (database backends).
///
/// Adapters implement this trait to provide persistence for credentials,
/// raw events, projections, and audit records. All rows are scoped by
/// tenant id.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // ==================== Credential Operations ====================

    /// Inserts or replaces the credential for its `(tenant_id, provider)`
    /// pair. `created_at` is preserved when a row already exists.
    async fn upsert_credential(&self, credential: &Credential) -> CrmResult<Credential>;

    /// Gets the credential for a tenant and provider.
    async fn get_credential(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> CrmResult<Option<Credential>>;

    /// Finds the credential whose provider-side account id matches.
    async fn find_credential_by_account(
        &self,
        provider: Provider,
        account_id: &str,
    ) -> CrmResult<Option<Credential>>;

    /// Returns some credential for the provider, if any tenant has one.
    /// Used as the webhook tenant-resolution fallback.
    async fn first_credential_for_provider(
        &self,
        provider: Provider,
    ) -> CrmResult<Option<Credential>>;

    /// Lists all credentials for a tenant.
    async fn list_credentials(&self, tenant_id: &str) -> CrmResult<Vec<Credential>>;

    /// Deletes the credential for a tenant and provider. Returns whether
    /// a row existed; deleting an absent row is not an error.
    async fn delete_credential(&self, tenant_id: &str, provider: Provider) -> CrmResult<bool>;

    /// Advances the incremental-sync cursor for a credential.
    async fn set_last_synced(
        &self,
        tenant_id: &str,
        provider: Provider,
        at: DateTime<Utc>,
    ) -> CrmResult<()>;

    // ==================== Raw Event Operations ====================

    /// Inserts a raw event, enforcing the `(tenant_id, external_event_id)`
    /// uniqueness atomically with the insert. A second insert for the same
    /// pair fails with `CrmError::DuplicateEvent`; there must be no window
    /// in which two concurrent inserts can both succeed.
    async fn insert_raw_event(&self, event: &RawEvent) -> CrmResult<RawEvent>;

    /// Gets a raw event by its idempotency key.
    async fn get_raw_event(
        &self,
        tenant_id: &str,
        external_event_id: &str,
    ) -> CrmResult<Option<RawEvent>>;

    /// Marks an event processed. Only called after the processor completed
    /// without error.
    async fn mark_event_processed(
        &self,
        tenant_id: &str,
        external_event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> CrmResult<()>;

    /// Lists events still awaiting processing, oldest first.
    async fn list_unprocessed_events(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> CrmResult<Vec<RawEvent>>;

    /// Counts stored raw events for a tenant.
    async fn count_raw_events(&self, _tenant_id: &str) -> CrmResult<usize> {
        Ok(0)
    }

    // ==================== Projection Operations ====================

    /// Inserts or updates a client record keyed by id.
    async fn upsert_client(&self, client: &ClientRecord) -> CrmResult<ClientRecord>;

    /// Gets a client by the provider-side customer id.
    async fn get_client_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<ClientRecord>>;

    /// Gets a client by email.
    async fn get_client_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> CrmResult<Option<ClientRecord>>;

    /// Lists all clients for a tenant.
    async fn list_clients(&self, tenant_id: &str) -> CrmResult<Vec<ClientRecord>>;

    /// Inserts or updates a subscription keyed by its external id.
    async fn upsert_subscription(&self, subscription: &Subscription) -> CrmResult<Subscription>;

    /// Gets a subscription by the provider-side id.
    async fn get_subscription_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<Subscription>>;

    /// Lists all subscriptions for a tenant.
    async fn list_subscriptions(&self, tenant_id: &str) -> CrmResult<Vec<Subscription>>;

    /// Lists the subscriptions belonging to one provider-side customer.
    async fn list_subscriptions_for_customer(
        &self,
        tenant_id: &str,
        customer_external_id: &str,
    ) -> CrmResult<Vec<Subscription>> {
        let subscriptions = self.list_subscriptions(tenant_id).await?;
        Ok(subscriptions
            .into_iter()
            .filter(|s| s.customer_external_id.as_deref() == Some(customer_external_id))
            .collect())
    }

    /// Inserts or updates a payment keyed by its external id.
    async fn upsert_payment(&self, payment: &Payment) -> CrmResult<Payment>;

    /// Gets a payment by the provider-side id.
    async fn get_payment_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<Payment>>;

    /// Lists all payments for a tenant.
    async fn list_payments(&self, tenant_id: &str) -> CrmResult<Vec<Payment>>;

    /// Deletes a payment row. Used when a higher-priority source replaces
    /// a lower-priority record of the same real-world payment.
    async fn delete_payment(&self, tenant_id: &str, external_id: &str) -> CrmResult<bool>;

    /// Records a recommendation.
    async fn insert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> CrmResult<Recommendation>;

    /// Lists recommendations for a tenant, newest first.
    async fn list_recommendations(&self, tenant_id: &str) -> CrmResult<Vec<Recommendation>>;

    // ==================== Audit Operations ====================

    /// Appends an audit record. The audit log is append-only.
    async fn append_audit(&self, record: &AuditRecord) -> CrmResult<()>;

    /// Lists audit records for a tenant, newest first.
    async fn list_audit(&self, tenant_id: &str, limit: usize) -> CrmResult<Vec<AuditRecord>>;
}

/// Account information returned when a provider validates an API key.
#[derive(Debug, Clone)]
pub struct ProviderAccount {
    /// The provider-side account identifier.
    pub account_id: String,
    /// Whether the key is a live-mode key.
    pub livemode: bool,
}

/// A refreshed access secret returned by a provider's token endpoint.
#[derive(Debug, Clone)]
pub struct RefreshedSecret {
    /// The new access secret.
    pub secret: String,
    /// A replacement refresh secret, when the provider rotated it.
    pub refresh_secret: Option<String>,
    /// Lifetime of the new secret in seconds, when the provider says.
    pub expires_in_secs: Option<i64>,
}

/// Trait for third-party provider APIs.
///
/// The concrete HTTP clients live outside the core; everything here is
/// expressed over raw `serde_json::Value` objects because provider
/// response shapes are tolerated, not modeled. List methods default to
/// empty so providers without a given object kind need not implement
/// them.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which provider this client talks to.
    fn provider(&self) -> Provider;

    /// Validates an API key against the provider and returns the account
    /// it belongs to.
    async fn validate_key(&self, api_key: &str) -> CrmResult<ProviderAccount>;

    /// Exchanges a refresh secret for a new access secret.
    async fn refresh_secret(&self, refresh_secret: &str) -> CrmResult<RefreshedSecret> {
        let _ = refresh_secret;
        Err(crate::error::CrmError::provider(
            self.provider().as_str(),
            "token refresh not supported",
        ))
    }

    /// Lists customer objects updated since the given time.
    async fn list_customers(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let _ = (secret, since);
        Ok(Vec::new())
    }

    /// Lists subscription objects updated since the given time.
    async fn list_subscriptions(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let _ = (secret, since);
        Ok(Vec::new())
    }

    /// Lists charge objects created since the given time.
    async fn list_charges(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let _ = (secret, since);
        Ok(Vec::new())
    }

    /// Lists payment-intent objects created since the given time.
    async fn list_payment_intents(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let _ = (secret, since);
        Ok(Vec::new())
    }

    /// Lists paid invoice objects created since the given time.
    async fn list_paid_invoices(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let _ = (secret, since);
        Ok(Vec::new())
    }
}
