//! # HubSync Memory Adapter
//!
//! An in-memory storage adapter for HubSync, primarily intended for
//! testing and development purposes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hubsync_memory_adapter::MemoryAdapter;
//!
//! let adapter = Arc::new(MemoryAdapter::new());
//! let vault = CredentialVault::new(adapter.clone(), ring, clock);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hubsync_core::error::{CrmError, CrmResult};
use hubsync_core::traits::StorageAdapter;
use hubsync_core::types::{
    AuditRecord, ClientRecord, Credential, Payment, Provider, RawEvent, Recommendation,
    Subscription,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage for a single entity type.
type Store<T> = Arc<RwLock<HashMap<String, T>>>;

fn credential_key(tenant_id: &str, provider: Provider) -> String {
    format!("{tenant_id}:{provider}")
}

fn scoped_key(tenant_id: &str, external_id: &str) -> String {
    format!("{tenant_id}:{external_id}")
}

/// In-memory storage adapter for HubSync.
///
/// This adapter stores all data in memory and is suitable for testing
/// and development. Data is lost when the process exits.
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    credentials: Store<Credential>,
    raw_events: Store<RawEvent>,
    clients: Store<ClientRecord>,
    subscriptions: Store<Subscription>,
    payments: Store<Payment>,
    recommendations: Arc<RwLock<Vec<Recommendation>>>,
    audit: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAdapter {
    /// Creates a new in-memory adapter.
    pub fn new() -> Self {
        Self {
            credentials: Arc::new(RwLock::new(HashMap::new())),
            raw_events: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            payments: Arc::new(RwLock::new(HashMap::new())),
            recommendations: Arc::new(RwLock::new(Vec::new())),
            audit: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Clears all stored data.
    pub async fn clear(&self) {
        self.credentials.write().await.clear();
        self.raw_events.write().await.clear();
        self.clients.write().await.clear();
        self.subscriptions.write().await.clear();
        self.payments.write().await.clear();
        self.recommendations.write().await.clear();
        self.audit.write().await.clear();
    }

    /// Returns the number of credentials stored across all tenants.
    pub async fn credential_count(&self) -> usize {
        self.credentials.read().await.len()
    }

    /// Returns the number of raw events stored across all tenants.
    pub async fn raw_event_count(&self) -> usize {
        self.raw_events.read().await.len()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    // ==================== Credential Operations ====================

    async fn upsert_credential(&self, credential: &Credential) -> CrmResult<Credential> {
        let mut credentials = self.credentials.write().await;
        let key = credential_key(&credential.tenant_id, credential.provider);

        // Reconnecting keeps the row identity, creation time, and sync
        // cursor; secrets and metadata are replaced.
        let stored = match credentials.get(&key) {
            Some(existing) => {
                let mut updated = credential.clone();
                updated.id = existing.id.clone();
                updated.created_at = existing.created_at;
                updated.last_synced_at = existing.last_synced_at;
                updated
            }
            None => credential.clone(),
        };

        credentials.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_credential(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> CrmResult<Option<Credential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials.get(&credential_key(tenant_id, provider)).cloned())
    }

    async fn find_credential_by_account(
        &self,
        provider: Provider,
        account_id: &str,
    ) -> CrmResult<Option<Credential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .values()
            .find(|c| c.provider == provider && c.account_id.as_deref() == Some(account_id))
            .cloned())
    }

    async fn first_credential_for_provider(
        &self,
        provider: Provider,
    ) -> CrmResult<Option<Credential>> {
        let credentials = self.credentials.read().await;
        // Oldest connection wins so the answer is stable across calls.
        Ok(credentials
            .values()
            .filter(|c| c.provider == provider)
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .cloned())
    }

    async fn list_credentials(&self, tenant_id: &str) -> CrmResult<Vec<Credential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete_credential(&self, tenant_id: &str, provider: Provider) -> CrmResult<bool> {
        let mut credentials = self.credentials.write().await;
        Ok(credentials
            .remove(&credential_key(tenant_id, provider))
            .is_some())
    }

    async fn set_last_synced(
        &self,
        tenant_id: &str,
        provider: Provider,
        at: DateTime<Utc>,
    ) -> CrmResult<()> {
        let mut credentials = self.credentials.write().await;
        // A credential removed mid-sync makes this a no-op, not an error.
        if let Some(credential) = credentials.get_mut(&credential_key(tenant_id, provider)) {
            credential.last_synced_at = Some(at);
            credential.updated_at = at;
        }
        Ok(())
    }

    // ==================== Raw Event Operations ====================

    async fn insert_raw_event(&self, event: &RawEvent) -> CrmResult<RawEvent> {
        // One write lock spans the duplicate check and the insert, so two
        // concurrent deliveries of the same event cannot both succeed.
        let mut raw_events = self.raw_events.write().await;
        let key = scoped_key(&event.tenant_id, &event.external_event_id);

        if raw_events.contains_key(&key) {
            return Err(CrmError::duplicate_event(
                &event.tenant_id,
                &event.external_event_id,
            ));
        }

        raw_events.insert(key, event.clone());
        Ok(event.clone())
    }

    async fn get_raw_event(
        &self,
        tenant_id: &str,
        external_event_id: &str,
    ) -> CrmResult<Option<RawEvent>> {
        let raw_events = self.raw_events.read().await;
        Ok(raw_events
            .get(&scoped_key(tenant_id, external_event_id))
            .cloned())
    }

    async fn mark_event_processed(
        &self,
        tenant_id: &str,
        external_event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> CrmResult<()> {
        let mut raw_events = self.raw_events.write().await;
        let event = raw_events
            .get_mut(&scoped_key(tenant_id, external_event_id))
            .ok_or_else(|| {
                CrmError::not_found("raw_event", "external_event_id", external_event_id)
            })?;
        event.processed = true;
        event.processed_at = Some(processed_at);
        Ok(())
    }

    async fn list_unprocessed_events(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> CrmResult<Vec<RawEvent>> {
        let raw_events = self.raw_events.read().await;
        let mut pending: Vec<RawEvent> = raw_events
            .values()
            .filter(|e| e.tenant_id == tenant_id && !e.processed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.received_at, &a.id).cmp(&(b.received_at, &b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn count_raw_events(&self, tenant_id: &str) -> CrmResult<usize> {
        let raw_events = self.raw_events.read().await;
        Ok(raw_events
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .count())
    }

    // ==================== Projection Operations ====================

    async fn upsert_client(&self, client: &ClientRecord) -> CrmResult<ClientRecord> {
        let mut clients = self.clients.write().await;
        clients.insert(client.id.clone(), client.clone());
        Ok(client.clone())
    }

    async fn get_client_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<ClientRecord>> {
        let clients = self.clients.read().await;
        Ok(clients
            .values()
            .find(|c| c.tenant_id == tenant_id && c.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_client_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> CrmResult<Option<ClientRecord>> {
        let clients = self.clients.read().await;
        Ok(clients
            .values()
            .find(|c| c.tenant_id == tenant_id && c.email == email)
            .cloned())
    }

    async fn list_clients(&self, tenant_id: &str) -> CrmResult<Vec<ClientRecord>> {
        let clients = self.clients.read().await;
        Ok(clients
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> CrmResult<Subscription> {
        let mut subscriptions = self.subscriptions.write().await;
        let key = scoped_key(&subscription.tenant_id, &subscription.external_id);
        subscriptions.insert(key, subscription.clone());
        Ok(subscription.clone())
    }

    async fn get_subscription_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.get(&scoped_key(tenant_id, external_id)).cloned())
    }

    async fn list_subscriptions(&self, tenant_id: &str) -> CrmResult<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn upsert_payment(&self, payment: &Payment) -> CrmResult<Payment> {
        let mut payments = self.payments.write().await;
        let key = scoped_key(&payment.tenant_id, &payment.external_id);
        payments.insert(key, payment.clone());
        Ok(payment.clone())
    }

    async fn get_payment_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> CrmResult<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&scoped_key(tenant_id, external_id)).cloned())
    }

    async fn list_payments(&self, tenant_id: &str) -> CrmResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete_payment(&self, tenant_id: &str, external_id: &str) -> CrmResult<bool> {
        let mut payments = self.payments.write().await;
        Ok(payments.remove(&scoped_key(tenant_id, external_id)).is_some())
    }

    async fn insert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> CrmResult<Recommendation> {
        let mut recommendations = self.recommendations.write().await;
        recommendations.push(recommendation.clone());
        Ok(recommendation.clone())
    }

    async fn list_recommendations(&self, tenant_id: &str) -> CrmResult<Vec<Recommendation>> {
        let recommendations = self.recommendations.read().await;
        Ok(recommendations
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .rev()
            .cloned()
            .collect())
    }

    // ==================== Audit Operations ====================

    async fn append_audit(&self, record: &AuditRecord) -> CrmResult<()> {
        let mut audit = self.audit.write().await;
        audit.push(record.clone());
        Ok(())
    }

    async fn list_audit(&self, tenant_id: &str, limit: usize) -> CrmResult<Vec<AuditRecord>> {
        let audit = self.audit.read().await;
        Ok(audit
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsync_core::types::AuditEventType;
    use serde_json::json;

    fn event(tenant_id: &str, external_event_id: &str) -> RawEvent {
        RawEvent::new(
            tenant_id.to_string(),
            external_event_id.to_string(),
            "charge.succeeded".to_string(),
            json!({ "id": external_event_id }),
        )
    }

    #[tokio::test]
    async fn test_duplicate_raw_event_rejected() {
        let adapter = MemoryAdapter::new();

        adapter
            .insert_raw_event(&event("org_1", "evt_1"))
            .await
            .unwrap();
        let err = adapter
            .insert_raw_event(&event("org_1", "evt_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::DuplicateEvent { .. }));

        // Same external id under another tenant is a different event.
        adapter
            .insert_raw_event(&event("org_2", "evt_1"))
            .await
            .unwrap();
        assert_eq!(adapter.raw_event_count().await, 2);
    }

    #[tokio::test]
    async fn test_mark_event_processed() {
        let adapter = MemoryAdapter::new();
        adapter
            .insert_raw_event(&event("org_1", "evt_1"))
            .await
            .unwrap();

        let now = Utc::now();
        adapter
            .mark_event_processed("org_1", "evt_1", now)
            .await
            .unwrap();

        let stored = adapter
            .get_raw_event("org_1", "evt_1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.processed);
        assert_eq!(stored.processed_at, Some(now));

        let pending = adapter.list_unprocessed_events("org_1", 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unprocessed_events_oldest_first() {
        let adapter = MemoryAdapter::new();

        let mut first = event("org_1", "evt_a");
        first.received_at = Utc::now() - chrono::Duration::minutes(5);
        let second = event("org_1", "evt_b");

        adapter.insert_raw_event(&second).await.unwrap();
        adapter.insert_raw_event(&first).await.unwrap();

        let pending = adapter.list_unprocessed_events("org_1", 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].external_event_id, "evt_a");
    }

    #[tokio::test]
    async fn test_credential_reconnect_preserves_identity() {
        let adapter = MemoryAdapter::new();

        let first = Credential::new("org_1".to_string(), Provider::Stripe, "v1:aaa".to_string());
        let stored = adapter.upsert_credential(&first).await.unwrap();

        adapter
            .set_last_synced("org_1", Provider::Stripe, Utc::now())
            .await
            .unwrap();

        let second = Credential::new("org_1".to_string(), Provider::Stripe, "v1:bbb".to_string());
        let replaced = adapter.upsert_credential(&second).await.unwrap();

        assert_eq!(replaced.id, stored.id);
        assert_eq!(replaced.created_at, stored.created_at);
        assert_eq!(replaced.encrypted_secret, "v1:bbb");
        assert!(replaced.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_find_credential_by_account() {
        let adapter = MemoryAdapter::new();

        let mut credential =
            Credential::new("org_1".to_string(), Provider::Stripe, "v1:aaa".to_string());
        credential.account_id = Some("acct_123".to_string());
        adapter.upsert_credential(&credential).await.unwrap();

        let found = adapter
            .find_credential_by_account(Provider::Stripe, "acct_123")
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.tenant_id), Some("org_1".to_string()));

        let missing = adapter
            .find_credential_by_account(Provider::Stripe, "acct_other")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_payment_upsert_and_delete_by_external_id() {
        let adapter = MemoryAdapter::new();

        let payment = Payment::new(
            "org_1".to_string(),
            "ch_1".to_string(),
            5000,
            hubsync_core::types::PaymentStatus::Succeeded,
            hubsync_core::types::PaymentSource::Charge,
        );
        adapter.upsert_payment(&payment).await.unwrap();

        assert!(adapter
            .get_payment_by_external_id("org_1", "ch_1")
            .await
            .unwrap()
            .is_some());
        assert!(adapter.delete_payment("org_1", "ch_1").await.unwrap());
        assert!(!adapter.delete_payment("org_1", "ch_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_audit_listing_newest_first_with_limit() {
        let adapter = MemoryAdapter::new();

        for index in 0..5 {
            let record = AuditRecord::new("org_1".to_string(), AuditEventType::TokenDecrypted)
                .with_details(json!({ "index": index }));
            adapter.append_audit(&record).await.unwrap();
        }

        let listed = adapter.list_audit("org_1", 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].details["index"], 4);
        assert_eq!(listed[2].details["index"], 2);
    }
}
