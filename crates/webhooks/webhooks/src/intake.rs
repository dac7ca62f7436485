//! Webhook intake: verify, resolve the tenant, persist, process, ack.
//!
//! The guiding rule is to ack nearly everything. A non-200 makes the
//! provider redeliver, and redelivering a payload we already know we
//! cannot use only builds a retry queue of garbage. The single 400 is
//! for bodies that cannot even be parsed, where redelivery is the only
//! hope of ever seeing the event.

use std::sync::Arc;

use hubsync_core::{CrmError, CrmResult, Provider, RawEvent, StorageAdapter, DEFAULT_TENANT_ID};
use hubsync_events::EventProcessor;

use crate::payload::ProviderEvent;
use crate::signature::{WebhookSigner, DEFAULT_TOLERANCE_SECS};

// ==================== Configuration ====================

/// Settings for one intake endpoint.
pub struct IntakeConfig {
    /// The provider whose deliveries this endpoint accepts.
    pub provider: Provider,
    /// Shared secret the provider signs deliveries with.
    pub signing_secret: String,
    /// Tenant used when no credential resolves the delivery.
    pub default_tenant_id: String,
    /// Signature timestamp tolerance in seconds.
    pub tolerance_secs: i64,
}

impl IntakeConfig {
    /// Creates a config with the default tenant and tolerance.
    pub fn new(provider: Provider, signing_secret: impl Into<String>) -> Self {
        Self {
            provider,
            signing_secret: signing_secret.into(),
            default_tenant_id: DEFAULT_TENANT_ID.to_string(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Overrides the fallback tenant.
    pub fn with_default_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.default_tenant_id = tenant_id.into();
        self
    }

    /// Overrides the signature timestamp tolerance.
    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }
}

/// What the HTTP layer should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeResponse {
    pub status: u16,
    pub body: &'static str,
}

const ACK_RECEIVED: IntakeResponse = IntakeResponse {
    status: 200,
    body: "Webhook received",
};
const ACK_DUPLICATE: IntakeResponse = IntakeResponse {
    status: 200,
    body: "Event already processed",
};
const ACK_BAD_SIGNATURE: IntakeResponse = IntakeResponse {
    status: 200,
    body: "Invalid signature",
};
const REJECT_BAD_PAYLOAD: IntakeResponse = IntakeResponse {
    status: 400,
    body: "Invalid payload",
};

// ==================== Intake ====================

/// Receives webhook deliveries for one provider.
pub struct WebhookIntake {
    storage: Arc<dyn StorageAdapter>,
    processor: Arc<EventProcessor>,
    signer: WebhookSigner,
    provider: Provider,
    default_tenant_id: String,
    tolerance_secs: i64,
}

impl WebhookIntake {
    /// Creates an intake endpoint.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        processor: Arc<EventProcessor>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            storage,
            processor,
            signer: WebhookSigner::new(config.signing_secret),
            provider: config.provider,
            default_tenant_id: config.default_tenant_id,
            tolerance_secs: config.tolerance_secs,
        }
    }

    /// Handles one delivery: raw body plus the signature header, if the
    /// request carried one.
    pub async fn handle(&self, body: &[u8], signature_header: Option<&str>) -> IntakeResponse {
        let Some(header) = signature_header else {
            tracing::warn!(provider = %self.provider, "Webhook without signature header");
            return ACK_BAD_SIGNATURE;
        };
        if let Err(err) = self.signer.verify_header(header, body, self.tolerance_secs) {
            tracing::warn!(
                provider = %self.provider,
                error = %err,
                "Webhook signature verification failed"
            );
            return ACK_BAD_SIGNATURE;
        }

        let event = match ProviderEvent::parse(body) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(provider = %self.provider, error = %err, "Webhook body rejected");
                return REJECT_BAD_PAYLOAD;
            }
        };

        let tenant_id = match self.resolve_tenant(event.account_id.as_deref()).await {
            Ok(tenant_id) => tenant_id,
            Err(err) => {
                tracing::error!(
                    provider = %self.provider,
                    external_event_id = %event.external_event_id,
                    error = %err,
                    "Tenant resolution failed, acking for redelivery"
                );
                return ACK_RECEIVED;
            }
        };

        self.record_and_process(&tenant_id, event).await
    }

    async fn record_and_process(&self, tenant_id: &str, event: ProviderEvent) -> IntakeResponse {
        let raw = RawEvent::new(
            tenant_id.to_string(),
            event.external_event_id,
            event.event_type,
            event.payload,
        );

        let raw = match self.storage.insert_raw_event(&raw).await {
            Ok(raw) => raw,
            Err(CrmError::DuplicateEvent {
                external_event_id, ..
            }) => {
                tracing::debug!(
                    tenant_id,
                    external_event_id,
                    "Duplicate delivery, already recorded"
                );
                return ACK_DUPLICATE;
            }
            Err(err) => {
                tracing::error!(
                    tenant_id,
                    error = %err,
                    "Failed to record webhook event, acking for redelivery"
                );
                return ACK_RECEIVED;
            }
        };

        // Processing failures keep the ack: the row is durable with
        // processed = false, so replay picks it up without another
        // delivery from the provider.
        match self.processor.process_raw(&raw).await {
            Ok(outcome) => {
                tracing::debug!(
                    tenant_id,
                    external_event_id = %raw.external_event_id,
                    event_type = %raw.event_type,
                    ?outcome,
                    "Webhook event applied"
                );
            }
            Err(err) => {
                tracing::error!(
                    tenant_id,
                    external_event_id = %raw.external_event_id,
                    event_type = %raw.event_type,
                    error = %err,
                    "Event processing failed, event stays unprocessed"
                );
            }
        }
        ACK_RECEIVED
    }

    /// Maps a delivery to its tenant through the stored credentials.
    async fn resolve_tenant(&self, account_id: Option<&str>) -> CrmResult<String> {
        if let Some(account_id) = account_id {
            if let Some(credential) = self
                .storage
                .find_credential_by_account(self.provider, account_id)
                .await?
            {
                return Ok(credential.tenant_id);
            }
            tracing::warn!(
                provider = %self.provider,
                account_id,
                "No credential matches the delivery's account id"
            );
        }

        if let Some(credential) = self
            .storage
            .first_credential_for_provider(self.provider)
            .await?
        {
            return Ok(credential.tenant_id);
        }

        tracing::warn!(
            provider = %self.provider,
            "No credential for provider, using the default tenant"
        );
        Ok(self.default_tenant_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hubsync_core::Credential;
    use hubsync_memory_adapter::MemoryAdapter;
    use serde_json::{json, Value};

    const SECRET: &str = "whsec_test";

    struct Fixture {
        intake: WebhookIntake,
        storage: Arc<MemoryAdapter>,
        signer: WebhookSigner,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryAdapter::new());
        let processor = Arc::new(EventProcessor::new(storage.clone()));
        let intake = WebhookIntake::new(
            storage.clone(),
            processor,
            IntakeConfig::new(Provider::Stripe, SECRET),
        );
        Fixture {
            intake,
            storage,
            signer: WebhookSigner::new(SECRET),
        }
    }

    fn signed(signer: &WebhookSigner, body: &Value) -> (Vec<u8>, String) {
        let bytes = body.to_string().into_bytes();
        let header = signer.sign_header(Utc::now().timestamp(), &bytes);
        (bytes, header)
    }

    fn customer_event(event_id: &str) -> Value {
        json!({
            "id": event_id,
            "type": "customer.created",
            "created": 1_700_000_000,
            "data": { "object": { "id": "cus_1", "email": "ada@example.com" } },
        })
    }

    #[tokio::test]
    async fn test_happy_path_records_and_processes() {
        let fixture = fixture();
        let (body, header) = signed(&fixture.signer, &customer_event("evt_1"));

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, ACK_RECEIVED);
        let raw = fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .unwrap();
        assert!(raw.processed);
        assert!(fixture
            .storage
            .get_client_by_external_id(DEFAULT_TENANT_ID, "cus_1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_signature_acks_without_recording() {
        let fixture = fixture();
        let body = customer_event("evt_1").to_string().into_bytes();

        let response = fixture.intake.handle(&body, None).await;

        assert_eq!(response, ACK_BAD_SIGNATURE);
        assert!(fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_wrong_secret_acks_without_recording() {
        let fixture = fixture();
        let forger = WebhookSigner::new("whsec_wrong");
        let (body, header) = signed(&forger, &customer_event("evt_1"));

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, ACK_BAD_SIGNATURE);
        assert!(fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_rejected() {
        let fixture = fixture();
        let body = customer_event("evt_1").to_string().into_bytes();
        let header = fixture
            .signer
            .sign_header(Utc::now().timestamp() - 3600, &body);

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, ACK_BAD_SIGNATURE);
    }

    #[tokio::test]
    async fn test_tampered_body_is_rejected() {
        let fixture = fixture();
        let (_, header) = signed(&fixture.signer, &customer_event("evt_1"));
        let tampered = customer_event("evt_other").to_string().into_bytes();

        let response = fixture.intake.handle(&tampered, Some(&header)).await;

        assert_eq!(response, ACK_BAD_SIGNATURE);
    }

    #[tokio::test]
    async fn test_malformed_body_is_the_only_400() {
        let fixture = fixture();
        let body = b"{not json".to_vec();
        let header = fixture.signer.sign_header(Utc::now().timestamp(), &body);

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, REJECT_BAD_PAYLOAD);
    }

    #[tokio::test]
    async fn test_event_without_id_is_rejected() {
        let fixture = fixture();
        let body = json!({ "type": "charge.succeeded" }).to_string().into_bytes();
        let header = fixture.signer.sign_header(Utc::now().timestamp(), &body);

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, REJECT_BAD_PAYLOAD);
    }

    #[tokio::test]
    async fn test_redelivery_is_acked_once_processed() {
        let fixture = fixture();
        let (body, header) = signed(&fixture.signer, &customer_event("evt_1"));

        let first = fixture.intake.handle(&body, Some(&header)).await;
        let second = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(first, ACK_RECEIVED);
        assert_eq!(second, ACK_DUPLICATE);
        assert_eq!(
            fixture.storage.list_clients(DEFAULT_TENANT_ID).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_account_id_routes_to_owning_tenant() {
        let fixture = fixture();
        let mut credential = Credential::new(
            "tenant-b".to_string(),
            Provider::Stripe,
            "sealed".to_string(),
        );
        credential.account_id = Some("acct_b".to_string());
        fixture.storage.upsert_credential(&credential).await.unwrap();

        let mut event = customer_event("evt_1");
        event["account"] = json!("acct_b");
        let (body, header) = signed(&fixture.signer, &event);

        fixture.intake.handle(&body, Some(&header)).await;

        assert!(fixture
            .storage
            .get_raw_event("tenant-b", "evt_1")
            .await
            .unwrap()
            .is_some());
        assert!(fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_account_falls_back_to_first_credential() {
        let fixture = fixture();
        let credential = Credential::new(
            "tenant-b".to_string(),
            Provider::Stripe,
            "sealed".to_string(),
        );
        fixture.storage.upsert_credential(&credential).await.unwrap();

        let mut event = customer_event("evt_1");
        event["account"] = json!("acct_nobody");
        let (body, header) = signed(&fixture.signer, &event);

        fixture.intake.handle(&body, Some(&header)).await;

        assert!(fixture
            .storage
            .get_raw_event("tenant-b", "evt_1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_no_credentials_fall_back_to_default_tenant() {
        let fixture = fixture();
        let (body, header) = signed(&fixture.signer, &customer_event("evt_1"));

        fixture.intake.handle(&body, Some(&header)).await;

        assert!(fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_event_type_still_acks_and_marks_processed() {
        let fixture = fixture();
        let event = json!({
            "id": "evt_1",
            "type": "account.external_account.created",
            "data": { "object": {} },
        });
        let (body, header) = signed(&fixture.signer, &event);

        let response = fixture.intake.handle(&body, Some(&header)).await;

        assert_eq!(response, ACK_RECEIVED);
        let raw = fixture
            .storage
            .get_raw_event(DEFAULT_TENANT_ID, "evt_1")
            .await
            .unwrap()
            .unwrap();
        assert!(raw.processed);
    }
}
