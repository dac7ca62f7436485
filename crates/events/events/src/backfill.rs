//! Pulls provider history through the list APIs and replays it through
//! the projector.
//!
//! Backfill is the safety net under the webhook path: anything a missed
//! or mis-ordered event left behind gets picked up on the next run. Both
//! paths share the projector, so replays converge instead of duplicating.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use hubsync_core::{
    ApplyOutcome, BackfillReport, Clock, CrmError, CrmResult, DecryptedCredential, Provider,
    ProviderClient, StorageAdapter, SystemClock,
};
use hubsync_vault::{CredentialVault, NewCredential};

use crate::projections::{
    draft_from_charge, draft_from_invoice, draft_from_payment_intent, str_field, PaymentDraft,
    Projector,
};

/// Overlap subtracted from the incremental cursor, absorbing clock skew
/// between this service and the provider.
const SYNC_OVERLAP_MINUTES: i64 = 15;

// ==================== Backfill Engine ====================

/// Replays provider history into the projection tables.
pub struct BackfillEngine {
    storage: Arc<dyn StorageAdapter>,
    vault: Arc<CredentialVault>,
    providers: HashMap<Provider, Arc<dyn ProviderClient>>,
    projector: Projector,
    clock: Arc<dyn Clock>,
}

impl BackfillEngine {
    /// Creates an engine with no registered providers.
    pub fn new(storage: Arc<dyn StorageAdapter>, vault: Arc<CredentialVault>) -> Self {
        Self {
            projector: Projector::new(storage.clone()),
            storage,
            vault,
            providers: HashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Registers a provider client, keyed by the provider it reports.
    pub fn with_provider(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    /// Overrides the clock. Tests use this to steer expiry and cursors.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs a backfill for one tenant and provider.
    ///
    /// `full_resync` ignores the incremental cursor and pages everything.
    /// The cursor advances to this run's start time, so records written
    /// upstream while the run was paging fall into the next window.
    pub async fn run(
        &self,
        tenant_id: &str,
        provider: Provider,
        full_resync: bool,
    ) -> CrmResult<BackfillReport> {
        let client = self
            .providers
            .get(&provider)
            .ok_or_else(|| CrmError::UnknownProvider {
                value: provider.to_string(),
            })?;

        let credential = self.credential_for_sync(tenant_id, provider, client.as_ref()).await?;
        let run_started_at = self.clock.now();
        let since = if full_resync {
            None
        } else {
            credential
                .last_synced_at
                .map(|at| at - Duration::minutes(SYNC_OVERLAP_MINUTES))
        };

        tracing::info!(
            tenant_id,
            provider = %provider,
            full_resync,
            since = since.map(|s| s.to_rfc3339()).unwrap_or_else(|| "beginning".to_string()),
            "Starting backfill"
        );

        let mut report = BackfillReport::default();
        self.sync_customers(tenant_id, client.as_ref(), &credential, since, &mut report)
            .await;
        self.sync_subscriptions(tenant_id, client.as_ref(), &credential, since, &mut report)
            .await;
        // Invoices land before charges so a charge with a bare invoice
        // reference can resolve its subscription through the stored row.
        self.sync_invoices(tenant_id, client.as_ref(), &credential, since, &mut report)
            .await;
        self.sync_charges(tenant_id, client.as_ref(), &credential, since, &mut report)
            .await;
        self.sync_payment_intents(tenant_id, client.as_ref(), &credential, since, &mut report)
            .await;

        self.storage
            .set_last_synced(tenant_id, provider, run_started_at)
            .await?;

        tracing::info!(
            tenant_id,
            provider = %provider,
            applied = report.applied(),
            skipped = report.skipped,
            failures = report.failures,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Retrieves the credential, refreshing it first when it has expired.
    async fn credential_for_sync(
        &self,
        tenant_id: &str,
        provider: Provider,
        client: &dyn ProviderClient,
    ) -> CrmResult<DecryptedCredential> {
        match self.vault.retrieve(tenant_id, provider).await {
            Ok(credential) => Ok(credential),
            Err(CrmError::CredentialExpired { .. }) => {
                self.refresh_expired(tenant_id, provider, client).await
            }
            Err(err) => Err(err),
        }
    }

    /// Exchanges the refresh secret for a new access secret and stores it.
    ///
    /// Direct API keys have nothing to refresh; an expired one means the
    /// tenant must reconnect.
    async fn refresh_expired(
        &self,
        tenant_id: &str,
        provider: Provider,
        client: &dyn ProviderClient,
    ) -> CrmResult<DecryptedCredential> {
        let stored = self
            .storage
            .get_credential(tenant_id, provider)
            .await?
            .ok_or_else(|| CrmError::not_connected(tenant_id, provider.as_str()))?;

        if stored.is_direct_api_key() {
            return Err(CrmError::expired(tenant_id, provider.as_str()));
        }

        let refresh = match self.vault.retrieve_refresh_secret(tenant_id, provider).await {
            Ok(refresh) => refresh,
            Err(CrmError::NotConnected { .. }) => {
                return Err(CrmError::expired(tenant_id, provider.as_str()));
            }
            Err(err) => return Err(err),
        };

        let refreshed = client.refresh_secret(&refresh).await?;
        let expires_at = self.clock.now()
            + refreshed
                .expires_in_secs
                .map(Duration::seconds)
                .unwrap_or_else(|| Duration::days(365));
        // Providers that do not rotate refresh secrets omit them from the
        // response; the old one stays valid.
        let next_refresh = refreshed.refresh_secret.unwrap_or(refresh);

        let mut input = NewCredential::new(tenant_id, provider, refreshed.secret)
            .with_refresh_secret(next_refresh)
            .with_expiry(expires_at);
        if let Some(scope) = stored.scope.clone() {
            input = input.with_scope(scope);
        }
        if let Some(account_id) = stored.account_id.clone() {
            input = input.with_account(account_id);
        }
        self.vault.store(input).await?;
        tracing::info!(tenant_id, provider = %provider, "Refreshed expired credential");

        self.vault.retrieve(tenant_id, provider).await
    }

    // ==================== Sync Passes ====================

    async fn sync_customers(
        &self,
        tenant_id: &str,
        client: &dyn ProviderClient,
        credential: &DecryptedCredential,
        since: Option<DateTime<Utc>>,
        report: &mut BackfillReport,
    ) {
        let customers = match client.list_customers(&credential.secret, since).await {
            Ok(customers) => customers,
            Err(err) => {
                tracing::error!(tenant_id, error = %err, "Listing customers failed");
                report.failures += 1;
                report.errors.push(format!("list customers: {err}"));
                return;
            }
        };

        for object in customers {
            match self
                .projector
                .upsert_client_from_customer(tenant_id, &object, None)
                .await
            {
                Ok(ApplyOutcome::Applied) => report.customers += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => record_failure(report, "customer", &object, err),
            }
        }
    }

    async fn sync_subscriptions(
        &self,
        tenant_id: &str,
        client: &dyn ProviderClient,
        credential: &DecryptedCredential,
        since: Option<DateTime<Utc>>,
        report: &mut BackfillReport,
    ) {
        let subscriptions = match client.list_subscriptions(&credential.secret, since).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                tracing::error!(tenant_id, error = %err, "Listing subscriptions failed");
                report.failures += 1;
                report.errors.push(format!("list subscriptions: {err}"));
                return;
            }
        };

        for object in subscriptions {
            match self
                .projector
                .upsert_subscription_from_object(tenant_id, &object, None, None)
                .await
            {
                Ok(ApplyOutcome::Applied) => report.subscriptions += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => record_failure(report, "subscription", &object, err),
            }
        }
    }

    async fn sync_invoices(
        &self,
        tenant_id: &str,
        client: &dyn ProviderClient,
        credential: &DecryptedCredential,
        since: Option<DateTime<Utc>>,
        report: &mut BackfillReport,
    ) {
        let invoices = match client.list_paid_invoices(&credential.secret, since).await {
            Ok(invoices) => invoices,
            Err(err) => {
                tracing::error!(tenant_id, error = %err, "Listing invoices failed");
                report.failures += 1;
                report.errors.push(format!("list invoices: {err}"));
                return;
            }
        };

        for object in invoices {
            let draft = draft_from_invoice(&object);
            self.apply_payment_object(tenant_id, &object, "invoice", draft, report)
                .await;
        }
    }

    async fn sync_charges(
        &self,
        tenant_id: &str,
        client: &dyn ProviderClient,
        credential: &DecryptedCredential,
        since: Option<DateTime<Utc>>,
        report: &mut BackfillReport,
    ) {
        let charges = match client.list_charges(&credential.secret, since).await {
            Ok(charges) => charges,
            Err(err) => {
                tracing::error!(tenant_id, error = %err, "Listing charges failed");
                report.failures += 1;
                report.errors.push(format!("list charges: {err}"));
                return;
            }
        };

        for object in charges {
            let draft = draft_from_charge(&object);
            self.apply_payment_object(tenant_id, &object, "charge", draft, report)
                .await;
        }
    }

    async fn sync_payment_intents(
        &self,
        tenant_id: &str,
        client: &dyn ProviderClient,
        credential: &DecryptedCredential,
        since: Option<DateTime<Utc>>,
        report: &mut BackfillReport,
    ) {
        let intents = match client.list_payment_intents(&credential.secret, since).await {
            Ok(intents) => intents,
            Err(err) => {
                tracing::error!(tenant_id, error = %err, "Listing payment intents failed");
                report.failures += 1;
                report.errors.push(format!("list payment intents: {err}"));
                return;
            }
        };

        for object in intents {
            let draft = draft_from_payment_intent(&object);
            self.apply_payment_object(tenant_id, &object, "payment intent", draft, report)
                .await;
        }
    }

    /// Applies one payment-shaped provider object.
    async fn apply_payment_object(
        &self,
        tenant_id: &str,
        object: &Value,
        kind: &str,
        draft: Option<PaymentDraft>,
        report: &mut BackfillReport,
    ) {
        let Some(mut draft) = draft else {
            report.failures += 1;
            report.errors.push(format!("{kind} without an id"));
            return;
        };

        if let Some(customer) = draft.customer_external_id.as_deref() {
            let email_hint = str_field(object, "customer_email")
                .or_else(|| str_field(object, "receipt_email"));
            if let Err(err) = self
                .projector
                .ensure_client(tenant_id, customer, email_hint)
                .await
            {
                record_failure(report, kind, object, err);
                return;
            }
        }

        if draft.subscription_external_id.is_none() {
            match self
                .projector
                .resolve_subscription_from_invoice(tenant_id, &object["invoice"])
                .await
            {
                Ok(subscription) => draft.subscription_external_id = subscription,
                Err(err) => {
                    record_failure(report, kind, object, err);
                    return;
                }
            }
        }

        match self.projector.upsert_payment(tenant_id, draft).await {
            Ok(ApplyOutcome::Applied) => report.payments += 1,
            Ok(_) => report.skipped += 1,
            Err(err) => record_failure(report, kind, object, err),
        }
    }
}

/// Counts a per-record failure without aborting the run.
fn record_failure(report: &mut BackfillReport, kind: &str, object: &Value, err: CrmError) {
    let id = str_field(object, "id").unwrap_or("unknown");
    tracing::warn!(kind, id, error = %err, "Backfill record failed");
    report.failures += 1;
    report.errors.push(format!("{kind} {id}: {err}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use hubsync_core::{ManualClock, PaymentStatus, RefreshedSecret, SubscriptionStatus};
    use hubsync_memory_adapter::MemoryAdapter;
    use hubsync_vault::KeyRing;
    use serde_json::json;
    use std::sync::Mutex;

    const TENANT: &str = "tenant-a";

    /// Scripted provider client recording the windows it was called with.
    #[derive(Default)]
    struct FakeProvider {
        customers: Vec<Value>,
        subscriptions: Vec<Value>,
        charges: Vec<Value>,
        payment_intents: Vec<Value>,
        invoices: Vec<Value>,
        refreshed: Option<RefreshedSecret>,
        windows: Mutex<Vec<Option<DateTime<Utc>>>>,
        fail_charges: bool,
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        fn provider(&self) -> Provider {
            Provider::Stripe
        }

        async fn validate_key(&self, _api_key: &str) -> CrmResult<hubsync_core::ProviderAccount> {
            Ok(hubsync_core::ProviderAccount {
                account_id: "acct_test".to_string(),
                livemode: false,
            })
        }

        async fn refresh_secret(&self, _refresh_secret: &str) -> CrmResult<RefreshedSecret> {
            self.refreshed
                .clone()
                .ok_or_else(|| CrmError::provider("stripe", "refresh unavailable"))
        }

        async fn list_customers(
            &self,
            _secret: &str,
            since: Option<DateTime<Utc>>,
        ) -> CrmResult<Vec<Value>> {
            self.windows.lock().unwrap().push(since);
            Ok(self.customers.clone())
        }

        async fn list_subscriptions(
            &self,
            _secret: &str,
            _since: Option<DateTime<Utc>>,
        ) -> CrmResult<Vec<Value>> {
            Ok(self.subscriptions.clone())
        }

        async fn list_charges(
            &self,
            _secret: &str,
            _since: Option<DateTime<Utc>>,
        ) -> CrmResult<Vec<Value>> {
            if self.fail_charges {
                return Err(CrmError::provider("stripe", "charges endpoint unavailable"));
            }
            Ok(self.charges.clone())
        }

        async fn list_payment_intents(
            &self,
            _secret: &str,
            _since: Option<DateTime<Utc>>,
        ) -> CrmResult<Vec<Value>> {
            Ok(self.payment_intents.clone())
        }

        async fn list_paid_invoices(
            &self,
            _secret: &str,
            _since: Option<DateTime<Utc>>,
        ) -> CrmResult<Vec<Value>> {
            Ok(self.invoices.clone())
        }
    }

    struct Fixture {
        engine: BackfillEngine,
        storage: Arc<MemoryAdapter>,
        vault: Arc<CredentialVault>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(provider: FakeProvider) -> Fixture {
        let storage = Arc::new(MemoryAdapter::new());
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let vault = Arc::new(CredentialVault::new(
            storage.clone(),
            Arc::new(KeyRing::generate()),
            clock.clone(),
        ));
        let engine = BackfillEngine::new(storage.clone(), vault.clone())
            .with_provider(Arc::new(provider))
            .with_clock(clock.clone());
        Fixture {
            engine,
            storage,
            vault,
            clock,
        }
    }

    async fn connect_api_key(fixture: &Fixture) {
        fixture
            .vault
            .store(
                NewCredential::new(TENANT, Provider::Stripe, "sk_test_123")
                    .with_scope(hubsync_core::SCOPE_DIRECT_API_KEY),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_backfill_builds_projections() {
        let provider = FakeProvider {
            customers: vec![json!({ "id": "cus_1", "email": "ada@example.com", "name": "Ada Lovelace" })],
            subscriptions: vec![json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "items": { "data": [
                    { "price": { "id": "price_1", "unit_amount": 4900, "recurring": { "interval": "month" } }, "quantity": 1 },
                ]}
            })],
            invoices: vec![json!({
                "id": "in_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "status": "paid",
                "amount_paid": 4900,
            })],
            charges: vec![json!({
                "id": "ch_1",
                "customer": "cus_1",
                "invoice": "in_1",
                "status": "succeeded",
                "amount": 4900,
            })],
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        let report = fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        assert_eq!(report.customers, 1);
        assert_eq!(report.subscriptions, 1);
        assert_eq!(report.failures, 0);
        // The invoice inserts, the charge for the same (sub, invoice) pair
        // carries a better source and also inserts.
        assert_eq!(report.payments, 2);

        let client = fixture
            .storage
            .get_client_by_external_id(TENANT, "cus_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.mrr_cents, 4900);

        let charge = fixture
            .storage
            .get_payment_by_external_id(TENANT, "ch_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(charge.subscription_external_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_incremental_window_overlaps_cursor() {
        let fixture = fixture(FakeProvider::default()).await;
        connect_api_key(&fixture).await;
        let cursor = Utc.timestamp_opt(1_699_990_000, 0).unwrap();
        fixture
            .storage
            .set_last_synced(TENANT, Provider::Stripe, cursor)
            .await
            .unwrap();

        fixture
            .engine
            .run(TENANT, Provider::Stripe, false)
            .await
            .unwrap();

        // Cursor advanced to the run start.
        let stored = fixture
            .storage
            .get_credential(TENANT, Provider::Stripe)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.last_synced_at,
            Some(fixture.clock.now()),
        );
    }

    #[tokio::test]
    async fn test_incremental_passes_buffered_since() {
        let provider = FakeProvider::default();
        let storage = Arc::new(MemoryAdapter::new());
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let vault = Arc::new(CredentialVault::new(
            storage.clone(),
            Arc::new(KeyRing::generate()),
            clock.clone(),
        ));
        let provider = Arc::new(provider);
        let engine = BackfillEngine::new(storage.clone(), vault.clone())
            .with_provider(provider.clone())
            .with_clock(clock.clone());
        vault
            .store(
                NewCredential::new(TENANT, Provider::Stripe, "sk_test_123")
                    .with_scope(hubsync_core::SCOPE_DIRECT_API_KEY),
            )
            .await
            .unwrap();
        let cursor = Utc.timestamp_opt(1_699_990_000, 0).unwrap();
        storage
            .set_last_synced(TENANT, Provider::Stripe, cursor)
            .await
            .unwrap();

        engine.run(TENANT, Provider::Stripe, false).await.unwrap();
        engine.run(TENANT, Provider::Stripe, true).await.unwrap();

        let windows = provider.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], Some(cursor - Duration::minutes(15)));
        assert_eq!(windows[1], None);
    }

    #[tokio::test]
    async fn test_list_failure_counts_but_other_passes_continue() {
        let provider = FakeProvider {
            customers: vec![json!({ "id": "cus_1" })],
            fail_charges: true,
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        let report = fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        assert_eq!(report.customers, 1);
        assert_eq!(report.failures, 1);
        assert!(report.errors[0].contains("list charges"));
    }

    #[tokio::test]
    async fn test_record_without_id_counts_as_failure() {
        let provider = FakeProvider {
            customers: vec![json!({ "email": "no-id@example.com" })],
            charges: vec![json!({ "amount": 100 })],
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        let report = fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        // The customer without an id is skipped, the charge without an id
        // is a failure.
        assert_eq!(report.customers, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures, 1);
        assert!(report.errors[0].contains("charge without an id"));
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_an_error() {
        let fixture = fixture(FakeProvider::default()).await;

        let err = fixture
            .engine
            .run(TENANT, Provider::Brevo, true)
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::UnknownProvider { .. }));
    }

    #[tokio::test]
    async fn test_expired_oauth_credential_is_refreshed() {
        let provider = FakeProvider {
            refreshed: Some(RefreshedSecret {
                secret: "new-access".to_string(),
                refresh_secret: Some("new-refresh".to_string()),
                expires_in_secs: Some(3600),
            }),
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        fixture
            .vault
            .store(
                NewCredential::new(TENANT, Provider::Stripe, "old-access")
                    .with_refresh_secret("old-refresh")
                    .with_expiry(fixture.clock.now() - Duration::hours(1)),
            )
            .await
            .unwrap();

        fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        let refreshed = fixture
            .vault
            .retrieve(TENANT, Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(refreshed.secret, "new-access");
        assert_eq!(
            refreshed.expires_at,
            Some(fixture.clock.now() + Duration::seconds(3600)),
        );
        let next_refresh = fixture
            .vault
            .retrieve_refresh_secret(TENANT, Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(next_refresh, "new-refresh");
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_secret_when_provider_omits_it() {
        let provider = FakeProvider {
            refreshed: Some(RefreshedSecret {
                secret: "new-access".to_string(),
                refresh_secret: None,
                expires_in_secs: None,
            }),
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        fixture
            .vault
            .store(
                NewCredential::new(TENANT, Provider::Stripe, "old-access")
                    .with_refresh_secret("old-refresh")
                    .with_expiry(fixture.clock.now() - Duration::hours(1)),
            )
            .await
            .unwrap();

        fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        let next_refresh = fixture
            .vault
            .retrieve_refresh_secret(TENANT, Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(next_refresh, "old-refresh");
        let refreshed = fixture
            .vault
            .retrieve(TENANT, Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(
            refreshed.expires_at,
            Some(fixture.clock.now() + Duration::days(365)),
        );
    }

    #[tokio::test]
    async fn test_expired_api_key_requires_reconnect() {
        let fixture = fixture(FakeProvider::default()).await;
        fixture
            .vault
            .store(
                NewCredential::new(TENANT, Provider::Stripe, "sk_test_123")
                    .with_scope(hubsync_core::SCOPE_DIRECT_API_KEY)
                    .with_expiry(fixture.clock.now() - Duration::hours(1)),
            )
            .await
            .unwrap();

        let err = fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::CredentialExpired { .. }));
    }

    #[tokio::test]
    async fn test_replay_converges_with_webhook_state() {
        // A charge already applied through the webhook path arrives again
        // via backfill with identical content; nothing duplicates.
        let provider = FakeProvider {
            charges: vec![json!({
                "id": "ch_1",
                "customer": "cus_1",
                "status": "succeeded",
                "amount": 4900,
                "created": 1_699_999_000,
            })],
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        let processor = crate::EventProcessor::new(fixture.storage.clone());
        processor
            .apply_event(
                TENANT,
                "charge.succeeded",
                &json!({
                    "created": 1_699_999_000,
                    "data": { "object": {
                        "id": "ch_1",
                        "customer": "cus_1",
                        "status": "succeeded",
                        "amount": 4900,
                        "created": 1_699_999_000,
                    }}
                }),
            )
            .await
            .unwrap();

        let report = fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        let payments = fixture.storage.list_payments(TENANT).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Succeeded);
        assert_eq!(report.payments, 1);
        assert_eq!(fixture.storage.list_clients(TENANT).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backfilled_refunded_charge_lands_refunded() {
        let provider = FakeProvider {
            charges: vec![json!({
                "id": "ch_1",
                "customer": "cus_1",
                "status": "succeeded",
                "refunded": true,
                "amount": 4900,
            })],
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        let payment = fixture
            .storage
            .get_payment_by_external_id(TENANT, "ch_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_backfill_subscription_marks_active_holder() {
        let provider = FakeProvider {
            subscriptions: vec![json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "trialing",
                "plan": { "amount": 900, "interval": "month" },
            })],
            ..Default::default()
        };
        let fixture = fixture(provider).await;
        connect_api_key(&fixture).await;

        fixture
            .engine
            .run(TENANT, Provider::Stripe, true)
            .await
            .unwrap();

        let subscription = fixture
            .storage
            .get_subscription_by_external_id(TENANT, "sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Trialing);
        assert_eq!(subscription.mrr_cents, 900);
    }
}
