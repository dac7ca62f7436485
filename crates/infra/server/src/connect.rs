//! Connect and disconnect flows.
//!
//! Connecting a provider validates the caller's secret against the live
//! API, stores it encrypted, writes an audit trail, and queues a full
//! backfill. API-key attempts are rate limited per tenant and user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use hubsync_core::{
    secret_preview, AuditEventType, AuditLog, AuditRecord, Clock, CrmError, CrmResult, Provider,
    ProviderCategory, ProviderClient, RateLimitDecision, SlidingWindowLimiter, StorageAdapter,
    SystemClock, SCOPE_DIRECT_API_KEY,
};
use hubsync_events::{SyncQueue, SyncTask, TaskSubmission};
use hubsync_vault::{CredentialVault, NewCredential};

/// Connection attempts allowed per tenant and user inside the window.
const CONNECT_MAX_ATTEMPTS: u32 = 3;
/// Rate limit window in minutes.
const CONNECT_WINDOW_MINUTES: i64 = 15;
/// How long idle rate-limit entries are retained before sweeping.
const LIMITER_RETENTION_HOURS: i64 = 1;

/// Result of a successful connect.
#[derive(Debug)]
pub struct ConnectOutcome {
    /// Provider-side account the credential belongs to.
    pub account_id: Option<String>,
    /// Whether the key is live mode. `None` for OAuth connects.
    pub livemode: Option<bool>,
    /// The queued full backfill. The connect call does not wait for it;
    /// callers that care can await `backfill.done`.
    pub backfill: TaskSubmission,
}

/// Tokens obtained from a provider's OAuth exchange.
#[derive(Debug, Clone)]
pub struct OauthGrant {
    /// The access secret to store.
    pub access_secret: String,
    /// Refresh secret, when the provider issued one.
    pub refresh_secret: Option<String>,
    /// When the access secret expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-side account identifier.
    pub account_id: Option<String>,
    /// Granted scope string.
    pub scope: Option<String>,
}

impl OauthGrant {
    /// A grant holding just an access secret.
    pub fn new(access_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: None,
            expires_at: None,
            account_id: None,
            scope: None,
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

    /// Sets the provider-side account id.
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Sets the granted scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Connects providers for tenants and audits every attempt.
pub struct ConnectService {
    storage: Arc<dyn StorageAdapter>,
    vault: Arc<CredentialVault>,
    queue: SyncQueue,
    providers: HashMap<Provider, Arc<dyn ProviderClient>>,
    limiter: Mutex<SlidingWindowLimiter>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl ConnectService {
    /// Creates a service over the given storage, vault, and task queue.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        vault: Arc<CredentialVault>,
        queue: SyncQueue,
    ) -> Self {
        Self {
            audit: AuditLog::new(storage.clone()),
            storage,
            vault,
            queue,
            providers: HashMap::new(),
            limiter: Mutex::new(SlidingWindowLimiter::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Registers the API client for a provider.
    pub fn with_provider(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    /// Overrides the clock. Tests use this to steer the rate limiter.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connects a provider with a direct API key.
    pub async fn connect_api_key(
        &self,
        tenant_id: &str,
        user_id: &str,
        provider: Provider,
        api_key: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> CrmResult<ConnectOutcome> {
        self.check_rate_limit(tenant_id, user_id, provider, &ip_address, &user_agent)
            .await?;

        if provider.category() == ProviderCategory::Payments
            && !api_key.starts_with("sk_test_")
            && !api_key.starts_with("sk_live_")
        {
            return Err(CrmError::InvalidField {
                field: "api_key".to_string(),
                reason: "payment provider keys start with sk_test_ or sk_live_".to_string(),
            });
        }

        self.check_category_conflict(tenant_id, provider).await?;

        let client = self.client_for(provider)?;
        let account = client.validate_key(api_key).await?;

        // Audit before storing so a storage failure cannot hide the attempt.
        self.audit
            .record(
                AuditRecord::new(tenant_id.to_string(), AuditEventType::ApiKeyConnected)
                    .with_user(user_id)
                    .with_resource(format!("{provider}_token"), account.account_id.clone())
                    .with_origin(ip_address, user_agent)
                    .with_details(json!({
                        "api_key_prefix": secret_preview(api_key),
                        "livemode": account.livemode,
                    })),
            )
            .await;

        self.vault
            .store(
                NewCredential::new(tenant_id, provider, api_key)
                    .with_scope(SCOPE_DIRECT_API_KEY)
                    .with_account(account.account_id.clone()),
            )
            .await?;

        let backfill = self.queue_backfill(tenant_id, provider)?;

        tracing::info!(
            tenant_id,
            provider = %provider,
            account_id = %account.account_id,
            livemode = account.livemode,
            "Provider connected with API key"
        );

        Ok(ConnectOutcome {
            account_id: Some(account.account_id),
            livemode: Some(account.livemode),
            backfill,
        })
    }

    /// Connects a provider with tokens from an OAuth exchange.
    ///
    /// The redirect flow already proved the tokens against the provider,
    /// so no validation call is made here.
    pub async fn connect_oauth(
        &self,
        tenant_id: &str,
        user_id: &str,
        provider: Provider,
        grant: OauthGrant,
    ) -> CrmResult<ConnectOutcome> {
        self.check_category_conflict(tenant_id, provider).await?;

        let OauthGrant {
            access_secret,
            refresh_secret,
            expires_at,
            account_id,
            scope,
        } = grant;

        let mut record = AuditRecord::new(tenant_id.to_string(), AuditEventType::OauthConnected)
            .with_user(user_id)
            .with_details(json!({
                "scope": scope,
                "expires_at": expires_at,
            }));
        if let Some(account_id) = &account_id {
            record = record.with_resource(format!("{provider}_token"), account_id.clone());
        }
        self.audit.record(record).await;

        let mut credential = NewCredential::new(tenant_id, provider, access_secret);
        if let Some(refresh_secret) = refresh_secret {
            credential = credential.with_refresh_secret(refresh_secret);
        }
        if let Some(expires_at) = expires_at {
            credential = credential.with_expiry(expires_at);
        }
        if let Some(scope) = scope {
            credential = credential.with_scope(scope);
        }
        if let Some(account_id) = &account_id {
            credential = credential.with_account(account_id.clone());
        }
        self.vault.store(credential).await?;

        let backfill = self.queue_backfill(tenant_id, provider)?;

        tracing::info!(tenant_id, provider = %provider, "Provider connected via OAuth");

        Ok(ConnectOutcome {
            account_id,
            livemode: None,
            backfill,
        })
    }

    /// Removes a stored credential. Removing an absent credential is not
    /// an error and is not audited.
    pub async fn disconnect(
        &self,
        tenant_id: &str,
        user_id: &str,
        provider: Provider,
    ) -> CrmResult<bool> {
        let stored = self.storage.get_credential(tenant_id, provider).await?;
        let removed = self.vault.remove(tenant_id, provider).await?;
        if !removed {
            return Ok(false);
        }

        let event_type = match stored {
            Some(credential) if credential.is_direct_api_key() => {
                AuditEventType::ApiKeyDisconnected
            }
            _ => AuditEventType::OauthDisconnected,
        };
        self.audit
            .record(AuditRecord::new(tenant_id.to_string(), event_type).with_user(user_id))
            .await;

        tracing::info!(tenant_id, provider = %provider, "Provider disconnected");
        Ok(true)
    }

    async fn check_rate_limit(
        &self,
        tenant_id: &str,
        user_id: &str,
        provider: Provider,
        ip_address: &Option<String>,
        user_agent: &Option<String>,
    ) -> CrmResult<()> {
        let now = self.clock.now();
        let key = format!("connect:{tenant_id}:{user_id}");
        let decision = {
            let mut limiter = self
                .limiter
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            limiter.maybe_cleanup(Duration::hours(LIMITER_RETENTION_HOURS), now);
            limiter.check(
                &key,
                CONNECT_MAX_ATTEMPTS,
                Duration::minutes(CONNECT_WINDOW_MINUTES),
                now,
            )
        };

        if let RateLimitDecision::Limited {
            retry_after_secs, ..
        } = decision
        {
            tracing::warn!(
                tenant_id,
                user_id,
                provider = %provider,
                retry_after_secs,
                "Connect attempt rate limited"
            );
            self.audit
                .record(
                    AuditRecord::new(tenant_id.to_string(), AuditEventType::RateLimitExceeded)
                        .with_user(user_id)
                        .with_origin(ip_address.clone(), user_agent.clone())
                        .with_details(json!({
                            "operation": "connect",
                            "provider": provider.as_str(),
                            "retry_after_secs": retry_after_secs,
                        })),
                )
                .await;
            return Err(CrmError::RateLimitExceeded { retry_after_secs });
        }

        Ok(())
    }

    /// One provider per category; a second provider in an occupied
    /// category is rejected, never silently swapped in.
    async fn check_category_conflict(&self, tenant_id: &str, provider: Provider) -> CrmResult<()> {
        let existing = self.storage.list_credentials(tenant_id).await?;
        for credential in existing {
            if credential.provider != provider
                && credential.provider.category() == provider.category()
            {
                return Err(CrmError::CompetingProvider {
                    provider: provider.to_string(),
                    existing: credential.provider.to_string(),
                });
            }
        }
        Ok(())
    }

    fn client_for(&self, provider: Provider) -> CrmResult<Arc<dyn ProviderClient>> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or_else(|| CrmError::UnknownProvider {
                value: provider.to_string(),
            })
    }

    fn queue_backfill(&self, tenant_id: &str, provider: Provider) -> CrmResult<TaskSubmission> {
        self.queue.submit(SyncTask::Backfill {
            tenant_id: tenant_id.to_string(),
            provider,
            full_resync: true,
        })
    }
}
