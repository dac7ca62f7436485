//! Core data types for HubSync.
//!
//! This module defines the tenant-scoped records that flow through the
//! system: credentials, raw webhook events, the synced projections
//! (clients, subscriptions, payments), and audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CrmError;

/// Tenant id used when webhook tenant resolution finds no matching
/// credential. Single-tenant fallback; see the intake documentation.
pub const DEFAULT_TENANT_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Scope tag marking a credential created from a directly entered API key.
/// Such credentials never expire and are never refreshed.
pub const SCOPE_DIRECT_API_KEY: &str = "direct_api_key";

/// An external SaaS system integrated via OAuth or API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    Brevo,
    #[serde(rename = "calcom")]
    CalCom,
    Calendly,
}

/// Functional category of a provider. At most one provider per category
/// may be connected for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Payments,
    EmailMarketing,
    Scheduling,
}

impl Provider {
    /// Stable string form used in storage keys and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Brevo => "brevo",
            Self::CalCom => "calcom",
            Self::Calendly => "calendly",
        }
    }

    /// The category this provider belongs to.
    pub fn category(&self) -> ProviderCategory {
        match self {
            Self::Stripe => ProviderCategory::Payments,
            Self::Brevo => ProviderCategory::EmailMarketing,
            Self::CalCom | Self::Calendly => ProviderCategory::Scheduling,
        }
    }

    /// Parses a provider from its string form.
    pub fn parse(value: &str) -> Result<Self, CrmError> {
        match value {
            "stripe" => Ok(Self::Stripe),
            "brevo" => Ok(Self::Brevo),
            "calcom" => Ok(Self::CalCom),
            "calendly" => Ok(Self::Calendly),
            other => Err(CrmError::UnknownProvider {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An encrypted third-party credential stored per tenant and provider.
///
/// The secret fields hold versioned encryption envelopes
/// (`v<N>:<base64>`), never plaintext. At most one credential exists per
/// `(tenant_id, provider)` pair; reconnecting overwrites in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Unique identifier for the credential
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The external provider this credential authenticates against
    pub provider: Provider,

    /// Encrypted access secret (OAuth access token or API key)
    pub encrypted_secret: String,

    /// Encrypted refresh secret, when the provider issued one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_refresh_secret: Option<String>,

    /// Expiry of the access secret. `None` means non-expiring (API key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scope tag, e.g. `direct_api_key` or the OAuth scope string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// The provider-side account identifier, used for webhook tenant
    /// resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Cursor for incremental backfill
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Timestamp when the credential was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when the credential was last updated
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Creates a new credential holding an already-encrypted secret.
    pub fn new(tenant_id: String, provider: Provider, encrypted_secret: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            provider,
            encrypted_secret,
            encrypted_refresh_secret: None,
            expires_at: None,
            scope: None,
            account_id: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks whether the credential has expired as of `now`.
    ///
    /// A credential without an expiry never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now,
            None => false,
        }
    }

    /// Whether this credential came from a directly entered API key.
    pub fn is_direct_api_key(&self) -> bool {
        self.scope.as_deref() == Some(SCOPE_DIRECT_API_KEY)
    }
}

/// A decrypted credential returned by the vault.
///
/// Holds the plaintext secret for immediate use; callers must not
/// persist or log it.
#[derive(Debug, Clone)]
pub struct DecryptedCredential {
    /// The stored credential's id
    pub credential_id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The external provider
    pub provider: Provider,

    /// Decrypted access secret
    pub secret: String,

    /// Scope tag carried from the stored credential
    pub scope: Option<String>,

    /// Provider-side account identifier
    pub account_id: Option<String>,

    /// Expiry carried from the stored credential
    pub expires_at: Option<DateTime<Utc>>,

    /// Cursor for incremental backfill
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A webhook event recorded durably before any processing.
///
/// `(tenant_id, external_event_id)` is the idempotency key: the storage
/// adapter rejects a second insert for the same pair, which is what makes
/// redelivery a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Unique identifier for the stored event row
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The provider's own event id (e.g. `evt_...`)
    pub external_event_id: String,

    /// The provider's event type string (e.g. `charge.succeeded`)
    pub event_type: String,

    /// Verbatim event payload as delivered
    pub payload: Value,

    /// When the event was recorded
    pub received_at: DateTime<Utc>,

    /// Whether the processor has successfully applied this event
    #[serde(default)]
    pub processed: bool,

    /// When processing completed, if it has
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// Creates a new unprocessed event.
    pub fn new(
        tenant_id: String,
        external_event_id: String,
        event_type: String,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            external_event_id,
            event_type,
            payload,
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
        }
    }
}

/// A unified client/lead record, synced from provider customer data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Unique identifier for the client row
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The provider-side customer id (e.g. `cus_...`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// Contact email
    pub email: String,

    /// First name parsed from the provider's display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    /// Last name parsed from the provider's display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    /// Sales lifecycle state (`cold_lead` for newly synced clients)
    pub lifecycle_state: String,

    /// Monthly recurring revenue in cents, summed over active subscriptions
    #[serde(default)]
    pub mrr_cents: i64,

    /// Lifetime revenue in cents, recomputed from succeeded payments
    #[serde(default)]
    pub lifetime_revenue_cents: i64,

    /// The provider's own last-update timestamp for this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,

    /// Timestamp when the row was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when the row was last updated
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state assigned to clients first seen via provider sync.
pub const LIFECYCLE_COLD_LEAD: &str = "cold_lead";

impl ClientRecord {
    /// Creates a new client record in the default lifecycle state.
    pub fn new(tenant_id: String, email: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            external_id: None,
            email,
            first_name: None,
            last_name: None,
            lifecycle_state: LIFECYCLE_COLD_LEAD.to_string(),
            mrr_cents: 0,
            lifetime_revenue_cents: 0,
            source_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Subscription status, parsed defensively from the provider's string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    /// Parses a provider status string, defaulting to `Active` for
    /// unrecognized values.
    pub fn from_provider(value: &str) -> Self {
        match value {
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" | "cancelled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Active,
        }
    }

    /// Whether this status counts toward a client's MRR.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

/// A synced subscription projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier for the subscription row
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The provider-side subscription id (e.g. `sub_...`)
    pub external_id: String,

    /// The provider-side customer this subscription belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_external_id: Option<String>,

    /// Current status
    pub status: SubscriptionStatus,

    /// Price/plan id from the first subscription item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    /// Normalized monthly recurring revenue in cents
    #[serde(default)]
    pub mrr_cents: i64,

    /// Current billing period start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,

    /// Current billing period end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,

    /// Whether the subscription cancels at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,

    /// The provider's own last-update timestamp for this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,

    /// Timestamp when the row was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when the row was last updated
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates a new subscription projection.
    pub fn new(tenant_id: String, external_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            external_id,
            customer_external_id: None,
            status: SubscriptionStatus::Active,
            plan_id: None,
            mrr_cents: 0,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            source_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
    Refunded,
}

/// Which provider object a payment projection was built from.
///
/// One real-world payment can surface as a charge, a payment intent, and
/// an invoice; dedup prefers the source with the higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    Charge,
    PaymentIntent,
    Invoice,
}

impl PaymentSource {
    /// Dedup priority: higher wins when the same payment is seen through
    /// multiple provider objects.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Charge => 3,
            Self::PaymentIntent => 2,
            Self::Invoice => 1,
        }
    }
}

/// A synced payment projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Unique identifier for the payment row
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The provider-side object id (`ch_...`, `pi_...`, or `in_...`)
    pub external_id: String,

    /// The provider-side customer this payment belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_external_id: Option<String>,

    /// Amount in cents
    pub amount_cents: i64,

    /// ISO currency code
    pub currency: String,

    /// Payment status
    pub status: PaymentStatus,

    /// Which provider object this projection came from
    pub source: PaymentSource,

    /// Linked subscription, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_external_id: Option<String>,

    /// Linked invoice, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_external_id: Option<String>,

    /// Receipt or hosted invoice URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_url: Option<String>,

    /// The provider's creation timestamp for the object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_created_at: Option<DateTime<Utc>>,

    /// The provider's own last-update timestamp for this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,

    /// Timestamp when the row was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when the row was last updated
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a new payment projection.
    pub fn new(
        tenant_id: String,
        external_id: String,
        amount_cents: i64,
        status: PaymentStatus,
        source: PaymentSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            external_id,
            customer_external_id: None,
            amount_cents,
            currency: "usd".to_string(),
            status,
            source,
            subscription_external_id: None,
            invoice_external_id: None,
            receipt_url: None,
            source_created_at: None,
            source_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An operator-facing follow-up generated by the pipeline, e.g. a payment
/// recovery task raised when a charge fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Unique identifier
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// The provider-side customer the recommendation concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_external_id: Option<String>,

    /// Recommendation kind (e.g. `payment_recovery`)
    pub kind: String,

    /// Workflow status (`pending` until acted on)
    pub status: String,

    /// Human-readable context
    pub message: String,

    /// Timestamp when the recommendation was created
    pub created_at: DateTime<Utc>,
}

/// Kind of recommendation raised on failed payments.
pub const RECOMMENDATION_PAYMENT_RECOVERY: &str = "payment_recovery";

/// Initial workflow status for new recommendations.
pub const RECOMMENDATION_PENDING: &str = "pending";

impl Recommendation {
    /// Creates a pending payment-recovery recommendation.
    pub fn payment_recovery(
        tenant_id: String,
        customer_external_id: Option<String>,
        message: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            customer_external_id,
            kind: RECOMMENDATION_PAYMENT_RECOVERY.to_string(),
            status: RECOMMENDATION_PENDING.to_string(),
            message,
            created_at: Utc::now(),
        }
    }
}

/// Security-sensitive operations recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ApiKeyConnected,
    ApiKeyDisconnected,
    OauthConnected,
    OauthDisconnected,
    TokenAccessed,
    TokenDecrypted,
    RateLimitExceeded,
    UnauthorizedAccess,
}

impl AuditEventType {
    /// Stable string form stored with audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKeyConnected => "api_key_connected",
            Self::ApiKeyDisconnected => "api_key_disconnected",
            Self::OauthConnected => "oauth_connected",
            Self::OauthDisconnected => "oauth_disconnected",
            Self::TokenAccessed => "token_accessed",
            Self::TokenDecrypted => "token_decrypted",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::UnauthorizedAccess => "unauthorized_access",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique identifier
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// Acting user, when the operation was user-initiated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// What happened
    pub event_type: AuditEventType,

    /// Kind of resource touched (e.g. `stripe_token`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    /// Identifier of the resource touched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// Client IP, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Client user agent, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Structured context. Never contains secrets; token material is
    /// reduced to a truncated preview before it gets here.
    pub details: Value,

    /// Timestamp when the entry was recorded
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a new audit record with empty details.
    pub fn new(tenant_id: String, event_type: AuditEventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            user_id: None,
            event_type,
            resource_type: None,
            resource_id: None,
            ip_address: None,
            user_agent: None,
            details: Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Sets the acting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the touched resource.
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Sets the request origin.
    pub fn with_origin(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Sets the structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Outcome of applying a single event to the projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event mutated at least one projection.
    Applied,
    /// The event type is not handled; accepted and skipped.
    Ignored,
    /// The record was discarded: older than the stored projection under
    /// the timestamp tie-break, or already covered by a better-sourced
    /// payment record.
    Stale,
}

/// Summary of a backfill run. Per-record failures are counted and
/// collected; they never abort the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Customers upserted
    pub customers: usize,
    /// Subscriptions upserted
    pub subscriptions: usize,
    /// Payments upserted
    pub payments: usize,
    /// Records skipped by dedup or the timestamp tie-break
    pub skipped: usize,
    /// Records that failed to apply
    pub failures: usize,
    /// Error strings for the failed records
    pub errors: Vec<String>,
}

impl BackfillReport {
    /// Total records that applied successfully.
    pub fn applied(&self) -> usize {
        self.customers + self.subscriptions + self.payments
    }
}

/// Summary of a reconcile run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Clients whose aggregates were examined
    pub clients_checked: usize,
    /// Clients whose aggregates had drifted and were corrected
    pub clients_updated: usize,
}
