//! Projection upserts shared by the live event path and backfill.
//!
//! Both paths funnel provider objects through the same `Projector`, so a
//! record converges to the same row no matter which path saw it first.
//! Updates apply last-writer-wins by the external system's own timestamp,
//! never by arrival order.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use hubsync_core::{
    ApplyOutcome, ClientRecord, CrmResult, Payment, PaymentSource, PaymentStatus, StorageAdapter,
    Subscription, SubscriptionStatus,
};

// ==================== Field Extraction ====================

/// Reads a string field from a JSON object.
pub(crate) fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// Reads an integer field from a JSON object.
pub(crate) fn i64_field(object: &Value, key: &str) -> Option<i64> {
    object.get(key).and_then(Value::as_i64)
}

/// Resolves an expandable reference to its id: providers send either a
/// bare string id or an expanded object carrying an `id` field.
pub(crate) fn expandable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(_) => str_field(value, "id").map(str::to_string),
        _ => None,
    }
}

/// Converts an epoch-seconds field to a timestamp.
pub(crate) fn epoch_field(object: &Value, key: &str) -> Option<DateTime<Utc>> {
    i64_field(object, key).and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// The timestamp a record carries about itself: the object's `updated`,
/// else its `created`, else the enclosing event's `created`.
pub(crate) fn source_timestamp(
    object: &Value,
    event_created: Option<i64>,
) -> Option<DateTime<Utc>> {
    epoch_field(object, "updated")
        .or_else(|| epoch_field(object, "created"))
        .or_else(|| event_created.and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

/// Whether an incoming record is strictly older than the stored one.
/// Missing timestamps never make a record stale.
pub(crate) fn is_stale(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (incoming, stored) {
        (Some(new), Some(old)) => new < old,
        _ => false,
    }
}

/// Placeholder email for customers that arrive without one.
pub(crate) fn fallback_email(customer_external_id: &str) -> String {
    let prefix: String = customer_external_id.chars().take(8).collect();
    format!("customer_{prefix}@stripe.test")
}

// ==================== MRR ====================

/// Normalizes a recurring amount to its monthly equivalent in cents.
fn monthly_cents(amount_cents: i64, interval: &str) -> i64 {
    match interval {
        "year" => amount_cents / 12,
        "week" => (amount_cents as f64 * 4.33).round() as i64,
        "day" => amount_cents * 30,
        _ => amount_cents,
    }
}

/// Computes a subscription's MRR in cents from its items.
///
/// Each item contributes `unit_amount x quantity` normalized to monthly.
/// Sparse test-mode objects carry no items; those fall back to a
/// top-level plan amount and interval.
pub fn mrr_from_subscription(object: &Value) -> i64 {
    let items = object
        .pointer("/items/data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    if items.is_empty() {
        let amount = object
            .pointer("/plan/amount")
            .and_then(Value::as_i64)
            .or_else(|| i64_field(object, "amount"))
            .unwrap_or(0);
        let interval = object
            .pointer("/plan/interval")
            .and_then(Value::as_str)
            .or_else(|| str_field(object, "interval"))
            .unwrap_or("month");
        return monthly_cents(amount, interval);
    }

    items
        .iter()
        .map(|item| {
            let unit_amount = item
                .pointer("/price/unit_amount")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let quantity = i64_field(item, "quantity").unwrap_or(1);
            let interval = item
                .pointer("/price/recurring/interval")
                .and_then(Value::as_str)
                .unwrap_or("month");
            monthly_cents(unit_amount * quantity, interval)
        })
        .sum()
}

// ==================== Payment Drafts ====================

/// Everything the pipeline knows about a payment before it becomes a row.
///
/// Built by the event handlers and the backfill extractors, then applied
/// through [`Projector::upsert_payment`].
#[derive(Debug, Clone)]
pub struct PaymentDraft {
    pub external_id: String,
    pub customer_external_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub source: PaymentSource,
    pub subscription_external_id: Option<String>,
    pub invoice_external_id: Option<String>,
    pub receipt_url: Option<String>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

/// Builds a payment draft from a charge object. `None` when the object
/// has no id.
pub fn draft_from_charge(object: &Value) -> Option<PaymentDraft> {
    let external_id = str_field(object, "id")?.to_string();
    let refunded = object
        .get("refunded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let status = if refunded {
        PaymentStatus::Refunded
    } else {
        match str_field(object, "status") {
            Some("succeeded") => PaymentStatus::Succeeded,
            Some("pending") => PaymentStatus::Pending,
            Some("failed") => PaymentStatus::Failed,
            _ => {
                if object.get("paid").and_then(Value::as_bool).unwrap_or(false) {
                    PaymentStatus::Succeeded
                } else {
                    PaymentStatus::Failed
                }
            }
        }
    };

    Some(PaymentDraft {
        external_id,
        customer_external_id: expandable_id(&object["customer"]),
        amount_cents: i64_field(object, "amount").unwrap_or(0),
        currency: str_field(object, "currency").unwrap_or("usd").to_string(),
        status,
        source: PaymentSource::Charge,
        subscription_external_id: None,
        invoice_external_id: expandable_id(&object["invoice"]),
        receipt_url: str_field(object, "receipt_url").map(str::to_string),
        source_created_at: epoch_field(object, "created"),
        source_updated_at: source_timestamp(object, None),
    })
}

/// Builds a payment draft from a payment-intent object.
pub fn draft_from_payment_intent(object: &Value) -> Option<PaymentDraft> {
    let external_id = str_field(object, "id")?.to_string();
    let status = match str_field(object, "status").unwrap_or("") {
        "succeeded" => PaymentStatus::Succeeded,
        "requires_payment_method" | "canceled" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    };

    Some(PaymentDraft {
        external_id,
        customer_external_id: expandable_id(&object["customer"]),
        amount_cents: i64_field(object, "amount").unwrap_or(0),
        currency: str_field(object, "currency").unwrap_or("usd").to_string(),
        status,
        source: PaymentSource::PaymentIntent,
        subscription_external_id: None,
        invoice_external_id: expandable_id(&object["invoice"]),
        receipt_url: None,
        source_created_at: epoch_field(object, "created"),
        source_updated_at: source_timestamp(object, None),
    })
}

/// Builds a payment draft from an invoice object.
pub fn draft_from_invoice(object: &Value) -> Option<PaymentDraft> {
    let external_id = str_field(object, "id")?.to_string();
    let paid = object.get("paid").and_then(Value::as_bool).unwrap_or(false);
    let status = match str_field(object, "status") {
        Some("paid") => PaymentStatus::Succeeded,
        _ if paid => PaymentStatus::Succeeded,
        Some("uncollectible") => PaymentStatus::Failed,
        Some("open") | Some("void") => {
            let attempts = i64_field(object, "attempt_count").unwrap_or(0);
            let payment_error = object
                .get("last_payment_error")
                .is_some_and(|e| !e.is_null());
            if attempts > 0 && !payment_error {
                PaymentStatus::Pending
            } else {
                PaymentStatus::Failed
            }
        }
        _ => PaymentStatus::Pending,
    };

    Some(PaymentDraft {
        invoice_external_id: Some(external_id.clone()),
        external_id,
        customer_external_id: expandable_id(&object["customer"]),
        amount_cents: i64_field(object, "amount_paid")
            .filter(|v| *v != 0)
            .or_else(|| i64_field(object, "amount_due"))
            .unwrap_or(0),
        currency: str_field(object, "currency").unwrap_or("usd").to_string(),
        status,
        source: PaymentSource::Invoice,
        subscription_external_id: expandable_id(&object["subscription"]),
        receipt_url: str_field(object, "hosted_invoice_url").map(str::to_string),
        source_created_at: epoch_field(object, "created"),
        source_updated_at: source_timestamp(object, None),
    })
}

// ==================== Projector ====================

/// Applies provider objects to the projection tables.
pub struct Projector {
    storage: Arc<dyn StorageAdapter>,
}

impl Projector {
    /// Creates a projector over the given storage.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Inserts or updates a client from a provider customer object.
    ///
    /// Matches an existing row by external id first, then by email,
    /// linking the external id when the match came through email.
    /// Lifecycle state is only set at creation.
    pub async fn upsert_client_from_customer(
        &self,
        tenant_id: &str,
        object: &Value,
        event_created: Option<i64>,
    ) -> CrmResult<ApplyOutcome> {
        let Some(external_id) = str_field(object, "id").map(str::to_string) else {
            tracing::debug!(tenant_id, "Customer object without an id, skipping");
            return Ok(ApplyOutcome::Ignored);
        };

        let email = str_field(object, "email").map(str::to_string);
        let (first_name, last_name) = split_name(str_field(object, "name"));
        let incoming_ts = source_timestamp(object, event_created);

        let mut existing = self
            .storage
            .get_client_by_external_id(tenant_id, &external_id)
            .await?;
        if existing.is_none() {
            if let Some(email) = email.as_deref() {
                existing = self.storage.get_client_by_email(tenant_id, email).await?;
            }
        }

        match existing {
            Some(mut client) => {
                if is_stale(incoming_ts, client.source_updated_at) {
                    return Ok(ApplyOutcome::Stale);
                }
                client.external_id = Some(external_id);
                if let Some(email) = email {
                    client.email = email;
                }
                if first_name.is_some() {
                    client.first_name = first_name;
                    client.last_name = last_name;
                }
                if incoming_ts.is_some() {
                    client.source_updated_at = incoming_ts;
                }
                client.updated_at = Utc::now();
                self.storage.upsert_client(&client).await?;
            }
            None => {
                let email = email.unwrap_or_else(|| fallback_email(&external_id));
                let mut client = ClientRecord::new(tenant_id.to_string(), email);
                client.external_id = Some(external_id);
                client.first_name = first_name;
                client.last_name = last_name;
                client.source_updated_at = incoming_ts;
                self.storage.upsert_client(&client).await?;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Finds the client a payment should attach to, creating a stub when
    /// the customer has never been seen.
    ///
    /// An email hint from the payment object lets an existing row without
    /// a provider link be matched and linked instead of duplicated.
    pub async fn ensure_client(
        &self,
        tenant_id: &str,
        customer_external_id: &str,
        email_hint: Option<&str>,
    ) -> CrmResult<ClientRecord> {
        if let Some(client) = self
            .storage
            .get_client_by_external_id(tenant_id, customer_external_id)
            .await?
        {
            return Ok(client);
        }

        if let Some(email) = email_hint {
            if let Some(mut client) = self.storage.get_client_by_email(tenant_id, email).await? {
                if client.external_id.is_none() {
                    client.external_id = Some(customer_external_id.to_string());
                    client.updated_at = Utc::now();
                    client = self.storage.upsert_client(&client).await?;
                    tracing::info!(
                        tenant_id,
                        customer_external_id,
                        "Linked existing client to provider customer by email"
                    );
                }
                return Ok(client);
            }
        }

        let email = email_hint
            .map(str::to_string)
            .unwrap_or_else(|| fallback_email(customer_external_id));
        let mut client = ClientRecord::new(tenant_id.to_string(), email);
        client.external_id = Some(customer_external_id.to_string());
        let created = self.storage.upsert_client(&client).await?;
        tracing::info!(
            tenant_id,
            customer_external_id,
            "Created client for unseen provider customer"
        );
        Ok(created)
    }

    /// Inserts or updates a subscription from a provider subscription
    /// object, then recomputes the owning client's MRR.
    ///
    /// `forced_status` overrides the object's own status; the created and
    /// deleted event handlers use it.
    pub async fn upsert_subscription_from_object(
        &self,
        tenant_id: &str,
        object: &Value,
        forced_status: Option<SubscriptionStatus>,
        event_created: Option<i64>,
    ) -> CrmResult<ApplyOutcome> {
        let Some(external_id) = str_field(object, "id").map(str::to_string) else {
            tracing::debug!(tenant_id, "Subscription object without an id, skipping");
            return Ok(ApplyOutcome::Ignored);
        };

        let status = forced_status.unwrap_or_else(|| {
            str_field(object, "status")
                .map(SubscriptionStatus::from_provider)
                .unwrap_or(SubscriptionStatus::Active)
        });
        let customer_external_id = expandable_id(&object["customer"]);
        let mrr_cents = mrr_from_subscription(object);
        let plan_id = object
            .pointer("/items/data/0/price/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let period_start = epoch_field(object, "current_period_start");
        let period_end = epoch_field(object, "current_period_end");
        let cancel_at_period_end = object
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let incoming_ts = source_timestamp(object, event_created);

        let existing = self
            .storage
            .get_subscription_by_external_id(tenant_id, &external_id)
            .await?;

        let (outcome, owner) = match existing {
            Some(mut subscription) => {
                if is_stale(incoming_ts, subscription.source_updated_at) {
                    (ApplyOutcome::Stale, None)
                } else {
                    subscription.status = status;
                    subscription.mrr_cents = mrr_cents;
                    subscription.current_period_start = period_start;
                    subscription.current_period_end = period_end;
                    subscription.cancel_at_period_end = cancel_at_period_end;
                    if plan_id.is_some() {
                        subscription.plan_id = plan_id;
                    }
                    if customer_external_id.is_some() {
                        subscription.customer_external_id = customer_external_id;
                    }
                    if incoming_ts.is_some() {
                        subscription.source_updated_at = incoming_ts;
                    }
                    subscription.updated_at = Utc::now();
                    let owner = subscription.customer_external_id.clone();
                    self.storage.upsert_subscription(&subscription).await?;
                    (ApplyOutcome::Applied, owner)
                }
            }
            None => {
                let mut subscription = Subscription::new(tenant_id.to_string(), external_id);
                subscription.customer_external_id = customer_external_id;
                subscription.status = status;
                subscription.plan_id = plan_id;
                subscription.mrr_cents = mrr_cents;
                subscription.current_period_start = period_start;
                subscription.current_period_end = period_end;
                subscription.cancel_at_period_end = cancel_at_period_end;
                subscription.source_updated_at = incoming_ts;
                let owner = subscription.customer_external_id.clone();
                self.storage.upsert_subscription(&subscription).await?;
                (ApplyOutcome::Applied, owner)
            }
        };

        if outcome == ApplyOutcome::Applied {
            if let Some(customer) = owner.as_deref() {
                self.recompute_client_mrr(tenant_id, customer).await?;
            }
        }
        Ok(outcome)
    }

    /// Makes sure an invoice-referenced subscription exists.
    ///
    /// Invoices can arrive before their `customer.subscription.created`
    /// event; the invoice amount stands in as monthly MRR until a real
    /// subscription object is seen. Existing rows with a nonzero MRR are
    /// left alone.
    pub async fn ensure_subscription_from_invoice(
        &self,
        tenant_id: &str,
        subscription_external_id: &str,
        customer_external_id: Option<&str>,
        amount_cents: i64,
        event_created: Option<i64>,
    ) -> CrmResult<()> {
        let existing = self
            .storage
            .get_subscription_by_external_id(tenant_id, subscription_external_id)
            .await?;

        let owner = match existing {
            Some(mut subscription) => {
                if subscription.mrr_cents != 0 {
                    return Ok(());
                }
                subscription.mrr_cents = amount_cents;
                subscription.status = SubscriptionStatus::Active;
                subscription.updated_at = Utc::now();
                let owner = subscription
                    .customer_external_id
                    .clone()
                    .or_else(|| customer_external_id.map(str::to_string));
                self.storage.upsert_subscription(&subscription).await?;
                owner
            }
            None => {
                let now = Utc::now();
                let mut subscription =
                    Subscription::new(tenant_id.to_string(), subscription_external_id.to_string());
                subscription.customer_external_id = customer_external_id.map(str::to_string);
                subscription.status = SubscriptionStatus::Active;
                subscription.mrr_cents = amount_cents;
                subscription.current_period_start = Some(now);
                subscription.current_period_end = Some(now + Duration::days(30));
                subscription.source_updated_at =
                    event_created.and_then(|secs| DateTime::from_timestamp(secs, 0));
                tracing::info!(
                    tenant_id,
                    subscription_external_id,
                    mrr_cents = amount_cents,
                    "Creating subscription from invoice amount"
                );
                self.storage.upsert_subscription(&subscription).await?;
                customer_external_id.map(str::to_string)
            }
        };

        if let Some(customer) = owner.as_deref() {
            self.recompute_client_mrr(tenant_id, customer).await?;
        }
        Ok(())
    }

    /// Recomputes a client's MRR as the sum of its active subscriptions.
    pub async fn recompute_client_mrr(
        &self,
        tenant_id: &str,
        customer_external_id: &str,
    ) -> CrmResult<()> {
        let Some(mut client) = self
            .storage
            .get_client_by_external_id(tenant_id, customer_external_id)
            .await?
        else {
            return Ok(());
        };

        let subscriptions = self
            .storage
            .list_subscriptions_for_customer(tenant_id, customer_external_id)
            .await?;
        let total: i64 = subscriptions
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| s.mrr_cents)
            .sum();

        if client.mrr_cents != total {
            client.mrr_cents = total;
            client.updated_at = Utc::now();
            self.storage.upsert_client(&client).await?;
        }
        Ok(())
    }

    /// Resolves the subscription a charge belongs to through its invoice
    /// reference. An expanded invoice carries the subscription directly; a
    /// bare invoice id is matched against a previously stored invoice
    /// payment.
    pub async fn resolve_subscription_from_invoice(
        &self,
        tenant_id: &str,
        invoice_ref: &Value,
    ) -> CrmResult<Option<String>> {
        match invoice_ref {
            Value::Object(_) => Ok(expandable_id(&invoice_ref["subscription"])),
            Value::String(invoice_id) => {
                let payment = self
                    .storage
                    .get_payment_by_external_id(tenant_id, invoice_id)
                    .await?;
                Ok(payment.and_then(|p| p.subscription_external_id))
            }
            _ => Ok(None),
        }
    }

    /// Inserts or updates a payment row.
    ///
    /// Existing rows (matched by external id) update under the
    /// last-writer-wins rule. New successful payments pass through the
    /// duplicate checks first: one real-world payment can surface as a
    /// charge, a payment intent, and an invoice, and only the best-sourced
    /// record should be inserted. Failed payments are never deduplicated;
    /// every retry attempt is kept.
    pub async fn upsert_payment(
        &self,
        tenant_id: &str,
        draft: PaymentDraft,
    ) -> CrmResult<ApplyOutcome> {
        if let Some(mut payment) = self
            .storage
            .get_payment_by_external_id(tenant_id, &draft.external_id)
            .await?
        {
            if is_stale(draft.source_updated_at, payment.source_updated_at) {
                return Ok(ApplyOutcome::Stale);
            }
            payment.customer_external_id = draft.customer_external_id;
            payment.amount_cents = draft.amount_cents;
            payment.currency = draft.currency;
            payment.status = draft.status;
            payment.source = draft.source;
            payment.subscription_external_id = draft.subscription_external_id;
            payment.invoice_external_id = draft.invoice_external_id;
            payment.receipt_url = draft.receipt_url;
            if draft.source_updated_at.is_some() {
                payment.source_updated_at = draft.source_updated_at;
            }
            payment.updated_at = Utc::now();
            self.storage.upsert_payment(&payment).await?;
            return Ok(ApplyOutcome::Applied);
        }

        if draft.status == PaymentStatus::Succeeded && self.is_duplicate(tenant_id, &draft).await? {
            return Ok(ApplyOutcome::Stale);
        }

        let mut payment = Payment::new(
            tenant_id.to_string(),
            draft.external_id,
            draft.amount_cents,
            draft.status,
            draft.source,
        );
        payment.customer_external_id = draft.customer_external_id;
        payment.currency = draft.currency;
        payment.subscription_external_id = draft.subscription_external_id;
        payment.invoice_external_id = draft.invoice_external_id;
        payment.receipt_url = draft.receipt_url;
        payment.source_created_at = draft.source_created_at;
        payment.source_updated_at = draft.source_updated_at;
        self.storage.upsert_payment(&payment).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Duplicate checks for new successful payments.
    async fn is_duplicate(&self, tenant_id: &str, draft: &PaymentDraft) -> CrmResult<bool> {
        let existing = self.storage.list_payments(tenant_id).await?;

        // A better-sourced record for the same subscription and invoice
        // already covers this payment.
        if let (Some(subscription), Some(invoice)) = (
            draft.subscription_external_id.as_deref(),
            draft.invoice_external_id.as_deref(),
        ) {
            let covered = existing.iter().any(|p| {
                p.status == PaymentStatus::Succeeded
                    && p.external_id != draft.external_id
                    && p.subscription_external_id.as_deref() == Some(subscription)
                    && p.invoice_external_id.as_deref() == Some(invoice)
                    && p.source.priority() > draft.source.priority()
            });
            if covered {
                tracing::debug!(
                    tenant_id,
                    external_id = %draft.external_id,
                    subscription,
                    invoice,
                    "Skipping payment already covered for this subscription and invoice"
                );
                return Ok(true);
            }
        }

        // An invoice record adds nothing once a charge or intent for the
        // same invoice is stored.
        if draft.source == PaymentSource::Invoice {
            if let Some(invoice) = draft.invoice_external_id.as_deref() {
                let covered = existing.iter().any(|p| {
                    p.status == PaymentStatus::Succeeded
                        && p.source != PaymentSource::Invoice
                        && p.invoice_external_id.as_deref() == Some(invoice)
                });
                if covered {
                    tracing::debug!(
                        tenant_id,
                        external_id = %draft.external_id,
                        invoice,
                        "Skipping invoice payment already covered by a charge or intent"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Splits a display name on the first whitespace into first/last.
fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(full) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (None, None);
    };
    let mut parts = full.splitn(2, char::is_whitespace);
    let first = parts.next().map(str::to_string);
    let last = parts
        .next()
        .map(|rest| rest.trim().to_string())
        .filter(|s| !s.is_empty());
    (first, last)
}
