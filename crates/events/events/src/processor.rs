//! Applies stored webhook events to the projection tables.
//!
//! The processor is a pure function of (tenant, event type, payload) over
//! the storage adapter. Handlers tolerate sparse payloads: a field the
//! provider did not send downgrades the event, it never fails it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use hubsync_core::{
    ApplyOutcome, CrmResult, PaymentSource, PaymentStatus, RawEvent, Recommendation,
    StorageAdapter, SubscriptionStatus,
};

use crate::projections::{
    epoch_field, expandable_id, i64_field, source_timestamp, str_field, PaymentDraft, Projector,
};

// ==================== Event Processor ====================

/// Routes provider events to their projection handlers.
pub struct EventProcessor {
    storage: Arc<dyn StorageAdapter>,
    projector: Projector,
}

impl EventProcessor {
    /// Creates a processor over the given storage.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            projector: Projector::new(storage.clone()),
            storage,
        }
    }

    /// Applies a single event payload to the projections.
    ///
    /// Unrecognized event types are ignored, not errors: providers add
    /// types faster than consumers learn them.
    pub async fn apply_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> CrmResult<ApplyOutcome> {
        let object = payload.pointer("/data/object").unwrap_or(&Value::Null);
        let event_created = payload.get("created").and_then(Value::as_i64);

        match event_type {
            "charge.succeeded" | "invoice.payment_succeeded" | "invoice.paid" => {
                self.handle_payment_succeeded(tenant_id, event_type, object, event_created)
                    .await
            }
            "charge.failed" | "invoice.payment_failed" | "payment_intent.payment_failed" => {
                self.handle_payment_failed(tenant_id, event_type, object, event_created)
                    .await
            }
            "charge.refunded" => self.handle_refund(tenant_id, object, event_created).await,
            t if t.starts_with("customer.subscription.") => {
                let forced = match t {
                    "customer.subscription.created" => Some(SubscriptionStatus::Active),
                    "customer.subscription.deleted" => Some(SubscriptionStatus::Canceled),
                    _ => None,
                };
                self.projector
                    .upsert_subscription_from_object(tenant_id, object, forced, event_created)
                    .await
            }
            "customer.created" | "customer.updated" => {
                self.projector
                    .upsert_client_from_customer(tenant_id, object, event_created)
                    .await
            }
            _ => {
                tracing::debug!(tenant_id, event_type, "Ignoring unhandled event type");
                Ok(ApplyOutcome::Ignored)
            }
        }
    }

    /// Applies a stored raw event and marks it processed on success.
    pub async fn process_raw(&self, event: &RawEvent) -> CrmResult<ApplyOutcome> {
        let outcome = self
            .apply_event(&event.tenant_id, &event.event_type, &event.payload)
            .await?;
        self.storage
            .mark_event_processed(&event.tenant_id, &event.external_event_id, Utc::now())
            .await?;
        Ok(outcome)
    }

    // ==================== Payment Handlers ====================

    async fn handle_payment_succeeded(
        &self,
        tenant_id: &str,
        event_type: &str,
        object: &Value,
        event_created: Option<i64>,
    ) -> CrmResult<ApplyOutcome> {
        let invoice_event = event_type.starts_with("invoice.");

        let (external_id, amount_cents, subscription, invoice_id, receipt_url, source) =
            if invoice_event {
                // Invoices report the charge that settled them; the row is
                // keyed by the charge id so a later charge.succeeded lands
                // on the same record. An uncharged invoice falls back to
                // its own id.
                let external_id =
                    expandable_id(&object["charge"]).or_else(|| {
                        let fallback = str_field(object, "id").map(str::to_string);
                        if fallback.is_some() {
                            tracing::warn!(
                                tenant_id,
                                event_type,
                                "Invoice carries no charge, keying payment by invoice id"
                            );
                        }
                        fallback
                    });
                (
                    external_id,
                    i64_field(object, "amount_paid")
                        .filter(|v| *v != 0)
                        .or_else(|| i64_field(object, "amount_due"))
                        .unwrap_or(0),
                    expandable_id(&object["subscription"]),
                    str_field(object, "id").map(str::to_string),
                    str_field(object, "hosted_invoice_url").map(str::to_string),
                    PaymentSource::Invoice,
                )
            } else {
                let subscription = self
                    .projector
                    .resolve_subscription_from_invoice(tenant_id, &object["invoice"])
                    .await?;
                (
                    str_field(object, "id").map(str::to_string),
                    i64_field(object, "amount").unwrap_or(0),
                    subscription,
                    expandable_id(&object["invoice"]),
                    str_field(object, "receipt_url").map(str::to_string),
                    PaymentSource::Charge,
                )
            };

        let Some(external_id) = external_id else {
            tracing::debug!(tenant_id, event_type, "Payment event without an id, skipping");
            return Ok(ApplyOutcome::Ignored);
        };
        let Some(customer_external_id) = expandable_id(&object["customer"]) else {
            tracing::debug!(
                tenant_id,
                event_type,
                "Payment event without a customer, skipping"
            );
            return Ok(ApplyOutcome::Ignored);
        };

        let email_hint =
            str_field(object, "customer_email").or_else(|| str_field(object, "receipt_email"));
        self.projector
            .ensure_client(tenant_id, &customer_external_id, email_hint)
            .await?;

        // A charge with no invoice linkage still counts toward the
        // customer's sole active subscription, if there is exactly one
        // plausible owner.
        let subscription = match subscription {
            Some(sub) => Some(sub),
            None => {
                self.active_subscription_for(tenant_id, &customer_external_id)
                    .await?
            }
        };

        let draft = PaymentDraft {
            external_id,
            customer_external_id: Some(customer_external_id.clone()),
            amount_cents,
            currency: str_field(object, "currency").unwrap_or("usd").to_string(),
            status: PaymentStatus::Succeeded,
            source,
            subscription_external_id: subscription.clone(),
            invoice_external_id: invoice_id,
            receipt_url,
            source_created_at: epoch_field(object, "created"),
            source_updated_at: source_timestamp(object, event_created),
        };
        let outcome = self.projector.upsert_payment(tenant_id, draft).await?;

        if invoice_event && amount_cents > 0 {
            if let Some(subscription) = subscription.as_deref() {
                self.projector
                    .ensure_subscription_from_invoice(
                        tenant_id,
                        subscription,
                        Some(&customer_external_id),
                        amount_cents,
                        event_created,
                    )
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn handle_payment_failed(
        &self,
        tenant_id: &str,
        event_type: &str,
        object: &Value,
        event_created: Option<i64>,
    ) -> CrmResult<ApplyOutcome> {
        let invoice_event = event_type.starts_with("invoice.");

        let (external_id, amount_cents, subscription, invoice_id, receipt_url) = if invoice_event {
            (
                expandable_id(&object["charge"])
                    .or_else(|| str_field(object, "id").map(str::to_string)),
                i64_field(object, "amount_due").unwrap_or(0),
                expandable_id(&object["subscription"]),
                str_field(object, "id").map(str::to_string),
                str_field(object, "hosted_invoice_url").map(str::to_string),
            )
        } else {
            (
                str_field(object, "id").map(str::to_string),
                i64_field(object, "amount").unwrap_or(0),
                None,
                expandable_id(&object["invoice"]),
                None,
            )
        };
        let source = if invoice_event {
            PaymentSource::Invoice
        } else if event_type.starts_with("payment_intent.") {
            PaymentSource::PaymentIntent
        } else {
            PaymentSource::Charge
        };

        let Some(external_id) = external_id else {
            tracing::debug!(tenant_id, event_type, "Payment event without an id, skipping");
            return Ok(ApplyOutcome::Ignored);
        };
        let Some(customer_external_id) = expandable_id(&object["customer"]) else {
            tracing::debug!(
                tenant_id,
                event_type,
                "Payment event without a customer, skipping"
            );
            return Ok(ApplyOutcome::Ignored);
        };

        // Failed payments never create clients; a failure for an unknown
        // customer is recorded but generates no follow-up.
        let client = self
            .storage
            .get_client_by_external_id(tenant_id, &customer_external_id)
            .await?;

        let currency = str_field(object, "currency").unwrap_or("usd").to_string();
        let draft = PaymentDraft {
            external_id: external_id.clone(),
            customer_external_id: Some(customer_external_id.clone()),
            amount_cents,
            currency: currency.clone(),
            status: PaymentStatus::Failed,
            source,
            subscription_external_id: subscription,
            invoice_external_id: invoice_id,
            receipt_url,
            source_created_at: epoch_field(object, "created"),
            source_updated_at: source_timestamp(object, event_created),
        };
        let outcome = self.projector.upsert_payment(tenant_id, draft).await?;

        if let Some(client) = client {
            let message = format!(
                "Payment {} for {:.2} {} failed; follow up with the customer to recover it",
                external_id,
                amount_cents as f64 / 100.0,
                currency.to_uppercase()
            );
            let recommendation = Recommendation::payment_recovery(
                tenant_id.to_string(),
                Some(customer_external_id),
                message,
            );
            self.storage.insert_recommendation(&recommendation).await?;
            tracing::info!(
                tenant_id,
                client_id = %client.id,
                payment = %external_id,
                "Recorded payment-recovery recommendation"
            );
        }
        Ok(outcome)
    }

    async fn handle_refund(
        &self,
        tenant_id: &str,
        object: &Value,
        event_created: Option<i64>,
    ) -> CrmResult<ApplyOutcome> {
        let Some(charge_id) =
            expandable_id(&object["charge"]).or_else(|| str_field(object, "id").map(str::to_string))
        else {
            tracing::debug!(tenant_id, "Refund event without a charge id, skipping");
            return Ok(ApplyOutcome::Ignored);
        };

        let Some(mut payment) = self
            .storage
            .get_payment_by_external_id(tenant_id, &charge_id)
            .await?
        else {
            // A refund can outrun its charge event; backfill carries the
            // refunded flag on the charge itself.
            tracing::debug!(tenant_id, charge_id, "Refund for unknown payment, skipping");
            return Ok(ApplyOutcome::Ignored);
        };

        payment.status = PaymentStatus::Refunded;
        let refund_ts = source_timestamp(object, event_created);
        if refund_ts > payment.source_updated_at {
            payment.source_updated_at = refund_ts;
        }
        payment.updated_at = Utc::now();
        self.storage.upsert_payment(&payment).await?;
        tracing::info!(tenant_id, charge_id, "Marked payment refunded");
        Ok(ApplyOutcome::Applied)
    }

    /// The customer's active subscription, when they have exactly one.
    async fn active_subscription_for(
        &self,
        tenant_id: &str,
        customer_external_id: &str,
    ) -> CrmResult<Option<String>> {
        let subscriptions = self
            .storage
            .list_subscriptions_for_customer(tenant_id, customer_external_id)
            .await?;
        let mut active = subscriptions
            .into_iter()
            .filter(|s| s.status == SubscriptionStatus::Active);
        let first = active.next();
        if active.next().is_some() {
            return Ok(None);
        }
        Ok(first.map(|s| s.external_id))
    }
}
