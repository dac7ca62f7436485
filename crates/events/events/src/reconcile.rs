//! Periodic repair of the revenue aggregates on client rows.
//!
//! Webhooks and backfill both mutate payments and subscriptions; the
//! aggregates on the client row can drift when runs interleave. The
//! reconciler recomputes them from the stored rows and rewrites only
//! what changed, so a clean pass is a no-op.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use hubsync_core::{CrmResult, Payment, PaymentStatus, ReconcileReport, StorageAdapter};

// ==================== Reconciler ====================

/// Recomputes per-client lifetime revenue and MRR from stored rows.
pub struct Reconciler {
    storage: Arc<dyn StorageAdapter>,
}

impl Reconciler {
    /// Creates a reconciler over the given storage.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Reconciles every client of a tenant.
    pub async fn reconcile(&self, tenant_id: &str) -> CrmResult<ReconcileReport> {
        let clients = self.storage.list_clients(tenant_id).await?;
        let payments = self.storage.list_payments(tenant_id).await?;
        let subscriptions = self.storage.list_subscriptions(tenant_id).await?;

        let mut report = ReconcileReport::default();
        for mut client in clients {
            report.clients_checked += 1;

            let (lifetime, mrr) = match client.external_id.as_deref() {
                Some(external_id) => {
                    let client_payments: Vec<&Payment> = payments
                        .iter()
                        .filter(|p| p.customer_external_id.as_deref() == Some(external_id))
                        .collect();
                    let lifetime = dedup_for_revenue(&client_payments)
                        .iter()
                        .map(|p| p.amount_cents)
                        .sum();
                    let mrr = subscriptions
                        .iter()
                        .filter(|s| {
                            s.customer_external_id.as_deref() == Some(external_id)
                                && s.status.is_active()
                        })
                        .map(|s| s.mrr_cents)
                        .sum();
                    (lifetime, mrr)
                }
                // Never-synced clients hold no provider rows to sum.
                None => (0, 0),
            };

            if client.lifetime_revenue_cents != lifetime || client.mrr_cents != mrr {
                tracing::debug!(
                    tenant_id,
                    client_id = %client.id,
                    lifetime_from = client.lifetime_revenue_cents,
                    lifetime_to = lifetime,
                    mrr_from = client.mrr_cents,
                    mrr_to = mrr,
                    "Repairing drifted client aggregates"
                );
                client.lifetime_revenue_cents = lifetime;
                client.mrr_cents = mrr;
                client.updated_at = Utc::now();
                self.storage.upsert_client(&client).await?;
                report.clients_updated += 1;
            }
        }

        tracing::info!(
            tenant_id,
            checked = report.clients_checked,
            updated = report.clients_updated,
            "Reconcile complete"
        );
        Ok(report)
    }
}

/// One payment per real-world transaction, best source wins.
///
/// The intake layer keeps every record it sees; a transaction can sit in
/// the table as a charge, a payment intent, and an invoice at once. For
/// revenue, records collapse on their subscription/invoice linkage and
/// the strongest source for each group is counted once.
fn dedup_for_revenue<'a>(payments: &[&'a Payment]) -> Vec<&'a Payment> {
    #[derive(Hash, PartialEq, Eq)]
    enum RevenueKey<'a> {
        SubscriptionInvoice(&'a str, &'a str),
        Invoice(&'a str),
        Payment(&'a str),
    }

    let mut succeeded: Vec<&Payment> = payments
        .iter()
        .copied()
        .filter(|p| p.status == PaymentStatus::Succeeded)
        .collect();
    succeeded.sort_by(|a, b| {
        b.source
            .priority()
            .cmp(&a.source.priority())
            .then(b.updated_at.cmp(&a.updated_at))
    });

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for payment in succeeded {
        let key = match (
            payment.subscription_external_id.as_deref(),
            payment.invoice_external_id.as_deref(),
        ) {
            (Some(subscription), Some(invoice)) => {
                RevenueKey::SubscriptionInvoice(subscription, invoice)
            }
            (_, Some(invoice)) => RevenueKey::Invoice(invoice),
            _ => RevenueKey::Payment(payment.external_id.as_str()),
        };
        if seen.insert(key) {
            kept.push(payment);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hubsync_core::{ClientRecord, PaymentSource, Subscription, SubscriptionStatus};
    use hubsync_memory_adapter::MemoryAdapter;

    const TENANT: &str = "tenant-a";

    fn payment(
        external_id: &str,
        amount_cents: i64,
        status: PaymentStatus,
        source: PaymentSource,
    ) -> Payment {
        let mut p = Payment::new(
            TENANT.to_string(),
            external_id.to_string(),
            amount_cents,
            status,
            source,
        );
        p.customer_external_id = Some("cus_1".to_string());
        p
    }

    #[test]
    fn test_dedup_prefers_charge_over_invoice_for_same_pair() {
        let mut charge = payment("ch_1", 4900, PaymentStatus::Succeeded, PaymentSource::Charge);
        charge.subscription_external_id = Some("sub_1".to_string());
        charge.invoice_external_id = Some("in_1".to_string());
        let mut invoice = payment("in_1", 4900, PaymentStatus::Succeeded, PaymentSource::Invoice);
        invoice.subscription_external_id = Some("sub_1".to_string());
        invoice.invoice_external_id = Some("in_1".to_string());

        let refs: Vec<&Payment> = vec![&invoice, &charge];
        let kept = dedup_for_revenue(&refs);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].external_id, "ch_1");
    }

    #[test]
    fn test_dedup_groups_bare_invoices_by_invoice_id() {
        let mut first = payment("ch_1", 900, PaymentStatus::Succeeded, PaymentSource::Charge);
        first.invoice_external_id = Some("in_1".to_string());
        let mut second = payment("in_1", 900, PaymentStatus::Succeeded, PaymentSource::Invoice);
        second.invoice_external_id = Some("in_1".to_string());

        let refs: Vec<&Payment> = vec![&first, &second];
        let kept = dedup_for_revenue(&refs);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].external_id, "ch_1");
    }

    #[test]
    fn test_dedup_keeps_unlinked_payments_separately() {
        let a = payment("ch_1", 100, PaymentStatus::Succeeded, PaymentSource::Charge);
        let b = payment("ch_2", 200, PaymentStatus::Succeeded, PaymentSource::Charge);
        let failed = payment("ch_3", 300, PaymentStatus::Failed, PaymentSource::Charge);
        let refunded = payment("ch_4", 400, PaymentStatus::Refunded, PaymentSource::Charge);

        let refs: Vec<&Payment> = vec![&a, &b, &failed, &refunded];
        let kept = dedup_for_revenue(&refs);

        assert_eq!(kept.len(), 2);
        let total: i64 = kept.iter().map(|p| p.amount_cents).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn test_dedup_same_priority_takes_newest() {
        let mut older = payment("ch_1", 100, PaymentStatus::Succeeded, PaymentSource::Charge);
        older.invoice_external_id = Some("in_1".to_string());
        let mut newer = payment("ch_2", 200, PaymentStatus::Succeeded, PaymentSource::Charge);
        newer.invoice_external_id = Some("in_1".to_string());
        newer.updated_at = older.updated_at + Duration::seconds(60);

        let refs: Vec<&Payment> = vec![&older, &newer];
        let kept = dedup_for_revenue(&refs);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].external_id, "ch_2");
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drifted_aggregates() {
        let storage = Arc::new(MemoryAdapter::new());
        let mut client = ClientRecord::new(TENANT.to_string(), "ada@example.com".to_string());
        client.external_id = Some("cus_1".to_string());
        client.lifetime_revenue_cents = 999;
        client.mrr_cents = 999;
        storage.upsert_client(&client).await.unwrap();

        storage
            .upsert_payment(&payment(
                "ch_1",
                4900,
                PaymentStatus::Succeeded,
                PaymentSource::Charge,
            ))
            .await
            .unwrap();
        let mut subscription = Subscription::new(TENANT.to_string(), "sub_1".to_string());
        subscription.customer_external_id = Some("cus_1".to_string());
        subscription.status = SubscriptionStatus::Active;
        subscription.mrr_cents = 4900;
        storage.upsert_subscription(&subscription).await.unwrap();
        let mut canceled = Subscription::new(TENANT.to_string(), "sub_2".to_string());
        canceled.customer_external_id = Some("cus_1".to_string());
        canceled.status = SubscriptionStatus::Canceled;
        canceled.mrr_cents = 9900;
        storage.upsert_subscription(&canceled).await.unwrap();

        let reconciler = Reconciler::new(storage.clone());
        let report = reconciler.reconcile(TENANT).await.unwrap();

        assert_eq!(report.clients_checked, 1);
        assert_eq!(report.clients_updated, 1);
        let repaired = storage
            .get_client_by_external_id(TENANT, "cus_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repaired.lifetime_revenue_cents, 4900);
        assert_eq!(repaired.mrr_cents, 4900);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let storage = Arc::new(MemoryAdapter::new());
        let mut client = ClientRecord::new(TENANT.to_string(), "ada@example.com".to_string());
        client.external_id = Some("cus_1".to_string());
        storage.upsert_client(&client).await.unwrap();
        storage
            .upsert_payment(&payment(
                "ch_1",
                4900,
                PaymentStatus::Succeeded,
                PaymentSource::Charge,
            ))
            .await
            .unwrap();

        let reconciler = Reconciler::new(storage.clone());
        let first = reconciler.reconcile(TENANT).await.unwrap();
        let second = reconciler.reconcile(TENANT).await.unwrap();

        assert_eq!(first.clients_updated, 1);
        assert_eq!(second.clients_updated, 0);
        assert_eq!(second.clients_checked, 1);
    }

    #[tokio::test]
    async fn test_client_without_external_id_zeroes_stale_aggregates() {
        let storage = Arc::new(MemoryAdapter::new());
        let mut client = ClientRecord::new(TENANT.to_string(), "manual@example.com".to_string());
        client.mrr_cents = 500;
        storage.upsert_client(&client).await.unwrap();

        let reconciler = Reconciler::new(storage.clone());
        let report = reconciler.reconcile(TENANT).await.unwrap();

        assert_eq!(report.clients_updated, 1);
        let repaired = storage.list_clients(TENANT).await.unwrap();
        assert_eq!(repaired[0].mrr_cents, 0);
    }
}
