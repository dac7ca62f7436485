//! Stripe API client.
//!
//! Implements `ProviderClient` over Stripe's REST API. List endpoints page
//! with `starting_after` cursors until `has_more` goes false.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use hubsync_core::{CrmError, CrmResult, Provider, ProviderAccount, ProviderClient};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com";
const PAGE_SIZE: u32 = 100;

/// HTTP client for the Stripe API.
pub struct StripeClient {
    client: reqwest::Client,
    base_url: String,
}

impl StripeClient {
    /// Creates a client against the public Stripe API.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Points the client at a different host, e.g. a local stub.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get(&self, secret: &str, path: &str, query: &[(String, String)]) -> CrmResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(secret)
            .query(query)
            .send()
            .await
            .map_err(|err| CrmError::provider("stripe", err.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| CrmError::provider("stripe", err.to_string()))?;

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(CrmError::provider(
                "stripe",
                format!("HTTP {}: {message}", status.as_u16()),
            ));
        }

        Ok(body)
    }

    /// Pages through a list endpoint and returns every record.
    ///
    /// Stripe lists filter on creation time only; the backfill's overlap
    /// window makes up for records updated after creation.
    async fn list(
        &self,
        secret: &str,
        path: &str,
        extra: &[(&str, &str)],
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        let mut records = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> =
                vec![("limit".to_string(), PAGE_SIZE.to_string())];
            for (key, value) in extra {
                query.push((key.to_string(), value.to_string()));
            }
            if let Some(since) = since {
                query.push(("created[gte]".to_string(), since.timestamp().to_string()));
            }
            if let Some(cursor) = &starting_after {
                query.push(("starting_after".to_string(), cursor.clone()));
            }

            let page = self.get(secret, path, &query).await?;
            let data = page
                .pointer("/data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let has_more = page
                .pointer("/has_more")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let last_id = data
                .last()
                .and_then(|record| record.pointer("/id"))
                .and_then(Value::as_str)
                .map(String::from);

            records.extend(data);

            match (has_more, last_id) {
                (true, Some(id)) => starting_after = Some(id),
                _ => break,
            }
        }

        Ok(records)
    }
}

impl Default for StripeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for StripeClient {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn validate_key(&self, api_key: &str) -> CrmResult<ProviderAccount> {
        let account = self.get(api_key, "/v1/account", &[]).await?;
        let account_id = account
            .pointer("/id")
            .and_then(Value::as_str)
            .ok_or_else(|| CrmError::provider("stripe", "account response missing id"))?
            .to_string();

        // Mode is carried by the key itself, not the account object.
        let livemode = api_key.starts_with("sk_live_");

        Ok(ProviderAccount {
            account_id,
            livemode,
        })
    }

    async fn list_customers(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        self.list(secret, "/v1/customers", &[], since).await
    }

    async fn list_subscriptions(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        self.list(secret, "/v1/subscriptions", &[("status", "all")], since)
            .await
    }

    async fn list_charges(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        self.list(secret, "/v1/charges", &[], since).await
    }

    async fn list_payment_intents(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        self.list(secret, "/v1/payment_intents", &[], since).await
    }

    async fn list_paid_invoices(
        &self,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> CrmResult<Vec<Value>> {
        self.list(secret, "/v1/invoices", &[("status", "paid")], since)
            .await
    }
}
