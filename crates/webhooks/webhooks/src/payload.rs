//! Provider event envelope parsing.

use serde_json::Value;

use hubsync_core::{CrmError, CrmResult};

/// A webhook delivery parsed just far enough to store it.
///
/// The body stays verbatim in `payload`; only the identity fields are
/// lifted out. Everything else is the processor's problem.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    /// The provider's own event id, used as the idempotency key.
    pub external_event_id: String,
    /// The provider's event type string.
    pub event_type: String,
    /// Provider-side account the event belongs to, when the provider
    /// routes multiple accounts through one endpoint.
    pub account_id: Option<String>,
    /// The delivered body, unmodified.
    pub payload: Value,
}

impl ProviderEvent {
    /// Parses a raw webhook body.
    ///
    /// An event without an id cannot be deduplicated and one without a
    /// type cannot be routed, so both are required. Anything else may be
    /// absent.
    pub fn parse(body: &[u8]) -> CrmResult<Self> {
        let payload: Value = serde_json::from_slice(body).map_err(|err| {
            CrmError::InvalidPayload {
                reason: format!("body is not valid JSON: {err}"),
            }
        })?;

        let external_event_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CrmError::InvalidPayload {
                reason: "missing event id".to_string(),
            })?
            .to_string();
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CrmError::InvalidPayload {
                reason: "missing event type".to_string(),
            })?
            .to_string();
        let account_id = payload
            .get("account")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            external_event_id,
            event_type,
            account_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_event() {
        let body = json!({
            "id": "evt_1",
            "type": "charge.succeeded",
            "account": "acct_1",
            "created": 1_700_000_000,
            "data": { "object": { "id": "ch_1" } },
        });

        let event = ProviderEvent::parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(event.external_event_id, "evt_1");
        assert_eq!(event.event_type, "charge.succeeded");
        assert_eq!(event.account_id.as_deref(), Some("acct_1"));
        assert_eq!(event.payload["data"]["object"]["id"], "ch_1");
    }

    #[test]
    fn test_account_is_optional() {
        let body = json!({ "id": "evt_1", "type": "charge.succeeded" });
        let event = ProviderEvent::parse(body.to_string().as_bytes()).unwrap();
        assert!(event.account_id.is_none());
    }

    #[test]
    fn test_missing_id_is_invalid() {
        let body = json!({ "type": "charge.succeeded" });
        let err = ProviderEvent::parse(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CrmError::InvalidPayload { .. }));
    }

    #[test]
    fn test_missing_type_is_invalid() {
        let body = json!({ "id": "evt_1" });
        let err = ProviderEvent::parse(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CrmError::InvalidPayload { .. }));
    }

    #[test]
    fn test_non_string_id_is_invalid() {
        let body = json!({ "id": 42, "type": "charge.succeeded" });
        assert!(ProviderEvent::parse(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_non_json_body_is_invalid() {
        let err = ProviderEvent::parse(b"not json at all").unwrap_err();
        assert!(matches!(err, CrmError::InvalidPayload { .. }));
    }
}
