//! Append-only audit logging for security-sensitive operations.
//!
//! Recording an audit entry never fails the surrounding operation: a
//! storage failure is logged and swallowed. Token material must be
//! reduced to a truncated preview before it reaches this module.

use std::sync::Arc;

use crate::traits::StorageAdapter;
use crate::types::AuditRecord;

/// Writes audit records through the storage adapter.
#[derive(Clone)]
pub struct AuditLog {
    storage: Arc<dyn StorageAdapter>,
}

impl AuditLog {
    /// Creates an audit log over the given storage.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Appends a record. Failures are logged, never propagated.
    pub async fn record(&self, record: AuditRecord) {
        if let Err(err) = self.storage.append_audit(&record).await {
            tracing::error!(
                tenant_id = %record.tenant_id,
                event_type = %record.event_type,
                error = %err,
                "Failed to write audit record"
            );
        }
    }
}

/// Reduces a secret to a non-reversible preview: the first 10 characters
/// followed by `"..."`, or `"***"` when the secret is too short for even
/// that to be safe.
pub fn secret_preview(secret: &str) -> String {
    if secret.len() > 10 {
        let prefix: String = secret.chars().take(10).collect();
        format!("{}...", prefix)
    } else {
        "***".to_string()
    }
}
