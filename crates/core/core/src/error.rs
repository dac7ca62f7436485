//! Error types for HubSync.
//!
//! This module defines the `CrmError` enum which represents all possible
//! errors that can occur within the sync and credential subsystems.

use thiserror::Error;

/// The main error type for HubSync operations.
///
/// This enum covers all error cases that can occur during credential
/// management, webhook intake, event processing, and storage operations.
#[derive(Debug, Error)]
pub enum CrmError {
    // ==================== Credential Errors ====================
    /// No credential is stored for the requested tenant and provider.
    #[error("Not connected: no {provider} credential for tenant {tenant_id}")]
    NotConnected { tenant_id: String, provider: String },

    /// The stored credential has passed its expiry time.
    #[error("Credential expired for {provider}: reconnect your account")]
    CredentialExpired { tenant_id: String, provider: String },

    /// No key in the ring could decrypt the stored ciphertext.
    #[error("Decryption failed for {resource}: no matching key in ring")]
    DecryptionFailed { resource: String },

    /// A single key string could not be parsed into usable key material.
    #[error("Invalid encryption key material: {reason}")]
    KeyParse { reason: String },

    // ==================== Webhook Errors ====================
    /// The webhook signature was missing, malformed, or did not match.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// The webhook body could not be parsed into an event.
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// An event with this idempotency key was already recorded.
    #[error("Duplicate event: {external_event_id} already recorded for tenant {tenant_id}")]
    DuplicateEvent {
        tenant_id: String,
        external_event_id: String,
    },

    /// A handler failed while applying a single event.
    #[error("Handler failed for event type '{event_type}': {message}")]
    HandlerFailed { event_type: String, message: String },

    // ==================== Validation Errors ====================
    /// A field value is invalid.
    #[error("Invalid field value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// The provider name is not one of the supported providers.
    #[error("Unknown provider: {value}")]
    UnknownProvider { value: String },

    /// A provider in the same category is already connected.
    #[error("Cannot connect {provider}: {existing} is already connected in the same category")]
    CompetingProvider { provider: String, existing: String },

    // ==================== Storage Errors ====================
    /// A storage operation failed.
    #[error("Storage error: {message}")]
    StorageError { message: String },

    /// The requested record was not found.
    #[error("Record not found: {entity} with {key}={value}")]
    NotFound {
        entity: String,
        key: String,
        value: String,
    },

    // ==================== External Provider Errors ====================
    /// A call to the third-party API failed.
    #[error("Provider error from {provider}: {message}")]
    ProviderError { provider: String, message: String },

    // ==================== Rate Limiting ====================
    /// Too many attempts have been made.
    #[error("Rate limit exceeded. Try again in {retry_after_secs} seconds")]
    RateLimitExceeded { retry_after_secs: u64 },

    // ==================== Configuration Errors ====================
    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// A required configuration value is missing.
    #[error("Missing configuration: {key}")]
    MissingConfiguration { key: String },

    // ==================== Internal Errors ====================
    /// An internal error occurred.
    #[error("Internal error: {message}")]
    InternalError { message: String },

    /// Serialization/deserialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

impl CrmError {
    /// Creates a new not-connected error.
    pub fn not_connected(tenant_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::NotConnected {
            tenant_id: tenant_id.into(),
            provider: provider.into(),
        }
    }

    /// Creates a new expired-credential error.
    pub fn expired(tenant_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::CredentialExpired {
            tenant_id: tenant_id.into(),
            provider: provider.into(),
        }
    }

    /// Creates a new decryption error.
    pub fn decryption(resource: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            resource: resource.into(),
        }
    }

    /// Creates a new duplicate-event error.
    pub fn duplicate_event(
        tenant_id: impl Into<String>,
        external_event_id: impl Into<String>,
    ) -> Self {
        Self::DuplicateEvent {
            tenant_id: tenant_id.into(),
            external_event_id: external_event_id.into(),
        }
    }

    /// Creates a new handler error.
    pub fn handler(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    /// Creates a new not found error.
    pub fn not_found(
        entity: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a new provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Returns true if this is a user-facing error (vs internal).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::CredentialExpired { .. }
                | Self::InvalidSignature
                | Self::InvalidPayload { .. }
                | Self::InvalidField { .. }
                | Self::UnknownProvider { .. }
                | Self::CompetingProvider { .. }
                | Self::RateLimitExceeded { .. }
        )
    }

    /// Returns an HTTP status code appropriate for this error.
    ///
    /// `DuplicateEvent` maps to 200: redelivery of an already-recorded
    /// event is a successful no-op at the webhook boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DuplicateEvent { .. } => 200,
            Self::CredentialExpired { .. } | Self::InvalidSignature => 401,
            Self::NotConnected { .. } | Self::NotFound { .. } => 404,
            Self::CompetingProvider { .. } => 409,
            Self::InvalidPayload { .. }
            | Self::InvalidField { .. }
            | Self::UnknownProvider { .. } => 422,
            Self::RateLimitExceeded { .. } => 429,
            _ => 500,
        }
    }
}

/// A Result type alias using CrmError.
pub type CrmResult<T> = Result<T, CrmError>;

impl From<serde_json::Error> for CrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            message: err.to_string(),
        }
    }
}
