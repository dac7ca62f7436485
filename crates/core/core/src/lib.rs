//! # HubSync Core
//!
//! This crate provides the foundational types and traits for the HubSync system.
//! It defines the core data structures (`Credential`, `RawEvent`, the synced
//! projections), error types, and the trait interfaces that adapters and
//! provider clients must implement.

pub mod audit;
pub mod clock;
pub mod error;
pub mod rate_limit;
pub mod traits;
pub mod types;

// Re-export commonly used items at the crate root
pub use audit::{secret_preview, AuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CrmError, CrmResult};
pub use rate_limit::{RateLimitDecision, SlidingWindowLimiter};
pub use traits::{ProviderAccount, ProviderClient, RefreshedSecret, StorageAdapter};
pub use types::{
    ApplyOutcome, AuditEventType, AuditRecord, BackfillReport, ClientRecord, Credential,
    DecryptedCredential, Payment, PaymentSource, PaymentStatus, Provider, ProviderCategory,
    RawEvent, Recommendation, ReconcileReport, Subscription, SubscriptionStatus,
    DEFAULT_TENANT_ID, LIFECYCLE_COLD_LEAD, RECOMMENDATION_PAYMENT_RECOVERY,
    RECOMMENDATION_PENDING, SCOPE_DIRECT_API_KEY,
};
