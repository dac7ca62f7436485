//! # HubSync Webhooks
//!
//! Webhook intake for HubSync: HMAC signature verification over raw
//! delivery bodies, tenant resolution through stored credentials, and
//! idempotent recording of events before they are processed.

pub mod intake;
pub mod payload;
pub mod signature;

pub use intake::{IntakeConfig, IntakeResponse, WebhookIntake};
pub use payload::ProviderEvent;
pub use signature::{SignatureError, SignatureHeader, WebhookSigner, DEFAULT_TOLERANCE_SECS};
