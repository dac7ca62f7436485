//! # HubSync Events
//!
//! Event processing for HubSync: applies stored webhook events to the
//! CRM projections, pulls provider history through backfill, reconciles
//! the aggregates the two paths maintain together, and runs both as
//! queued background tasks.

pub mod backfill;
pub mod processor;
pub mod projections;
pub mod reconcile;
pub mod tasks;

pub use backfill::BackfillEngine;
pub use processor::EventProcessor;
pub use projections::{mrr_from_subscription, PaymentDraft, Projector};
pub use reconcile::Reconciler;
pub use tasks::{SyncQueue, SyncTask, SyncWorker, TaskOutcome, TaskResult, TaskSubmission};
