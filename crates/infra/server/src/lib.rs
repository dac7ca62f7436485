//! # HubSync Server
//!
//! Standalone sync server wiring the credential vault, webhook intake,
//! connect flows, and the background sync worker over a storage adapter.

mod config;
mod connect;
#[cfg(feature = "http-client")]
mod stripe;

pub use config::{AppConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};
pub use connect::{ConnectOutcome, ConnectService, OauthGrant};
#[cfg(feature = "http-client")]
pub use stripe::StripeClient;

use std::sync::Arc;

use hubsync_core::{
    Clock, CrmError, CrmResult, Provider, ProviderClient, StorageAdapter, SystemClock,
};
use hubsync_events::{BackfillEngine, EventProcessor, Reconciler, SyncQueue, SyncWorker};
use hubsync_vault::{CredentialVault, KeyRing};
use hubsync_webhooks::{IntakeConfig, WebhookIntake};

/// A fully wired sync application.
pub struct SyncApp {
    /// Resolved configuration.
    pub config: AppConfig,
    /// Storage shared by every component.
    pub storage: Arc<dyn StorageAdapter>,
    /// Credential vault.
    pub vault: Arc<CredentialVault>,
    /// Event processor, shared with the intake.
    pub processor: Arc<EventProcessor>,
    /// Webhook intake for the payments provider.
    pub intake: WebhookIntake,
    /// Connect and disconnect flows.
    pub connect: ConnectService,
    /// Handle for queueing sync tasks.
    pub queue: SyncQueue,
    worker: Option<SyncWorker>,
}

impl SyncApp {
    /// Wires an application from configuration.
    ///
    /// `providers` holds one API client per supported provider; the same
    /// clients serve key validation and backfill paging.
    pub fn build(
        config: AppConfig,
        storage: Arc<dyn StorageAdapter>,
        ring: Arc<KeyRing>,
        providers: Vec<Arc<dyn ProviderClient>>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let vault = Arc::new(CredentialVault::new(storage.clone(), ring, clock));
        let processor = Arc::new(EventProcessor::new(storage.clone()));

        let mut backfill = BackfillEngine::new(storage.clone(), vault.clone());
        for client in &providers {
            backfill = backfill.with_provider(client.clone());
        }
        let (queue, worker) = SyncWorker::new(backfill, Reconciler::new(storage.clone()));

        let intake = WebhookIntake::new(
            storage.clone(),
            processor.clone(),
            IntakeConfig::new(Provider::Stripe, config.webhook_signing_secret.clone())
                .with_default_tenant(config.default_tenant_id.clone())
                .with_tolerance_secs(config.webhook_tolerance_secs),
        );

        let mut connect = ConnectService::new(storage.clone(), vault.clone(), queue.clone());
        for client in providers {
            connect = connect.with_provider(client);
        }

        Self {
            config,
            storage,
            vault,
            processor,
            intake,
            connect,
            queue,
            worker: Some(worker),
        }
    }

    /// Detaches the background worker so it can run on its own task.
    /// Returns `None` once the worker has been taken.
    pub fn take_worker(&mut self) -> Option<SyncWorker> {
        self.worker.take()
    }

    /// Runs the server until the task queue closes.
    pub async fn run(mut self) -> CrmResult<()> {
        let worker = self
            .take_worker()
            .ok_or_else(|| CrmError::internal("sync worker already taken"))?;

        tracing::info!(
            default_tenant_id = %self.config.default_tenant_id,
            tolerance_secs = self.config.webhook_tolerance_secs,
            "HubSync server ready"
        );

        // An HTTP frame would feed `intake` and `connect` here; the worker
        // loop is the long-running piece.
        worker.run().await;
        Ok(())
    }
}
