//! Background queue for backfill and reconcile runs.
//!
//! Sync runs page external APIs and can take minutes; request handlers
//! enqueue them and return. A single worker drains the queue so one
//! tenant's runs never interleave with themselves.

use tokio::sync::{mpsc, oneshot};

use hubsync_core::{BackfillReport, CrmError, CrmResult, Provider, ReconcileReport};

use crate::backfill::BackfillEngine;
use crate::reconcile::Reconciler;

// ==================== Tasks ====================

/// A unit of background sync work.
#[derive(Debug, Clone)]
pub enum SyncTask {
    /// Pull provider history for a tenant.
    Backfill {
        tenant_id: String,
        provider: Provider,
        full_resync: bool,
    },
    /// Recompute a tenant's client aggregates.
    Reconcile { tenant_id: String },
}

impl SyncTask {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backfill { .. } => "backfill",
            Self::Reconcile { .. } => "reconcile",
        }
    }

    /// The tenant the task runs for.
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Backfill { tenant_id, .. } | Self::Reconcile { tenant_id } => tenant_id,
        }
    }
}

/// What a completed task produced.
#[derive(Debug)]
pub enum TaskOutcome {
    Backfill(BackfillReport),
    Reconcile(ReconcileReport),
}

/// How a task finished.
pub type TaskResult = CrmResult<TaskOutcome>;

/// Handle returned at enqueue time.
///
/// Awaiting `done` yields the task's result; dropping it instead is
/// fine, the worker runs the task either way.
#[derive(Debug)]
pub struct TaskSubmission {
    pub task_id: String,
    pub done: oneshot::Receiver<TaskResult>,
}

struct QueuedTask {
    task_id: String,
    task: SyncTask,
    done: oneshot::Sender<TaskResult>,
}

// ==================== Queue and Worker ====================

/// Submission side of the sync queue. Cheap to clone.
#[derive(Clone)]
pub struct SyncQueue {
    sender: mpsc::UnboundedSender<QueuedTask>,
}

impl SyncQueue {
    /// Enqueues a task for the worker.
    pub fn submit(&self, task: SyncTask) -> CrmResult<TaskSubmission> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        self.sender
            .send(QueuedTask {
                task_id: task_id.clone(),
                task,
                done: done_tx,
            })
            .map_err(|_| CrmError::internal("sync worker is no longer running"))?;
        Ok(TaskSubmission {
            task_id,
            done: done_rx,
        })
    }
}

/// Drains the sync queue, one task at a time.
pub struct SyncWorker {
    receiver: mpsc::UnboundedReceiver<QueuedTask>,
    backfill: BackfillEngine,
    reconciler: Reconciler,
}

impl SyncWorker {
    /// Creates a connected queue/worker pair.
    pub fn new(backfill: BackfillEngine, reconciler: Reconciler) -> (SyncQueue, SyncWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            SyncQueue { sender },
            SyncWorker {
                receiver,
                backfill,
                reconciler,
            },
        )
    }

    /// Runs until every queue handle is dropped.
    pub async fn run(mut self) {
        while let Some(queued) = self.receiver.recv().await {
            tracing::info!(
                task_id = %queued.task_id,
                kind = queued.task.kind(),
                tenant_id = queued.task.tenant_id(),
                "Running sync task"
            );
            let result = self.execute(queued.task).await;
            if let Err(err) = &result {
                tracing::error!(
                    task_id = %queued.task_id,
                    error = %err,
                    "Sync task failed"
                );
            }
            if queued.done.send(result).is_err() {
                tracing::debug!(
                    task_id = %queued.task_id,
                    "Task submitter dropped before the result arrived"
                );
            }
        }
    }

    async fn execute(&self, task: SyncTask) -> TaskResult {
        match task {
            SyncTask::Backfill {
                tenant_id,
                provider,
                full_resync,
            } => self
                .backfill
                .run(&tenant_id, provider, full_resync)
                .await
                .map(TaskOutcome::Backfill),
            SyncTask::Reconcile { tenant_id } => self
                .reconciler
                .reconcile(&tenant_id)
                .await
                .map(TaskOutcome::Reconcile),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hubsync_core::{
        ClientRecord, ManualClock, Payment, PaymentSource, PaymentStatus, StorageAdapter,
    };
    use hubsync_memory_adapter::MemoryAdapter;
    use hubsync_vault::{CredentialVault, KeyRing};
    use std::sync::Arc;

    const TENANT: &str = "tenant-a";

    fn queue_over(storage: Arc<MemoryAdapter>) -> (SyncQueue, SyncWorker) {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let vault = Arc::new(CredentialVault::new(
            storage.clone(),
            Arc::new(KeyRing::generate()),
            clock.clone(),
        ));
        let backfill = BackfillEngine::new(storage.clone(), vault).with_clock(clock);
        let reconciler = Reconciler::new(storage);
        SyncWorker::new(backfill, reconciler)
    }

    #[tokio::test]
    async fn test_submitted_reconcile_resolves_with_report() {
        let storage = Arc::new(MemoryAdapter::new());
        let mut client = ClientRecord::new(TENANT.to_string(), "ada@example.com".to_string());
        client.external_id = Some("cus_1".to_string());
        storage.upsert_client(&client).await.unwrap();
        let mut payment = Payment::new(
            TENANT.to_string(),
            "ch_1".to_string(),
            4900,
            PaymentStatus::Succeeded,
            PaymentSource::Charge,
        );
        payment.customer_external_id = Some("cus_1".to_string());
        storage.upsert_payment(&payment).await.unwrap();

        let (queue, worker) = queue_over(storage);
        let worker = tokio::spawn(worker.run());

        let submission = queue
            .submit(SyncTask::Reconcile {
                tenant_id: TENANT.to_string(),
            })
            .unwrap();
        assert!(!submission.task_id.is_empty());

        let outcome = submission.done.await.unwrap().unwrap();
        match outcome {
            TaskOutcome::Reconcile(report) => {
                assert_eq!(report.clients_checked, 1);
                assert_eq!(report.clients_updated, 1);
            }
            other => panic!("expected reconcile outcome, got {other:?}"),
        }

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_backfill_for_unknown_provider_reports_error() {
        let storage = Arc::new(MemoryAdapter::new());
        let (queue, worker) = queue_over(storage);
        tokio::spawn(worker.run());

        let submission = queue
            .submit(SyncTask::Backfill {
                tenant_id: TENANT.to_string(),
                provider: hubsync_core::Provider::Stripe,
                full_resync: true,
            })
            .unwrap();

        let result = submission.done.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_worker_survives_dropped_submission() {
        let storage = Arc::new(MemoryAdapter::new());
        let (queue, worker) = queue_over(storage.clone());
        tokio::spawn(worker.run());

        let first = queue
            .submit(SyncTask::Reconcile {
                tenant_id: TENANT.to_string(),
            })
            .unwrap();
        drop(first);

        let second = queue
            .submit(SyncTask::Reconcile {
                tenant_id: TENANT.to_string(),
            })
            .unwrap();
        let outcome = second.done.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_task_accessors() {
        let backfill = SyncTask::Backfill {
            tenant_id: TENANT.to_string(),
            provider: hubsync_core::Provider::Stripe,
            full_resync: false,
        };
        assert_eq!(backfill.kind(), "backfill");
        assert_eq!(backfill.tenant_id(), TENANT);

        let reconcile = SyncTask::Reconcile {
            tenant_id: TENANT.to_string(),
        };
        assert_eq!(reconcile.kind(), "reconcile");
        assert_eq!(reconcile.tenant_id(), TENANT);
    }
}
