//! Maintenance scheduler
//!
//! Runs the recovery log sweep on the configured cron schedule and prunes
//! the audit log once a day.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};

use super::{Reconciler, RotationError};
use crate::audit::AuditLog;
use crate::config::LendingConfig;
use crate::storage::StorageHandle;

/// Daily at 03:00
pub const AUDIT_CLEANUP_SCHEDULE: &str = "0 0 3 * * *";

/// Manages the periodic maintenance jobs
pub struct MaintenanceScheduler {
    scheduler: JobScheduler,
}

impl MaintenanceScheduler {
    /// Build and start the scheduler. Followers pass no reconciler and only
    /// get audit cleanup.
    pub async fn start(
        config: &LendingConfig,
        storage: StorageHandle,
        reconciler: Option<Arc<Reconciler>>,
        audit: Option<Arc<AuditLog>>,
    ) -> Result<Self, RotationError> {
        let scheduler = JobScheduler::new().await?;

        if let Some(reconciler) = reconciler {
            let job = Job::new_async(config.reconcile_schedule.as_str(), move |_uuid, _lock| {
                let reconciler = Arc::clone(&reconciler);
                let storage = Arc::clone(&storage);

                Box::pin(async move {
                    match reconciler.run_once(&storage).await {
                        Ok(report) if !report.is_clean() => tracing::warn!(
                            failed = report.failed.len(),
                            "recovery sweep left entries pending"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "recovery sweep failed"),
                    }
                })
            })?;
            scheduler.add(job).await?;

            tracing::info!(schedule = %config.reconcile_schedule, "scheduled recovery sweep");
        }

        if let Some(audit) = audit {
            let job = Job::new_async(AUDIT_CLEANUP_SCHEDULE, move |_uuid, _lock| {
                let audit = Arc::clone(&audit);
                Box::pin(async move {
                    if let Err(e) = audit.cleanup_old_entries() {
                        tracing::error!(error = %e, "audit cleanup failed");
                    }
                })
            })?;
            scheduler.add(job).await?;
        }

        scheduler.start().await?;
        Ok(Self { scheduler })
    }

    pub async fn shutdown(mut self) -> Result<(), RotationError> {
        self.scheduler.shutdown().await?;
        Ok(())
    }
}
