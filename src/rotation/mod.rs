//! Background credential maintenance
//!
//! Finishes password rotations left behind in the recovery log, rotates the
//! directory bind (root) credential on request, and schedules the periodic
//! jobs that keep both healthy.

pub mod reconcile;
pub mod root;
pub mod scheduler;

pub use reconcile::{ReconcileReport, Reconciler};
pub use root::RootRotator;
pub use scheduler::MaintenanceScheduler;

use thiserror::Error;

/// Errors from the maintenance jobs
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("a root credential rotation is already in progress")]
    InProgress,

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("rotation not available on this node: {0}")]
    NotConfigured(String),
}

impl From<tokio_cron_scheduler::JobSchedulerError> for RotationError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        RotationError::Scheduler(e.to_string())
    }
}
