//! The engine's scheduled jobs.
//!
//! Each one decides what to put on the durable queue; the queue workers do
//! the actual counting and batch work.

pub mod anonymize_archived_petitions;
pub mod archive_closed_petitions;
pub mod job_queue_maintenance;
pub mod ops_log_cleanup;
pub mod signature_count_audit;
pub mod signature_counter_bootstrap;

pub use anonymize_archived_petitions::AnonymizeArchivedPetitionsJob;
pub use archive_closed_petitions::ArchiveClosedPetitionsJob;
pub use job_queue_maintenance::JobQueueMaintenanceJob;
pub use ops_log_cleanup::OpsLogCleanupJob;
pub use signature_count_audit::SignatureCountAuditJob;
pub use signature_counter_bootstrap::SignatureCounterBootstrapJob;

use super::BackgroundJob;
use crate::config::EngineSettings;
use std::sync::Arc;
use std::time::Duration;

/// How often queue maintenance runs between startups.
const QUEUE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often the counter chain is re-seeded if no pass is queued.
const COUNTER_RESEED_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Every scheduled job the engine runs, configured from `settings`.
pub fn engine_jobs(settings: &EngineSettings) -> Vec<Arc<dyn BackgroundJob>> {
    vec![
        Arc::new(SignatureCounterBootstrapJob::new(COUNTER_RESEED_INTERVAL)),
        Arc::new(SignatureCountAuditJob::new(settings.audit_interval())),
        Arc::new(ArchiveClosedPetitionsJob::new(settings.archive_interval())),
        Arc::new(AnonymizeArchivedPetitionsJob::new(
            settings.anonymize_interval(),
            settings.anonymize_after(),
        )),
        Arc::new(JobQueueMaintenanceJob::new(
            QUEUE_MAINTENANCE_INTERVAL,
            settings.stale_job_timeout(),
            settings.finished_job_retention(),
        )),
        Arc::new(OpsLogCleanupJob::new(settings.ops_retention())),
    ]
}
