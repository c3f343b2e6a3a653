//! Background job scheduling and execution system.
//!
//! Runs the engine's periodic and event-triggered work: the counter
//! bootstrap, the drift audit, archive and anonymization sweeps and queue
//! housekeeping.

mod audit_logger;
mod context;
mod handle;
mod job;
pub mod jobs;
mod scheduler;

pub use audit_logger::JobAuditLogger;
pub use context::JobContext;
pub use handle::{JobInfo, JobRunInfo, JobScheduleInfo, SchedulerHandle};
pub use job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior};
pub use scheduler::{create_scheduler, JobScheduler};
