use super::job::{BackgroundJob, HookEvent, JobError, JobSchedule};
use crate::ops_store::{JobAuditEntry, JobRun, OpsStore};
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Information about a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub is_running: bool,
    pub last_run: Option<JobRunInfo>,
    pub next_run_at: Option<String>,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                value_secs: Some(duration.as_secs()),
                hooks: None,
            },
            JobSchedule::Hook(event) => JobScheduleInfo {
                schedule_type: "hook".to_string(),
                value_secs: None,
                hooks: Some(vec![event.to_string()]),
            },
            JobSchedule::Combined { interval, hooks } => JobScheduleInfo {
                schedule_type: "combined".to_string(),
                value_secs: interval.map(|d| d.as_secs()),
                hooks: Some(hooks.iter().map(|h| h.to_string()).collect()),
            },
        }
    }
}

/// Serializable job run information.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl From<JobRun> for JobRunInfo {
    fn from(run: JobRun) -> Self {
        JobRunInfo {
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|dt| dt.to_rfc3339()),
            status: run.status.as_str().to_string(),
            error_message: run.error_message,
            triggered_by: run.triggered_by,
        }
    }
}

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        params: Option<serde_json::Value>,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// Shared state between scheduler and handle.
pub struct SharedJobState {
    /// Set at registration, never changes afterwards
    pub jobs: HashMap<String, Arc<dyn BackgroundJob>>,
    pub running_jobs: HashSet<String>,
}

/// Handle to interact with the job scheduler from outside its loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    hook_tx: mpsc::Sender<HookEvent>,
    shared_state: Arc<RwLock<SharedJobState>>,
    ops_store: Arc<dyn OpsStore>,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        hook_tx: mpsc::Sender<HookEvent>,
        shared_state: Arc<RwLock<SharedJobState>>,
        ops_store: Arc<dyn OpsStore>,
    ) -> Self {
        Self {
            command_tx,
            hook_tx,
            shared_state,
            ops_store,
        }
    }

    fn job_info(
        &self,
        job_id: &str,
        job: &Arc<dyn BackgroundJob>,
        is_running: bool,
    ) -> Result<JobInfo> {
        let last_run = self.ops_store.get_last_run(job_id)?.map(JobRunInfo::from);
        let next_run_at = self
            .ops_store
            .get_schedule_state(job_id)?
            .map(|s| s.next_run_at.to_rfc3339());

        Ok(JobInfo {
            id: job_id.to_string(),
            name: job.name().to_string(),
            description: job.description().to_string(),
            schedule: job.schedule().into(),
            is_running,
            last_run,
            next_run_at,
        })
    }

    /// Get information about all registered jobs, sorted by id.
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let state = self.shared_state.read().await;
        let mut jobs = state
            .jobs
            .iter()
            .map(|(job_id, job)| self.job_info(job_id, job, state.running_jobs.contains(job_id)))
            .collect::<Result<Vec<_>>>()?;

        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let state = self.shared_state.read().await;
        match state.jobs.get(job_id) {
            Some(job) => Ok(Some(self.job_info(
                job_id,
                job,
                state.running_jobs.contains(job_id),
            )?)),
            None => Ok(None),
        }
    }

    /// Trigger a job manually.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        self.trigger_job_with_params(job_id, None).await
    }

    pub async fn trigger_job_with_params(
        &self,
        job_id: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                params,
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler did not respond".to_string()))?
    }

    /// Fires a hook event, e.g. after moderation closes a petition.
    pub async fn notify(&self, event: HookEvent) -> Result<(), JobError> {
        self.hook_tx
            .send(event)
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))
    }

    pub fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRunInfo>> {
        let history = self.ops_store.get_job_history(job_id, limit)?;
        Ok(history.into_iter().map(JobRunInfo::from).collect())
    }

    pub async fn is_job_running(&self, job_id: &str) -> bool {
        let state = self.shared_state.read().await;
        state.running_jobs.contains(job_id)
    }

    pub async fn job_exists(&self, job_id: &str) -> bool {
        let state = self.shared_state.read().await;
        state.jobs.contains_key(job_id)
    }

    /// Audit log entries of all jobs.
    pub fn get_job_audit_log(&self, limit: usize, offset: usize) -> Result<Vec<JobAuditEntry>> {
        self.ops_store.get_job_audit_log(limit, offset)
    }

    pub fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>> {
        self.ops_store.get_job_audit_log_by_job(job_id, limit, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops_store::JobRunStatus;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_job_schedule_info_from_interval() {
        let info: JobScheduleInfo = JobSchedule::Interval(Duration::from_secs(3600)).into();

        assert_eq!(info.schedule_type, "interval");
        assert_eq!(info.value_secs, Some(3600));
        assert!(info.hooks.is_none());
    }

    #[test]
    fn test_job_schedule_info_from_hook() {
        let info: JobScheduleInfo = JobSchedule::Hook(HookEvent::OnStartup).into();

        assert_eq!(info.schedule_type, "hook");
        assert_eq!(info.hooks, Some(vec!["OnStartup".to_string()]));
        assert!(info.value_secs.is_none());
    }

    #[test]
    fn test_job_schedule_info_from_combined() {
        let info: JobScheduleInfo = JobSchedule::Combined {
            interval: Some(Duration::from_secs(1800)),
            hooks: vec![HookEvent::OnStartup, HookEvent::OnPetitionClosed],
        }
        .into();

        assert_eq!(info.schedule_type, "combined");
        assert_eq!(info.value_secs, Some(1800));
        let hooks = info.hooks.unwrap();
        assert_eq!(hooks.len(), 2);
        assert!(hooks.contains(&"OnPetitionClosed".to_string()));
    }

    #[test]
    fn test_job_run_info_from_failed() {
        let now = Utc::now();
        let run = JobRun {
            id: 2,
            job_id: "signature_count_audit".to_string(),
            started_at: now,
            finished_at: Some(now + chrono::Duration::seconds(5)),
            status: JobRunStatus::Failed,
            error_message: Some("database is locked".to_string()),
            triggered_by: "schedule".to_string(),
        };

        let info: JobRunInfo = run.into();

        assert_eq!(info.status, "failed");
        assert_eq!(info.error_message, Some("database is locked".to_string()));
        assert_eq!(info.triggered_by, "schedule");
        assert!(info.started_at.contains('T'));
    }
}
