use super::context::JobContext;
use super::handle::{SchedulerCommand, SchedulerHandle, SharedJobState};
use super::job::{BackgroundJob, HookEvent, JobError, ShutdownBehavior};
use crate::metrics;
use crate::ops_store::{JobRunStatus, JobScheduleState, OpsStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long the loop sleeps without re-checking schedules.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// How long shutdown waits for each running job.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Runs periodic and hook-triggered background jobs.
pub struct JobScheduler {
    shared_state: Arc<RwLock<SharedJobState>>,

    /// Task handles of running jobs, owned by the scheduler loop
    running_handles: HashMap<String, JoinHandle<()>>,

    job_cancel_tokens: HashMap<String, CancellationToken>,

    ops_store: Arc<dyn OpsStore>,

    hook_receiver: mpsc::Receiver<HookEvent>,

    command_receiver: mpsc::Receiver<SchedulerCommand>,

    shutdown_token: CancellationToken,

    job_context: JobContext,
}

impl JobScheduler {
    pub fn new(
        ops_store: Arc<dyn OpsStore>,
        hook_receiver: mpsc::Receiver<HookEvent>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        job_context: JobContext,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            shared_state,
            running_handles: HashMap::new(),
            job_cancel_tokens: HashMap::new(),
            ops_store,
            hook_receiver,
            command_receiver,
            shutdown_token,
            job_context,
        }
    }

    pub async fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id().to_string();
        info!("Registering job: {} - {}", job_id, job.description());
        let mut state = self.shared_state.write().await;
        state.jobs.insert(job_id, job);
    }

    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting job scheduler with {} registered jobs", job_count);

        // Runs left open by a previous process never finished.
        match self.ops_store.mark_stale_jobs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale jobs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale jobs: {}", e);
            }
        }

        self.trigger_jobs_for_hook(HookEvent::OnStartup).await;

        loop {
            self.cleanup_completed_jobs().await;

            let sleep_duration = self.time_until_next_scheduled_job().await;
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(event) = self.hook_receiver.recv() => {
                    debug!("Received hook event: {}", event);
                    self.trigger_jobs_for_hook(event).await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob {
                job_id,
                params,
                response,
            } => {
                let result = self.trigger_job(&job_id, params).await;
                let _ = response.send(result);
            }
        }
    }

    async fn trigger_job(
        &mut self,
        job_id: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), JobError> {
        let state = self.shared_state.read().await;
        if !state.jobs.contains_key(job_id) {
            return Err(JobError::NotFound);
        }
        if state.running_jobs.contains(job_id) {
            return Err(JobError::AlreadyRunning);
        }
        drop(state);

        self.spawn_job(job_id, "manual", params).await;
        Ok(())
    }

    /// Next run time of an interval job. Jobs that never ran are due now.
    fn next_run_time(&self, job_id: &str, job: &Arc<dyn BackgroundJob>) -> Option<chrono::DateTime<Utc>> {
        job.schedule().interval()?;
        match self.ops_store.get_schedule_state(job_id) {
            Ok(Some(state)) => Some(state.next_run_at),
            Ok(None) => Some(Utc::now()),
            Err(e) => {
                warn!("Failed to read schedule state for {}: {}", job_id, e);
                None
            }
        }
    }

    async fn time_until_next_scheduled_job(&self) -> Duration {
        let mut min_duration = MAX_SLEEP;

        let state = self.shared_state.read().await;
        for (job_id, job) in &state.jobs {
            if state.running_jobs.contains(job_id) {
                continue;
            }

            if let Some(next_run) = self.next_run_time(job_id, job) {
                let now = Utc::now();
                if next_run <= now {
                    return Duration::ZERO;
                }
                let duration = (next_run - now).to_std().unwrap_or(Duration::from_secs(1));
                min_duration = min_duration.min(duration);
            }
        }

        min_duration
    }

    async fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let jobs_to_run: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .filter(|(job_id, _)| !state.running_jobs.contains(*job_id))
                .filter(|(job_id, job)| {
                    self.next_run_time(job_id, job)
                        .is_some_and(|next_run| next_run <= now)
                })
                .map(|(job_id, _)| job_id.clone())
                .collect()
        };

        for job_id in jobs_to_run {
            self.spawn_job(&job_id, "schedule", None).await;
        }
    }

    async fn trigger_jobs_for_hook(&mut self, event: HookEvent) {
        let jobs_to_trigger: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .filter(|(_, job)| job.schedule().listens_to(event))
                .filter(|(job_id, _)| {
                    let running = state.running_jobs.contains(*job_id);
                    if running {
                        debug!("Skipping hook trigger for already running job: {}", job_id);
                    }
                    !running
                })
                .map(|(job_id, _)| job_id.clone())
                .collect()
        };

        let trigger = format!("hook:{}", event);
        for job_id in jobs_to_trigger {
            self.spawn_job(&job_id, &trigger, None).await;
        }
    }

    fn store_next_run(&self, job_id: &str, interval: Duration, last_run_at: Option<chrono::DateTime<Utc>>) {
        let schedule_state = JobScheduleState {
            job_id: job_id.to_string(),
            next_run_at: crate::engine::after(Utc::now(), interval),
            last_run_at,
        };
        if let Err(e) = self.ops_store.update_schedule_state(&schedule_state) {
            warn!("Failed to update schedule state for {}: {}", job_id, e);
        }
    }

    async fn spawn_job(&mut self, job_id: &str, triggered_by: &str, params: Option<serde_json::Value>) {
        let job = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => Arc::clone(job),
                None => {
                    error!("Attempted to spawn unknown job: {}", job_id);
                    return;
                }
            }
        };

        let run_id = match self.ops_store.record_job_start(job_id, triggered_by) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to record job start for {}: {}", job_id, e);
                return;
            }
        };

        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            job_id, run_id, triggered_by
        );

        {
            let mut state = self.shared_state.write().await;
            state.running_jobs.insert(job_id.to_string());
        }

        // Push the next run out now so the loop doesn't spin while the job runs.
        if let Some(interval) = job.schedule().interval() {
            self.store_next_run(job_id, interval, None);
        }

        metrics::set_background_job_running(job_id, true);

        let cancel_token = self.job_context.cancellation_token.child_token();
        self.job_cancel_tokens
            .insert(job_id.to_string(), cancel_token.clone());
        let ctx = self.job_context.with_token(cancel_token);

        let ops_store = Arc::clone(&self.ops_store);
        let job_id_owned = job_id.to_string();
        let shared_state = Arc::clone(&self.shared_state);

        let handle = tokio::spawn(async move {
            let start_time = Instant::now();
            let result =
                tokio::task::spawn_blocking(move || job.execute_with_params(&ctx, params)).await;
            let elapsed = start_time.elapsed();

            let (status, error_msg, status_label) = match result {
                Ok(Ok(())) => {
                    info!(
                        "Job {} completed successfully in {:?}",
                        job_id_owned, elapsed
                    );
                    (JobRunStatus::Completed, None, "success")
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", job_id_owned, elapsed);
                    (
                        JobRunStatus::Failed,
                        Some("Cancelled".to_string()),
                        "cancelled",
                    )
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id_owned, elapsed, e);
                    (JobRunStatus::Failed, Some(e.to_string()), "failed")
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id_owned, elapsed, e);
                    (
                        JobRunStatus::Failed,
                        Some(format!("Task panic: {}", e)),
                        "panic",
                    )
                }
            };

            metrics::record_background_job_execution(&job_id_owned, status_label, elapsed);
            metrics::set_background_job_running(&job_id_owned, false);

            if let Err(e) = ops_store.record_job_finish(run_id, status, error_msg) {
                error!("Failed to record job finish for {}: {}", job_id_owned, e);
            }

            let mut state = shared_state.write().await;
            state.running_jobs.remove(&job_id_owned);
        });

        self.running_handles.insert(job_id.to_string(), handle);
    }

    async fn update_schedule_after_run(&self, job_id: &str) {
        let interval = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => job.schedule().interval(),
                None => return,
            }
        };

        if let Some(interval) = interval {
            self.store_next_run(job_id, interval, Some(Utc::now()));
        }
    }

    async fn cleanup_completed_jobs(&mut self) {
        let completed: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in completed {
            if let Some(handle) = self.running_handles.remove(&job_id) {
                let _ = handle.await;
            }
            self.job_cancel_tokens.remove(&job_id);
            self.update_schedule_after_run(&job_id).await;
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        let behaviors: HashMap<String, ShutdownBehavior> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .map(|(job_id, job)| (job_id.clone(), job.shutdown_behavior()))
                .collect()
        };

        for (job_id, token) in &self.job_cancel_tokens {
            if behaviors.get(job_id).copied().unwrap_or_default() == ShutdownBehavior::Cancellable {
                debug!("Cancelling job: {}", job_id);
                token.cancel();
            }
        }

        for (job_id, handle) in self.running_handles.drain() {
            if behaviors.get(&job_id) == Some(&ShutdownBehavior::WaitForCompletion) {
                info!("Waiting for job {} to complete...", job_id);
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Job {} did not stop within {:?}", job_id, SHUTDOWN_GRACE);
            }
        }

        self.job_cancel_tokens.clear();
        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    ops_store: Arc<dyn OpsStore>,
    shutdown_token: CancellationToken,
    job_context: JobContext,
) -> (JobScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let (hook_tx, hook_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedJobState {
        jobs: HashMap::new(),
        running_jobs: HashSet::new(),
    }));

    let scheduler = JobScheduler::new(
        ops_store.clone(),
        hook_rx,
        command_rx,
        shutdown_token,
        job_context,
        Arc::clone(&shared_state),
    );

    let handle = SchedulerHandle::new(command_tx, hook_tx, shared_state, ops_store);

    (scheduler, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::job::JobSchedule;
    use crate::config::EngineSettings;
    use crate::engine::test_support::engine;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestJob {
        id: &'static str,
        schedule: JobSchedule,
        execution_count: Arc<AtomicUsize>,
        should_fail: Arc<AtomicBool>,
    }

    impl TestJob {
        fn on(id: &'static str, schedule: JobSchedule) -> (Arc<Self>, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            let job = Arc::new(Self {
                id,
                schedule,
                execution_count: count.clone(),
                should_fail: Arc::new(AtomicBool::new(false)),
            });
            (job, count)
        }
    }

    impl BackgroundJob for TestJob {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Test Job"
        }

        fn description(&self) -> &'static str {
            "A test job for unit tests"
        }

        fn schedule(&self) -> JobSchedule {
            self.schedule.clone()
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.execution_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                Err(JobError::ExecutionFailed("Test failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn create_test_scheduler(shutdown_token: CancellationToken) -> (JobScheduler, SchedulerHandle) {
        let t = engine(EngineSettings::default());
        let job_context = JobContext::new(shutdown_token.child_token(), t.ctx.clone());
        create_scheduler(t.ops.clone(), shutdown_token, job_context)
    }

    #[tokio::test]
    async fn test_register_and_list_jobs() {
        let (mut scheduler, handle) = create_test_scheduler(CancellationToken::new());
        assert!(handle.list_jobs().await.unwrap().is_empty());

        for id in ["job_b", "job_a"] {
            let (job, _) = TestJob::on(id, JobSchedule::Hook(HookEvent::OnStartup));
            scheduler.register_job(job).await;
        }

        let jobs = handle.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "job_a");
        assert_eq!(jobs[1].id, "job_b");
        assert!(!jobs[0].is_running);
        assert!(jobs[0].last_run.is_none());
        assert!(handle.job_exists("job_a").await);
        assert!(handle.get_job("nonexistent").await.unwrap().is_none());
        assert_eq!(scheduler.job_count().await, 2);
    }

    #[tokio::test]
    async fn test_job_execution_on_startup_hook() {
        let shutdown_token = CancellationToken::new();
        let (mut scheduler, handle) = create_test_scheduler(shutdown_token.clone());
        let (job, count) = TestJob::on("startup_job", JobSchedule::Hook(HookEvent::OnStartup));
        scheduler.register_job(job).await;

        let sched_handle = tokio::spawn(async move {
            scheduler.run().await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let history = handle.get_job_history("startup_job", 10).unwrap();
        assert!(!history.is_empty());
        assert_eq!(history[0].status, "completed");
        assert_eq!(history[0].triggered_by, "hook:OnStartup");

        shutdown_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_handle).await;
    }

    #[tokio::test]
    async fn test_notify_triggers_hook_jobs_only() {
        let shutdown_token = CancellationToken::new();
        let (mut scheduler, handle) = create_test_scheduler(shutdown_token.clone());
        let (closed_job, closed_count) = TestJob::on(
            "on_closed",
            JobSchedule::Combined {
                interval: Some(Duration::from_secs(3600)),
                hooks: vec![HookEvent::OnPetitionClosed],
            },
        );
        let (startup_job, startup_count) =
            TestJob::on("on_startup", JobSchedule::Hook(HookEvent::OnStartup));
        scheduler.register_job(closed_job).await;
        scheduler.register_job(startup_job).await;

        let sched_handle = tokio::spawn(async move {
            scheduler.run().await;
        });
        // The interval job runs once immediately since it never ran before.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(closed_count.load(Ordering::SeqCst), 1);

        handle.notify(HookEvent::OnPetitionClosed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(closed_count.load(Ordering::SeqCst), 2);
        assert_eq!(startup_count.load(Ordering::SeqCst), 1);
        let history = handle.get_job_history("on_closed", 10).unwrap();
        assert!(history
            .iter()
            .any(|run| run.triggered_by == "hook:OnPetitionClosed"));
        let info = handle.get_job("on_closed").await.unwrap().unwrap();
        assert!(info.next_run_at.is_some());

        shutdown_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_handle).await;
    }

    #[tokio::test]
    async fn test_manual_trigger_and_failure_recording() {
        let shutdown_token = CancellationToken::new();
        let (mut scheduler, handle) = create_test_scheduler(shutdown_token.clone());
        let (job, count) = TestJob::on("manual_job", JobSchedule::Hook(HookEvent::OnPetitionClosed));
        job.should_fail.store(true, Ordering::SeqCst);
        scheduler.register_job(job).await;

        let sched_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        assert!(matches!(
            handle.trigger_job("nonexistent").await,
            Err(JobError::NotFound)
        ));
        handle.trigger_job("manual_job").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let history = handle.get_job_history("manual_job", 10).unwrap();
        assert_eq!(history[0].status, "failed");
        assert_eq!(history[0].triggered_by, "manual");
        assert!(history[0]
            .error_message
            .as_ref()
            .unwrap()
            .contains("Test failure"));

        shutdown_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_handle).await;
    }
}
