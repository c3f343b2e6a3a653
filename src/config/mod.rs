mod file_config;

pub use file_config::{EngineConfig, FileConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,
    pub worker_count: usize,
    pub poll_interval_ms: u64,

    pub engine: EngineSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let worker_count = file.worker_count.unwrap_or(cli.worker_count).max(1);
        let poll_interval_ms = file.poll_interval_ms.unwrap_or(cli.poll_interval_ms).max(10);

        let engine = EngineSettings::from_file(file.engine.unwrap_or_default())?;

        Ok(Self {
            db_dir,
            metrics_port,
            worker_count,
            poll_interval_ms,
            engine,
        })
    }

    pub fn petitions_db_path(&self) -> PathBuf {
        self.db_dir.join("petitions.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.db_dir.join("queue.db")
    }

    pub fn ops_db_path(&self) -> PathBuf {
        self.db_dir.join("ops.db")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub signature_count_interval_secs: u64,
    pub counter_enabled: bool,
    pub archive_batch_limit: usize,
    pub anonymize_batch_limit: usize,
    pub termination_reschedule_delay_secs: u64,
    pub audit_lookback_hours: u64,
    pub audit_interval_minutes: u64,
    pub stuck_reset_timeout_secs: u64,
    pub archive_interval_minutes: u64,
    pub anonymize_interval_hours: u64,
    pub anonymize_after_days: u64,
    pub stale_job_timeout_secs: u64,
    pub finished_job_retention_days: u64,
    /// Job run history, job audit log and alerts.
    pub ops_retention_days: u64,
    pub max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            signature_count_interval_secs: 60,
            counter_enabled: true,
            archive_batch_limit: 1000,
            anonymize_batch_limit: 1000,
            termination_reschedule_delay_secs: 300,
            audit_lookback_hours: 36,
            audit_interval_minutes: 60,
            stuck_reset_timeout_secs: 300,
            archive_interval_minutes: 60,
            anonymize_interval_hours: 24,
            anonymize_after_days: 365,
            stale_job_timeout_secs: 3600,
            finished_job_retention_days: 7,
            ops_retention_days: 30,
            max_attempts: 10,
        }
    }
}

impl EngineSettings {
    /// Merges the `[engine]` table over the defaults.
    pub fn from_file(file: EngineConfig) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            signature_count_interval_secs: file
                .signature_count_interval_secs
                .unwrap_or(defaults.signature_count_interval_secs),
            counter_enabled: file.counter_enabled.unwrap_or(defaults.counter_enabled),
            archive_batch_limit: file
                .archive_batch_limit
                .unwrap_or(defaults.archive_batch_limit),
            anonymize_batch_limit: file
                .anonymize_batch_limit
                .unwrap_or(defaults.anonymize_batch_limit),
            termination_reschedule_delay_secs: file
                .termination_reschedule_delay_secs
                .unwrap_or(defaults.termination_reschedule_delay_secs),
            audit_lookback_hours: file
                .audit_lookback_hours
                .unwrap_or(defaults.audit_lookback_hours),
            audit_interval_minutes: file
                .audit_interval_minutes
                .unwrap_or(defaults.audit_interval_minutes),
            stuck_reset_timeout_secs: file
                .stuck_reset_timeout_secs
                .unwrap_or(defaults.stuck_reset_timeout_secs),
            archive_interval_minutes: file
                .archive_interval_minutes
                .unwrap_or(defaults.archive_interval_minutes),
            anonymize_interval_hours: file
                .anonymize_interval_hours
                .unwrap_or(defaults.anonymize_interval_hours),
            anonymize_after_days: file
                .anonymize_after_days
                .unwrap_or(defaults.anonymize_after_days),
            stale_job_timeout_secs: file
                .stale_job_timeout_secs
                .unwrap_or(defaults.stale_job_timeout_secs),
            finished_job_retention_days: file
                .finished_job_retention_days
                .unwrap_or(defaults.finished_job_retention_days),
            ops_retention_days: file
                .ops_retention_days
                .unwrap_or(defaults.ops_retention_days),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
        };

        if settings.signature_count_interval_secs == 0 {
            bail!("engine.signature_count_interval_secs must be greater than 0");
        }
        if settings.archive_batch_limit == 0 || settings.anonymize_batch_limit == 0 {
            bail!("engine batch limits must be greater than 0");
        }
        if settings.max_attempts == 0 {
            bail!("engine.max_attempts must be greater than 0");
        }
        Ok(settings)
    }

    pub fn signature_count_interval(&self) -> Duration {
        Duration::from_secs(self.signature_count_interval_secs)
    }

    pub fn termination_reschedule_delay(&self) -> Duration {
        Duration::from_secs(self.termination_reschedule_delay_secs)
    }

    pub fn audit_lookback(&self) -> Duration {
        Duration::from_secs(self.audit_lookback_hours * 3600)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_minutes * 60)
    }

    pub fn stuck_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_reset_timeout_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_minutes * 60)
    }

    pub fn anonymize_interval(&self) -> Duration {
        Duration::from_secs(self.anonymize_interval_hours * 3600)
    }

    pub fn anonymize_after(&self) -> Duration {
        Duration::from_secs(self.anonymize_after_days * 86400)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }

    pub fn finished_job_retention(&self) -> Duration {
        Duration::from_secs(self.finished_job_retention_days * 86400)
    }

    pub fn ops_retention(&self) -> Duration {
        Duration::from_secs(self.ops_retention_days * 86400)
    }
}
