use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,
    pub worker_count: Option<usize>,
    pub poll_interval_ms: Option<u64>,

    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct EngineConfig {
    // Counter
    pub signature_count_interval_secs: Option<u64>,
    pub counter_enabled: Option<bool>,
    // Batches
    pub archive_batch_limit: Option<usize>,
    pub anonymize_batch_limit: Option<usize>,
    pub termination_reschedule_delay_secs: Option<u64>,
    // Auditor
    pub audit_lookback_hours: Option<u64>,
    pub audit_interval_minutes: Option<u64>,
    pub stuck_reset_timeout_secs: Option<u64>,
    // Enqueuers
    pub archive_interval_minutes: Option<u64>,
    pub anonymize_interval_hours: Option<u64>,
    pub anonymize_after_days: Option<u64>,
    // Queue housekeeping
    pub stale_job_timeout_secs: Option<u64>,
    pub finished_job_retention_days: Option<u64>,
    pub max_attempts: Option<u32>,
    // Ops database housekeeping
    pub ops_retention_days: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_engine_table() {
        let config: FileConfig = toml::from_str(
            r#"
            db_dir = "/data"
            worker_count = 4

            [engine]
            signature_count_interval_secs = 30
            counter_enabled = false
            archive_batch_limit = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/data"));
        assert_eq!(config.worker_count, Some(4));
        assert!(config.metrics_port.is_none());
        let engine = config.engine.unwrap();
        assert_eq!(engine.signature_count_interval_secs, Some(30));
        assert_eq!(engine.counter_enabled, Some(false));
        assert_eq!(engine.archive_batch_limit, Some(250));
        assert!(engine.anonymize_batch_limit.is_none());
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.engine.is_none());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_count = \"many\"").unwrap();

        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
