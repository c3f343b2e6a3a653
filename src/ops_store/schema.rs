//! SQLite schema for the operational database (`ops.db`).
//!
//! Holds everything about how the engine itself is running: scheduled job
//! history, next-run bookkeeping, the job audit trail and raised alerts.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job runs, schedules and audit log
// =============================================================================

const JOB_RUNS_TABLE_V1: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_runs_job_id_started", "job_id, started_at DESC"),
        ("idx_job_runs_status", "status"),
    ],
    unique_constraints: &[],
};

const JOB_SCHEDULES_TABLE_V1: Table = Table {
    name: "job_schedules",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("next_run_at", &SqlType::Text, non_null = true),
        sqlite_column!("last_run_at", &SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[],
};

const JOB_AUDIT_LOG_TABLE_V1: Table = Table {
    name: "job_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Text, non_null = true),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
    ],
    indices: &[
        ("idx_job_audit_log_job_id", "job_id"),
        ("idx_job_audit_log_timestamp", "timestamp DESC"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - Engine alerts
// =============================================================================

const ENGINE_ALERTS_TABLE_V2: Table = Table {
    name: "engine_alerts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("petition_id", &SqlType::Integer),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_engine_alerts_kind_created", "kind, created_at DESC"),
        ("idx_engine_alerts_petition", "petition_id"),
    ],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    ENGINE_ALERTS_TABLE_V2.create(conn)
}

/// Version 1: job runs, schedules, audit log
/// Version 2: engine alerts
pub const OPS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            JOB_RUNS_TABLE_V1,
            JOB_SCHEDULES_TABLE_V1,
            JOB_AUDIT_LOG_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            JOB_RUNS_TABLE_V1,
            JOB_SCHEDULES_TABLE_V1,
            JOB_AUDIT_LOG_TABLE_V1,
            ENGINE_ALERTS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
