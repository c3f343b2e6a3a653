//! SQLite schema for the durable job queue (`queue.db`).

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const JOB_QUEUE_TABLE_V1: Table = Table {
    name: "job_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("lane", &SqlType::Integer, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("unique_key", &SqlType::Text),
        sqlite_column!("run_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("locked_by", &SqlType::Text),
        sqlite_column!("locked_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("finished_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_job_queue_claim", "status, lane, run_at, id"),
        ("idx_job_queue_unique_key", "unique_key, status"),
        ("idx_job_queue_locked_at", "status, locked_at"),
    ],
    unique_constraints: &[],
};

pub const QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOB_QUEUE_TABLE_V1],
    migration: None,
}];
