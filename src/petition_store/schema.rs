//! SQLite schema for the petition database (`petitions.db`).
//!
//! All timestamps are INTEGER Unix milliseconds.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

const PETITION_FK: ForeignKey = ForeignKey {
    foreign_table: "petitions",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

// =============================================================================
// Version 1 - Petitions, signatures and journals
// =============================================================================

const PETITIONS_TABLE_V1: Table = Table {
    name: "petitions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "signature_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_signed_at", &SqlType::Integer),
        sqlite_column!("signature_count_validated_at", &SqlType::Integer),
        sqlite_column!("signature_count_reset_at", &SqlType::Integer),
        sqlite_column!("opened_at", &SqlType::Integer),
        sqlite_column!("closed_at", &SqlType::Integer),
        sqlite_column!("archived_at", &SqlType::Integer),
        sqlite_column!("anonymized_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_petitions_last_signed_at", "last_signed_at"),
        ("idx_petitions_state_archived", "state, archived_at"),
        ("idx_petitions_reset_at", "signature_count_reset_at"),
    ],
    unique_constraints: &[],
};

const SIGNATURES_TABLE_V1: Table = Table {
    name: "signatures",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "petition_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&PETITION_FK)
        ),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("email", &SqlType::Text, non_null = true),
        sqlite_column!("postcode", &SqlType::Text),
        sqlite_column!("ip_address", &SqlType::Text),
        sqlite_column!("constituency_id", &SqlType::Text),
        sqlite_column!("location_code", &SqlType::Text, non_null = true),
        sqlite_column!("validated_at", &SqlType::Integer),
        sqlite_column!(
            "creator",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "sponsor",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("archived_at", &SqlType::Integer),
        sqlite_column!("anonymized_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        (
            "idx_signatures_petition_validated",
            "petition_id, state, validated_at",
        ),
        ("idx_signatures_petition_archived", "petition_id, archived_at"),
        (
            "idx_signatures_petition_anonymized",
            "petition_id, anonymized_at",
        ),
    ],
    unique_constraints: &[],
};

const CONSTITUENCY_JOURNALS_TABLE_V1: Table = Table {
    name: "constituency_journals",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "petition_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&PETITION_FK)
        ),
        sqlite_column!("constituency_id", &SqlType::Text, non_null = true),
        sqlite_column!(
            "signature_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_signed_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["petition_id", "constituency_id"]],
};

const COUNTRY_JOURNALS_TABLE_V1: Table = Table {
    name: "country_journals",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "petition_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&PETITION_FK)
        ),
        sqlite_column!("location_code", &SqlType::Text, non_null = true),
        sqlite_column!(
            "signature_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_signed_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["petition_id", "location_code"]],
};

// =============================================================================
// Version 2 - Archive storage
// =============================================================================

/// Archived copies keep the live petition id as primary key, so a second copy
/// of the same petition is a constraint violation rather than a duplicate.
const ARCHIVED_PETITIONS_TABLE_V2: Table = Table {
    name: "archived_petitions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("signature_count", &SqlType::Integer, non_null = true),
        sqlite_column!("opened_at", &SqlType::Integer),
        sqlite_column!("closed_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("constituency_breakdown", &SqlType::Text, non_null = true),
        sqlite_column!("country_breakdown", &SqlType::Text, non_null = true),
        sqlite_column!("archived_at", &SqlType::Integer),
        sqlite_column!("anonymized_at", &SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[],
};

const ARCHIVED_SIGNATURES_TABLE_V2: Table = Table {
    name: "archived_signatures",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("petition_id", &SqlType::Integer, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("email", &SqlType::Text, non_null = true),
        sqlite_column!("postcode", &SqlType::Text),
        sqlite_column!("ip_address", &SqlType::Text),
        sqlite_column!("constituency_id", &SqlType::Text),
        sqlite_column!("location_code", &SqlType::Text, non_null = true),
        sqlite_column!("validated_at", &SqlType::Integer),
        sqlite_column!("creator", &SqlType::Integer, non_null = true),
        sqlite_column!("sponsor", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("archived_at", &SqlType::Integer, non_null = true),
        sqlite_column!("anonymized_at", &SqlType::Integer),
    ],
    indices: &[("idx_archived_signatures_petition", "petition_id")],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    ARCHIVED_PETITIONS_TABLE_V2.create(conn)?;
    ARCHIVED_SIGNATURES_TABLE_V2.create(conn)?;
    Ok(())
}

/// Version 1: petitions, signatures, constituency and country journals
/// Version 2: archived petitions and signatures
pub const PETITION_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            PETITIONS_TABLE_V1,
            SIGNATURES_TABLE_V1,
            CONSTITUENCY_JOURNALS_TABLE_V1,
            COUNTRY_JOURNALS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            PETITIONS_TABLE_V1,
            SIGNATURES_TABLE_V1,
            CONSTITUENCY_JOURNALS_TABLE_V1,
            COUNTRY_JOURNALS_TABLE_V1,
            ARCHIVED_PETITIONS_TABLE_V2,
            ARCHIVED_SIGNATURES_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
