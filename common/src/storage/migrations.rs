use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::error::AppError;

use super::db::SurrealDbClient;

/// One forward-only schema migration. The DDL block runs inside a single
/// transaction together with the `schema_migrations` bookkeeping write.
struct Migration {
    version: u32,
    name: &'static str,
    ddl: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "graph_tables",
        ddl: r"
            DEFINE TABLE IF NOT EXISTS concept SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS concept_embedding SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS source SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS instance SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS relationship_vocabulary SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_embedding_concept ON concept_embedding FIELDS embedding HNSW DIMENSION 1536;
            DEFINE INDEX IF NOT EXISTS idx_source_document_hash ON source FIELDS document_hash;
            DEFINE INDEX IF NOT EXISTS idx_source_ontology ON source FIELDS ontology;
            DEFINE INDEX IF NOT EXISTS idx_instance_concept ON instance FIELDS concept_id;
            DEFINE INDEX IF NOT EXISTS idx_instance_source ON instance FIELDS source_id;
        ",
    },
    Migration {
        version: 2,
        name: "job_tables",
        ddl: r"
            DEFINE TABLE IF NOT EXISTS job SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS job_content SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS job_checkpoint SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS principal SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_job_status ON job FIELDS status;
            DEFINE INDEX IF NOT EXISTS idx_job_principal ON job FIELDS principal_id;
            DEFINE INDEX IF NOT EXISTS idx_job_created ON job FIELDS created_at;
            DEFINE INDEX IF NOT EXISTS idx_job_content_hash ON job FIELDS content_hash;
            DEFINE INDEX IF NOT EXISTS idx_principal_api_key ON principal FIELDS api_key;
        ",
    },
    Migration {
        version: 3,
        name: "seed_vocabulary",
        ddl: r"
            UPSERT relationship_vocabulary:IMPLIES SET description = 'Logical implication between concepts', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:SUPPORTS SET description = 'One concept provides evidence for another', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:CONTRADICTS SET description = 'Concepts in tension or direct conflict', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:PART_OF SET description = 'Component or membership relation', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:CAUSES SET description = 'Causal relation', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:USES SET description = 'One concept employs or depends on another', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:EXTENDS SET description = 'One concept builds upon another', is_active = true, merged_into = NONE;
            UPSERT relationship_vocabulary:RELATES_TO SET description = 'Generic association', is_active = true, merged_into = NONE;
        ",
    },
];

#[derive(Deserialize)]
struct AppliedRow {
    version: u32,
}

/// Apply every migration not yet recorded in `schema_migrations`, in order.
pub async fn apply(db: &SurrealDbClient) -> Result<(), AppError> {
    db.client
        .query("DEFINE TABLE IF NOT EXISTS schema_migrations SCHEMALESS;")
        .await?
        .check()?;

    let mut response = db
        .client
        .query("SELECT version FROM schema_migrations ORDER BY version ASC")
        .await?;
    let applied: Vec<AppliedRow> = response.take(0)?;
    let latest = applied.iter().map(|row| row.version).max().unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > latest) {
        let query = format!(
            "BEGIN TRANSACTION;
             {ddl}
             CREATE schema_migrations:{version} SET version = {version}, name = $name, applied_at = $applied_at;
             COMMIT TRANSACTION;",
            ddl = migration.ddl,
            version = migration.version,
        );
        db.client
            .query(query)
            .bind(("name", migration.name))
            .bind(("applied_at", surrealdb::Datetime::from(Utc::now())))
            .await?
            .check()?;
        info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
    }

    Ok(())
}
