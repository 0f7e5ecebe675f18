use sha2::{Digest, Sha256};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Source, "source", {
    document: String,
    ontology: String,
    chunk_index: u32,
    full_text: String,
    document_hash: String
});

impl Source {
    /// Deterministic source id: one chunk of one document always maps to
    /// the same record.
    pub fn deterministic_id(document_hash: &str, chunk_index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_hash.as_bytes());
        hasher.update(b":");
        hasher.update(chunk_index.to_string().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn new(
        document: String,
        ontology: String,
        chunk_index: u32,
        full_text: String,
        document_hash: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::deterministic_id(&document_hash, chunk_index),
            created_at: now,
            updated_at: now,
            document,
            ontology,
            chunk_index,
            full_text,
            document_hash,
        }
    }

    /// Store the source unless an identical record already exists. Sources
    /// are immutable; a duplicate create is a no-op. Returns whether a row
    /// was created.
    pub async fn store_if_absent(&self, db: &SurrealDbClient) -> Result<bool, AppError> {
        match db.store_item(self.clone()).await {
            Ok(_) => Ok(true),
            Err(err) if is_already_exists(&err) => Ok(false),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    pub async fn get_by_ids(
        ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<surrealdb::RecordId> = ids
            .iter()
            .map(|id| surrealdb::RecordId::from_table_key(Self::table_name(), id))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE id IN $things")
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn list_by_ontology(
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE ontology = $ontology")
            .bind(("table", Self::table_name()))
            .bind(("ontology", ontology.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn delete_by_ontology(
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE FROM type::table($table) WHERE ontology = $ontology")
            .bind(("table", Self::table_name()))
            .bind(("ontology", ontology.to_owned()))
            .await?
            .check()?;
        Ok(())
    }
}

fn is_already_exists(err: &surrealdb::Error) -> bool {
    err.to_string().contains("already exists")
}
