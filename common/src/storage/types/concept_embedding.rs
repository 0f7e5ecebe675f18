use std::collections::HashMap;

use surrealdb::RecordId;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ConceptEmbedding, "concept_embedding", {
    concept_id: RecordId,
    embedding: Vec<f32>,
    /// Identifier of the model that produced the vector; staleness marker.
    model: String,
    dimension: u32
});

impl ConceptEmbedding {
    /// One embedding row per concept; the row shares the concept's key so
    /// replays overwrite instead of accumulating.
    pub fn new(concept_id: &str, embedding: Vec<f32>, model: String) -> Self {
        let now = Utc::now();
        let dimension = u32::try_from(embedding.len()).unwrap_or(u32::MAX);
        Self {
            id: concept_id.to_owned(),
            created_at: now,
            updated_at: now,
            concept_id: RecordId::from_table_key("concept", concept_id),
            embedding,
            model,
            dimension,
        }
    }

    pub async fn get_by_concept_id(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(concept_id).await?)
    }

    /// Embeddings for a batch of concepts, keyed by concept id.
    pub async fn get_by_concept_ids(
        concept_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<HashMap<String, Vec<f32>>, AppError> {
        if concept_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let things: Vec<RecordId> = concept_ids
            .iter()
            .map(|id| RecordId::from_table_key(Self::table_name(), id))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE id INSIDE $things")
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.concept_id.key().to_string(), row.embedding))
            .collect())
    }

    /// Rows whose model differs from the active embedding model. Surfaced
    /// to operators; re-embedding runs only on explicit reconciliation.
    pub async fn stale_ids(
        active_model: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
        }
        let mut response = db
            .client
            .query("SELECT id FROM type::table($table) WHERE model != $model")
            .bind(("table", Self::table_name()))
            .bind(("model", active_model.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }
}
