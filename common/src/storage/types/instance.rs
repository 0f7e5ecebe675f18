use sha2::{Digest, Sha256};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::source::Source;

stored_object!(Instance, "instance", {
    quote: String,
    char_offset_start: u64,
    char_offset_end: u64,
    concept_id: String,
    source_id: String
});

impl Instance {
    /// Dedup key: the same quote span in the same source chunk is one
    /// instance, no matter how often a chunk is replayed.
    pub fn deterministic_id(
        source_id: &str,
        char_offset_start: u64,
        char_offset_end: u64,
        quote: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(char_offset_start.to_be_bytes());
        hasher.update(char_offset_end.to_be_bytes());
        hasher.update(quote.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn new(
        quote: String,
        char_offset_start: u64,
        char_offset_end: u64,
        concept_id: String,
        source_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::deterministic_id(&source_id, char_offset_start, char_offset_end, &quote),
            created_at: now,
            updated_at: now,
            quote,
            char_offset_start,
            char_offset_end,
            concept_id,
            source_id,
        }
    }

    /// Byte offsets must slice the exact quote out of the chunk text.
    pub fn verify_against(&self, full_text: &str) -> bool {
        let start = usize::try_from(self.char_offset_start).unwrap_or(usize::MAX);
        let end = usize::try_from(self.char_offset_end).unwrap_or(usize::MAX);
        full_text.get(start..end) == Some(self.quote.as_str())
    }

    pub async fn store_if_absent(&self, db: &SurrealDbClient) -> Result<bool, AppError> {
        match db.store_item(self.clone()).await {
            Ok(_) => Ok(true),
            Err(err) if err.to_string().contains("already exists") => Ok(false),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    /// Evidence for a concept, ordered by source then offset.
    pub async fn list_for_concept(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table) WHERE concept_id = $concept_id
                 ORDER BY source_id ASC, char_offset_start ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("concept_id", concept_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn count_for_concept(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<u64, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: u64,
        }
        let mut response = db
            .client
            .query(
                "SELECT count() AS total FROM type::table($table)
                 WHERE concept_id = $concept_id GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("concept_id", concept_id.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.total))
    }

    pub async fn delete_by_source_ids(
        source_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE FROM type::table($table) WHERE source_id IN $source_ids")
            .bind(("table", Self::table_name()))
            .bind(("source_ids", source_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    /// Rehome all evidence of one concept onto another (reconciliation).
    pub async fn reassign_concept(
        from_concept: &str,
        to_concept: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::table($table) SET concept_id = $to, updated_at = time::now()
                 WHERE concept_id = $from",
            )
            .bind(("table", Self::table_name()))
            .bind(("from", from_concept.to_owned()))
            .bind(("to", to_concept.to_owned()))
            .await?
            .check()?;
        Ok(())
    }
}

/// Check the offset invariant for a batch of instances against their source.
pub fn verify_instances(source: &Source, instances: &[Instance]) -> bool {
    instances
        .iter()
        .all(|instance| instance.verify_against(&source.full_text))
}
