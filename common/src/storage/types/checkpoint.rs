use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::job::ProgressCounters;

stored_object!(JobCheckpoint, "job_checkpoint", {
    job_id: String,
    last_chunk_index: u32,
    counters: ProgressCounters
});

impl JobCheckpoint {
    /// One checkpoint row per job; the record key is the job id.
    pub fn new(job_id: &str, last_chunk_index: u32, counters: ProgressCounters) -> Self {
        let now = Utc::now();
        Self {
            id: job_id.to_owned(),
            created_at: now,
            updated_at: now,
            job_id: job_id.to_owned(),
            last_chunk_index,
            counters,
        }
    }

    /// Persist the chunk watermark. Replays are harmless because upserts are
    /// idempotent; the checkpoint only has to be monotone per worker.
    pub async fn save(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "UPSERT type::thing($table, $id) SET
                     job_id = $job_id,
                     last_chunk_index = $last_chunk_index,
                     counters = $counters,
                     created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                     updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("job_id", self.job_id.clone()))
            .bind(("last_chunk_index", self.last_chunk_index))
            .bind(("counters", self.counters.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn get_for_job(
        job_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(job_id).await?)
    }

    pub async fn delete_for_job(job_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _removed: Option<Self> = db.delete_item(job_id).await?;
        Ok(())
    }

    /// A checkpoint is resumable while its last write is younger than the
    /// configured orphan window.
    pub fn is_fresh(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map_or(true, |age| age <= max_age)
    }
}
