use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(JobContent, "job_content", {
    text: String,
    document_hash: String
});

impl JobContent {
    /// Canonical parsed text held for the worker between submit and
    /// execution; the job's `content_ref` points here.
    pub fn new(text: String, document_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            text,
            document_hash,
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job content {id} not found")))
    }
}
