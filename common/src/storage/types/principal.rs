use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Principal, "principal", {
    name: String,
    api_key: String,
    auto_approve_allowed: bool
});

impl Principal {
    /// Auth mechanics live outside the core; this row is what a validated
    /// bearer key resolves to.
    pub fn new(name: String, auto_approve_allowed: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            api_key: Uuid::new_v4().to_string(),
            auto_approve_allowed,
        }
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE api_key = $api_key LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("api_key", api_key.to_owned()))
            .await?;
        let principals: Vec<Self> = response.take(0)?;
        Ok(principals.into_iter().next())
    }
}
