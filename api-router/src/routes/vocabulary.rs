use axum::{extract::State, response::IntoResponse, Json};
use common::storage::types::vocabulary::RelationshipType;
use serde_json::json;

use crate::{api_state::ApiState, error::ApiError};

/// The relationship vocabulary, active entries first.
pub async fn list(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let mut entries = RelationshipType::load_all(&state.db).await?;
    entries.sort_by(|a, b| {
        b.is_active
            .cmp(&a.is_active)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(Json(json!({ "vocabulary": entries })))
}
