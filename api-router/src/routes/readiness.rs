use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::api_state::ApiState;

/// Ready once the database answers queries.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.client.query("RETURN 1").await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
