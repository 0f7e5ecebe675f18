use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use common::storage::ontology::delete_ontology;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

/// Delete an ontology and everything only it evidences.
pub async fn delete(
    State(state): State<ApiState>,
    Path(ontology): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = delete_ontology(&ontology, &state.db).await?;
    info!(
        ontology = %outcome.ontology,
        sources_deleted = outcome.sources_deleted,
        "ontology deletion requested via API"
    );
    Ok(Json(outcome))
}
