use axum::{extract::State, response::IntoResponse, Json};
use common::storage::types::concept::Concept;
use ingestion_pipeline::reconcile::reconcile_once;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    /// Also regenerate every concept embedding under the active model.
    #[serde(default)]
    pub reembed: bool,
}

/// Explicit reconciliation request: merge duplicate concepts, and re-embed
/// the graph when asked. Re-embedding never happens on the ingest path.
pub async fn reconcile(
    State(state): State<ApiState>,
    body: Option<Json<ReconcileRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let reembedded = if request.reembed {
        Concept::update_all_embeddings(&state.db, state.embeddings.as_ref()).await?
    } else {
        0
    };

    let merged = reconcile_once(&state.db, state.config.concept_merge_threshold).await?;

    info!(merged, reembedded, "reconciliation requested via API");
    Ok(Json(json!({
        "merged": merged,
        "reembedded": reembedded,
    })))
}
