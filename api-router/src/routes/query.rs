use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use query_engine::SearchRequest;
use serde::Deserialize;

use crate::{api_state::ApiState, error::ApiError};

pub async fn search(
    State(state): State<ApiState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.query.search(request).await?;
    Ok(Json(response))
}

pub async fn concept_details(
    State(state): State<ApiState>,
    Path(concept_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state.query.details(&concept_id).await?;
    Ok(Json(details))
}

#[derive(Debug, Deserialize)]
pub struct RelatedRequest {
    pub concept_id: String,
    pub max_depth: Option<usize>,
    pub rel_types: Option<Vec<String>>,
}

pub async fn related(
    State(state): State<ApiState>,
    Json(request): Json<RelatedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let related = state
        .query
        .related(
            &request.concept_id,
            request.max_depth.unwrap_or(2),
            request.rel_types.as_deref(),
        )
        .await?;
    let count = related.len();
    Ok(Json(serde_json::json!({
        "related": related,
        "count": count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub from_id: String,
    pub to_id: String,
    pub max_hops: Option<usize>,
}

pub async fn connect(
    State(state): State<ApiState>,
    Json(request): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .query
        .connect(
            &request.from_id,
            &request.to_id,
            request.max_hops.unwrap_or(query_engine::MAX_CONNECT_HOPS),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ConnectBySearchRequest {
    pub from_query: String,
    pub to_query: String,
    pub max_hops: Option<usize>,
}

pub async fn connect_by_search(
    State(state): State<ApiState>,
    Json(request): Json<ConnectBySearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .query
        .connect_by_search(
            &request.from_query,
            &request.to_query,
            request.max_hops.unwrap_or(query_engine::MAX_CONNECT_HOPS),
        )
        .await?;
    Ok(Json(response))
}
