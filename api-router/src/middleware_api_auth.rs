use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use common::storage::types::principal::Principal;

use crate::{api_state::ApiState, error::ApiError};

/// Resolve the bearer key to a validated principal. Auth mechanics beyond
/// the key lookup live outside the core; handlers consume the principal
/// from request extensions.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = extract_api_key(&request)
        .ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))?;

    let principal = Principal::find_by_api_key(&api_key, &state.db).await?;
    let principal = principal
        .ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))?;

    request.extensions_mut().insert(principal);

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        })
        .map(String::from)
}
