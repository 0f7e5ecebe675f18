#![allow(clippy::missing_docs_in_private_items)]

use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use middleware_api_auth::api_auth;
use routes::{
    admin,
    ingest::ingest,
    jobs::{approve_job, cancel_job, get_job, list_jobs, reject_job, stream_job},
    liveness::live,
    ontologies,
    query::{concept_details, connect, connect_by_search, related, search},
    readiness::ready,
    vocabulary,
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // Protected API endpoints (require auth)
    let protected = Router::new()
        .route(
            "/ingest",
            post(ingest).layer(DefaultBodyLimit::max(app_state.config.ingest_max_body_bytes)),
        )
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/approve", post(approve_job))
        .route("/jobs/{id}/reject", post(reject_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/stream", get(stream_job))
        .route("/search", post(search))
        .route("/concepts/{id}", get(concept_details))
        .route("/related", post(related))
        .route("/connect", post(connect))
        .route("/connect-by-search", post(connect_by_search))
        .route("/vocabulary", get(vocabulary::list))
        .route("/ontologies/{name}", delete(ontologies::delete))
        .route("/admin/reconcile", post(admin::reconcile))
        .route_layer(from_fn_with_state(app_state.clone(), api_auth));

    public.merge(protected)
}
