use std::{convert::Infallible, time::Duration};

use async_stream::stream;
use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Extension, Json,
};
use common::storage::types::{job::Job, principal::Principal};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::{api_state::ApiState, error::ApiError};

fn job_payload(job: &Job) -> serde_json::Value {
    json!({
        "job_id": job.id,
        "job_type": job.job_type,
        "status": job.status.as_str(),
        "ontology": job.ontology,
        "document": job.document,
        "analysis": job.analysis,
        "progress": job.progress,
        "error": job.error,
        "created_at": job.created_at,
        "approved_at": job.approved_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
        "expires_at": job.expires_at,
    })
}

pub async fn get_job(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.scheduler.status(&principal, &job_id).await?;
    Ok(Json(job_payload(&job)))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.scheduler.jobs_for_principal(&principal).await?;
    let jobs: Vec<serde_json::Value> = jobs.iter().map(job_payload).collect();
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn approve_job(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.scheduler.approve(&principal, &job_id).await?;
    Ok(Json(job_payload(&job)))
}

pub async fn reject_job(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.scheduler.reject(&principal, &job_id).await?;
    Ok(Json(job_payload(&job)))
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.scheduler.cancel(&principal, &job_id).await?;
    Ok(Json(job_payload(&job)))
}

/// Long-lived progress stream: last-known snapshot first, then live deltas.
/// Each frame is an independent JSON object; the event id carries the
/// per-job sequence so clients can reconnect with Last-Event-ID semantics.
/// Disconnecting never affects job execution.
pub async fn stream_job(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (snapshot, mut rx) = state.scheduler.subscribe(&principal, &job_id).await?;

    let event_stream = stream! {
        let mut last_status = None;
        if let Some(snapshot) = snapshot {
            last_status = Some(snapshot.status.clone());
            yield Ok::<Event, Infallible>(progress_frame(&snapshot));
            if is_terminal_status(&snapshot.status) {
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    last_status = Some(event.status.clone());
                    let terminal = is_terminal_status(&event.status);
                    yield Ok(progress_frame(&event));
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Slow subscriber: skip ahead rather than block anyone.
                    debug!(job_id = %job_id, skipped, "progress subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }

        debug!(job_id = %job_id, ?last_status, "progress stream closed");
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn progress_frame(event: &ingestion_pipeline::ProgressEvent) -> Event {
    let frame = Event::default()
        .id(event.sequence.to_string())
        .event("progress");
    match serde_json::to_string(event) {
        Ok(data) => frame.data(data),
        Err(_) => frame.data("{}"),
    }
}

fn is_terminal_status(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "cancelled" | "rejected")
}
