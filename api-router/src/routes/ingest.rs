use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use common::storage::types::{job::JobType, principal::Principal};
use ingestion_pipeline::SubmitRequest;
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct IngestParams {
    pub text: Option<String>,
    pub ontology: String,
    pub filename: Option<String>,
    #[form_data(default)]
    pub auto_approve: bool,
    #[form_data(default)]
    pub force: bool,
    pub metadata: Option<String>,
    #[form_data(limit = "10000000")]
    pub file: Option<FieldData<NamedTempFile>>,
}

/// Submit content for ingestion. Returns the job with its synchronous
/// analysis; execution waits behind the approval gate.
pub async fn ingest(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    TypedMultipart(input): TypedMultipart<IngestParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (job_type, document, text) = resolve_content(&state, input.file, input.text, input.filename).await?;

    let metadata = input
        .metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|err| ApiError::ValidationError(format!("metadata is not valid JSON: {err}")))?;

    info!(
        principal = %principal.id,
        ontology = %input.ontology,
        document = %document,
        "ingest request received"
    );

    let job = state
        .scheduler
        .submit(
            &principal,
            SubmitRequest {
                job_type,
                text,
                document,
                ontology: input.ontology,
                auto_approve: input.auto_approve,
                force: input.force,
                metadata,
            },
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "job_id": job.id,
            "status": job.status.as_str(),
            "analysis": job.analysis,
        })),
    ))
}

/// Turn the multipart payload into canonical-text input: direct text,
/// an uploaded text file, or an image routed through the vision adapter.
async fn resolve_content(
    state: &ApiState,
    file: Option<FieldData<NamedTempFile>>,
    text: Option<String>,
    filename: Option<String>,
) -> Result<(JobType, String, String), ApiError> {
    if let Some(file) = file {
        let document = file
            .metadata
            .file_name
            .clone()
            .or(filename)
            .ok_or_else(|| ApiError::ValidationError("uploaded file needs a filename".into()))?;

        let bytes = tokio::fs::read(file.contents.path())
            .await
            .map_err(|err| ApiError::InternalError(err.to_string()))?;

        let mime = mime_guess::from_path(&document).first_or_octet_stream();
        if mime.type_() == mime_guess::mime::IMAGE {
            let description = state
                .vision
                .describe_image(&bytes, mime.essence_str())
                .await?;
            return Ok((JobType::IngestImage, document, description));
        }

        let text = String::from_utf8(bytes)
            .map_err(|_| ApiError::ValidationError("file is not valid UTF-8 text".into()))?;
        return Ok((JobType::IngestFile, document, text));
    }

    let text = text.ok_or_else(|| {
        ApiError::ValidationError("either a file or a text field is required".into())
    })?;
    let document = filename
        .ok_or_else(|| ApiError::ValidationError("filename is required for text input".into()))?;
    Ok((JobType::IngestText, document, text))
}
