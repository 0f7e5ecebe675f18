use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Quota exceeded: {0}")]
    Quota(String),
    #[error("Transient adapter error: {0}")]
    AdapterTransient(String),
    #[error("Fatal adapter error: {0}")]
    AdapterFatal(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a chunk-level retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::AdapterTransient(_))
    }

    /// Stable machine-readable code for the HTTP layer; raw messages never
    /// cross the API boundary for internal variants.
    pub fn taxonomy_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Auth(_) => "auth_error",
            AppError::Quota(_) => "quota_error",
            AppError::AdapterTransient(_) => "adapter_transient_error",
            AppError::AdapterFatal(_) => "adapter_fatal_error",
            AppError::Store(_) | AppError::Database(_) => "store_error",
            AppError::Cancelled => "cancelled",
            AppError::NotFound(_) => "not_found",
            _ => "internal_error",
        }
    }
}

/// Classify an `async-openai` failure into the retry taxonomy. Rate limits
/// and connection problems are worth retrying; everything else ends the
/// chunk.
pub fn classify_openai_error(err: &OpenAIError) -> AppError {
    match err {
        OpenAIError::Reqwest(e) => AppError::AdapterTransient(format!("network error: {e}")),
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            if code == "rate_limit_exceeded" || api.r#type.as_deref() == Some("server_error") {
                AppError::AdapterTransient(format!("provider error: {}", api.message))
            } else {
                AppError::AdapterFatal(format!("provider rejected request: {}", api.message))
            }
        }
        OpenAIError::JSONDeserialize(e) => {
            AppError::AdapterFatal(format!("malformed provider response: {e}"))
        }
        other => AppError::AdapterFatal(other.to_string()),
    }
}
