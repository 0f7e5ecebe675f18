use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI-compatible embeddings endpoint.
    OpenAi,
    /// Deterministic local bag-of-words embedding; offline and test use.
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAi
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_extraction_model")]
    pub extraction_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_job_approval_timeout_secs")]
    pub job_approval_timeout_secs: u64,
    #[serde(default = "default_job_completed_retention_secs")]
    pub job_completed_retention_secs: u64,
    #[serde(default = "default_job_failed_retention_secs")]
    pub job_failed_retention_secs: u64,
    #[serde(default = "default_job_cleanup_interval_secs")]
    pub job_cleanup_interval_secs: u64,

    #[serde(default = "default_chunk_target_tokens")]
    pub chunk_target_tokens: usize,
    #[serde(default = "default_chunk_overlap_tokens")]
    pub chunk_overlap_tokens: usize,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_extract_max_retries")]
    pub extract_max_retries: usize,
    #[serde(default = "default_checkpoint_max_age_secs")]
    pub checkpoint_max_age_secs: u64,

    #[serde(default = "default_concept_merge_threshold")]
    pub concept_merge_threshold: f32,
    #[serde(default = "default_true")]
    pub vocabulary_expansion: bool,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_ingest_max_body_bytes")]
    pub ingest_max_body_bytes: usize,

    /// Optional submit-time budget; estimates above it are rejected.
    #[serde(default)]
    pub max_job_cost_usd: Option<f64>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_extraction_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_job_approval_timeout_secs() -> u64 {
    3600
}

fn default_job_completed_retention_secs() -> u64 {
    86_400
}

fn default_job_failed_retention_secs() -> u64 {
    259_200
}

fn default_job_cleanup_interval_secs() -> u64 {
    60
}

fn default_chunk_target_tokens() -> usize {
    900
}

fn default_chunk_overlap_tokens() -> usize {
    150
}

fn default_chunk_timeout_secs() -> u64 {
    600
}

fn default_extract_max_retries() -> usize {
    3
}

fn default_checkpoint_max_age_secs() -> u64 {
    900
}

fn default_concept_merge_threshold() -> f32 {
    0.85
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_ingest_max_body_bytes() -> usize {
    10_000_000
}

impl AppConfig {
    pub fn job_approval_timeout(&self) -> Duration {
        Duration::from_secs(self.job_approval_timeout_secs)
    }

    pub fn job_completed_retention(&self) -> Duration {
        Duration::from_secs(self.job_completed_retention_secs)
    }

    pub fn job_failed_retention(&self) -> Duration {
        Duration::from_secs(self.job_failed_retention_secs)
    }

    pub fn job_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.job_cleanup_interval_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// A config suitable for tests: in-memory database, hashed embeddings,
    /// short maintenance intervals.
    pub fn for_tests() -> Self {
        Self {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test_ns".into(),
            surrealdb_database: "test_db".into(),
            http_port: 0,
            openai_base_url: "https://example.invalid/v1".into(),
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_model: "hashed".into(),
            embedding_dimension: 64,
            extraction_model: "gpt-4o-mini".into(),
            vision_model: "gpt-4o-mini".into(),
            max_concurrent_jobs: 2,
            job_approval_timeout_secs: 1,
            job_completed_retention_secs: 3600,
            job_failed_retention_secs: 3600,
            job_cleanup_interval_secs: 1,
            chunk_target_tokens: 64,
            chunk_overlap_tokens: 8,
            chunk_timeout_secs: 30,
            extract_max_retries: 2,
            checkpoint_max_age_secs: 900,
            concept_merge_threshold: 0.85,
            vocabulary_expansion: true,
            reconcile_interval_secs: 3600,
            ingest_max_body_bytes: 10_000_000,
            max_job_cost_usd: None,
        }
    }
}
