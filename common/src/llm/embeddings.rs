use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::{classify_openai_error, AppError},
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Provider batch size for embedding requests.
const EMBED_BATCH_SIZE: usize = 64;

/// Embedding access for the pipeline and query engine. Vectors come back
/// unit-normalized in the adapter's fixed dimension; the model id is stored
/// with every write so stale vectors are detectable after a model change.
#[async_trait]
pub trait EmbeddingAdapter: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    fn dimension(&self) -> usize;

    fn model_id(&self) -> &str;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_owned())).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::AdapterFatal("no embedding returned for input".into()))
    }
}

/// Scale a vector to unit length. Zero vectors stay zero.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

pub struct OpenAiEmbeddings {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddings {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String, dimension: usize) -> Self {
        Self {
            client,
            model,
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingAdapter for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let request = CreateEmbeddingRequestArgs::default()
                .model(&self.model)
                .dimensions(u32::try_from(self.dimension).unwrap_or(u32::MAX))
                .input(batch.to_vec())
                .build()
                .map_err(AppError::OpenAI)?;

            let response = self
                .client
                .embeddings()
                .create(request)
                .await
                .map_err(|err| classify_openai_error(&err))?;

            if response.data.len() != batch.len() {
                return Err(AppError::AdapterFatal(format!(
                    "embedding response size mismatch: sent {}, received {}",
                    batch.len(),
                    response.data.len()
                )));
            }

            for item in response.data {
                let mut vector = item.embedding;
                if vector.len() != self.dimension {
                    return Err(AppError::AdapterFatal(format!(
                        "embedding has dimension {}, expected {}",
                        vector.len(),
                        self.dimension
                    )));
                }
                normalize(&mut vector);
                vectors.push(vector);
            }
        }

        debug!(count = vectors.len(), model = %self.model, "embeddings generated");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Deterministic bag-of-words embedding. No network, stable across runs;
/// used by tests and offline deployments.
pub struct HashedEmbeddings {
    dimension: usize,
}

impl HashedEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            let idx = bucket(&token, self.dimension);
            if let Some(value) = vector.get_mut(idx) {
                *value += 1.0;
            }
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingAdapter for HashedEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        "hashed"
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

/// Pick the embedding backend at startup by configuration.
pub fn from_config(
    config: &AppConfig,
    client: Arc<Client<OpenAIConfig>>,
) -> Arc<dyn EmbeddingAdapter> {
    match config.embedding_backend {
        EmbeddingBackend::OpenAi => Arc::new(OpenAiEmbeddings::new(
            client,
            config.embedding_model.clone(),
            config.embedding_dimension,
        )),
        EmbeddingBackend::Hashed => Arc::new(HashedEmbeddings::new(config.embedding_dimension)),
    }
}
