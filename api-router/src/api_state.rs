use std::sync::Arc;

use common::{
    llm::{embeddings::EmbeddingAdapter, vision::VisionAdapter},
    storage::db::SurrealDbClient,
    utils::config::AppConfig,
};
use ingestion_pipeline::JobScheduler;
use query_engine::QueryEngine;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub scheduler: Arc<JobScheduler>,
    pub query: Arc<QueryEngine>,
    pub vision: Arc<dyn VisionAdapter>,
    pub embeddings: Arc<dyn EmbeddingAdapter>,
}

impl ApiState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        scheduler: Arc<JobScheduler>,
        query: Arc<QueryEngine>,
        vision: Arc<dyn VisionAdapter>,
        embeddings: Arc<dyn EmbeddingAdapter>,
    ) -> Self {
        Self {
            db,
            config,
            scheduler,
            query,
            vision,
            embeddings,
        }
    }
}
