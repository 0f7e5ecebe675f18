use std::sync::Arc;

use api_router::{api_routes_v1, api_state::ApiState};
use axum::{extract::FromRef, Router};
use common::{
    llm::{
        embeddings,
        extraction::OpenAiExtraction,
        vision::OpenAiVision,
    },
    storage::{db::SurrealDbClient, types::concept_embedding::ConceptEmbedding},
    utils::config::get_config,
};
use ingestion_pipeline::JobScheduler;
use query_engine::QueryEngine;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.apply_migrations().await?;
    db.ensure_vector_index(config.embedding_dimension).await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedding_adapter = embeddings::from_config(&config, Arc::clone(&openai_client));
    info!(
        embedding_backend = ?config.embedding_backend,
        embedding_model = embedding_adapter.model_id(),
        embedding_dimension = embedding_adapter.dimension(),
        "Embedding adapter initialized"
    );

    // Vectors written under a different model are stale until an operator
    // runs a reconciliation re-embed; search may rank them poorly.
    let stale = ConceptEmbedding::stale_ids(embedding_adapter.model_id(), &db).await?;
    if !stale.is_empty() {
        tracing::warn!(
            stale_count = stale.len(),
            active_model = embedding_adapter.model_id(),
            "concept embeddings produced by a different model detected"
        );
    }

    let extraction_adapter = Arc::new(OpenAiExtraction::new(
        Arc::clone(&openai_client),
        config.extraction_model.clone(),
    ));
    let vision_adapter = Arc::new(OpenAiVision::new(
        Arc::clone(&openai_client),
        config.vision_model.clone(),
    ));

    // Scheduler owns the worker pool and maintenance sweeps.
    let scheduler = JobScheduler::new(
        Arc::clone(&db),
        config.clone(),
        extraction_adapter,
        Arc::clone(&embedding_adapter),
    );
    scheduler.start().await?;
    info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Job scheduler started"
    );

    let query_engine = Arc::new(QueryEngine::new(
        Arc::clone(&db),
        Arc::clone(&embedding_adapter),
    ));

    let api_state = ApiState::new(
        db,
        config.clone(),
        scheduler,
        query_engine,
        vision_adapter,
        embedding_adapter,
    );

    // Create Axum router
    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(AppState { api_state });

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone, FromRef)]
struct AppState {
    api_state: ApiState,
}
