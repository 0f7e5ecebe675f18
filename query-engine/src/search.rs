use common::{
    error::AppError,
    storage::types::{concept::Concept, instance::Instance},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::QueryEngine;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_MIN_SIMILARITY: f32 = 0.7;
const MAX_SAMPLE_EVIDENCE: usize = 3;
/// Extra candidates fetched beyond the limit so the below-threshold count
/// and suggested threshold can be reported.
const CANDIDATE_HEADROOM: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    pub min_similarity: Option<f32>,
    pub ontology: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub concept_id: String,
    pub label: String,
    pub description: String,
    pub ontologies: Vec<String>,
    pub similarity: f32,
    pub evidence_count: u64,
    pub sample_evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub threshold_used: f32,
    pub below_threshold_count: usize,
    /// Highest below-cutoff similarity, rounded down; progressive
    /// disclosure for a client that wants to widen the net.
    pub suggested_threshold: Option<f32>,
}

impl QueryEngine {
    /// Semantic similarity search over concepts. The query is embedded once;
    /// scoring runs on the store's vector index.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, AppError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AppError::Validation("query must not be empty".into()));
        }
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 100);
        let threshold = request
            .min_similarity
            .unwrap_or(DEFAULT_MIN_SIMILARITY)
            .clamp(0.0, 1.0);

        let embedding = self.embeddings().embed_one(query).await?;
        let candidates = Concept::vector_search(
            limit + CANDIDATE_HEADROOM,
            embedding,
            request.ontology.as_deref(),
            self.db(),
        )
        .await?;

        let mut results = Vec::new();
        let mut below_threshold_count = 0;
        let mut suggested_threshold = None;

        for candidate in candidates {
            if candidate.score >= threshold {
                if results.len() < limit {
                    results.push(self.hydrate_hit(candidate.concept, candidate.score).await?);
                }
            } else {
                below_threshold_count += 1;
                if suggested_threshold.is_none() {
                    suggested_threshold = Some(round_down(candidate.score));
                }
            }
        }

        debug!(
            query_len = query.len(),
            hits = results.len(),
            below_threshold_count,
            "semantic search finished"
        );

        Ok(SearchResponse {
            results,
            threshold_used: threshold,
            below_threshold_count,
            suggested_threshold,
        })
    }

    async fn hydrate_hit(&self, concept: Concept, score: f32) -> Result<SearchHit, AppError> {
        let evidence = Instance::list_for_concept(&concept.id, self.db()).await?;
        let sample_evidence = evidence
            .iter()
            .take(MAX_SAMPLE_EVIDENCE)
            .map(|instance| instance.quote.clone())
            .collect();

        Ok(SearchHit {
            concept_id: concept.id,
            label: concept.label,
            description: concept.description,
            ontologies: concept.ontologies,
            similarity: score,
            evidence_count: evidence.len() as u64,
            sample_evidence,
        })
    }
}

fn round_down(similarity: f32) -> f32 {
    (similarity * 100.0).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::embeddings::{EmbeddingAdapter, HashedEmbeddings};
    use common::storage::db::SurrealDbClient;
    use std::sync::Arc;
    use uuid::Uuid;

    const DIM: usize = 64;

    async fn engine_with_concepts(labels: &[(&str, &str)]) -> QueryEngine {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        db.ensure_vector_index(DIM).await.expect("index");

        let embeddings = Arc::new(HashedEmbeddings::new(DIM));

        for (label, ontology) in labels {
            let concept = Concept::new(
                Concept::fingerprint(label, ontology),
                (*label).to_owned(),
                format!("{label} description"),
                vec![label.to_lowercase()],
                (*ontology).to_owned(),
                "hashed".into(),
            );
            let input = format!("{} {} {}", concept.label, concept.description, label.to_lowercase());
            let vector = embeddings.embed_one(&input).await.expect("embed");
            let concept_id = concept.id.clone();
            Concept::store_with_embedding(concept, vector, &db)
                .await
                .expect("store");
            Instance::new(
                (*label).to_owned(),
                0,
                label.len() as u64,
                concept_id,
                format!("source-{label}"),
            )
            .store_if_absent(&db)
            .await
            .expect("instance");
        }

        QueryEngine::new(db, embeddings)
    }

    #[tokio::test]
    async fn search_finds_exact_label_with_high_similarity() {
        let engine = engine_with_concepts(&[
            ("graph database", "OntA"),
            ("flower arranging", "OntA"),
        ])
        .await;

        let response = engine
            .search(SearchRequest {
                query: "graph database".into(),
                limit: Some(5),
                min_similarity: Some(0.6),
                ontology: None,
            })
            .await
            .expect("search");

        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].label, "graph database");
        assert!(response.results[0].similarity >= 0.6);
        assert_eq!(response.results[0].evidence_count, 1);
        assert_eq!(response.results[0].sample_evidence.len(), 1);
        assert!((response.threshold_used - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn below_threshold_results_are_counted_not_returned() {
        let engine = engine_with_concepts(&[
            ("graph database", "OntA"),
            ("completely unrelated gardening topic", "OntA"),
        ])
        .await;

        let response = engine
            .search(SearchRequest {
                query: "graph database".into(),
                limit: Some(5),
                min_similarity: Some(0.9),
                ontology: None,
            })
            .await
            .expect("search");

        assert!(response.below_threshold_count >= 1);
        let suggested = response.suggested_threshold.expect("suggested");
        assert!(suggested < 0.9);
    }

    #[tokio::test]
    async fn ontology_filter_scopes_results() {
        let engine = engine_with_concepts(&[
            ("graph database", "OntA"),
            ("graph database", "OntB"),
        ])
        .await;

        let response = engine
            .search(SearchRequest {
                query: "graph database".into(),
                limit: Some(10),
                min_similarity: Some(0.5),
                ontology: Some("OntB".into()),
            })
            .await
            .expect("search");

        assert!(response
            .results
            .iter()
            .all(|hit| hit.ontologies.contains(&"OntB".to_string())));
    }

    #[tokio::test]
    async fn empty_query_is_a_validation_error() {
        let engine = engine_with_concepts(&[]).await;
        let err = engine
            .search(SearchRequest {
                query: "  ".into(),
                limit: None,
                min_similarity: None,
                ontology: None,
            })
            .await
            .expect_err("validation");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn round_down_truncates_to_two_decimals() {
        assert!((round_down(0.879) - 0.87).abs() < 1e-6);
        assert!((round_down(0.5) - 0.5).abs() < 1e-6);
    }
}
