use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::types::{concept::Concept, relationship::ConceptRelationship},
};
use serde::Serialize;

use crate::{QueryEngine, MAX_RELATED_DEPTH};

#[derive(Debug, Clone, Serialize)]
pub struct RelatedConcept {
    pub concept_id: String,
    pub label: String,
    pub description: String,
    pub distance: usize,
    /// Relationship types along the discovery path, in order from the
    /// start concept.
    pub path_types: Vec<String>,
}

impl QueryEngine {
    /// Bounded breadth-first traversal from a concept, treating edges as
    /// undirected. Optional relationship-type filter.
    pub async fn related(
        &self,
        concept_id: &str,
        max_depth: usize,
        rel_types: Option<&[String]>,
    ) -> Result<Vec<RelatedConcept>, AppError> {
        if max_depth == 0 || max_depth > MAX_RELATED_DEPTH {
            return Err(AppError::Validation(format!(
                "max_depth must be between 1 and {MAX_RELATED_DEPTH}"
            )));
        }
        // The start concept must exist.
        let start = Concept::get_by_ids(&[concept_id.to_owned()], self.db()).await?;
        if start.is_empty() {
            return Err(AppError::NotFound(format!("concept {concept_id} not found")));
        }

        let type_filter: Option<HashSet<&str>> =
            rel_types.map(|types| types.iter().map(String::as_str).collect());

        let mut paths: HashMap<String, Vec<String>> = HashMap::new();
        let mut distances: HashMap<String, usize> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::from([concept_id.to_owned()]);
        let mut frontier = vec![concept_id.to_owned()];

        for depth in 1..=max_depth {
            if frontier.is_empty() {
                break;
            }
            let edges = ConceptRelationship::adjacent_to_concepts(&frontier, self.db()).await?;
            let frontier_set: HashSet<&str> = frontier.iter().map(String::as_str).collect();
            let mut next_frontier = Vec::new();

            for edge in &edges {
                if type_filter
                    .as_ref()
                    .is_some_and(|filter| !filter.contains(edge.rel_type.as_str()))
                {
                    continue;
                }
                for (node, neighbor) in [(&edge.in_, &edge.out), (&edge.out, &edge.in_)] {
                    if !frontier_set.contains(node.as_str()) || visited.contains(neighbor) {
                        continue;
                    }
                    let mut path = paths.get(node.as_str()).cloned().unwrap_or_default();
                    path.push(edge.rel_type.clone());
                    paths.insert(neighbor.clone(), path);
                    distances.insert(neighbor.clone(), depth);
                    visited.insert(neighbor.clone());
                    next_frontier.push(neighbor.clone());
                }
            }
            frontier = next_frontier;
        }

        // Hydrate reached concepts in discovery order.
        let mut reached: Vec<(String, usize)> = distances.into_iter().collect();
        reached.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let ids: Vec<String> = reached.iter().map(|(id, _)| id.clone()).collect();
        let concepts = Concept::get_by_ids(&ids, self.db()).await?;
        let by_id: HashMap<String, Concept> = concepts
            .into_iter()
            .map(|concept| (concept.id.clone(), concept))
            .collect();

        Ok(reached
            .into_iter()
            .filter_map(|(id, distance)| {
                let concept = by_id.get(&id)?;
                Some(RelatedConcept {
                    concept_id: id.clone(),
                    label: concept.label.clone(),
                    description: concept.description.clone(),
                    distance,
                    path_types: paths.get(&id).cloned().unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::embeddings::HashedEmbeddings;
    use common::storage::db::SurrealDbClient;
    use std::sync::Arc;
    use uuid::Uuid;

    const DIM: usize = 8;

    async fn engine() -> QueryEngine {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        db.ensure_vector_index(DIM).await.expect("index");
        QueryEngine::new(db, Arc::new(HashedEmbeddings::new(DIM)))
    }

    async fn seed(engine: &QueryEngine, id: &str) {
        let concept = Concept::new(
            id.into(),
            id.to_uppercase(),
            format!("{id} description"),
            vec![],
            "TestOnt".into(),
            "hashed".into(),
        );
        let mut embedding = vec![0.0; DIM];
        embedding[id.len() % DIM] = 1.0;
        Concept::store_with_embedding(concept, embedding, engine.db())
            .await
            .expect("store");
    }

    async fn link(engine: &QueryEngine, from: &str, to: &str, rel_type: &str) {
        ConceptRelationship::new(from.into(), to.into(), rel_type.into(), 0.8, "s".into())
            .upsert(engine.db())
            .await
            .expect("edge");
    }

    /// a -IMPLIES-> b -SUPPORTS-> c, plus d -PART_OF-> a (incoming).
    async fn seed_chain(engine: &QueryEngine) {
        for id in ["a", "bb", "ccc", "dddd"] {
            seed(engine, id).await;
        }
        link(engine, "a", "bb", "IMPLIES").await;
        link(engine, "bb", "ccc", "SUPPORTS").await;
        link(engine, "dddd", "a", "PART_OF").await;
    }

    #[tokio::test]
    async fn traversal_reports_distance_and_path_types() {
        let engine = engine().await;
        seed_chain(&engine).await;

        let related = engine.related("a", 3, None).await.expect("related");

        let by_id: HashMap<&str, &RelatedConcept> = related
            .iter()
            .map(|entry| (entry.concept_id.as_str(), entry))
            .collect();

        assert_eq!(by_id["bb"].distance, 1);
        assert_eq!(by_id["bb"].path_types, vec!["IMPLIES"]);
        assert_eq!(by_id["ccc"].distance, 2);
        assert_eq!(by_id["ccc"].path_types, vec!["IMPLIES", "SUPPORTS"]);
        // Incoming edges count as related too.
        assert_eq!(by_id["dddd"].distance, 1);
    }

    #[tokio::test]
    async fn depth_bound_is_respected() {
        let engine = engine().await;
        seed_chain(&engine).await;

        let related = engine.related("a", 1, None).await.expect("related");
        let ids: Vec<&str> = related.iter().map(|r| r.concept_id.as_str()).collect();
        assert!(ids.contains(&"bb"));
        assert!(ids.contains(&"dddd"));
        assert!(!ids.contains(&"ccc"));
    }

    #[tokio::test]
    async fn rel_type_filter_prunes_branches() {
        let engine = engine().await;
        seed_chain(&engine).await;

        let related = engine
            .related("a", 3, Some(&["IMPLIES".to_string()]))
            .await
            .expect("related");
        let ids: Vec<&str> = related.iter().map(|r| r.concept_id.as_str()).collect();
        assert_eq!(ids, vec!["bb"]);
    }

    #[tokio::test]
    async fn depth_above_bound_is_rejected() {
        let engine = engine().await;
        seed(&engine, "a").await;
        let err = engine.related("a", 6, None).await.expect_err("too deep");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_start_concept_is_not_found() {
        let engine = engine().await;
        let err = engine.related("ghost", 2, None).await.expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
