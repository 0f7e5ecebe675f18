use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::types::{concept::Concept, relationship::ConceptRelationship},
};
use serde::Serialize;
use tracing::debug;

use crate::{QueryEngine, MAX_CONNECT_HOPS};

/// At most this many alternative shortest paths are returned.
const MAX_PATHS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct PathNode {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphPath {
    pub nodes: Vec<PathNode>,
    pub relationships: Vec<String>,
    pub hops: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathResponse {
    pub paths: Vec<GraphPath>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedQuery {
    pub query: String,
    pub concept_id: String,
    pub label: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectBySearchResponse {
    pub from: ResolvedQuery,
    pub to: ResolvedQuery,
    #[serde(flatten)]
    pub paths: PathResponse,
}

#[derive(Clone)]
struct ParentLink {
    node: String,
    rel_type: String,
    confidence: f32,
}

type VisitMap = HashMap<String, Option<ParentLink>>;

impl QueryEngine {
    /// Shortest path between two concepts via bidirectional BFS
    /// (meet-in-the-middle), edges treated as undirected. Ties break on
    /// path length, then total confidence (higher first), then
    /// lexicographic node ids for stability.
    pub async fn connect(
        &self,
        from_id: &str,
        to_id: &str,
        max_hops: usize,
    ) -> Result<PathResponse, AppError> {
        if max_hops == 0 || max_hops > MAX_CONNECT_HOPS {
            return Err(AppError::Validation(format!(
                "max_hops must be between 1 and {MAX_CONNECT_HOPS}"
            )));
        }

        let endpoints =
            Concept::get_by_ids(&[from_id.to_owned(), to_id.to_owned()], self.db()).await?;
        let known: HashSet<&str> = endpoints.iter().map(|c| c.id.as_str()).collect();
        for id in [from_id, to_id] {
            if !known.contains(id) {
                return Err(AppError::NotFound(format!("concept {id} not found")));
            }
        }

        if from_id == to_id {
            // Zero-hop trivial path.
            let path = self.hydrate(vec![from_id.to_owned()], Vec::new()).await?;
            return Ok(PathResponse {
                count: 1,
                paths: vec![path],
            });
        }

        let mut forward: VisitMap = HashMap::from([(from_id.to_owned(), None)]);
        let mut backward: VisitMap = HashMap::from([(to_id.to_owned(), None)]);
        let mut forward_frontier = vec![from_id.to_owned()];
        let mut backward_frontier = vec![to_id.to_owned()];
        let mut meets: Vec<String> = Vec::new();
        let mut depth = 0usize;

        while meets.is_empty()
            && depth < max_hops
            && !forward_frontier.is_empty()
            && !backward_frontier.is_empty()
        {
            // Expand the smaller frontier to keep the branching factor down.
            let expand_forward = forward_frontier.len() <= backward_frontier.len();
            let (frontier, map, other_map) = if expand_forward {
                (&mut forward_frontier, &mut forward, &backward)
            } else {
                (&mut backward_frontier, &mut backward, &forward)
            };

            let edges = ConceptRelationship::adjacent_to_concepts(frontier, self.db()).await?;
            let frontier_set: HashSet<String> = frontier.drain(..).collect();
            let mut next_frontier = Vec::new();

            for edge in &edges {
                for (node, neighbor) in [(&edge.in_, &edge.out), (&edge.out, &edge.in_)] {
                    if !frontier_set.contains(node.as_str()) || map.contains_key(neighbor) {
                        continue;
                    }
                    map.insert(
                        neighbor.clone(),
                        Some(ParentLink {
                            node: node.clone(),
                            rel_type: edge.rel_type.clone(),
                            confidence: edge.confidence,
                        }),
                    );
                    next_frontier.push(neighbor.clone());
                    if other_map.contains_key(neighbor) {
                        meets.push(neighbor.clone());
                    }
                }
            }

            *frontier = next_frontier;
            depth += 1;
        }

        if meets.is_empty() {
            return Ok(PathResponse {
                paths: Vec::new(),
                count: 0,
            });
        }

        let mut candidates: Vec<(Vec<String>, Vec<String>, f32)> = Vec::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        for meet in meets {
            let (nodes, rel_types, confidence_total) =
                assemble_path(&forward, &backward, &meet);
            if nodes.len().saturating_sub(1) > max_hops {
                continue;
            }
            if seen.insert(nodes.clone()) {
                candidates.push((nodes, rel_types, confidence_total));
            }
        }

        candidates.sort_by(|a, b| {
            a.0.len()
                .cmp(&b.0.len())
                .then_with(|| {
                    b.2.partial_cmp(&a.2)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.truncate(MAX_PATHS);

        debug!(paths = candidates.len(), "connect finished");

        let mut paths = Vec::with_capacity(candidates.len());
        for (nodes, rel_types, _confidence) in candidates {
            paths.push(self.hydrate(nodes, rel_types).await?);
        }
        Ok(PathResponse {
            count: paths.len(),
            paths,
        })
    }

    /// Resolve two natural-language queries to their top concepts, then run
    /// the path query between them.
    pub async fn connect_by_search(
        &self,
        query_from: &str,
        query_to: &str,
        max_hops: usize,
    ) -> Result<ConnectBySearchResponse, AppError> {
        let from = self.resolve_query(query_from).await?;
        let to = self.resolve_query(query_to).await?;
        let paths = self.connect(&from.concept_id, &to.concept_id, max_hops).await?;
        Ok(ConnectBySearchResponse { from, to, paths })
    }

    async fn resolve_query(&self, query: &str) -> Result<ResolvedQuery, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::Validation("query must not be empty".into()));
        }
        let embedding = self.embeddings().embed_one(query).await?;
        let top = Concept::vector_search(1, embedding, None, self.db())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                AppError::NotFound(format!("no concept resolves the query '{query}'"))
            })?;
        Ok(ResolvedQuery {
            query: query.to_owned(),
            concept_id: top.concept.id,
            label: top.concept.label,
            similarity: top.score,
        })
    }

    async fn hydrate(
        &self,
        node_ids: Vec<String>,
        relationships: Vec<String>,
    ) -> Result<GraphPath, AppError> {
        let concepts = Concept::get_by_ids(&node_ids, self.db()).await?;
        let by_id: HashMap<String, Concept> = concepts
            .into_iter()
            .map(|concept| (concept.id.clone(), concept))
            .collect();

        let nodes = node_ids
            .into_iter()
            .map(|id| {
                let concept = by_id.get(&id);
                PathNode {
                    label: concept.map(|c| c.label.clone()).unwrap_or_else(|| id.clone()),
                    description: concept.map(|c| c.description.clone()),
                    id,
                }
            })
            .collect::<Vec<_>>();

        Ok(GraphPath {
            hops: nodes.len().saturating_sub(1),
            nodes,
            relationships,
        })
    }
}

/// Stitch the two half-paths together at the meeting node.
fn assemble_path(
    forward: &VisitMap,
    backward: &VisitMap,
    meet: &str,
) -> (Vec<String>, Vec<String>, f32) {
    let mut nodes = Vec::new();
    let mut rel_types = Vec::new();
    let mut confidence_total = 0.0f32;

    // Walk from the meeting node back to the start, then reverse.
    let mut cursor = meet.to_owned();
    let mut head_nodes = vec![cursor.clone()];
    let mut head_rels = Vec::new();
    while let Some(Some(link)) = forward.get(&cursor) {
        head_rels.push((link.rel_type.clone(), link.confidence));
        cursor = link.node.clone();
        head_nodes.push(cursor.clone());
    }
    head_nodes.reverse();
    head_rels.reverse();

    nodes.extend(head_nodes);
    for (rel_type, confidence) in head_rels {
        rel_types.push(rel_type);
        confidence_total += confidence;
    }

    // Walk from the meeting node towards the destination.
    let mut cursor = meet.to_owned();
    while let Some(Some(link)) = backward.get(&cursor) {
        rel_types.push(link.rel_type.clone());
        confidence_total += link.confidence;
        cursor = link.node.clone();
        nodes.push(cursor.clone());
    }

    (nodes, rel_types, confidence_total)
}
