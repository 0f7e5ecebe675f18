#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Read-side of the graph: semantic search, concept details, bounded
//! traversal and shortest paths. Queries return typed errors and are never
//! retried here.

pub mod connect;
pub mod details;
pub mod related;
pub mod search;

use std::sync::Arc;

use common::{llm::embeddings::EmbeddingAdapter, storage::db::SurrealDbClient};

pub use connect::{ConnectBySearchResponse, GraphPath, PathNode, PathResponse, ResolvedQuery};
pub use details::{ConceptDetails, EvidenceItem, OutgoingRelationship};
pub use related::RelatedConcept;
pub use search::{SearchHit, SearchRequest, SearchResponse};

/// Upper bound on `related` traversal depth.
pub const MAX_RELATED_DEPTH: usize = 5;
/// Upper bound on `connect` path length.
pub const MAX_CONNECT_HOPS: usize = 6;

pub struct QueryEngine {
    db: Arc<SurrealDbClient>,
    embeddings: Arc<dyn EmbeddingAdapter>,
}

impl QueryEngine {
    pub fn new(db: Arc<SurrealDbClient>, embeddings: Arc<dyn EmbeddingAdapter>) -> Self {
        Self { db, embeddings }
    }

    pub(crate) fn db(&self) -> &SurrealDbClient {
        &self.db
    }

    pub(crate) fn embeddings(&self) -> &dyn EmbeddingAdapter {
        self.embeddings.as_ref()
    }
}
