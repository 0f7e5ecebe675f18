use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surrealdb::RecordId;

use crate::storage::types::concept::deserialize_flexible_id;
use crate::{error::AppError, storage::db::SurrealDbClient};

/// A typed concept→concept edge. The record id is deterministic over
/// (from, to, rel_type) so repeated proposals of the same edge coalesce.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConceptRelationship {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub rel_type: String,
    pub confidence: f32,
    pub created_from_source: String,
}

impl ConceptRelationship {
    /// Full sha256 hex over `from -> to : rel_type`, matching
    /// `crypto::sha256` when the edge id is derived inside a store
    /// transaction.
    pub fn deterministic_id(from: &str, to: &str, rel_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(from.as_bytes());
        hasher.update(b"->");
        hasher.update(to.as_bytes());
        hasher.update(b":");
        hasher.update(rel_type.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        in_: String,
        out: String,
        rel_type: String,
        confidence: f32,
        created_from_source: String,
    ) -> Self {
        Self {
            id: Self::deterministic_id(&in_, &out, &rel_type),
            in_,
            out,
            rel_type,
            confidence,
            created_from_source,
        }
    }

    /// Write the edge, coalescing with any existing (from, to, rel_type)
    /// edge. Confidence keeps the maximum seen across proposals.
    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $prev = (SELECT VALUE confidence FROM type::thing('relates_to', $rel_id))[0] ?? 0.0f;
                LET $in_concept = type::thing('concept', $in_id);
                LET $out_concept = type::thing('concept', $out_id);
                LET $edge = type::thing('relates_to', $rel_id);
                DELETE type::thing('relates_to', $rel_id);
                RELATE $in_concept->$edge->$out_concept SET
                    rel_type = $rel_type,
                    confidence = math::max([$confidence, $prev]),
                    created_from_source = $created_from_source;
                COMMIT TRANSACTION;"#,
            )
            .bind(("rel_id", self.id.clone()))
            .bind(("in_id", self.in_.clone()))
            .bind(("out_id", self.out.clone()))
            .bind(("rel_type", self.rel_type.clone()))
            .bind(("confidence", self.confidence))
            .bind(("created_from_source", self.created_from_source.clone()))
            .await?
            .check()?;

        Ok(())
    }

    /// Outgoing edges for one concept.
    pub async fn outgoing_for_concept(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM relates_to WHERE in = type::thing('concept', $concept_id)")
            .bind(("concept_id", concept_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Edges touching any of the given concepts, both directions. This is
    /// the frontier-expansion query for traversal and pathfinding.
    pub async fn adjacent_to_concepts(
        concept_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<RecordId> = concept_ids
            .iter()
            .map(|id| RecordId::from_table_key("concept", id))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM relates_to WHERE in IN $things OR out IN $things")
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn delete_by_source_ids(
        source_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE FROM relates_to WHERE created_from_source IN $source_ids")
            .bind(("source_ids", source_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    /// Move every edge touching `from_concept` over to `to_concept`
    /// (reconciliation). Re-relating recomputes deterministic ids, so edges
    /// that now duplicate an existing edge coalesce on the way over.
    pub async fn rehome_concept(
        from_concept: &str,
        to_concept: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let edges = Self::adjacent_to_concepts(&[from_concept.to_owned()], db).await?;

        for edge in edges {
            let new_in = if edge.in_ == from_concept {
                to_concept.to_owned()
            } else {
                edge.in_.clone()
            };
            let new_out = if edge.out == from_concept {
                to_concept.to_owned()
            } else {
                edge.out.clone()
            };

            db.client
                .query("DELETE type::thing('relates_to', $id)")
                .bind(("id", edge.id.clone()))
                .await?
                .check()?;

            // Self-loops produced by the merge are dropped rather than moved.
            if new_in == new_out {
                continue;
            }

            Self::new(
                new_in,
                new_out,
                edge.rel_type,
                edge.confidence,
                edge.created_from_source,
            )
            .upsert(db)
            .await?;
        }

        Ok(())
    }
}
