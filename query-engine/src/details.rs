use common::{error::AppError, storage::types::concept::Concept};
use serde::{Deserialize, Serialize};

use crate::QueryEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub quote: String,
    pub char_offset_start: u64,
    pub char_offset_end: u64,
    pub source_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingRelationship {
    pub rel_type: String,
    pub confidence: f32,
    pub target_id: String,
    pub target_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptDetails {
    pub concept: Concept,
    /// Full evidence list, ordered by source then offset.
    pub evidence: Vec<EvidenceItem>,
    pub relationships: Vec<OutgoingRelationship>,
}

impl QueryEngine {
    /// Concept, evidence and outgoing relationships in one round-trip.
    pub async fn details(&self, concept_id: &str) -> Result<ConceptDetails, AppError> {
        let mut response = self
            .db()
            .client
            .query(
                "SELECT * FROM type::thing('concept', $id);
                 SELECT quote, char_offset_start, char_offset_end, source_id
                     FROM instance WHERE concept_id = $id
                     ORDER BY source_id ASC, char_offset_start ASC;
                 SELECT rel_type, confidence,
                        record::id(out) AS target_id, out.label AS target_label
                     FROM relates_to WHERE in = type::thing('concept', $id);",
            )
            .bind(("id", concept_id.to_owned()))
            .await?;

        let concepts: Vec<Concept> = response.take(0)?;
        let Some(concept) = concepts.into_iter().next() else {
            return Err(AppError::NotFound(format!("concept {concept_id} not found")));
        };
        let evidence: Vec<EvidenceItem> = response.take(1)?;
        let relationships: Vec<OutgoingRelationship> = response.take(2)?;

        Ok(ConceptDetails {
            concept,
            evidence,
            relationships,
        })
    }
}
