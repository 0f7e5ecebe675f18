use std::collections::HashSet;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            concept::Concept, concept_embedding::ConceptEmbedding, instance::Instance,
            relationship::ConceptRelationship,
        },
    },
};
use tracing::info;

/// Periodic pass that merges concepts created near-simultaneously by racing
/// jobs and only later found to be duplicates: pairwise cosine at or above
/// the merge threshold with at least one shared ontology. The older id wins;
/// evidence, edges and appearances move over; the loser is deleted.
pub async fn reconcile_once(
    db: &SurrealDbClient,
    merge_threshold: f32,
) -> Result<u64, AppError> {
    let mut concepts: Vec<Concept> = db.get_all_stored_items().await?;
    if concepts.len() < 2 {
        return Ok(0);
    }
    // Older first, id as the stable tie-break, so the winner of any pair is
    // simply the earlier element.
    concepts.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let ids: Vec<String> = concepts.iter().map(|concept| concept.id.clone()).collect();
    let embeddings = ConceptEmbedding::get_by_concept_ids(&ids, db).await?;

    let mut absorbed: HashSet<String> = HashSet::new();
    let mut merged_count = 0u64;

    for (winner_index, winner) in concepts.iter().enumerate() {
        if absorbed.contains(&winner.id) {
            continue;
        }
        let Some(winner_embedding) = embeddings.get(&winner.id) else {
            continue;
        };

        for loser in concepts.iter().skip(winner_index + 1) {
            if absorbed.contains(&loser.id) {
                continue;
            }
            if !shares_ontology(winner, loser) {
                continue;
            }
            let Some(loser_embedding) = embeddings.get(&loser.id) else {
                continue;
            };
            if cosine(winner_embedding, loser_embedding) < merge_threshold {
                continue;
            }

            merge_pair(winner, loser, db).await?;
            absorbed.insert(loser.id.clone());
            merged_count = merged_count.saturating_add(1);
        }
    }

    if merged_count > 0 {
        info!(merged = merged_count, "reconciliation merged duplicate concepts");
    }
    Ok(merged_count)
}

async fn merge_pair(
    winner: &Concept,
    loser: &Concept,
    db: &SurrealDbClient,
) -> Result<(), AppError> {
    Concept::absorb_concept(&winner.id, loser, db).await?;
    Instance::reassign_concept(&loser.id, &winner.id, db).await?;
    ConceptRelationship::rehome_concept(&loser.id, &winner.id, db).await?;

    for source_id in Concept::appears_in_source_ids(&loser.id, db).await? {
        Concept::ensure_appears_in(&winner.id, &source_id, db).await?;
    }

    Concept::delete_with_embedding(&loser.id, db).await
}

fn shares_ontology(a: &Concept, b: &Concept) -> bool {
    a.ontologies
        .iter()
        .any(|ontology| b.ontologies.contains(ontology))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
