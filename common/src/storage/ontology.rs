use serde::Serialize;
use tracing::info;

use crate::error::AppError;

use super::db::SurrealDbClient;
use super::types::{
    concept::Concept, instance::Instance, relationship::ConceptRelationship, source::Source,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OntologyDeletion {
    pub ontology: String,
    pub sources_deleted: usize,
    pub concepts_deleted: usize,
    pub concepts_preserved: usize,
}

/// Delete an ontology: its sources, their instances and relationships, and
/// any concept left without evidence. Concepts shared with other ontologies
/// survive but lose the deleted ontology and its APPEARS_IN edges.
pub async fn delete_ontology(
    ontology: &str,
    db: &SurrealDbClient,
) -> Result<OntologyDeletion, AppError> {
    let sources = Source::list_by_ontology(ontology, db).await?;
    if sources.is_empty() {
        return Err(AppError::NotFound(format!("ontology {ontology} not found")));
    }
    let source_ids: Vec<String> = sources.iter().map(|source| source.id.clone()).collect();

    // Concepts touching the ontology, captured before the edges go away.
    let affected = Concept::list_by_ontology(ontology, db).await?;

    Instance::delete_by_source_ids(&source_ids, db).await?;
    ConceptRelationship::delete_by_source_ids(&source_ids, db).await?;
    Concept::unlink_sources(&source_ids, db).await?;
    Source::delete_by_ontology(ontology, db).await?;
    Concept::remove_ontology(ontology, db).await?;

    let mut concepts_deleted = 0;
    let mut concepts_preserved = 0;
    for concept in affected {
        if Instance::count_for_concept(&concept.id, db).await? == 0 {
            Concept::delete_with_embedding(&concept.id, db).await?;
            concepts_deleted += 1;
        } else {
            concepts_preserved += 1;
        }
    }

    info!(
        ontology,
        sources_deleted = source_ids.len(),
        concepts_deleted,
        concepts_preserved,
        "ontology deleted"
    );

    Ok(OntologyDeletion {
        ontology: ontology.to_owned(),
        sources_deleted: source_ids.len(),
        concepts_deleted,
        concepts_preserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const DIM: usize = 4;

    async fn setup_test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.apply_migrations().await.expect("migrations");
        db.ensure_vector_index(DIM).await.expect("index");
        db
    }

    async fn seed_concept(db: &SurrealDbClient, id: &str, ontologies: &[&str]) {
        let mut concept = Concept::new(
            id.into(),
            id.to_uppercase(),
            format!("{id} description"),
            vec![],
            ontologies[0].into(),
            "hashed".into(),
        );
        concept.ontologies = ontologies.iter().map(|s| (*s).to_owned()).collect();
        Concept::store_with_embedding(concept, vec![1.0, 0.0, 0.0, 0.0], db)
            .await
            .expect("store concept");
    }

    async fn seed_source_with_instance(
        db: &SurrealDbClient,
        ontology: &str,
        hash: &str,
        concept_id: &str,
    ) -> Source {
        let source = Source::new(
            "doc.txt".into(),
            ontology.into(),
            0,
            "quoted text here".into(),
            hash.into(),
        );
        source.store_if_absent(db).await.expect("source");
        Instance::new("quoted".into(), 0, 6, concept_id.into(), source.id.clone())
            .store_if_absent(db)
            .await
            .expect("instance");
        Concept::ensure_appears_in(concept_id, &source.id, db)
            .await
            .expect("appears_in");
        source
    }

    #[tokio::test]
    async fn orphaned_concepts_go_shared_concepts_stay() {
        let db = setup_test_db().await;

        // `solo` only exists in OntA; `shared` also has evidence in OntB.
        seed_concept(&db, "solo", &["OntA"]).await;
        seed_concept(&db, "shared", &["OntA", "OntB"]).await;
        seed_source_with_instance(&db, "OntA", "ha", "solo").await;
        seed_source_with_instance(&db, "OntA", "ha2", "shared").await;
        seed_source_with_instance(&db, "OntB", "hb", "shared").await;

        let outcome = delete_ontology("OntA", &db).await.expect("delete");
        assert_eq!(outcome.sources_deleted, 2);
        assert_eq!(outcome.concepts_deleted, 1);
        assert_eq!(outcome.concepts_preserved, 1);

        let solo: Option<Concept> = db.get_item("solo").await.expect("get solo");
        assert!(solo.is_none());

        let shared: Concept = db.get_item("shared").await.expect("get").expect("kept");
        assert!(!shared.ontologies.contains(&"OntA".to_string()));
        assert!(shared.ontologies.contains(&"OntB".to_string()));
        assert_eq!(
            Instance::count_for_concept("shared", &db).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn unknown_ontology_is_not_found() {
        let db = setup_test_db().await;
        let err = delete_ontology("Nothing", &db).await.expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
