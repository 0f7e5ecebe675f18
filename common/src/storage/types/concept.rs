use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    error::AppError, storage::db::SurrealDbClient,
    storage::types::concept_embedding::ConceptEmbedding, stored_object,
};

stored_object!(Concept, "concept", {
    label: String,
    description: String,
    search_terms: Vec<String>,
    ontologies: Vec<String>,
    embedding_model: String
});

/// Vector search result including the hydrated concept.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConceptVectorResult {
    pub concept: Concept,
    pub score: f32,
}

impl Concept {
    /// Lowercase, whitespace-collapsed form used for fingerprinting.
    pub fn normalize_label(label: &str) -> String {
        label
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Deterministic concept id: the same labelled idea backed by the same
    /// first quote always fingerprints to the same record, which is what
    /// makes chunk replays idempotent.
    pub fn fingerprint(label: &str, first_instance_quote: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize_label(label).as_bytes());
        hasher.update(b"\x1f");
        hasher.update(first_instance_quote.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn new(
        id: String,
        label: String,
        description: String,
        search_terms: Vec<String>,
        ontology: String,
        embedding_model: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            label,
            description,
            search_terms,
            ontologies: vec![ontology],
            embedding_model,
        }
    }

    /// Atomically store a concept and its embedding.
    /// Writes the concept to `concept` and the vector to `concept_embedding`;
    /// an id collision surfaces as `AppError::Store` so the caller can
    /// re-resolve with a suffixed fingerprint.
    pub async fn store_with_embedding(
        concept: Concept,
        embedding: Vec<f32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let emb = ConceptEmbedding::new(&concept.id, embedding, concept.embedding_model.clone());

        let query = format!(
            "
            BEGIN TRANSACTION;
              CREATE type::thing('{concept_table}', $concept_id) CONTENT $concept;
              CREATE type::thing('{emb_table}', $emb_id) CONTENT $emb;
            COMMIT TRANSACTION;
            ",
            concept_table = Self::table_name(),
            emb_table = ConceptEmbedding::table_name(),
        );

        let result = db
            .client
            .query(query)
            .bind(("concept_id", concept.id.clone()))
            .bind(("concept", concept))
            .bind(("emb_id", emb.id.clone()))
            .bind(("emb", emb))
            .await
            .map_err(AppError::Database)?
            .check();

        match result {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("already exists") => {
                Err(AppError::Store(format!("concept id collision: {err}")))
            }
            Err(err) => Err(AppError::Database(err)),
        }
    }

    /// Vector search over concepts via the embedding table, fetching full
    /// concept rows and cosine scores. Optionally scoped to one ontology.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        ontology: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<Vec<ConceptVectorResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            concept_id: Concept,
            score: f32,
        }

        let ontology_filter = if ontology.is_some() {
            "AND $ontology IN concept_id.ontologies"
        } else {
            ""
        };

        let sql = format!(
            r#"
            SELECT
                concept_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE embedding <|{take},100|> $embedding
              {ontology_filter}
            ORDER BY score DESC
            LIMIT {take}
            FETCH concept_id;
            "#,
            emb_table = ConceptEmbedding::table_name(),
        );

        let mut response = db
            .client
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("ontology", ontology.map(str::to_owned)))
            .await
            .map_err(AppError::Database)?;

        response = response.check().map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ConceptVectorResult {
                concept: row.concept_id,
                score: row.score,
            })
            .collect())
    }

    /// Merge an extraction hit into an existing concept: union search terms
    /// and ontologies; label, description and embedding stay as they are.
    pub async fn absorb_extraction(
        id: &str,
        search_terms: &[String],
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET
                     search_terms = array::union(search_terms, $terms),
                     ontologies = array::union(ontologies, [$ontology]),
                     updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("terms", search_terms.to_vec()))
            .bind(("ontology", ontology.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    /// Fold a losing duplicate's metadata into the surviving concept
    /// (reconciliation): union search terms and every ontology.
    pub async fn absorb_concept(
        winner_id: &str,
        loser: &Concept,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET
                     search_terms = array::union(search_terms, $terms),
                     ontologies = array::union(ontologies, $ontologies),
                     updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", winner_id.to_owned()))
            .bind(("terms", loser.search_terms.clone()))
            .bind(("ontologies", loser.ontologies.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// Sources this concept appears in, via APPEARS_IN edges.
    pub async fn appears_in_source_ids(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            out: String,
        }
        let mut response = db
            .client
            .query("SELECT out FROM appears_in WHERE in = type::thing('concept', $concept_id)")
            .bind(("concept_id", concept_id.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.out).collect())
    }

    /// Deterministic APPEARS_IN edge id. Full sha256 hex over
    /// `concept_id -> source_id`, matching `crypto::sha256` when the edge id
    /// is derived inside a store transaction.
    pub fn appears_in_edge_id(concept_id: &str, source_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(concept_id.as_bytes());
        hasher.update(b"->");
        hasher.update(source_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Ensure the APPEARS_IN edge concept→source exists (set semantics via a
    /// deterministic edge id).
    pub async fn ensure_appears_in(
        concept_id: &str,
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let edge_id = Self::appears_in_edge_id(concept_id, source_id);

        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $concept = type::thing('concept', $concept_id);
                LET $source = type::thing('source', $source_id);
                LET $edge = type::thing('appears_in', $edge_id);
                DELETE type::thing('appears_in', $edge_id);
                RELATE $concept->$edge->$source;
                COMMIT TRANSACTION;"#,
            )
            .bind(("concept_id", concept_id.to_owned()))
            .bind(("source_id", source_id.to_owned()))
            .bind(("edge_id", edge_id))
            .await?
            .check()?;
        Ok(())
    }

    /// Remove APPEARS_IN edges into the given sources (ontology deletion).
    pub async fn unlink_sources(
        source_ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let things: Vec<surrealdb::RecordId> = source_ids
            .iter()
            .map(|id| surrealdb::RecordId::from_table_key("source", id))
            .collect();
        db.client
            .query("DELETE FROM appears_in WHERE out IN $things")
            .bind(("things", things))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn remove_ontology(
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::table($table)
                 SET ontologies = array::difference(ontologies, [$ontology]),
                     updated_at = time::now()
                 WHERE $ontology IN ontologies",
            )
            .bind(("table", Self::table_name()))
            .bind(("ontology", ontology.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    /// Concepts left without evidence are dropped together with their
    /// embedding and edges.
    pub async fn delete_with_embedding(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $thing = type::thing('concept', $id);
                DELETE FROM relates_to WHERE in = $thing OR out = $thing;
                DELETE FROM appears_in WHERE in = $thing;
                DELETE type::thing('concept_embedding', $id);
                DELETE $thing;
                COMMIT TRANSACTION;"#,
            )
            .bind(("id", id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn list_by_ontology(
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE $ontology IN ontologies")
            .bind(("table", Self::table_name()))
            .bind(("ontology", ontology.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Re-embed every concept under the active embedding model. Costly;
    /// runs only on an explicit reconciliation request, never on ingest.
    /// Vectors regenerate in memory first, then apply in one transaction
    /// together with the index redefinition so readers never see a mixed
    /// dimension.
    pub async fn update_all_embeddings(
        db: &SurrealDbClient,
        embeddings: &dyn crate::llm::embeddings::EmbeddingAdapter,
    ) -> Result<usize, AppError> {
        let dimension = embeddings.dimension();
        let concepts: Vec<Concept> = db.get_all_stored_items().await?;
        if concepts.is_empty() {
            info!("No concepts to re-embed; redefining the index only");
            db.ensure_vector_index(dimension).await?;
            return Ok(0);
        }
        info!(count = concepts.len(), "re-embedding all concepts");

        let inputs: Vec<String> = concepts
            .iter()
            .map(|concept| {
                format!(
                    "{} {} {}",
                    concept.label,
                    concept.description,
                    concept.search_terms.join(" ")
                )
            })
            .collect();
        let vectors = embeddings.embed(&inputs).await?;
        if vectors.len() != concepts.len() {
            return Err(AppError::InternalError(format!(
                "re-embedding returned {} vectors for {} concepts",
                vectors.len(),
                concepts.len()
            )));
        }

        let mut transaction = String::from("BEGIN TRANSACTION;");
        for (concept, vector) in concepts.iter().zip(&vectors) {
            let embedding_str = format!(
                "[{}]",
                vector
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            transaction.push_str(&format!(
                "UPSERT type::thing('concept_embedding', '{id}') SET \
                    concept_id = type::thing('concept', '{id}'), \
                    embedding = {embedding_str}, \
                    model = '{model}', \
                    dimension = {dimension}, \
                    created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                    updated_at = time::now();",
                id = concept.id,
                model = embeddings.model_id(),
            ));
            transaction.push_str(&format!(
                "UPDATE type::thing('concept', '{id}') SET embedding_model = '{model}', updated_at = time::now();",
                id = concept.id,
                model = embeddings.model_id(),
            ));
        }
        transaction.push_str(&format!(
            "DEFINE INDEX OVERWRITE idx_embedding_concept ON TABLE concept_embedding FIELDS embedding HNSW DIMENSION {dimension};"
        ));
        transaction.push_str("COMMIT TRANSACTION;");

        db.client.query(transaction).await?.check()?;

        info!(count = concepts.len(), "concept re-embedding finished");
        Ok(concepts.len())
    }

    pub async fn get_by_ids(ids: &[String], db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<surrealdb::RecordId> = ids
            .iter()
            .map(|id| surrealdb::RecordId::from_table_key(Self::table_name(), id))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE id IN $things")
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }
}
