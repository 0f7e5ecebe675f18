use std::collections::HashMap;

use common::{
    error::AppError,
    llm::extraction::ExtractedConcept,
    storage::{
        db::SurrealDbClient,
        types::{
            concept::Concept, instance::Instance, job::Job, job::ProgressCounters,
            source::Source,
        },
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::chunker::DocumentChunk;

/// A concept extracted from the chunk, instances already verified, with its
/// embedding.
pub struct ConceptCandidate {
    pub extracted: ExtractedConcept,
    pub embedding: Vec<f32>,
}

/// A relationship whose rel_type has already been resolved to an active
/// vocabulary entry.
pub struct ResolvedRelationship {
    pub from_label: String,
    pub to_label: String,
    pub rel_type: String,
    pub confidence: f32,
}

/// Outcome of the chunk transaction, produced by its final RETURN so the
/// progress counters reflect what actually committed.
#[derive(Debug, Deserialize)]
struct ChunkUpsertReport {
    source_created: bool,
    merged: Vec<bool>,
    instance_existed: Vec<bool>,
}

/// Upsert one chunk's extraction into the graph as a single transaction:
/// the vector-similarity identity lookup, the merge-or-create decision, the
/// evidence instances, the APPEARS_IN edges and the typed relationships all
/// commit together or not at all. Replays converge on the same state:
/// source, instance and edge ids are deterministic, new concepts
/// fingerprint to stable ids, and edges coalesce.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_chunk(
    db: &SurrealDbClient,
    merge_threshold: f32,
    embedding_model: &str,
    job: &Job,
    chunk: &DocumentChunk,
    concepts: Vec<ConceptCandidate>,
    relationships: Vec<ResolvedRelationship>,
    counters: &mut ProgressCounters,
) -> Result<(), AppError> {
    // Evidence-less concepts are dropped during verification; guard anyway
    // so every written concept keeps at least one instance.
    let concepts: Vec<ConceptCandidate> = concepts
        .into_iter()
        .filter(|candidate| !candidate.extracted.instances.is_empty())
        .collect();

    let source_id = Source::deterministic_id(&job.content_hash, chunk.index);
    let dimension = concepts
        .first()
        .map_or(0, |candidate| candidate.embedding.len());

    let mut query = String::from("BEGIN TRANSACTION;\n");
    let mut statements = 0usize;
    let mut binds: Vec<(String, Value)> = vec![
        ("source_id".into(), json!(source_id)),
        ("document".into(), json!(job.document)),
        ("ontology".into(), json!(job.ontology)),
        ("chunk_index".into(), json!(chunk.index)),
        ("full_text".into(), json!(chunk.text)),
        ("document_hash".into(), json!(job.content_hash)),
        ("threshold".into(), json!(merge_threshold)),
        ("model".into(), json!(embedding_model)),
        ("dimension".into(), json!(dimension)),
    ];

    fn push_statement(query: &mut String, statements: &mut usize, statement: &str) {
        query.push_str(statement);
        query.push_str(";\n");
        *statements += 1;
    }

    // Sources are immutable; an existing record is left untouched.
    push_statement(
        &mut query,
        &mut statements,
        "LET $src_exists = (SELECT VALUE id FROM type::thing('source', $source_id))[0] != NONE",
    );
    push_statement(
        &mut query,
        &mut statements,
        "IF !$src_exists THEN {
            CREATE type::thing('source', $source_id) SET
                document = $document,
                ontology = $ontology,
                chunk_index = $chunk_index,
                full_text = $full_text,
                document_hash = $document_hash,
                created_at = time::now(),
                updated_at = time::now();
        } END",
    );
    push_statement(
        &mut query,
        &mut statements,
        "LET $src = type::thing('source', $source_id)",
    );

    // Concept resolution. The similarity read, the merge-or-create branch
    // and everything downstream share the transaction, so the decision can
    // never split from the write it justifies.
    let mut label_to_index: HashMap<String, usize> = HashMap::new();
    let mut instance_count = 0usize;

    for (index, candidate) in concepts.iter().enumerate() {
        let extracted = &candidate.extracted;
        let first_quote = extracted
            .instances
            .first()
            .map(|instance| instance.quote.as_str())
            .unwrap_or_default();
        let fingerprint = Concept::fingerprint(&extracted.label, first_quote);

        binds.push((format!("embv{index}"), json!(candidate.embedding)));
        binds.push((format!("fpr{index}"), json!(fingerprint)));
        binds.push((
            format!("sfx{index}"),
            json!(format!("{fingerprint}-{}", chunk.index)),
        ));
        binds.push((format!("clabel{index}"), json!(extracted.label)));
        binds.push((format!("cdesc{index}"), json!(extracted.description)));
        binds.push((format!("cterms{index}"), json!(extracted.search_terms)));

        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $knn{index} = (SELECT concept_id, vector::similarity::cosine(embedding, $embv{index}) AS score
                    FROM concept_embedding
                    WHERE embedding <|1,100|> $embv{index}
                    ORDER BY score DESC
                    LIMIT 1)[0]"
            ),
        );
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $merge{index} = IF $knn{index} = NONE THEN false ELSE $knn{index}.score >= $threshold END"
            ),
        );
        // A fingerprint held by a dissimilar concept resolves to the
        // chunk-index suffix instead of aborting the transaction.
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $taken{index} = (SELECT VALUE id FROM type::thing('concept', $fpr{index}))[0] != NONE"
            ),
        );
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $cid{index} = IF $merge{index} THEN record::id($knn{index}.concept_id) ELSE (IF !$taken{index} THEN $fpr{index} ELSE $sfx{index} END) END"
            ),
        );
        // Merge unions search terms and ontologies; label, description and
        // embedding stay as they are. The create path writes the concept
        // and its vector together.
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "IF $merge{index} THEN {{
                    UPDATE type::thing('concept', $cid{index}) SET
                        search_terms = array::union(search_terms, $cterms{index}),
                        ontologies = array::union(ontologies, [$ontology]),
                        updated_at = time::now();
                }} ELSE {{
                    UPSERT type::thing('concept', $cid{index}) SET
                        label = $clabel{index},
                        description = $cdesc{index},
                        search_terms = $cterms{index},
                        ontologies = array::union(ontologies ?? [], [$ontology]),
                        embedding_model = $model,
                        created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                        updated_at = time::now();
                    UPSERT type::thing('concept_embedding', $cid{index}) SET
                        concept_id = type::thing('concept', $cid{index}),
                        embedding = $embv{index},
                        model = $model,
                        dimension = $dimension,
                        created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                        updated_at = time::now();
                }} END"
            ),
        );

        for instance in &extracted.instances {
            let instance_id = Instance::deterministic_id(
                &source_id,
                instance.char_offset_start,
                instance.char_offset_end,
                &instance.quote,
            );
            let n = instance_count;
            binds.push((format!("iid{n}"), json!(instance_id)));
            binds.push((format!("iq{n}"), json!(instance.quote)));
            binds.push((format!("is{n}"), json!(instance.char_offset_start)));
            binds.push((format!("ie{n}"), json!(instance.char_offset_end)));

            push_statement(
                &mut query,
                &mut statements,
                &format!(
                    "LET $iex{n} = (SELECT VALUE id FROM type::thing('instance', $iid{n}))[0] != NONE"
                ),
            );
            push_statement(
                &mut query,
                &mut statements,
                &format!(
                    "UPSERT type::thing('instance', $iid{n}) SET
                        quote = $iq{n},
                        char_offset_start = $is{n},
                        char_offset_end = $ie{n},
                        concept_id = $cid{index},
                        source_id = $source_id,
                        created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                        updated_at = time::now()"
                ),
            );
            instance_count += 1;
        }

        // APPEARS_IN with set semantics; the edge id derives from the
        // resolved concept id, so it is computed in the transaction.
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $aid{index} = crypto::sha256(string::concat($cid{index}, '->', $source_id))"
            ),
        );
        push_statement(
            &mut query,
            &mut statements,
            &format!("LET $aedge{index} = type::thing('appears_in', $aid{index})"),
        );
        push_statement(&mut query, &mut statements, &format!("DELETE $aedge{index}"));
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $ain{index} = type::thing('concept', $cid{index})"
            ),
        );
        push_statement(
            &mut query,
            &mut statements,
            &format!("RELATE $ain{index}->$aedge{index}->$src"),
        );

        label_to_index.insert(Concept::normalize_label(&extracted.label), index);

        debug!(
            label = %extracted.label,
            fingerprint = %fingerprint,
            first_quote = %first_quote,
            "concept staged for chunk transaction"
        );
    }

    // Relationships resolve both endpoints to concepts of this chunk;
    // duplicate (from, to, rel_type) edges coalesce on max confidence.
    let mut relationship_count = 0usize;
    for relationship in &relationships {
        let from = label_to_index.get(&Concept::normalize_label(&relationship.from_label));
        let to = label_to_index.get(&Concept::normalize_label(&relationship.to_label));
        let (Some(&from), Some(&to)) = (from, to) else {
            debug!(
                from = %relationship.from_label,
                to = %relationship.to_label,
                "dropping relationship with unresolved endpoint"
            );
            continue;
        };
        if from == to {
            continue;
        }

        let k = relationship_count;
        binds.push((format!("rtype{k}"), json!(relationship.rel_type)));
        binds.push((
            format!("conf{k}"),
            json!(relationship.confidence.clamp(0.0, 1.0)),
        ));

        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "LET $rid{k} = crypto::sha256(string::concat($cid{from}, '->', $cid{to}, ':', $rtype{k}))"
            ),
        );
        push_statement(
            &mut query,
            &mut statements,
            &format!("LET $redge{k} = type::thing('relates_to', $rid{k})"),
        );
        // Both labels can resolve to one concept after a merge; such
        // self-loops are dropped.
        push_statement(
            &mut query,
            &mut statements,
            &format!(
                "IF $cid{from} != $cid{to} THEN {{
                    LET $prev{k} = (SELECT VALUE confidence FROM $redge{k})[0] ?? 0.0f;
                    LET $rin{k} = type::thing('concept', $cid{from});
                    LET $rout{k} = type::thing('concept', $cid{to});
                    DELETE $redge{k};
                    RELATE $rin{k}->$redge{k}->$rout{k} SET
                        rel_type = $rtype{k},
                        confidence = math::max([$conf{k}, $prev{k}]),
                        created_from_source = $source_id;
                }} END"
            ),
        );
        relationship_count += 1;
    }

    let merged_list = (0..concepts.len())
        .map(|index| format!("$merge{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let instance_list = (0..instance_count)
        .map(|n| format!("$iex{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    push_statement(
        &mut query,
        &mut statements,
        &format!(
            "RETURN {{
                source_created: !$src_exists,
                merged: [{merged_list}],
                instance_existed: [{instance_list}]
            }}"
        ),
    );

    query.push_str("COMMIT TRANSACTION;");

    let mut request = db.client.query(query);
    for (key, value) in binds {
        request = request.bind((key, value));
    }
    let mut response = request
        .await
        .map_err(AppError::Database)?
        .check()
        .map_err(AppError::Database)?;

    let report: Option<ChunkUpsertReport> = response
        .take(statements - 1)
        .map_err(AppError::Database)?;
    let report = report
        .ok_or_else(|| AppError::Store("chunk upsert transaction returned no report".into()))?;

    if report.source_created {
        counters.sources_created = counters.sources_created.saturating_add(1);
    }
    for merged in &report.merged {
        if *merged {
            counters.concepts_linked = counters.concepts_linked.saturating_add(1);
        } else {
            counters.concepts_created = counters.concepts_created.saturating_add(1);
        }
    }
    let new_instances = report
        .instance_existed
        .iter()
        .filter(|existed| !**existed)
        .count() as u64;
    counters.instances_created = counters.instances_created.saturating_add(new_instances);
    counters.relationships_created = counters
        .relationships_created
        .saturating_add(relationship_count as u64);

    debug!(
        source_id = %source_id,
        concepts = report.merged.len(),
        new_instances,
        relationships = relationship_count,
        "chunk transaction committed"
    );

    Ok(())
}
