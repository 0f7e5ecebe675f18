pub mod upsert;

use std::sync::Arc;

use common::{
    error::AppError,
    llm::{
        embeddings::EmbeddingAdapter,
        extraction::{ChunkExtraction, ExtractedConcept, ExtractionAdapter},
    },
    storage::{
        db::SurrealDbClient,
        types::{
            checkpoint::JobCheckpoint,
            job::{Job, JobProgress, ProgressCounters},
            job_content::JobContent,
            vocabulary::RelationshipType,
        },
    },
    utils::config::AppConfig,
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    chunker::{chunk_document, DocumentChunk},
    progress::{ProgressEvent, ProgressHub},
};

use self::upsert::{upsert_chunk, ConceptCandidate, ResolvedRelationship};

/// Executes one approved job: chunk loop with extract → verify → embed →
/// upsert → checkpoint, cancellation observed at chunk boundaries.
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    extraction: Arc<dyn ExtractionAdapter>,
    embeddings: Arc<dyn EmbeddingAdapter>,
    config: AppConfig,
    progress: Arc<ProgressHub>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        extraction: Arc<dyn ExtractionAdapter>,
        embeddings: Arc<dyn EmbeddingAdapter>,
        config: AppConfig,
        progress: Arc<ProgressHub>,
    ) -> Self {
        Self {
            db,
            extraction,
            embeddings,
            config,
            progress,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, ontology = %job.ontology))]
    pub async fn run_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<JobProgress, AppError> {
        let content = JobContent::get(&job.content_ref, &self.db).await?;
        let chunks = chunk_document(
            &content.text,
            &content.document_hash,
            self.config.chunk_target_tokens,
            self.config.chunk_overlap_tokens,
        )?;

        let mut counters = ProgressCounters::default();
        let mut resume_after = None;
        if let Some(checkpoint) = JobCheckpoint::get_for_job(&job.id, &self.db).await? {
            resume_after = Some(checkpoint.last_chunk_index);
            counters = checkpoint.counters;
            info!(
                job_id = %job.id,
                last_chunk_index = checkpoint.last_chunk_index,
                "resuming job from checkpoint"
            );
        }
        counters.chunks_total = chunks.len() as u64;

        for chunk in &chunks {
            if resume_after.is_some_and(|last| chunk.index <= last) {
                continue;
            }
            // Cancellation is cooperative and observed only here; committed
            // chunks stay in the graph.
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            self.publish(job, "extract", &counters, None).await;

            let worked = tokio::time::timeout(
                self.config.chunk_timeout(),
                self.process_chunk(job, chunk, &mut counters),
            )
            .await;

            match worked {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(tag_chunk_error(err, chunk.index)),
                Err(_elapsed) => {
                    return Err(AppError::AdapterFatal(format!(
                        "chunk {} exceeded the {}s chunk timeout",
                        chunk.index, self.config.chunk_timeout_secs
                    )))
                }
            }

            counters.chunks_processed = counters.chunks_processed.saturating_add(1);
            JobCheckpoint::new(&job.id, chunk.index, counters.clone())
                .save(&self.db)
                .await?;

            let progress = self.snapshot(job, "upsert", &counters, None);
            Job::update_progress(&job.id, progress, &self.db).await?;
            self.publish(job, "upsert", &counters, None).await;
        }

        Ok(JobProgress {
            stage: "completed".into(),
            percent: 100,
            counters,
            message: None,
        })
    }

    async fn process_chunk(
        &self,
        job: &Job,
        chunk: &DocumentChunk,
        counters: &mut ProgressCounters,
    ) -> Result<(), AppError> {
        // The vocabulary is cached for the duration of the chunk.
        let mut vocabulary = RelationshipType::load_map(&self.db).await?;
        let vocabulary_names = RelationshipType::active_names(&vocabulary);

        let retry_strategy = ExponentialBackoff::from_millis(100)
            .max_delay(std::time::Duration::from_secs(10))
            .map(jitter)
            .take(self.config.extract_max_retries);
        let extraction = RetryIf::spawn(
            retry_strategy,
            || {
                self.extraction
                    .extract_concepts(&chunk.text, &vocabulary_names, Some(&job.ontology))
            },
            |err: &AppError| err.is_transient(),
        )
        .await
        .map_err(|err| match err {
            AppError::AdapterTransient(message) => {
                AppError::AdapterFatal(format!("retries exhausted: {message}"))
            }
            other => other,
        })?;

        let ChunkExtraction {
            concepts,
            relationships,
        } = extraction;
        let concepts = verify_concepts(&chunk.text, concepts);

        self.publish(job, "embed", counters, None).await;

        let inputs: Vec<String> = concepts.iter().map(embedding_input).collect();
        let vectors = self.embeddings.embed(&inputs).await?;
        if vectors.len() != concepts.len() {
            return Err(AppError::AdapterFatal(format!(
                "embedding count mismatch: {} concepts, {} vectors",
                concepts.len(),
                vectors.len()
            )));
        }
        let candidates: Vec<ConceptCandidate> = concepts
            .into_iter()
            .zip(vectors)
            .map(|(extracted, embedding)| ConceptCandidate {
                extracted,
                embedding,
            })
            .collect();

        let mut resolved = Vec::new();
        for relationship in relationships {
            match RelationshipType::resolve_active(&vocabulary, &relationship.rel_type) {
                Some(active) => resolved.push(ResolvedRelationship {
                    from_label: relationship.from_label,
                    to_label: relationship.to_label,
                    rel_type: active,
                    confidence: relationship.confidence.clamp(0.0, 1.0),
                }),
                None => {
                    let Some(name) = normalize_rel_type(&relationship.rel_type) else {
                        debug!(rel_type = %relationship.rel_type, "dropping malformed rel_type");
                        continue;
                    };
                    if !self.config.vocabulary_expansion {
                        debug!(rel_type = %name, "vocabulary expansion disabled; dropping");
                        continue;
                    }
                    RelationshipType::add_active(&name, "Proposed during extraction", &self.db)
                        .await?;
                    vocabulary.insert(
                        name.clone(),
                        RelationshipType::new(&name, "Proposed during extraction".into()),
                    );
                    resolved.push(ResolvedRelationship {
                        from_label: relationship.from_label,
                        to_label: relationship.to_label,
                        rel_type: name,
                        confidence: relationship.confidence.clamp(0.0, 1.0),
                    });
                }
            }
        }

        upsert_chunk(
            &self.db,
            self.config.concept_merge_threshold,
            self.embeddings.model_id(),
            job,
            chunk,
            candidates,
            resolved,
            counters,
        )
        .await
    }

    fn snapshot(
        &self,
        job: &Job,
        stage: &str,
        counters: &ProgressCounters,
        message: Option<String>,
    ) -> JobProgress {
        JobProgress {
            stage: stage.to_owned(),
            percent: percent_done(counters),
            counters: counters.clone(),
            message,
        }
    }

    async fn publish(
        &self,
        job: &Job,
        stage: &str,
        counters: &ProgressCounters,
        message: Option<String>,
    ) {
        self.progress
            .publish(ProgressEvent {
                job_id: job.id.clone(),
                status: "processing".into(),
                stage: stage.to_owned(),
                percent: percent_done(counters),
                counters: counters.clone(),
                message,
                sequence: 0,
            })
            .await;
    }
}

fn percent_done(counters: &ProgressCounters) -> u8 {
    if counters.chunks_total == 0 {
        return 0;
    }
    let percent = counters.chunks_processed.saturating_mul(100) / counters.chunks_total;
    u8::try_from(percent.min(100)).unwrap_or(100)
}

fn tag_chunk_error(err: AppError, index: u32) -> AppError {
    match err {
        AppError::AdapterTransient(m) => {
            AppError::AdapterTransient(format!("chunk {index}: {m}"))
        }
        AppError::AdapterFatal(m) => AppError::AdapterFatal(format!("chunk {index}: {m}")),
        AppError::Store(m) => AppError::Store(format!("chunk {index}: {m}")),
        AppError::Validation(m) => AppError::Validation(format!("chunk {index}: {m}")),
        other => other,
    }
}

/// `label + " " + description + " " + search_terms`, the embedding input
/// contract for concepts.
fn embedding_input(concept: &ExtractedConcept) -> String {
    format!(
        "{} {} {}",
        concept.label,
        concept.description,
        concept.search_terms.join(" ")
    )
}

/// Enforce the quote contract: every instance must be a verbatim substring
/// of the chunk. Offsets that drifted are re-anchored to the first match;
/// quotes that are not substrings at all are dropped, and concepts left
/// without evidence are dropped with them.
fn verify_concepts(
    chunk_text: &str,
    concepts: Vec<ExtractedConcept>,
) -> Vec<ExtractedConcept> {
    concepts
        .into_iter()
        .filter_map(|mut concept| {
            concept.instances.retain_mut(|instance| {
                let start = usize::try_from(instance.char_offset_start).unwrap_or(usize::MAX);
                let end = usize::try_from(instance.char_offset_end).unwrap_or(usize::MAX);
                if chunk_text.get(start..end) == Some(instance.quote.as_str()) {
                    return true;
                }
                match chunk_text.find(&instance.quote) {
                    Some(found) => {
                        instance.char_offset_start = found as u64;
                        instance.char_offset_end = (found + instance.quote.len()) as u64;
                        true
                    }
                    None => {
                        warn!(
                            quote = %instance.quote,
                            "dropping instance whose quote is not in the chunk"
                        );
                        false
                    }
                }
            });

            if concept.instances.is_empty() {
                warn!(label = %concept.label, "dropping concept with no surviving evidence");
                None
            } else {
                Some(concept)
            }
        })
        .collect()
}

/// Rel types are SCREAMING_SNAKE_CASE, bounded length.
fn normalize_rel_type(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 64 {
        return None;
    }
    let name: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().all(|c| c == '_') {
        return None;
    }
    Some(name)
}
