use std::time::Duration;

use common::storage::types::concept::Concept;
use common::storage::types::instance::Instance;
use common::storage::types::job::JobStatus;
use common::storage::types::relationship::ConceptRelationship;
use common::storage::types::source::Source;
use common::storage::types::vocabulary::RelationshipType;
use common::storage::db::SurrealDbClient;
use query_engine::SearchRequest;

use test_utils::*;

/// End-to-end scenarios driving the scheduler, pipeline, graph store and
/// query engine together over an in-memory database.

async fn graph_counts(db: &SurrealDbClient) -> (usize, usize, usize, usize) {
    let concepts: Vec<Concept> = db.get_all_stored_items().await.expect("concepts");
    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    let instances: Vec<Instance> = db.get_all_stored_items().await.expect("instances");
    let relationships: Vec<ConceptRelationship> = db
        .client
        .query("SELECT * FROM relates_to")
        .await
        .expect("relationships query")
        .take(0)
        .expect("relationships rows");
    (
        concepts.len(),
        sources.len(),
        instances.len(),
        relationships.len(),
    )
}

async fn assert_graph_invariants(db: &SurrealDbClient) {
    let sources: Vec<Source> = db.get_all_stored_items().await.expect("sources");
    let instances: Vec<Instance> = db.get_all_stored_items().await.expect("instances");
    let concepts: Vec<Concept> = db.get_all_stored_items().await.expect("concepts");

    // Every instance quote slices exactly out of its source text.
    for instance in &instances {
        let source = sources
            .iter()
            .find(|source| source.id == instance.source_id)
            .expect("instance has a source");
        assert!(
            instance.verify_against(&source.full_text),
            "instance {} does not slice out of its source",
            instance.id
        );
    }

    // Every concept keeps at least one piece of evidence.
    for concept in &concepts {
        let count = Instance::count_for_concept(&concept.id, db)
            .await
            .expect("count");
        assert!(count >= 1, "concept {} has no evidence", concept.id);
    }

    // Every edge's rel_type resolves to an active vocabulary entry.
    let vocabulary = RelationshipType::load_map(db).await.expect("vocabulary");
    let relationships: Vec<ConceptRelationship> = db
        .client
        .query("SELECT * FROM relates_to")
        .await
        .expect("relationships query")
        .take(0)
        .expect("relationships rows");
    for edge in &relationships {
        assert!(
            RelationshipType::resolve_active(&vocabulary, &edge.rel_type).is_some(),
            "rel_type {} does not resolve",
            edge.rel_type
        );
    }
}

const AGE_TEXT: &str =
    "Apache AGE extends PostgreSQL with graph capabilities. It uses Cypher queries.";

async fn script_age_extraction(h: &Harness) {
    h.extraction
        .push(extraction_of(
            vec![
                concept(
                    "Apache AGE",
                    "A PostgreSQL extension that adds graph database capabilities",
                    &["graph database", "graph database extension"],
                    AGE_TEXT,
                    "Apache AGE extends PostgreSQL",
                ),
                concept(
                    "PostgreSQL",
                    "A relational database system",
                    &["postgres"],
                    AGE_TEXT,
                    "PostgreSQL with graph capabilities",
                ),
                concept(
                    "Cypher",
                    "A graph query language",
                    &["cypher queries"],
                    AGE_TEXT,
                    "Cypher queries",
                ),
            ],
            vec![
                relationship("Apache AGE", "PostgreSQL", "EXTENDS", 0.9),
                relationship("Apache AGE", "Cypher", "USES", 0.8),
            ],
        ))
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_approve_complete_happy_path() {
    let h = setup().await;
    script_age_extraction(&h).await;

    let job = h
        .scheduler
        .submit(&h.principal, text_request(AGE_TEXT, "TestOnt", false))
        .await
        .expect("submit");

    let analysis = job.analysis.clone().expect("analysis");
    assert_eq!(analysis.chunk_count, 1);
    assert!(analysis.cost_estimate.total.cost_high > 0.0);
    assert_eq!(job.status, JobStatus::AwaitingApproval);

    h.scheduler
        .approve(&h.principal, &job.id)
        .await
        .expect("approve");
    let done = wait_terminal(&h.db, &job.id).await;
    assert_eq!(done.status, JobStatus::Completed);

    let (concepts, sources, instances, relationships) = graph_counts(&h.db).await;
    assert!(concepts >= 2, "expected at least two concepts, got {concepts}");
    assert_eq!(sources, 1);
    assert!(instances >= 2);
    assert!(relationships >= 1);

    assert_graph_invariants(&h.db).await;

    // Semantic search finds the graph extension.
    let response = h
        .query
        .search(SearchRequest {
            query: "graph database".into(),
            limit: Some(5),
            min_similarity: Some(0.6),
            ontology: None,
        })
        .await
        .expect("search");
    let hit = response
        .results
        .iter()
        .find(|hit| hit.label == "Apache AGE")
        .expect("Apache AGE should be found");
    assert!(hit.similarity >= 0.6);
    assert!(hit.evidence_count >= 1);

    h.scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_content_reingests_as_a_no_op() {
    let h = setup().await;
    script_age_extraction(&h).await;

    let first = h
        .scheduler
        .submit(&h.principal, text_request(AGE_TEXT, "TestOnt", true))
        .await
        .expect("first submit");
    let done = wait_terminal(&h.db, &first.id).await;
    assert_eq!(done.status, JobStatus::Completed);

    let counts_before = graph_counts(&h.db).await;
    let calls_before = h.extraction.call_count();

    // Identical submission resolves to the same job; nothing re-runs.
    let second = h
        .scheduler
        .submit(&h.principal, text_request(AGE_TEXT, "TestOnt", true))
        .await
        .expect("second submit");
    assert_eq!(second.id, first.id);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(graph_counts(&h.db).await, counts_before);
    assert_eq!(h.extraction.call_count(), calls_before);

    h.scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn documents_sharing_an_idea_merge_into_one_concept() {
    let h = setup().await;

    let text_a = "Governed agility balances control with speed.";
    let text_b = "Governed agility is a framework for controlled change.";
    let shared_description = "Balancing organisational control with speed of change";

    h.extraction
        .push(extraction_of(
            vec![concept(
                "Governed Agility",
                shared_description,
                &["governed agility"],
                text_a,
                "Governed agility",
            )],
            vec![],
        ))
        .await;
    let job_a = h
        .scheduler
        .submit(&h.principal, text_request(text_a, "A_ont", true))
        .await
        .expect("submit a");
    assert_eq!(
        wait_terminal(&h.db, &job_a.id).await.status,
        JobStatus::Completed
    );

    h.extraction
        .push(extraction_of(
            vec![concept(
                "Governed Agility",
                shared_description,
                &["governed agility"],
                text_b,
                "Governed agility",
            )],
            vec![],
        ))
        .await;
    let job_b = h
        .scheduler
        .submit(&h.principal, text_request(text_b, "B_ont", true))
        .await
        .expect("submit b");
    assert_eq!(
        wait_terminal(&h.db, &job_b.id).await.status,
        JobStatus::Completed
    );

    let concepts: Vec<Concept> = h.db.get_all_stored_items().await.expect("concepts");
    assert_eq!(concepts.len(), 1, "the two documents describe one concept");
    let merged = &concepts[0];
    assert!(merged.ontologies.contains(&"A_ont".to_string()));
    assert!(merged.ontologies.contains(&"B_ont".to_string()));
    assert_eq!(
        Instance::count_for_concept(&merged.id, &h.db)
            .await
            .expect("count"),
        2
    );

    // Trivial zero-hop path from the concept to itself.
    let path = h
        .query
        .connect(&merged.id, &merged.id, 3)
        .await
        .expect("connect");
    assert_eq!(path.count, 1);
    assert_eq!(path.paths[0].hops, 0);

    assert_graph_invariants(&h.db).await;

    h.scheduler.shutdown();
}

fn five_paragraph_text() -> String {
    let paragraphs = [
        "Alpha systems begin the pipeline narrative with a long opening paragraph that keeps going until the splitter has no option but to give it a chunk of its own, padded with further words.",
        "Bravo systems continue the account in a second paragraph of comparable weight, again padded generously so that the chunker treats it as an independent span of the document.",
        "Charlie systems occupy the middle of the document with yet another block of prose, long enough to stand alone in the chunk plan produced by the splitter configuration used in tests.",
        "Delta systems push the narrative towards its end with one more padded paragraph, carefully written to exceed the minimum span the chunk configuration will accept for a single chunk.",
        "Echo systems close the document with a final long paragraph, padded like the others so the whole text reliably becomes a handful of sequential chunks for the worker to process.",
    ];
    paragraphs.join("\n\n")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_preserves_partial_work_and_force_resumes() {
    let h = setup().await;
    let text = five_paragraph_text();

    // Slow chunks down so cancellation lands mid-job.
    h.extraction.set_delay(Duration::from_millis(300)).await;

    let job = h
        .scheduler
        .submit(&h.principal, text_request(&text, "TestOnt", true))
        .await
        .expect("submit");
    let chunks_total = job.analysis.clone().expect("analysis").chunk_count as u64;
    assert!(chunks_total >= 3, "test text should produce several chunks");

    wait_until(&h.db, &job.id, |j| {
        j.progress.counters.chunks_processed >= 2
    })
    .await;
    h.scheduler
        .cancel(&h.principal, &job.id)
        .await
        .expect("cancel");

    let cancelled = wait_terminal(&h.db, &job.id).await;
    assert!(matches!(cancelled.status, JobStatus::Cancelled { .. }));

    // Committed chunks stay; each processed chunk left its source behind.
    let processed = cancelled.progress.counters.chunks_processed;
    assert!(processed >= 2);
    let sources: Vec<Source> = h.db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len() as u64, processed);

    // Forced resubmission completes the remainder without duplicating the
    // chunks that were already committed.
    h.extraction.set_delay(Duration::from_millis(0)).await;
    let mut retry = text_request(&text, "TestOnt", true);
    retry.force = true;
    let second = h
        .scheduler
        .submit(&h.principal, retry)
        .await
        .expect("resubmit");
    assert_ne!(second.id, job.id);
    let done = wait_terminal(&h.db, &second.id).await;
    assert_eq!(done.status, JobStatus::Completed);

    let sources: Vec<Source> = h.db.get_all_stored_items().await.expect("sources");
    assert_eq!(sources.len() as u64, chunks_total);
    let instances: Vec<Instance> = h.db.get_all_stored_items().await.expect("instances");
    assert_eq!(instances.len() as u64, chunks_total, "one deduped instance per chunk");

    assert_graph_invariants(&h.db).await;

    h.scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unapproved_jobs_expire_without_model_calls() {
    let mut config = common::utils::config::AppConfig::for_tests();
    config.embedding_dimension = DIM;
    config.job_approval_timeout_secs = 1;
    config.job_cleanup_interval_secs = 1;
    let h = setup_with(config).await;

    let job = h
        .scheduler
        .submit(&h.principal, text_request("Left waiting forever.", "TestOnt", false))
        .await
        .expect("submit");

    let expired = wait_terminal(&h.db, &job.id).await;
    assert_eq!(
        expired.status,
        JobStatus::Cancelled {
            reason: "approval_timeout".into()
        }
    );
    assert_eq!(h.extraction.call_count(), 0, "no model calls were made");

    h.scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingested_chain_yields_a_shortest_path() {
    let h = setup().await;
    let text = "Alpha implies Beta in this argument. Beta supports Gamma throughout.";

    h.extraction
        .push(extraction_of(
            vec![
                concept("Alpha", "The first proposition", &["alpha"], text, "Alpha"),
                concept("Beta", "The middle proposition", &["beta"], text, "Beta"),
                concept("Gamma", "The final proposition", &["gamma"], text, "Gamma"),
            ],
            vec![
                relationship("Alpha", "Beta", "IMPLIES", 0.9),
                relationship("Beta", "Gamma", "SUPPORTS", 0.85),
            ],
        ))
        .await;

    let job = h
        .scheduler
        .submit(&h.principal, text_request(text, "TestOnt", true))
        .await
        .expect("submit");
    assert_eq!(
        wait_terminal(&h.db, &job.id).await.status,
        JobStatus::Completed
    );

    let concepts: Vec<Concept> = h.db.get_all_stored_items().await.expect("concepts");
    let id_of = |label: &str| {
        concepts
            .iter()
            .find(|c| c.label == label)
            .map(|c| c.id.clone())
            .expect("concept exists")
    };

    let response = h
        .query
        .connect(&id_of("Alpha"), &id_of("Gamma"), 3)
        .await
        .expect("connect");
    assert_eq!(response.count, 1);
    let path = &response.paths[0];
    assert_eq!(path.hops, 2);
    assert_eq!(
        path.nodes.iter().map(|n| n.label.as_str()).collect::<Vec<_>>(),
        vec!["Alpha", "Beta", "Gamma"]
    );
    assert_eq!(path.relationships, vec!["IMPLIES", "SUPPORTS"]);

    assert_graph_invariants(&h.db).await;

    h.scheduler.shutdown();
}
