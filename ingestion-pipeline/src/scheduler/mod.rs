use std::{collections::HashMap, sync::Arc};

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    error::AppError,
    llm::{embeddings::EmbeddingAdapter, extraction::ExtractionAdapter},
    storage::{
        db::SurrealDbClient,
        types::{
            checkpoint::JobCheckpoint,
            job::{Job, JobProgress, JobType},
            job_content::JobContent,
            principal::Principal,
        },
    },
    utils::config::AppConfig,
};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    analysis::analyse,
    pipeline::IngestionPipeline,
    progress::{ProgressEvent, ProgressHub},
    reconcile::reconcile_once,
};

/// Idle backoff for worker claim loops.
const IDLE_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub text: String,
    pub document: String,
    pub ontology: String,
    pub auto_approve: bool,
    pub force: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Owns the job lifecycle: the approval gate, a fixed worker pool claiming
/// approved jobs FIFO, cooperative cancellation, progress fan-out, and the
/// retention/reconciliation sweeps. One instance per process, created at
/// startup and handed to the HTTP layer.
pub struct JobScheduler {
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    pipeline: Arc<IngestionPipeline>,
    progress: Arc<ProgressHub>,
    running: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        extraction: Arc<dyn ExtractionAdapter>,
        embeddings: Arc<dyn EmbeddingAdapter>,
    ) -> Arc<Self> {
        let progress = Arc::new(ProgressHub::new());
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&db),
            extraction,
            embeddings,
            config.clone(),
            Arc::clone(&progress),
        ));

        Arc::new(Self {
            db,
            config,
            pipeline,
            progress,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Recover orphans, then launch the worker pool and the maintenance
    /// task.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.recover_orphans().await?;

        for index in 0..self.config.max_concurrent_jobs.max(1) {
            let scheduler = Arc::clone(self);
            let worker_id = format!("ingest-worker-{index}-{}", Uuid::new_v4());
            tokio::spawn(async move { scheduler.worker_loop(worker_id).await });
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.maintenance_loop().await });

        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Synchronous analysis, duplicate detection, approval gating. Never
    /// calls the extraction model.
    #[instrument(skip_all, fields(principal = %principal.id, ontology = %request.ontology))]
    pub async fn submit(
        &self,
        principal: &Principal,
        request: SubmitRequest,
    ) -> Result<Job, AppError> {
        if request.ontology.trim().is_empty() {
            return Err(AppError::Validation("ontology is required".into()));
        }
        if request.document.trim().is_empty() {
            return Err(AppError::Validation("document name is required".into()));
        }

        let analysis = analyse(&request.text, &self.config)?;

        if let Some(max_cost) = self.config.max_job_cost_usd {
            let estimate = analysis.analysis.cost_estimate.total.cost_high;
            if estimate > max_cost {
                return Err(AppError::Quota(format!(
                    "estimated cost {estimate:.4} USD exceeds the configured budget of {max_cost:.4} USD"
                )));
            }
        }

        if !request.force {
            if let Some(existing) = Job::find_existing(
                &principal.id,
                &request.ontology,
                &analysis.document_hash,
                &self.db,
            )
            .await?
            {
                info!(job_id = %existing.id, "duplicate submission resolved to existing job");
                return Ok(existing);
            }
        }

        let content = JobContent::new(analysis.canonical_text, analysis.document_hash.clone());
        let content_ref = content.id.clone();
        self.db.store_item(content).await?;

        let expires_at = Utc::now()
            + ChronoDuration::from_std(self.config.job_approval_timeout())
                .unwrap_or_else(|_| ChronoDuration::hours(1));
        let job = Job::new(
            request.job_type,
            principal.id.clone(),
            request.ontology,
            request.document,
            analysis.document_hash,
            content_ref,
            analysis.analysis,
            request.metadata.clone(),
            expires_at,
        );
        let job_id = job.id.clone();
        self.db.store_item(job.clone()).await?;

        let job = if request.auto_approve {
            if principal.auto_approve_allowed {
                Job::approve(&job_id, &self.db).await?
            } else {
                warn!(job_id = %job_id, "auto_approve requested without permission; holding for approval");
                job
            }
        } else {
            job
        };

        self.publish_status(&job, None).await;
        info!(job_id = %job.id, status = job.status.as_str(), "job submitted");
        Ok(job)
    }

    pub async fn approve(&self, principal: &Principal, job_id: &str) -> Result<Job, AppError> {
        self.authorize(principal, job_id).await?;
        let job = Job::approve(job_id, &self.db).await?;
        self.publish_status(&job, None).await;
        Ok(job)
    }

    pub async fn reject(&self, principal: &Principal, job_id: &str) -> Result<Job, AppError> {
        self.authorize(principal, job_id).await?;
        let job = Job::reject(job_id, &self.db).await?;
        self.publish_status(&job, None).await;
        Ok(job)
    }

    /// Cancel from any non-terminal state. Pending jobs flip immediately;
    /// processing jobs get their cooperative flag set and the worker commits
    /// at the next chunk boundary. Partial ingestion is preserved.
    pub async fn cancel(&self, principal: &Principal, job_id: &str) -> Result<Job, AppError> {
        self.authorize(principal, job_id).await?;
        match Job::cancel_pending(job_id, "requested", &self.db).await? {
            Some(job) => {
                self.publish_status(&job, None).await;
                Ok(job)
            }
            None => {
                if let Some(token) = self.running.lock().await.get(job_id) {
                    token.cancel();
                }
                Job::get(job_id, &self.db).await
            }
        }
    }

    pub async fn status(&self, principal: &Principal, job_id: &str) -> Result<Job, AppError> {
        self.authorize(principal, job_id).await?;
        Job::get(job_id, &self.db).await
    }

    pub async fn jobs_for_principal(&self, principal: &Principal) -> Result<Vec<Job>, AppError> {
        Job::list_for_principal(&principal.id, &self.db).await
    }

    /// Snapshot plus live receiver for a job's progress stream.
    pub async fn subscribe(
        &self,
        principal: &Principal,
        job_id: &str,
    ) -> Result<(Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>), AppError> {
        self.authorize(principal, job_id).await?;
        Ok(self.progress.subscribe(job_id).await)
    }

    async fn authorize(&self, principal: &Principal, job_id: &str) -> Result<(), AppError> {
        let job = Job::get(job_id, &self.db).await?;
        if job.principal_id != principal.id {
            return Err(AppError::Auth(format!(
                "job {job_id} belongs to another principal"
            )));
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        info!(%worker_id, "ingestion worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match Job::claim_next_approved(&worker_id, &self.db).await {
                Ok(Some(job)) => {
                    info!(%worker_id, job_id = %job.id, "claimed ingestion job");
                    self.execute_job(job).await;
                }
                Ok(None) => {
                    sleep(std::time::Duration::from_millis(IDLE_BACKOFF_MS)).await;
                }
                Err(err) => {
                    error!(%worker_id, error = %err, "failed to claim ingestion job");
                    sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
        info!(%worker_id, "ingestion worker stopped");
    }

    async fn execute_job(&self, job: Job) {
        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(job.id.clone(), token.clone());

        self.publish_status(&job, Some("processing started".into()))
            .await;

        let result = self.pipeline.run_job(&job, &token).await;
        self.running.lock().await.remove(&job.id);

        match result {
            Ok(progress) => {
                if let Err(err) = Job::mark_completed(&job.id, progress.clone(), &self.db).await {
                    error!(job_id = %job.id, error = %err, "failed to mark job completed");
                }
                JobCheckpoint::delete_for_job(&job.id, &self.db).await.ok();
                self.publish_event(&job.id, "completed", "completed", &progress, None)
                    .await;
                info!(job_id = %job.id, "ingestion job completed");
            }
            Err(AppError::Cancelled) => {
                if let Err(err) = Job::mark_cancelled(&job.id, "requested", &self.db).await {
                    error!(job_id = %job.id, error = %err, "failed to mark job cancelled");
                }
                let progress = Job::get(&job.id, &self.db)
                    .await
                    .map(|j| j.progress)
                    .unwrap_or_default();
                self.publish_event(&job.id, "cancelled", "cancelled", &progress, None)
                    .await;
                info!(job_id = %job.id, "ingestion job cancelled; committed chunks preserved");
            }
            Err(err) => {
                let reason = err.to_string();
                if let Err(mark_err) = Job::mark_failed(&job.id, &reason, &self.db).await {
                    error!(job_id = %job.id, error = %mark_err, "failed to mark job failed");
                }
                let progress = Job::get(&job.id, &self.db)
                    .await
                    .map(|j| j.progress)
                    .unwrap_or_default();
                self.publish_event(&job.id, "failed", "failed", &progress, Some(reason.clone()))
                    .await;
                warn!(job_id = %job.id, error = %reason, "ingestion job failed");
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut cleanup = tokio::time::interval(self.config.job_cleanup_interval());
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval());
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = cleanup.tick() => {
                    if let Err(err) = self.run_cleanup().await {
                        error!(error = %err, "job maintenance sweep failed");
                    }
                }
                _ = reconcile.tick() => {
                    match reconcile_once(&self.db, self.config.concept_merge_threshold).await {
                        Ok(0) => {}
                        Ok(merged) => info!(merged, "concept reconciliation pass finished"),
                        Err(err) => error!(error = %err, "concept reconciliation failed"),
                    }
                }
            }
        }
    }

    async fn run_cleanup(&self) -> Result<(), AppError> {
        // Approval TTL sweep.
        for job in Job::expire_awaiting(&self.db).await? {
            self.publish_event(
                &job.id,
                "cancelled",
                "cancelled",
                &job.progress,
                Some("approval_timeout".into()),
            )
            .await;
            info!(job_id = %job.id, "job cancelled by approval timeout");
        }

        // Retention purge.
        let now = Utc::now();
        let completed_cutoff = now
            - ChronoDuration::from_std(self.config.job_completed_retention())
                .unwrap_or_else(|_| ChronoDuration::days(1));
        let failed_cutoff = now
            - ChronoDuration::from_std(self.config.job_failed_retention())
                .unwrap_or_else(|_| ChronoDuration::days(3));
        for job in Job::list_purgeable(completed_cutoff, failed_cutoff, &self.db).await? {
            let _content: Option<JobContent> = self.db.delete_item(&job.content_ref).await?;
            JobCheckpoint::delete_for_job(&job.id, &self.db).await?;
            let _job: Option<Job> = self.db.delete_item(&job.id).await?;
            self.progress.forget(&job.id).await;
            info!(job_id = %job.id, "purged job past retention");
        }

        // Orphan recovery for Processing jobs with no live worker. The grace
        // window keeps a just-claimed job (worker not yet registered) from
        // being mistaken for an orphan; live jobs refresh updated_at at
        // every chunk.
        let grace = Utc::now() - ChronoDuration::seconds(5);
        let running = self.running.lock().await;
        let orphans: Vec<Job> = Job::processing_jobs(&self.db)
            .await?
            .into_iter()
            .filter(|job| !running.contains_key(&job.id) && job.updated_at < grace)
            .collect();
        drop(running);
        for job in orphans {
            self.recover_orphan(job).await?;
        }

        Ok(())
    }

    /// Processing jobs found without a live worker: resume from a fresh
    /// checkpoint, else fail with reason `orphaned`.
    async fn recover_orphans(&self) -> Result<(), AppError> {
        for job in Job::processing_jobs(&self.db).await? {
            self.recover_orphan(job).await?;
        }
        Ok(())
    }

    async fn recover_orphan(&self, job: Job) -> Result<(), AppError> {
        let checkpoint = JobCheckpoint::get_for_job(&job.id, &self.db).await?;
        let resumable = checkpoint
            .as_ref()
            .is_some_and(|cp| cp.is_fresh(self.config.checkpoint_max_age(), Utc::now()));

        // A freshly started job without a checkpoint has lost no work;
        // requeue it as well.
        if resumable || checkpoint.is_none() {
            warn!(job_id = %job.id, "requeueing orphaned job for resume");
            Job::requeue(&job.id, &self.db).await?;
        } else {
            warn!(job_id = %job.id, "orphaned job checkpoint too old; failing");
            Job::mark_failed(&job.id, "orphaned", &self.db).await?;
        }
        Ok(())
    }

    async fn publish_status(&self, job: &Job, message: Option<String>) {
        self.publish_event(
            &job.id,
            job.status.as_str(),
            &job.progress.stage,
            &job.progress,
            message,
        )
        .await;
    }

    async fn publish_event(
        &self,
        job_id: &str,
        status: &str,
        stage: &str,
        progress: &JobProgress,
        message: Option<String>,
    ) {
        self.progress
            .publish(ProgressEvent {
                job_id: job_id.to_owned(),
                status: status.to_owned(),
                stage: stage.to_owned(),
                percent: progress.percent,
                counters: progress.counters.clone(),
                message,
                sequence: 0,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::embeddings::HashedEmbeddings;
    use common::llm::extraction::scripted::ScriptedExtraction;
    use common::storage::types::job::JobStatus;
    use std::time::Duration;

    const DIM: usize = 64;

    struct Harness {
        scheduler: Arc<JobScheduler>,
        extraction: Arc<ScriptedExtraction>,
        principal: Principal,
        db: Arc<SurrealDbClient>,
    }

    async fn harness_with(config: AppConfig) -> Harness {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.apply_migrations().await.expect("migrations");
        db.ensure_vector_index(config.embedding_dimension)
            .await
            .expect("index");

        let principal = Principal::new("tester".into(), true);
        db.store_item(principal.clone()).await.expect("principal");

        let extraction = Arc::new(ScriptedExtraction::new());
        let scheduler = JobScheduler::new(
            Arc::clone(&db),
            config.clone(),
            Arc::clone(&extraction) as Arc<dyn ExtractionAdapter>,
            Arc::new(HashedEmbeddings::new(config.embedding_dimension)),
        );

        Harness {
            scheduler,
            extraction,
            principal,
            db,
        }
    }

    async fn harness() -> Harness {
        let mut config = AppConfig::for_tests();
        config.embedding_dimension = DIM;
        config.job_approval_timeout_secs = 3600;
        harness_with(config).await
    }

    fn request(text: &str, auto_approve: bool) -> SubmitRequest {
        SubmitRequest {
            job_type: JobType::IngestText,
            text: text.into(),
            document: "doc.txt".into(),
            ontology: "TestOnt".into(),
            auto_approve,
            force: false,
            metadata: None,
        }
    }

    async fn wait_for<F>(db: &SurrealDbClient, job_id: &str, predicate: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        for _ in 0..100 {
            let job = Job::get(job_id, db).await.expect("get job");
            if predicate(&job) {
                return job;
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for job state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_approve_complete_happy_path() {
        let h = harness().await;
        h.scheduler.start().await.expect("start");

        let job = h
            .scheduler
            .submit(&h.principal, request("Scheduling happy path text.", false))
            .await
            .expect("submit");
        assert_eq!(job.status, JobStatus::AwaitingApproval);
        let analysis = job.analysis.as_ref().expect("analysis");
        assert!(analysis.chunk_count >= 1);
        assert!(analysis.cost_estimate.total.cost_high > 0.0);

        h.scheduler
            .approve(&h.principal, &job.id)
            .await
            .expect("approve");

        let done = wait_for(&h.db, &job.id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.counters.chunks_processed, done.progress.counters.chunks_total);
        assert!(h.extraction.call_count() >= 1);

        h.scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_submission_returns_existing_job() {
        let h = harness().await;

        let first = h
            .scheduler
            .submit(&h.principal, request("Duplicate detection text.", false))
            .await
            .expect("first submit");
        let second = h
            .scheduler
            .submit(&h.principal, request("Duplicate detection text.", false))
            .await
            .expect("second submit");
        assert_eq!(first.id, second.id);

        // force=true creates a fresh job.
        let mut forced = request("Duplicate detection text.", false);
        forced.force = true;
        let third = h
            .scheduler
            .submit(&h.principal, forced)
            .await
            .expect("forced submit");
        assert_ne!(first.id, third.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_approve_requires_permission() {
        let h = harness().await;

        let job = h
            .scheduler
            .submit(&h.principal, request("Auto approved text.", true))
            .await
            .expect("submit");
        assert_eq!(job.status, JobStatus::Approved);

        let restricted = Principal::new("restricted".into(), false);
        h.db.store_item(restricted.clone()).await.expect("principal");
        let held = h
            .scheduler
            .submit(&restricted, request("Held for approval.", true))
            .await
            .expect("submit");
        assert_eq!(held.status, JobStatus::AwaitingApproval);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_before_processing_is_instant() {
        let h = harness().await;

        let job = h
            .scheduler
            .submit(&h.principal, request("Cancel me.", false))
            .await
            .expect("submit");
        let cancelled = h
            .scheduler
            .cancel(&h.principal, &job.id)
            .await
            .expect("cancel");
        assert_eq!(
            cancelled.status,
            JobStatus::Cancelled {
                reason: "requested".into()
            }
        );
        assert_eq!(h.extraction.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn approval_timeout_cancels_without_llm_calls() {
        let mut config = AppConfig::for_tests();
        config.embedding_dimension = DIM;
        config.job_approval_timeout_secs = 1;
        config.job_cleanup_interval_secs = 1;
        let h = harness_with(config).await;
        h.scheduler.start().await.expect("start");

        let job = h
            .scheduler
            .submit(&h.principal, request("Never approved.", false))
            .await
            .expect("submit");

        let expired = wait_for(&h.db, &job.id, |j| j.status.is_terminal()).await;
        assert_eq!(
            expired.status,
            JobStatus::Cancelled {
                reason: "approval_timeout".into()
            }
        );
        assert_eq!(h.extraction.call_count(), 0);

        h.scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quota_gate_rejects_expensive_jobs() {
        let mut config = AppConfig::for_tests();
        config.embedding_dimension = DIM;
        config.max_job_cost_usd = Some(0.0);
        let h = harness_with(config).await;

        let err = h
            .scheduler
            .submit(&h.principal, request("Any cost is too much here.", false))
            .await
            .expect_err("quota");
        assert!(matches!(err, AppError::Quota(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_jobs_are_not_visible() {
        let h = harness().await;

        let job = h
            .scheduler
            .submit(&h.principal, request("Private job.", false))
            .await
            .expect("submit");

        let outsider = Principal::new("outsider".into(), false);
        h.db.store_item(outsider.clone()).await.expect("principal");

        let err = h
            .scheduler
            .status(&outsider, &job.id)
            .await
            .expect_err("foreign status");
        assert!(matches!(err, AppError::Auth(_)));

        let err = h
            .scheduler
            .cancel(&outsider, &job.id)
            .await
            .expect_err("foreign cancel");
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn orphaned_processing_job_is_requeued_on_start() {
        let h = harness().await;

        let job = h
            .scheduler
            .submit(&h.principal, request("Orphan recovery text.", false))
            .await
            .expect("submit");
        Job::approve(&job.id, &h.db).await.expect("approve");
        // Simulate a previous process dying mid-flight.
        let claimed = Job::claim_next_approved("dead-worker", &h.db)
            .await
            .expect("claim")
            .expect("job");
        assert_eq!(claimed.id, job.id);

        h.scheduler.start().await.expect("start");

        let done = wait_for(&h.db, &job.id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Completed);

        h.scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_stream_sees_snapshot_and_completion() {
        let h = harness().await;
        h.scheduler.start().await.expect("start");

        let job = h
            .scheduler
            .submit(&h.principal, request("Streaming progress text.", false))
            .await
            .expect("submit");

        let (snapshot, mut rx) = h
            .scheduler
            .subscribe(&h.principal, &job.id)
            .await
            .expect("subscribe");
        assert!(snapshot.is_some(), "submit publishes an initial snapshot");

        h.scheduler
            .approve(&h.principal, &job.id)
            .await
            .expect("approve");

        let mut saw_completion = false;
        for _ in 0..200 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.status == "completed" {
                        saw_completion = true;
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => continue,
            }
        }
        assert!(saw_completion, "stream should carry the completion event");

        h.scheduler.shutdown();
    }
}
