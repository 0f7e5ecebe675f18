use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobType {
    IngestText,
    IngestFile,
    IngestImage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    AwaitingApproval,
    Approved,
    Processing,
    Completed,
    Failed { reason: String },
    Cancelled { reason: String },
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed { .. }
                | JobStatus::Cancelled { .. }
                | JobStatus::Rejected
        )
    }

    /// Short lowercase name for progress events and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Approved => "approved",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled { .. } => "cancelled",
            JobStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProgressCounters {
    pub chunks_processed: u64,
    pub chunks_total: u64,
    pub concepts_created: u64,
    pub concepts_linked: u64,
    pub sources_created: u64,
    pub instances_created: u64,
    pub relationships_created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub stage: String,
    pub percent: u8,
    pub counters: ProgressCounters,
    pub message: Option<String>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            stage: "pending".to_string(),
            percent: 0,
            counters: ProgressCounters::default(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostBand {
    pub cost_low: f64,
    pub cost_high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TotalCostBand {
    pub cost_low: f64,
    pub cost_high: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostEstimate {
    pub extraction: CostBand,
    pub embeddings: CostBand,
    pub total: TotalCostBand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAnalysis {
    pub cost_estimate: CostEstimate,
    pub chunk_count: u32,
    pub document_hash: String,
}

stored_object!(Job, "job", {
    job_type: JobType,
    status: JobStatus,
    principal_id: String,
    ontology: String,
    document: String,
    content_hash: String,
    content_ref: String,
    analysis: Option<JobAnalysis>,
    metadata: Option<serde_json::Value>,
    progress: JobProgress,
    error: Option<String>,
    worker_id: Option<String>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    approved_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    expires_at: Option<DateTime<Utc>>
});

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_type: JobType,
        principal_id: String,
        ontology: String,
        document: String,
        content_hash: String,
        content_ref: String,
        analysis: JobAnalysis,
        metadata: Option<serde_json::Value>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            job_type,
            status: JobStatus::AwaitingApproval,
            principal_id,
            ontology,
            document,
            content_hash,
            content_ref,
            analysis: Some(analysis),
            metadata,
            progress: JobProgress::default(),
            error: None,
            worker_id: None,
            approved_at: None,
            started_at: None,
            completed_at: None,
            expires_at: Some(expires_at),
        }
    }

    /// Idempotent-submit lookup: an equal submission from the same principal
    /// into the same ontology that is still pending, running or already
    /// completed wins over creating a new job.
    pub async fn find_existing(
        principal_id: &str,
        ontology: &str,
        content_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE principal_id = $principal_id
                   AND ontology = $ontology
                   AND content_hash = $content_hash
                   AND status IN ['AwaitingApproval', 'Approved', 'Processing', 'Completed']
                 ORDER BY created_at DESC
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("principal_id", principal_id.to_owned()))
            .bind(("ontology", ontology.to_owned()))
            .bind(("content_hash", content_hash.to_owned()))
            .await?;
        let jobs: Vec<Self> = response.take(0)?;
        Ok(jobs.into_iter().next())
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
    }

    async fn update_status(
        id: &str,
        status: JobStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn approve(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        let job = Self::get(id, db).await?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(AppError::Validation(format!(
                "job {id} is {} and cannot be approved",
                job.status.as_str()
            )));
        }

        let updated: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", JobStatus::Approved))
            .patch(PatchOp::replace(
                "/approved_at",
                surrealdb::sql::Datetime::default(),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
    }

    pub async fn reject(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        let job = Self::get(id, db).await?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(AppError::Validation(format!(
                "job {id} is {} and cannot be rejected",
                job.status.as_str()
            )));
        }
        Self::update_status(id, JobStatus::Rejected, db).await?;
        Self::get(id, db).await
    }

    /// Cancel a job that has not started. Returns the updated job when the
    /// cancellation applied here; `Ok(None)` means the job is Processing and
    /// must be cancelled cooperatively by its worker.
    pub async fn cancel_pending(
        id: &str,
        reason: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let job = Self::get(id, db).await?;
        match job.status {
            JobStatus::AwaitingApproval | JobStatus::Approved => {
                Self::update_status(
                    id,
                    JobStatus::Cancelled {
                        reason: reason.to_owned(),
                    },
                    db,
                )
                .await?;
                Ok(Some(Self::get(id, db).await?))
            }
            JobStatus::Processing => Ok(None),
            ref status => Err(AppError::Validation(format!(
                "job {id} is {} and cannot be cancelled",
                status.as_str()
            ))),
        }
    }

    /// Atomically claim the oldest Approved job for a worker. FIFO over
    /// submit time; a job is handed to at most one worker.
    pub async fn claim_next_approved(
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "BEGIN TRANSACTION;
                 LET $next = (SELECT VALUE id FROM job WHERE status = 'Approved' ORDER BY created_at ASC LIMIT 1)[0];
                 IF $next != NONE THEN
                     (UPDATE $next SET
                         status = 'Processing',
                         worker_id = $worker_id,
                         started_at = time::now(),
                         updated_at = time::now()
                      RETURN AFTER)
                 ELSE
                     []
                 END;
                 COMMIT TRANSACTION;",
            )
            .bind(("worker_id", worker_id.to_owned()))
            .await?;
        let claimed: Vec<Self> = response.take(1)?;
        Ok(claimed.into_iter().next())
    }

    /// Put an orphaned Processing job back in line for a fresh claim.
    pub async fn requeue(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", JobStatus::Approved))
            .patch(PatchOp::replace("/worker_id", None::<String>))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn mark_completed(
        id: &str,
        progress: JobProgress,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", JobStatus::Completed))
            .patch(PatchOp::replace("/progress", progress))
            .patch(PatchOp::replace(
                "/completed_at",
                surrealdb::sql::Datetime::default(),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn mark_failed(
        id: &str,
        reason: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace(
                "/status",
                JobStatus::Failed {
                    reason: reason.to_owned(),
                },
            ))
            .patch(PatchOp::replace("/error", Some(reason.to_owned())))
            .patch(PatchOp::replace(
                "/completed_at",
                surrealdb::sql::Datetime::default(),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn mark_cancelled(
        id: &str,
        reason: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace(
                "/status",
                JobStatus::Cancelled {
                    reason: reason.to_owned(),
                },
            ))
            .patch(PatchOp::replace(
                "/completed_at",
                surrealdb::sql::Datetime::default(),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn update_progress(
        id: &str,
        progress: JobProgress,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/progress", progress))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    /// Sweep AwaitingApproval jobs past their approval TTL into
    /// Cancelled{approval_timeout}. Returns the swept jobs.
    pub async fn expire_awaiting(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "UPDATE job SET
                     status = { Cancelled: { reason: 'approval_timeout' } },
                     completed_at = time::now(),
                     updated_at = time::now()
                 WHERE status = 'AwaitingApproval'
                   AND expires_at != NONE
                   AND expires_at < time::now()
                 RETURN AFTER",
            )
            .await?;
        Ok(response.take(0)?)
    }

    /// Terminal jobs whose retention window has elapsed, ready to purge.
    pub async fn list_purgeable(
        completed_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE (status = 'Completed' AND completed_at != NONE AND completed_at < $completed_cutoff)
                    OR ((status.Failed != NONE OR status.Cancelled != NONE OR status = 'Rejected')
                        AND completed_at != NONE AND completed_at < $failed_cutoff)",
            )
            .bind(("table", Self::table_name()))
            .bind(("completed_cutoff", surrealdb::Datetime::from(completed_cutoff)))
            .bind(("failed_cutoff", surrealdb::Datetime::from(failed_cutoff)))
            .await?;
        Ok(response.take(0)?)
    }

    /// Jobs marked Processing; on startup these are orphan candidates.
    pub async fn processing_jobs(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE status = 'Processing'")
            .bind(("table", Self::table_name()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn list_for_principal(
        principal_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE principal_id = $principal_id
                 ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("principal_id", principal_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }
}
