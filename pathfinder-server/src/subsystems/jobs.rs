//! Background advanced-synthesis jobs.
//!
//! A job row is created `pending` and handed to a detached tokio task.
//! Status moves `pending -> processing -> completed | failed`; a client may
//! cancel while the job is pending or processing. Each transition is a
//! conditional UPDATE on the expected current status, so a cancelled job
//! never flips back and its results are discarded.

use std::sync::Arc;

use pathfinder_core::config::SynthesisConfig;
use pathfinder_core::llm::LlmBackend;
use pathfinder_core::models::{JobStatus, SynthesisJob, SynthesisType};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::content_sources;
use crate::subsystems::realms;
use crate::subsystems::synthesis::{self, PipelineOutcome};
use crate::subsystems::versions::commit_version;

#[derive(Debug, Deserialize, Default)]
pub struct StartJob {
    #[serde(default)]
    pub content_source_ids: Vec<Uuid>,
    #[serde(default)]
    pub synthesis_type: SynthesisType,
    pub configuration: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub estimated_completion_seconds: u64,
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<SynthesisJob> {
    sqlx::query_as("SELECT * FROM synthesis_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Synthesis job"))
}

/// Newest first.
pub async fn list_for_realm(pool: &PgPool, realm_id: Uuid) -> ApiResult<Vec<SynthesisJob>> {
    realms::ensure_exists(pool, realm_id).await?;
    let rows = sqlx::query_as(
        "SELECT * FROM synthesis_jobs WHERE realm_id = $1 ORDER BY created_at DESC",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Insert a pending job and spawn its processing task.
pub async fn start(
    pool: &PgPool,
    llm: Arc<dyn LlmBackend>,
    config: &SynthesisConfig,
    realm_id: Uuid,
    req: StartJob,
) -> ApiResult<JobAccepted> {
    realms::ensure_exists(pool, realm_id).await?;

    let job: SynthesisJob = sqlx::query_as(
        r#"
        INSERT INTO synthesis_jobs (id, realm_id, status, synthesis_type, input_sources, configuration)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(realm_id)
    .bind(JobStatus::Pending)
    .bind(req.synthesis_type)
    .bind(&req.content_source_ids)
    .bind(req.configuration.unwrap_or_else(|| serde_json::json!({})))
    .fetch_one(pool)
    .await?;

    tracing::info!(
        job_id = %job.id,
        realm_id = %realm_id,
        synthesis_type = %job.synthesis_type,
        sources = job.input_sources.len(),
        "Queued advanced synthesis job"
    );

    let task_pool = pool.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        run_detached(&task_pool, llm.as_ref(), job_id).await;
    });

    Ok(JobAccepted {
        job_id: job.id,
        status: job.status,
        estimated_completion_seconds: config.estimated_completion_seconds,
    })
}

/// Drive one job to a terminal status.
///
/// Pipeline failures are recorded on the job; the returned error covers only
/// failures to update the job row itself.
pub async fn process_job(pool: &PgPool, llm: &dyn LlmBackend, job_id: Uuid) -> ApiResult<()> {
    let claimed: Option<SynthesisJob> = sqlx::query_as(
        r#"
        UPDATE synthesis_jobs SET status = $2, updated_at = now()
        WHERE id = $1 AND status = $3
        RETURNING *
        "#,
    )
    .bind(job_id)
    .bind(JobStatus::Processing)
    .bind(JobStatus::Pending)
    .fetch_optional(pool)
    .await?;

    let Some(job) = claimed else {
        tracing::info!(job_id = %job_id, "Job no longer pending, skipping");
        return Ok(());
    };

    let result = async {
        let realm = realms::get(pool, job.realm_id).await?;
        let sources = synthesis::load_sources(pool, job.realm_id, &job.input_sources).await?;
        synthesis::run_pipeline(llm, &realm, &sources).await
    }
    .await;

    match result {
        Ok(outcome) => complete(pool, &job, outcome).await,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Synthesis job failed");
            mark_failed(pool, job_id, &e.to_string()).await?;
            Ok(())
        }
    }
}

/// Body of the spawned task. A job whose own bookkeeping fails is still
/// moved to `failed` so pollers see it end.
pub async fn run_detached(pool: &PgPool, llm: &dyn LlmBackend, job_id: Uuid) {
    let Err(e) = process_job(pool, llm, job_id).await else {
        return;
    };
    tracing::error!(job_id = %job_id, error = %e, "Synthesis job bookkeeping failed");

    let message = format!("Internal error while finishing job: {}", e);
    if let Err(e) = mark_failed(pool, job_id, &message).await {
        tracing::error!(job_id = %job_id, error = %e, "Could not mark synthesis job failed");
    }
}

/// Move a `processing` job to `failed`. Returns false when the job was not
/// processing (finished, cancelled or gone).
pub async fn mark_failed(pool: &PgPool, job_id: Uuid, message: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE synthesis_jobs SET status = $2, error_message = $3, updated_at = now()
        WHERE id = $1 AND status = $4
        "#,
    )
    .bind(job_id)
    .bind(JobStatus::Failed)
    .bind(message)
    .bind(JobStatus::Processing)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn complete(pool: &PgPool, job: &SynthesisJob, outcome: PipelineOutcome) -> ApiResult<()> {
    let mut tx = pool.begin().await?;

    let (status,): (JobStatus,) =
        sqlx::query_as("SELECT status FROM synthesis_jobs WHERE id = $1 FOR UPDATE")
            .bind(job.id)
            .fetch_one(&mut *tx)
            .await?;
    if status != JobStatus::Processing {
        tracing::info!(job_id = %job.id, status = %status, "Job cancelled, discarding result");
        tx.rollback().await?;
        return Ok(());
    }

    let analysis = outcome.analysis_json(job.synthesis_type);
    let processing_time_ms = outcome.processing_time_ms;
    let source_ids = outcome.source_ids.clone();
    let version = commit_version(&mut *tx, job.realm_id, outcome.into_version()).await?;
    content_sources::mark_used(&mut *tx, &source_ids).await?;

    sqlx::query(
        r#"
        UPDATE synthesis_jobs
        SET status = $2, result_prompt = $3, quality_analysis = $4,
            processing_time_ms = $5, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(JobStatus::Completed)
    .bind(&version.content)
    .bind(&analysis)
    .bind(processing_time_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        job_id = %job.id,
        realm_id = %job.realm_id,
        version = version.version_number,
        processing_time_ms,
        "Synthesis job completed"
    );
    Ok(())
}

/// Cancel a pending or processing job. Finished jobs are a 400.
pub async fn cancel(pool: &PgPool, id: Uuid) -> ApiResult<SynthesisJob> {
    let job = get(pool, id).await?;
    if job.status.is_terminal() {
        return Err(not_cancellable(job.status));
    }

    // The job may finish between the read and this update.
    let cancelled: Option<SynthesisJob> = sqlx::query_as(
        r#"
        UPDATE synthesis_jobs SET status = $2, updated_at = now()
        WHERE id = $1 AND status IN ($3, $4)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(JobStatus::Cancelled)
    .bind(JobStatus::Pending)
    .bind(JobStatus::Processing)
    .fetch_optional(pool)
    .await?;

    match cancelled {
        Some(job) => {
            tracing::info!(job_id = %id, "Cancelled synthesis job");
            Ok(job)
        }
        None => Err(not_cancellable(get(pool, id).await?.status)),
    }
}

fn not_cancellable(status: JobStatus) -> ApiError {
    ApiError::bad_request(format!("Cannot cancel job with status {}", status))
}
