//! Smart synthesis: decide per new content source whether to integrate it
//! right away (one incremental model call) or park it in the batch queue.
//!
//! Synthesis that runs as a side effect of a content-source write never
//! fails that write. Errors are logged and the source stays queued.

use chrono::Utc;
use pathfinder_core::config::SynthesisConfig;
use pathfinder_core::llm::{GenerateRequest, LlmBackend};
use pathfinder_core::models::{
    ContentSource, PromptVersion, SynthesisMethod, SynthesisQueueEntry,
};
use pathfinder_core::prompts::{self, HIGH_PRIORITY_WEIGHT};
use pathfinder_core::{should_trigger, TriggerDecision, TriggerInputs};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::content_sources::{self, CreateContentSource, NewSource, UpdateContentSource};
use crate::subsystems::realms;
use crate::subsystems::versions::{commit_version, NewVersion};

#[derive(Debug, Deserialize, Default)]
pub struct CreateParams {
    #[serde(default)]
    pub auto_synthesize: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateParams {
    #[serde(default)]
    pub trigger_incremental_synthesis: bool,
}

#[derive(Debug, Deserialize)]
pub struct WeightParams {
    pub weight: f64,
    #[serde(default)]
    pub auto_synthesize: bool,
}

#[derive(Debug, Serialize)]
pub struct CreatedSource {
    #[serde(flatten)]
    pub source: ContentSource,
    pub synthesis_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct WeightUpdate {
    pub message: String,
    pub source_id: Uuid,
    pub old_weight: f64,
    pub weight: f64,
    pub synthesis_triggered: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub realm_id: Uuid,
    pub processed: bool,
    pub pending_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i32>,
    pub message: String,
}

pub async fn pending_queue_size(pool: &PgPool, realm_id: Uuid) -> ApiResult<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM synthesis_queue WHERE realm_id = $1 AND NOT processed",
    )
    .bind(realm_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

async fn total_content_length(pool: &PgPool, realm_id: Uuid) -> ApiResult<usize> {
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(char_length(content)), 0)::bigint FROM content_sources WHERE realm_id = $1",
    )
    .bind(realm_id)
    .fetch_one(pool)
    .await?;
    Ok(total.max(0) as usize)
}

async fn enqueue(pool: &PgPool, realm_id: Uuid, source_id: Uuid) -> ApiResult<()> {
    sqlx::query(
        "INSERT INTO synthesis_queue (id, realm_id, content_source_id) VALUES ($1, $2, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(realm_id)
    .bind(source_id)
    .execute(pool)
    .await?;
    tracing::debug!(realm_id = %realm_id, source_id = %source_id, "Queued for batch synthesis");
    Ok(())
}

/// Only entries for the integrated sources; anything queued meanwhile stays
/// pending.
async fn mark_queue_processed(
    conn: &mut PgConnection,
    realm_id: Uuid,
    source_ids: &[Uuid],
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE synthesis_queue SET processed = true
        WHERE realm_id = $1 AND content_source_id = ANY($2) AND NOT processed
        "#,
    )
    .bind(realm_id)
    .bind(source_ids)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Integrate `source_ids` into the realm's current prompt with one model
/// call and commit the result as an `incremental` version. Queue entries of
/// the integrated sources are marked processed.
pub async fn incremental_synthesis(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
    source_ids: &[Uuid],
) -> ApiResult<PromptVersion> {
    let realm = realms::get(pool, realm_id).await?;
    let sources = content_sources::get_many(pool, source_ids).await?;
    if sources.is_empty() {
        return Err(ApiError::bad_request("No content sources to integrate"));
    }

    let prompt = prompts::integration_prompt(realm.system_prompt.as_deref(), &sources);
    let reply = llm.generate(&GenerateRequest::prompt(prompt)).await?;
    let updated = prompts::strip_code_fences(&reply);
    if updated.is_empty() {
        return Err(ApiError::Upstream("Model returned an empty prompt".to_string()));
    }

    let used: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
    let mut version = NewVersion::new(updated, SynthesisMethod::Incremental);
    version.effectiveness_metrics = serde_json::json!({
        "integrated_sources": used,
        "model": llm.model(),
    });

    let mut tx = pool.begin().await?;
    let committed = commit_version(&mut *tx, realm_id, version).await?;
    let cleared = mark_queue_processed(&mut *tx, realm_id, &used).await?;
    content_sources::mark_used(&mut *tx, &used).await?;
    tx.commit().await?;

    tracing::info!(
        realm_id = %realm_id,
        version = committed.version_number,
        sources = used.len(),
        cleared_queue = cleared,
        "Incremental synthesis complete"
    );
    Ok(committed)
}

/// Best-effort variant for side effects of content-source writes.
async fn try_incremental(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
    source_id: Uuid,
) -> bool {
    match incremental_synthesis(pool, llm, realm_id, &[source_id]).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(
                realm_id = %realm_id,
                source_id = %source_id,
                error = %e,
                "Incremental synthesis failed"
            );
            false
        }
    }
}

async fn decide(
    pool: &PgPool,
    config: &SynthesisConfig,
    realm_id: Uuid,
    source: &ContentSource,
) -> ApiResult<TriggerDecision> {
    let realm = realms::get(pool, realm_id).await?;
    let inputs = TriggerInputs {
        weight: source.weight,
        content_length: source.content.chars().count(),
        total_content_length: total_content_length(pool, realm_id).await?,
        last_synthesis_at: realm.last_synthesis_at,
        pending_queue_size: pending_queue_size(pool, realm_id).await?,
    };
    Ok(should_trigger(&inputs, config, Utc::now()))
}

/// Store a new source and, with `auto_synthesize`, apply the trigger rules.
pub async fn add_content_source(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    config: &SynthesisConfig,
    req: CreateContentSource,
    params: CreateParams,
) -> ApiResult<CreatedSource> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }

    let realm = match req.realm_id {
        Some(realm_id) => Some(realms::get(pool, realm_id).await?),
        None => None,
    };

    let mut conn = pool.acquire().await?;
    let source = content_sources::insert(
        &mut *conn,
        NewSource {
            realm_id: req.realm_id,
            source_type: req.source_type,
            title: req.title,
            content: req.content,
            weight: req.weight.unwrap_or(1.0),
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: None,
        },
    )
    .await?;
    drop(conn);

    tracing::info!(
        source_id = %source.id,
        realm_id = ?source.realm_id,
        weight = source.weight,
        "Added content source"
    );

    let realm = match realm {
        Some(realm) if params.auto_synthesize => realm,
        _ => {
            return Ok(CreatedSource {
                source,
                synthesis_triggered: false,
                trigger_reason: None,
            })
        }
    };

    if realm.synthesis_disabled {
        tracing::info!(realm_id = %realm.id, "Synthesis disabled for realm, skipping triggers");
        return Ok(CreatedSource {
            source,
            synthesis_triggered: false,
            trigger_reason: Some("synthesis_disabled"),
        });
    }

    let decision = decide(pool, config, realm.id, &source).await?;
    tracing::info!(
        source_id = %source.id,
        decision = decision.reason(),
        "Evaluated synthesis trigger"
    );

    let mut triggered = false;
    if decision.triggers() {
        triggered = try_incremental(pool, llm, realm.id, source.id).await;
    }
    if !triggered {
        enqueue(pool, realm.id, source.id).await?;
    }

    // Reload so `last_used_at` reflects a successful run.
    let source = if triggered {
        content_sources::get(pool, source.id).await?
    } else {
        source
    };

    Ok(CreatedSource {
        source,
        synthesis_triggered: triggered,
        trigger_reason: Some(decision.reason()),
    })
}

pub async fn update_content_source(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    id: Uuid,
    req: UpdateContentSource,
    params: UpdateParams,
) -> ApiResult<ContentSource> {
    let updated = content_sources::update(pool, id, req).await?;

    match updated.realm_id {
        Some(realm_id) if params.trigger_incremental_synthesis => {
            if try_incremental(pool, llm, realm_id, id).await {
                return content_sources::get(pool, id).await;
            }
            Ok(updated)
        }
        _ => Ok(updated),
    }
}

/// Whether a weight change promotes a source into the high-priority band.
pub fn crosses_high_priority(old_weight: f64, new_weight: f64) -> bool {
    old_weight < HIGH_PRIORITY_WEIGHT && new_weight >= HIGH_PRIORITY_WEIGHT
}

pub async fn update_weight(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    id: Uuid,
    params: WeightParams,
) -> ApiResult<WeightUpdate> {
    let (old_weight, updated) = content_sources::set_weight(pool, id, params.weight).await?;

    let mut triggered = false;
    if let Some(realm_id) = updated.realm_id {
        if params.auto_synthesize && crosses_high_priority(old_weight, updated.weight) {
            triggered = try_incremental(pool, llm, realm_id, id).await;
        }
    }

    tracing::info!(source_id = %id, old_weight, weight = updated.weight, "Updated weight");
    Ok(WeightUpdate {
        message: format!("Weight updated to {}", updated.weight),
        source_id: id,
        old_weight,
        weight: updated.weight,
        synthesis_triggered: triggered,
    })
}

/// Distinct source ids in queue order.
pub fn queued_sources(entries: &[SynthesisQueueEntry]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = Vec::with_capacity(entries.len());
    for entry in entries {
        if !ids.contains(&entry.content_source_id) {
            ids.push(entry.content_source_id);
        }
    }
    ids
}

/// Integrate every unprocessed queue entry when at least `min_batch_size`
/// are waiting.
pub async fn process_batch_queue(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    config: &SynthesisConfig,
    realm_id: Uuid,
) -> ApiResult<BatchOutcome> {
    realms::ensure_exists(pool, realm_id).await?;

    let pending: Vec<SynthesisQueueEntry> = sqlx::query_as(
        "SELECT * FROM synthesis_queue WHERE realm_id = $1 AND NOT processed ORDER BY queued_at",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    let source_ids = queued_sources(&pending);

    if (source_ids.len() as i64) < config.min_batch_size {
        return Ok(BatchOutcome {
            realm_id,
            processed: false,
            pending_count: source_ids.len(),
            version_number: None,
            message: "No batch processing needed".to_string(),
        });
    }

    let version = incremental_synthesis(pool, llm, realm_id, &source_ids).await?;
    Ok(BatchOutcome {
        realm_id,
        processed: true,
        pending_count: source_ids.len(),
        version_number: Some(version.version_number),
        message: "Batch queue processed successfully".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_crossing_into_high_priority() {
        assert!(crosses_high_priority(2.9, 3.0));
        assert!(crosses_high_priority(0.0, 5.0));
        assert!(!crosses_high_priority(3.0, 4.0));
        assert!(!crosses_high_priority(1.0, 2.9));
        assert!(!crosses_high_priority(4.0, 1.0));
    }

    #[test]
    fn test_queued_sources_are_distinct_in_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let entry = |source: Uuid| SynthesisQueueEntry {
            id: Uuid::new_v4(),
            realm_id: Uuid::nil(),
            content_source_id: source,
            queued_at: Utc::now(),
            processed: false,
        };
        let ids = queued_sources(&[entry(a), entry(b), entry(a)]);
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_query_flags_default_off() {
        let create: CreateParams = serde_json::from_str("{}").unwrap();
        assert!(!create.auto_synthesize);
        let update: UpdateParams = serde_json::from_str("{}").unwrap();
        assert!(!update.trigger_incremental_synthesis);
        let weight: WeightParams = serde_json::from_str(r#"{"weight": 3.5}"#).unwrap();
        assert!(!weight.auto_synthesize);
    }
}
