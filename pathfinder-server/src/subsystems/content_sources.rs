//! Weighted content sources: storage, the content map, and one-off
//! migrations that turn reflections and texts into sources.
//!
//! Every insert stores a keyword analysis under
//! `metadata.lightweight_analysis`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pathfinder_core::analysis::{self, LightweightAnalysis};
use pathfinder_core::models::{
    validate_weight, ContentSource, Reflection, SourceType, Text,
};
use pathfinder_core::prompts::HIGH_PRIORITY_WEIGHT;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::{realms, texts};

const PREVIEW_CHARS: usize = 200;
const TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize, Default)]
pub struct SourceFilter {
    pub realm_id: Option<Uuid>,
    pub source_type: Option<SourceType>,
}

#[derive(Debug, Deserialize)]
pub struct CreateContentSource {
    pub realm_id: Option<Uuid>,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub weight: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateContentSource {
    pub title: Option<String>,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub weight: Option<f64>,
}

/// Row to insert; `created_at` is carried over by migrations.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub realm_id: Option<Uuid>,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub content: String,
    pub weight: f64,
    pub metadata: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
}

pub async fn insert(conn: &mut PgConnection, source: NewSource) -> ApiResult<ContentSource> {
    let weight = validate_weight(source.weight)?;
    let metadata = analysis::merge_into_metadata(&source.metadata, &analysis::analyze(&source.content));

    let row = sqlx::query_as(
        r#"
        INSERT INTO content_sources
            (id, realm_id, source_type, title, content, weight, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, clock_timestamp()))
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(source.realm_id)
    .bind(source.source_type)
    .bind(&source.title)
    .bind(&source.content)
    .bind(weight)
    .bind(&metadata)
    .bind(source.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Newest first.
pub async fn list(pool: &PgPool, filter: SourceFilter) -> ApiResult<Vec<ContentSource>> {
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM content_sources
        WHERE ($1::uuid IS NULL OR realm_id = $1)
          AND ($2::text IS NULL OR source_type = $2)
        ORDER BY created_at DESC
        "#,
    )
    .bind(filter.realm_id)
    .bind(filter.source_type)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Highest weight first.
pub async fn list_for_realm(pool: &PgPool, realm_id: Uuid) -> ApiResult<Vec<ContentSource>> {
    realms::ensure_exists(pool, realm_id).await?;
    let rows = sqlx::query_as(
        "SELECT * FROM content_sources WHERE realm_id = $1 ORDER BY weight DESC, created_at",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<ContentSource> {
    sqlx::query_as("SELECT * FROM content_sources WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Content source"))
}

pub async fn get_many(pool: &PgPool, ids: &[Uuid]) -> ApiResult<Vec<ContentSource>> {
    let rows = sqlx::query_as(
        "SELECT * FROM content_sources WHERE id = ANY($1) ORDER BY weight DESC, created_at",
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Changed content gets a fresh keyword analysis.
pub async fn update(pool: &PgPool, id: Uuid, req: UpdateContentSource) -> ApiResult<ContentSource> {
    let weight = req.weight.map(validate_weight).transpose()?;
    if let Some(content) = &req.content {
        if content.trim().is_empty() {
            return Err(ApiError::bad_request("content must not be empty"));
        }
    }

    let existing = get(pool, id).await?;
    let content = req.content.unwrap_or(existing.content);
    let base_metadata = req.metadata.unwrap_or(existing.metadata);
    let metadata = analysis::merge_into_metadata(&base_metadata, &analysis::analyze(&content));

    let row = sqlx::query_as(
        r#"
        UPDATE content_sources
        SET title = $2, content = $3, metadata = $4, weight = $5, updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(req.title.or(existing.title))
    .bind(&content)
    .bind(&metadata)
    .bind(weight.unwrap_or(existing.weight))
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Content source"))?;

    tracing::info!(source_id = %id, "Updated content source");
    Ok(row)
}

/// Returns the previous weight alongside the updated row.
pub async fn set_weight(pool: &PgPool, id: Uuid, weight: f64) -> ApiResult<(f64, ContentSource)> {
    let weight = validate_weight(weight)?;
    let mut tx = pool.begin().await?;

    let old: Option<(f64,)> =
        sqlx::query_as("SELECT weight FROM content_sources WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let (old_weight,) = old.ok_or_else(|| ApiError::not_found("Content source"))?;

    let updated: ContentSource = sqlx::query_as(
        "UPDATE content_sources SET weight = $2, updated_at = now() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(weight)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok((old_weight, updated))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM content_sources WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Content source"));
    }
    tracing::info!(source_id = %id, "Deleted content source");
    Ok(())
}

pub async fn mark_used(conn: &mut PgConnection, ids: &[Uuid]) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE content_sources SET last_used_at = now() WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// Lightweight insights
// ============================================================================

#[derive(Debug, Serialize)]
pub struct Insights {
    pub source_id: Uuid,
    pub lightweight_analysis: LightweightAnalysis,
    pub note: &'static str,
}

/// Re-run the keyword analysis and store it on the source.
pub async fn extract_insights(pool: &PgPool, id: Uuid) -> ApiResult<Insights> {
    let source = get(pool, id).await?;
    let result = analysis::analyze(&source.content);
    let metadata = analysis::merge_into_metadata(&source.metadata, &result);

    sqlx::query("UPDATE content_sources SET metadata = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(&metadata)
        .execute(pool)
        .await?;

    Ok(Insights {
        source_id: id,
        lightweight_analysis: result,
        note: "Keyword matching only, no model call",
    })
}

// ============================================================================
// Content map
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RealmInfo {
    pub id: Uuid,
    pub name: String,
    pub current_version: i32,
    pub quality_score: Option<f64>,
    pub last_synthesis_at: Option<DateTime<Utc>>,
    pub pending_batch_count: i64,
}

#[derive(Debug, Serialize)]
pub struct SourceSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub weight: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub content_preview: String,
    pub themes: Vec<String>,
    pub traits: Vec<String>,
    pub importance_indicators: usize,
}

#[derive(Debug, Serialize, Default)]
pub struct ContentStatistics {
    pub total_sources: usize,
    pub by_type: BTreeMap<String, usize>,
    pub total_weight: f64,
    pub average_weight: f64,
    pub high_priority_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ContentMap {
    pub realm_info: RealmInfo,
    pub content_sources: BTreeMap<String, Vec<SourceSummary>>,
    pub statistics: ContentStatistics,
}

/// First `limit` characters, with an ellipsis when something was cut.
pub fn preview(content: &str, limit: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

pub fn summarize(source: &ContentSource) -> SourceSummary {
    let analysis = analysis::from_metadata(&source.metadata);
    SourceSummary {
        id: source.id,
        title: source.title.clone(),
        weight: source.weight,
        last_used_at: source.last_used_at,
        created_at: source.created_at,
        content_preview: preview(&source.content, PREVIEW_CHARS),
        themes: analysis.as_ref().map(|a| a.themes.clone()).unwrap_or_default(),
        traits: analysis.as_ref().map(|a| a.traits.clone()).unwrap_or_default(),
        importance_indicators: analysis.map(|a| a.importance_indicators).unwrap_or(0),
    }
}

pub fn build_statistics(sources: &[ContentSource]) -> ContentStatistics {
    let mut stats = ContentStatistics {
        total_sources: sources.len(),
        ..ContentStatistics::default()
    };
    for source in sources {
        stats.total_weight += source.weight;
        *stats
            .by_type
            .entry(source.source_type.as_str().to_string())
            .or_insert(0) += 1;
        if source.weight >= HIGH_PRIORITY_WEIGHT {
            stats.high_priority_count += 1;
        }
    }
    if !sources.is_empty() {
        stats.average_weight = stats.total_weight / sources.len() as f64;
    }
    stats
}

pub async fn content_map(pool: &PgPool, realm_id: Uuid) -> ApiResult<ContentMap> {
    let realm = realms::get(pool, realm_id).await?;
    let sources = list_for_realm(pool, realm_id).await?;
    let pending = crate::subsystems::smart::pending_queue_size(pool, realm_id).await?;

    let mut grouped: BTreeMap<String, Vec<SourceSummary>> = SourceType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), Vec::new()))
        .collect();
    for source in &sources {
        grouped
            .entry(source.source_type.as_str().to_string())
            .or_default()
            .push(summarize(source));
    }

    Ok(ContentMap {
        realm_info: RealmInfo {
            id: realm.id,
            name: realm.name,
            current_version: realm.current_version,
            quality_score: realm.quality_score,
            last_synthesis_at: realm.last_synthesis_at,
            pending_batch_count: pending,
        },
        content_sources: grouped,
        statistics: build_statistics(&sources),
    })
}

// ============================================================================
// Migrations from reflections and texts
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub migrated_count: usize,
    pub skipped_count: usize,
    pub realm_id: Option<Uuid>,
}

async fn already_migrated(
    conn: &mut PgConnection,
    source_type: SourceType,
    key: &str,
    original_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let found: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM content_sources WHERE source_type = $1 AND metadata->>$2 = $3 LIMIT 1",
    )
    .bind(source_type)
    .bind(key)
    .bind(original_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

pub fn reflection_to_source(reflection: &Reflection) -> NewSource {
    let answer = reflection
        .answer
        .as_deref()
        .filter(|a| !a.trim().is_empty());
    let content = format!(
        "Q: {}\nA: {}",
        reflection.question,
        answer.unwrap_or("[Unanswered]")
    );

    NewSource {
        realm_id: Some(reflection.realm_id),
        source_type: SourceType::Reflection,
        title: Some(preview(&reflection.question, TITLE_CHARS)),
        content,
        weight: reflection.importance_score.clamp(0.0, 5.0),
        metadata: serde_json::json!({
            "original_reflection_id": reflection.id.to_string(),
            "question": reflection.question,
            "answer": answer,
            "migrated_at": Utc::now(),
        }),
        created_at: Some(reflection.created_at),
    }
}

pub fn text_to_source(text: &Text, realm_id: Option<Uuid>) -> NewSource {
    NewSource {
        realm_id,
        source_type: SourceType::Text,
        title: Some(text.title.clone()),
        content: text.content.clone(),
        weight: 1.0,
        metadata: serde_json::json!({
            "original_text_id": text.id.to_string(),
            "source_file_name": text.source_file_name,
            "migrated_at": Utc::now(),
        }),
        created_at: Some(text.created_at),
    }
}

/// Idempotent: reflections already carried over are skipped.
pub async fn migrate_from_reflections(
    pool: &PgPool,
    realm_id: Option<Uuid>,
) -> ApiResult<MigrationReport> {
    let reflections: Vec<Reflection> = sqlx::query_as(
        "SELECT * FROM reflections WHERE ($1::uuid IS NULL OR realm_id = $1) ORDER BY created_at",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    let mut report = MigrationReport {
        migrated_count: 0,
        skipped_count: 0,
        realm_id,
    };

    for reflection in &reflections {
        if already_migrated(&mut *tx, SourceType::Reflection, "original_reflection_id", reflection.id)
            .await?
        {
            report.skipped_count += 1;
            continue;
        }
        insert(&mut *tx, reflection_to_source(reflection)).await?;
        report.migrated_count += 1;
    }
    tx.commit().await?;

    tracing::info!(
        migrated = report.migrated_count,
        skipped = report.skipped_count,
        "Migrated reflections to content sources"
    );
    Ok(report)
}

/// Idempotent: texts already carried over are skipped. New sources are not
/// linked to any realm.
pub async fn migrate_from_texts(pool: &PgPool) -> ApiResult<MigrationReport> {
    let all_texts: Vec<Text> = sqlx::query_as("SELECT * FROM texts ORDER BY created_at")
        .fetch_all(pool)
        .await?;

    let mut tx = pool.begin().await?;
    let mut report = MigrationReport {
        migrated_count: 0,
        skipped_count: 0,
        realm_id: None,
    };

    for text in &all_texts {
        if already_migrated(&mut *tx, SourceType::Text, "original_text_id", text.id).await? {
            report.skipped_count += 1;
            continue;
        }
        insert(&mut *tx, text_to_source(text, None)).await?;
        report.migrated_count += 1;
    }
    tx.commit().await?;

    tracing::info!(
        migrated = report.migrated_count,
        skipped = report.skipped_count,
        "Migrated texts to content sources"
    );
    Ok(report)
}

/// Find the source carried over from `text_id`, linking it to `realm_id` if
/// it has no realm yet, or create it.
pub async fn get_or_create_for_text(
    pool: &PgPool,
    text_id: Uuid,
    realm_id: Uuid,
) -> ApiResult<ContentSource> {
    let text = texts::get(pool, text_id).await?;
    realms::ensure_exists(pool, realm_id).await?;

    let mut tx = pool.begin().await?;

    let existing: Option<ContentSource> = sqlx::query_as(
        r#"
        SELECT * FROM content_sources
        WHERE metadata->>'original_text_id' = $1
        ORDER BY created_at
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(text_id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    let source = match existing {
        Some(source) if source.realm_id.is_none() => {
            let linked: ContentSource = sqlx::query_as(
                "UPDATE content_sources SET realm_id = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(source.id)
            .bind(realm_id)
            .fetch_one(&mut *tx)
            .await?;
            tracing::info!(source_id = %linked.id, realm_id = %realm_id, "Linked text source to realm");
            linked
        }
        Some(source) => source,
        None => {
            let created = insert(&mut *tx, text_to_source(&text, Some(realm_id))).await?;
            tracing::info!(source_id = %created.id, text_id = %text_id, "Created source from text");
            created
        }
    };

    tx.commit().await?;
    Ok(source)
}
