//! Prompt version history.
//!
//! Versions are append-only. `commit_version` is the single write path: it
//! locks the realm row, allocates `MAX(version_number) + 1`, inserts the
//! version and points the realm at it, all on the caller's transaction.

use pathfinder_core::models::{PromptVersion, SynthesisMethod};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct NewVersion {
    pub content: String,
    pub method: SynthesisMethod,
    pub quality_score: Option<f64>,
    pub effectiveness_metrics: serde_json::Value,
    pub improvement_suggestions: Vec<String>,
}

impl NewVersion {
    pub fn new(content: impl Into<String>, method: SynthesisMethod) -> Self {
        Self {
            content: content.into(),
            method,
            quality_score: None,
            effectiveness_metrics: serde_json::json!({}),
            improvement_suggestions: Vec::new(),
        }
    }
}

/// Record `version` for `realm_id` and make it the realm's current prompt.
///
/// Run inside a transaction: the `FOR UPDATE` lock on the realm row is what
/// serializes concurrent commits for one realm.
pub async fn commit_version(
    conn: &mut PgConnection,
    realm_id: Uuid,
    version: NewVersion,
) -> ApiResult<PromptVersion> {
    let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM realms WHERE id = $1 FOR UPDATE")
        .bind(realm_id)
        .fetch_optional(&mut *conn)
        .await?;
    if locked.is_none() {
        return Err(ApiError::not_found("Realm"));
    }

    let (previous,): (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version_number), 0) FROM prompt_versions WHERE realm_id = $1",
    )
    .bind(realm_id)
    .fetch_one(&mut *conn)
    .await?;
    let version_number = previous + 1;

    let row: PromptVersion = sqlx::query_as(
        r#"
        INSERT INTO prompt_versions
            (id, realm_id, version_number, content, synthesis_method,
             quality_score, effectiveness_metrics, improvement_suggestions)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(realm_id)
    .bind(version_number)
    .bind(&version.content)
    .bind(version.method)
    .bind(version.quality_score)
    .bind(&version.effectiveness_metrics)
    .bind(&version.improvement_suggestions)
    .fetch_one(&mut *conn)
    .await?;

    let synthesized = version.method != SynthesisMethod::Manual;
    sqlx::query(
        r#"
        UPDATE realms
        SET system_prompt = $2,
            current_version = $3,
            quality_score = COALESCE($4, quality_score),
            last_synthesis_at = CASE WHEN $5 THEN now() ELSE last_synthesis_at END,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(realm_id)
    .bind(&version.content)
    .bind(version_number)
    .bind(version.quality_score)
    .bind(synthesized)
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        realm_id = %realm_id,
        version = version_number,
        method = %version.method,
        "Committed prompt version"
    );

    Ok(row)
}

/// Newest first.
pub async fn list_for_realm(pool: &PgPool, realm_id: Uuid) -> ApiResult<Vec<PromptVersion>> {
    crate::subsystems::realms::ensure_exists(pool, realm_id).await?;

    let versions = sqlx::query_as(
        "SELECT * FROM prompt_versions WHERE realm_id = $1 ORDER BY version_number DESC",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    Ok(versions)
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<PromptVersion> {
    sqlx::query_as("SELECT * FROM prompt_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Prompt version"))
}
