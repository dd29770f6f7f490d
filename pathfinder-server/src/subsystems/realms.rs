use pathfinder_core::models::{Realm, SynthesisMethod};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::versions::{commit_version, NewVersion};

#[derive(Debug, Deserialize)]
pub struct CreateRealm {
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateRealm {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub synthesis_disabled: Option<bool>,
}

fn validate_name(name: &str) -> ApiResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("Realm name must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn non_blank(prompt: Option<String>) -> Option<String> {
    prompt.filter(|p| !p.trim().is_empty())
}

pub async fn list(pool: &PgPool) -> ApiResult<Vec<Realm>> {
    let realms = sqlx::query_as("SELECT * FROM realms ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(realms)
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<Realm> {
    sqlx::query_as("SELECT * FROM realms WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Realm"))
}

pub async fn ensure_exists(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM realms WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    found.map(|_| ()).ok_or_else(|| ApiError::not_found("Realm"))
}

/// A realm created with a prompt starts at version 1 (`manual`).
pub async fn create(pool: &PgPool, req: CreateRealm) -> ApiResult<Realm> {
    let name = validate_name(&req.name)?;
    let id = Uuid::new_v4();

    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO realms (id, name, description) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(&name)
        .bind(&req.description)
        .execute(&mut *tx)
        .await?;

    if let Some(prompt) = non_blank(req.system_prompt) {
        commit_version(&mut *tx, id, NewVersion::new(prompt, SynthesisMethod::Manual)).await?;
    }

    let realm: Realm = sqlx::query_as("SELECT * FROM realms WHERE id = $1")
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(realm_id = %id, name = %realm.name, "Created realm");
    Ok(realm)
}

/// Fields left out of the request keep their value. A changed, non-blank
/// prompt is recorded as a new `manual` version.
pub async fn update(pool: &PgPool, id: Uuid, req: UpdateRealm) -> ApiResult<Realm> {
    let name = req.name.as_deref().map(validate_name).transpose()?;

    let mut tx = pool.begin().await?;

    let current: Realm = sqlx::query_as("SELECT * FROM realms WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("Realm"))?;

    sqlx::query(
        r#"
        UPDATE realms
        SET name = COALESCE($2, name),
            description = COALESCE($3, description),
            synthesis_disabled = COALESCE($4, synthesis_disabled),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&name)
    .bind(&req.description)
    .bind(req.synthesis_disabled)
    .execute(&mut *tx)
    .await?;

    if let Some(prompt) = non_blank(req.system_prompt) {
        if current.system_prompt.as_deref() != Some(prompt.as_str()) {
            commit_version(&mut *tx, id, NewVersion::new(prompt, SynthesisMethod::Manual))
                .await?;
        }
    }

    let realm: Realm = sqlx::query_as("SELECT * FROM realms WHERE id = $1")
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(realm)
}

/// Cascades to chats, reflections, content sources, versions and jobs.
pub async fn delete(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM realms WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Realm"));
    }
    tracing::info!(realm_id = %id, "Deleted realm");
    Ok(())
}
