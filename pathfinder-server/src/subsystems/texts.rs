use pathfinder_core::models::Text;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateText {
    pub title: String,
    pub content: String,
    pub source_file_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateText {
    pub title: Option<String>,
    pub content: Option<String>,
    pub source_file_name: Option<String>,
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub async fn list(pool: &PgPool) -> ApiResult<Vec<Text>> {
    let texts = sqlx::query_as("SELECT * FROM texts ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(texts)
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<Text> {
    sqlx::query_as("SELECT * FROM texts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Text"))
}

pub async fn create(pool: &PgPool, req: CreateText) -> ApiResult<Text> {
    require("title", &req.title)?;
    require("content", &req.content)?;

    let text: Text = sqlx::query_as(
        r#"
        INSERT INTO texts (id, title, content, source_file_name)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(req.title.trim())
    .bind(&req.content)
    .bind(&req.source_file_name)
    .fetch_one(pool)
    .await?;

    tracing::info!(text_id = %text.id, "Created text");
    Ok(text)
}

pub async fn update(pool: &PgPool, id: Uuid, req: UpdateText) -> ApiResult<Text> {
    if let Some(title) = &req.title {
        require("title", title)?;
    }

    sqlx::query_as(
        r#"
        UPDATE texts
        SET title = COALESCE($2, title),
            content = COALESCE($3, content),
            source_file_name = COALESCE($4, source_file_name),
            updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(req.title.as_deref().map(str::trim))
    .bind(&req.content)
    .bind(&req.source_file_name)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Text"))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM texts WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Text"));
    }
    Ok(())
}
