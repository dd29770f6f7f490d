use pathfinder_core::config::SynthesisConfig;
use pathfinder_core::llm::{GenerateRequest, LlmBackend};
use pathfinder_core::models::Reflection;
use pathfinder_core::prompts::{self, MAX_QUESTION_COUNT};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::realms;

pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Deserialize, Default)]
pub struct GenerateParams {
    pub count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerReflection {
    pub answer: String,
}

pub async fn unanswered(pool: &PgPool, realm_id: Uuid) -> ApiResult<Vec<Reflection>> {
    realms::ensure_exists(pool, realm_id).await?;
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM reflections
        WHERE realm_id = $1 AND (answer IS NULL OR btrim(answer) = '')
        ORDER BY created_at
        "#,
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn answered(pool: &PgPool, realm_id: Uuid) -> ApiResult<Vec<Reflection>> {
    realms::ensure_exists(pool, realm_id).await?;
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM reflections
        WHERE realm_id = $1 AND answer IS NOT NULL AND btrim(answer) <> ''
        ORDER BY updated_at DESC
        "#,
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn answer(pool: &PgPool, id: Uuid, req: AnswerReflection) -> ApiResult<Reflection> {
    if req.answer.trim().is_empty() {
        return Err(ApiError::bad_request("Answer must not be empty"));
    }

    sqlx::query_as(
        "UPDATE reflections SET answer = $2, updated_at = now() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(&req.answer)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Reflection"))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM reflections WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Reflection"));
    }
    Ok(())
}

fn resolve_count(requested: Option<u32>, config: &SynthesisConfig) -> ApiResult<u32> {
    let count = requested.unwrap_or(config.default_question_count);
    if !(1..=MAX_QUESTION_COUNT).contains(&count) {
        return Err(ApiError::bad_request(format!(
            "count must be between 1 and {}",
            MAX_QUESTION_COUNT
        )));
    }
    Ok(count)
}

/// Ask the model for new questions and store them unanswered.
pub async fn generate_questions(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    config: &SynthesisConfig,
    realm_id: Uuid,
    params: GenerateParams,
) -> ApiResult<Vec<Reflection>> {
    let count = resolve_count(params.count, config)?;
    let realm = realms::get(pool, realm_id).await?;

    let asked: Vec<(String,)> =
        sqlx::query_as("SELECT question FROM reflections WHERE realm_id = $1 ORDER BY created_at")
            .bind(realm_id)
            .fetch_all(pool)
            .await?;
    let asked: Vec<String> = asked.into_iter().map(|(q,)| q).collect();

    let prompt = prompts::question_generation_prompt(
        &realm.name,
        realm.description.as_deref(),
        realm.system_prompt.as_deref(),
        &asked,
        count,
    );
    let reply = llm.generate(&GenerateRequest::prompt(prompt)).await?;

    let questions = prompts::parse_questions(&reply, count).map_err(|e| {
        ApiError::Upstream(format!("Model returned malformed questions: {}", e))
    })?;
    if questions.is_empty() {
        return Err(ApiError::Upstream("Model returned no questions".to_string()));
    }

    let mut tx = pool.begin().await?;
    let mut created = Vec::with_capacity(questions.len());
    for q in questions {
        let category = q
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let reflection: Reflection = sqlx::query_as(
            r#"
            INSERT INTO reflections (id, realm_id, question, category, importance_score)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(realm_id)
        .bind(q.question.trim())
        .bind(category)
        .bind(q.importance_score.unwrap_or(1.0))
        .fetch_one(&mut *tx)
        .await?;
        created.push(reflection);
    }
    tx.commit().await?;

    tracing::info!(realm_id = %realm_id, count = created.len(), "Generated reflection questions");
    Ok(created)
}
